//! In-memory backends shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use querybox_sandbox::adapter::{
    DocumentClient, DocumentOp, DocumentReply, FieldInfo, RelationalClient, RowSet,
};
use querybox_sandbox::backend::{Connection, Connector};
use querybox_sandbox::ipc::ConnectionParams;
use querybox_sandbox::{
    BackendKind, DbError, ExecutionMode, InstanceEntry, SandboxConfig, ScriptExecutor,
    StaticCatalog,
};
use serde_json::{json, Map, Value};

pub const PG: &str = "pg-test";
pub const MONGO: &str = "mongo-test";

/// A `users` table with three rows. Any statement mentioning `fail` errors.
pub struct MemoryTable;

impl MemoryTable {
    fn rows() -> Vec<Map<String, Value>> {
        ["ada", "grace", "linus"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut row = Map::new();
                row.insert("id".into(), json!(i + 1));
                row.insert("name".into(), json!(name));
                row
            })
            .collect()
    }
}

#[async_trait]
impl RelationalClient for MemoryTable {
    async fn query(&self, sql: &str, _params: &[Value]) -> Result<RowSet, DbError> {
        if sql.contains("fail") {
            return Err(DbError::Query {
                message: "relation \"fail\" does not exist".into(),
                code: Some("42P01".into()),
            });
        }
        Ok(RowSet {
            fields: vec![
                FieldInfo {
                    name: "id".into(),
                    data_type: "int4".into(),
                },
                FieldInfo {
                    name: "name".into(),
                    data_type: "text".into(),
                },
            ],
            rows: Self::rows(),
        })
    }

    async fn execute(&self, sql: &str, _params: &[Value]) -> Result<u64, DbError> {
        if sql.contains("fail") {
            return Err(DbError::Query {
                message: "syntax error at or near \"fail\"".into(),
                code: Some("42601".into()),
            });
        }
        Ok(3)
    }

    async fn close(&self) {}
}

fn matches(doc: &Value, filter: &Value) -> bool {
    let Some(filter) = filter.as_object() else {
        return true;
    };
    filter.iter().all(|(k, v)| doc.get(k) == Some(v))
}

/// Collections of JSON documents supporting the common verbs.
#[derive(Default)]
pub struct MemoryCollections {
    data: Mutex<BTreeMap<String, Vec<Value>>>,
}

impl MemoryCollections {
    pub fn seeded() -> Self {
        let store = Self::default();
        store.data.lock().unwrap().insert(
            "events".into(),
            (1..=4)
                .map(|i| json!({ "_id": i, "kind": if i % 2 == 0 { "click" } else { "view" } }))
                .collect(),
        );
        store
    }

    pub fn len(&self, collection: &str) -> usize {
        self.data
            .lock()
            .unwrap()
            .get(collection)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl DocumentClient for MemoryCollections {
    async fn execute(&self, collection: &str, op: DocumentOp) -> Result<DocumentReply, DbError> {
        let mut data = self.data.lock().unwrap();
        let docs = data.entry(collection.to_string()).or_default();
        let reply = match op {
            DocumentOp::Find { filter, options } => {
                let found = docs
                    .iter()
                    .filter(|d| matches(d, &filter))
                    .skip(options.skip.unwrap_or(0) as usize)
                    .take(options.limit.map_or(usize::MAX, |l| l as usize))
                    .cloned()
                    .collect();
                DocumentReply::Documents(found)
            }
            DocumentOp::FindOne { filter, .. } => {
                DocumentReply::Document(docs.iter().find(|d| matches(d, &filter)).cloned())
            }
            DocumentOp::InsertOne { document } => {
                let id = document.get("_id").cloned().unwrap_or(json!(docs.len() + 1));
                docs.push(document);
                DocumentReply::Inserted { ids: vec![id] }
            }
            DocumentOp::InsertMany { documents } => {
                let ids = documents
                    .iter()
                    .enumerate()
                    .map(|(i, d)| d.get("_id").cloned().unwrap_or(json!(i)))
                    .collect();
                docs.extend(documents);
                DocumentReply::Inserted { ids }
            }
            DocumentOp::DeleteOne { filter } => match docs.iter().position(|d| matches(d, &filter)) {
                Some(pos) => {
                    docs.remove(pos);
                    DocumentReply::Deleted(1)
                }
                None => DocumentReply::Deleted(0),
            },
            DocumentOp::DeleteMany { filter } => {
                let before = docs.len();
                docs.retain(|d| !matches(d, &filter));
                DocumentReply::Deleted((before - docs.len()) as u64)
            }
            DocumentOp::CountDocuments { filter } => {
                DocumentReply::Count(docs.iter().filter(|d| matches(d, &filter)).count() as u64)
            }
            DocumentOp::Aggregate { pipeline } => {
                let mut out = docs.clone();
                for stage in &pipeline {
                    if let Some(filter) = stage.get("$match") {
                        out.retain(|d| matches(d, filter));
                    } else if let Some(n) = stage.get("$limit").and_then(Value::as_u64) {
                        out.truncate(n as usize);
                    }
                }
                DocumentReply::Documents(out)
            }
            DocumentOp::Drop => {
                docs.clear();
                DocumentReply::Acknowledged
            }
            other => return Err(DbError::Unsupported(other.verb().to_string())),
        };
        Ok(reply)
    }

    async fn list_collections(&self) -> Result<Vec<String>, DbError> {
        Ok(self.data.lock().unwrap().keys().cloned().collect())
    }

    async fn close(&self) {}
}

/// Hands out the in-memory clients matching the requested kind.
pub struct MemoryConnector {
    pub documents: Arc<MemoryCollections>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self {
            documents: Arc::new(MemoryCollections::seeded()),
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        params: &ConnectionParams,
        _database: &str,
    ) -> Result<Connection, DbError> {
        Ok(match params {
            ConnectionParams::Relational { .. } => Connection::Relational(Arc::new(MemoryTable)),
            ConnectionParams::Document { .. } => Connection::Document(self.documents.clone()),
        })
    }
}

pub fn catalog() -> StaticCatalog {
    let mut instances = BTreeMap::new();
    instances.insert(
        PG.to_string(),
        InstanceEntry {
            kind: Some(BackendKind::Relational),
            host: Some("localhost".into()),
            user: Some("reader".into()),
            password: Some("hunter2".into()),
            ..Default::default()
        },
    );
    instances.insert(
        MONGO.to_string(),
        InstanceEntry {
            kind: Some(BackendKind::Document),
            uri: Some("mongodb://localhost:27017".into()),
            ..Default::default()
        },
    );
    StaticCatalog::new(instances)
}

pub fn config(mode: ExecutionMode) -> SandboxConfig {
    SandboxConfig {
        execution_mode: mode,
        timeout: Duration::from_secs(10),
        grace: Duration::from_secs(2),
        ..Default::default()
    }
}

/// In-process executor over the in-memory backends.
pub fn in_process_executor() -> (ScriptExecutor, Arc<MemoryCollections>) {
    let connector = MemoryConnector::new();
    let documents = connector.documents.clone();
    let executor = ScriptExecutor::new(config(ExecutionMode::InProcess), Arc::new(catalog()))
        .with_connector(Arc::new(connector));
    (executor, documents)
}
