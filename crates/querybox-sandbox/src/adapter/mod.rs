//! Database adapters exposed to scripts as `db`.
//!
//! An adapter wraps a client, numbers and times every call, records
//! `query`/`operation`/`data` items in the execution's [`OutputCapture`], and
//! re-raises failures after logging them. The clients behind the adapters are
//! traits so the environment can run against in-memory backends.

mod document;
mod sql;

pub use document::DocumentAdapter;
pub use sql::{classify_statement, SqlAdapter, StatementClass};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DbError;
use crate::output::{OutputCapture, OutputItem};

/// Column metadata for a relational result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    /// Column name.
    pub name: String,
    /// Backend type name (`int4`, `text`, ...).
    #[serde(rename = "dataType")]
    pub data_type: String,
}

/// Rows returned by a relational statement, one JSON object per row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    /// Column metadata in select-list order.
    pub fields: Vec<FieldInfo>,
    /// Row values keyed by column name.
    pub rows: Vec<Map<String, Value>>,
}

/// A relational database connection.
#[async_trait]
pub trait RelationalClient: Send + Sync {
    /// Run a row-returning statement with positional parameters.
    async fn query(&self, sql: &str, params: &[Value]) -> Result<RowSet, DbError>;

    /// Run a statement and return the number of rows affected.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, DbError>;

    /// Release the connection. Best-effort.
    async fn close(&self);
}

/// Options accepted by `find`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindOptions {
    /// Maximum documents to return.
    #[serde(default)]
    pub limit: Option<u64>,
    /// Documents to skip.
    #[serde(default)]
    pub skip: Option<u64>,
    /// Sort specification.
    #[serde(default)]
    pub sort: Option<Value>,
    /// Projection document.
    #[serde(default, alias = "project")]
    pub projection: Option<Value>,
}

/// One document-store verb with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOp {
    /// `find(filter, options)`.
    Find {
        /// Query filter.
        filter: Value,
        /// Cursor options.
        options: FindOptions,
    },
    /// `findOne(filter, options)`.
    FindOne {
        /// Query filter.
        filter: Value,
        /// Projection document.
        projection: Option<Value>,
    },
    /// `insertOne(document)`.
    InsertOne {
        /// Document to insert.
        document: Value,
    },
    /// `insertMany(documents)`.
    InsertMany {
        /// Documents to insert.
        documents: Vec<Value>,
    },
    /// `updateOne(filter, update, options)`.
    UpdateOne {
        /// Query filter.
        filter: Value,
        /// Update document or pipeline.
        update: Value,
        /// Insert when nothing matches.
        upsert: bool,
    },
    /// `updateMany(filter, update, options)`.
    UpdateMany {
        /// Query filter.
        filter: Value,
        /// Update document or pipeline.
        update: Value,
        /// Insert when nothing matches.
        upsert: bool,
    },
    /// `deleteOne(filter)`.
    DeleteOne {
        /// Query filter.
        filter: Value,
    },
    /// `deleteMany(filter)`.
    DeleteMany {
        /// Query filter.
        filter: Value,
    },
    /// `countDocuments(filter)`.
    CountDocuments {
        /// Query filter.
        filter: Value,
    },
    /// `aggregate(pipeline)`.
    Aggregate {
        /// Pipeline stages.
        pipeline: Vec<Value>,
    },
    /// `createIndex(keys, options)`.
    CreateIndex {
        /// Index key specification.
        keys: Value,
        /// `name`, `unique`, `sparse`, `expireAfterSeconds`.
        options: Map<String, Value>,
    },
    /// `dropIndex(name)`.
    DropIndex {
        /// Index name.
        name: String,
    },
    /// `listIndexes()`.
    ListIndexes,
    /// `drop()`.
    Drop,
}

impl DocumentOp {
    /// Build an operation from a script-side verb and its JSON arguments.
    pub fn parse(verb: &str, args: Vec<Value>) -> Result<Self, DbError> {
        let mut args = args.into_iter();
        let mut next = || args.next().filter(|v| !v.is_null());

        let op = match verb {
            "find" => Self::Find {
                filter: filter_arg(next())?,
                options: match next() {
                    Some(v) => serde_json::from_value(v)
                        .map_err(|e| DbError::InvalidArgument(format!("find options: {e}")))?,
                    None => FindOptions::default(),
                },
            },
            "findOne" => {
                let filter = filter_arg(next())?;
                let projection = next().and_then(|opts| match opts {
                    Value::Object(mut m) => m.remove("projection").or_else(|| m.remove("project")),
                    _ => None,
                });
                Self::FindOne { filter, projection }
            }
            "insertOne" => Self::InsertOne {
                document: object_arg("insertOne", next())?,
            },
            "insertMany" => match next() {
                Some(Value::Array(documents)) if !documents.is_empty() => {
                    Self::InsertMany { documents }
                }
                _ => {
                    return Err(DbError::InvalidArgument(
                        "insertMany requires a non-empty array of documents".into(),
                    ))
                }
            },
            "updateOne" | "updateMany" => {
                let filter = filter_arg(next())?;
                let update = match next() {
                    Some(u @ (Value::Object(_) | Value::Array(_))) => u,
                    _ => {
                        return Err(DbError::InvalidArgument(format!(
                            "{verb} requires an update document"
                        )))
                    }
                };
                let upsert = next()
                    .and_then(|o| o.get("upsert").and_then(Value::as_bool))
                    .unwrap_or(false);
                if verb == "updateOne" {
                    Self::UpdateOne {
                        filter,
                        update,
                        upsert,
                    }
                } else {
                    Self::UpdateMany {
                        filter,
                        update,
                        upsert,
                    }
                }
            }
            "deleteOne" => Self::DeleteOne {
                filter: filter_arg(next())?,
            },
            "deleteMany" => Self::DeleteMany {
                filter: filter_arg(next())?,
            },
            "countDocuments" => Self::CountDocuments {
                filter: filter_arg(next())?,
            },
            "aggregate" => match next() {
                Some(Value::Array(pipeline)) => Self::Aggregate { pipeline },
                None => Self::Aggregate {
                    pipeline: Vec::new(),
                },
                Some(_) => {
                    return Err(DbError::InvalidArgument(
                        "aggregate requires an array of pipeline stages".into(),
                    ))
                }
            },
            "createIndex" => Self::CreateIndex {
                keys: object_arg("createIndex", next())?,
                options: match next() {
                    Some(Value::Object(m)) => m,
                    _ => Map::new(),
                },
            },
            "dropIndex" => match next() {
                Some(Value::String(name)) => Self::DropIndex { name },
                _ => {
                    return Err(DbError::InvalidArgument(
                        "dropIndex requires an index name".into(),
                    ))
                }
            },
            "listIndexes" => Self::ListIndexes,
            "drop" => Self::Drop,
            other => return Err(DbError::Unsupported(other.to_string())),
        };
        Ok(op)
    }

    /// The script-side verb name.
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Find { .. } => "find",
            Self::FindOne { .. } => "findOne",
            Self::InsertOne { .. } => "insertOne",
            Self::InsertMany { .. } => "insertMany",
            Self::UpdateOne { .. } => "updateOne",
            Self::UpdateMany { .. } => "updateMany",
            Self::DeleteOne { .. } => "deleteOne",
            Self::DeleteMany { .. } => "deleteMany",
            Self::CountDocuments { .. } => "countDocuments",
            Self::Aggregate { .. } => "aggregate",
            Self::CreateIndex { .. } => "createIndex",
            Self::DropIndex { .. } => "dropIndex",
            Self::ListIndexes => "listIndexes",
            Self::Drop => "drop",
        }
    }

    /// The query filter, for verbs that take one.
    pub fn filter(&self) -> Option<&Value> {
        match self {
            Self::Find { filter, .. }
            | Self::FindOne { filter, .. }
            | Self::UpdateOne { filter, .. }
            | Self::UpdateMany { filter, .. }
            | Self::DeleteOne { filter }
            | Self::DeleteMany { filter }
            | Self::CountDocuments { filter } => Some(filter),
            _ => None,
        }
    }
}

fn filter_arg(value: Option<Value>) -> Result<Value, DbError> {
    match value {
        None => Ok(Value::Object(Map::new())),
        Some(v @ Value::Object(_)) => Ok(v),
        Some(other) => Err(DbError::InvalidArgument(format!(
            "filter must be an object, got {other}"
        ))),
    }
}

fn object_arg(verb: &str, value: Option<Value>) -> Result<Value, DbError> {
    match value {
        Some(v @ Value::Object(_)) => Ok(v),
        _ => Err(DbError::InvalidArgument(format!(
            "{verb} requires a document"
        ))),
    }
}

/// What a document-store client returns for an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentReply {
    /// `find`, `aggregate`.
    Documents(Vec<Value>),
    /// `findOne`.
    Document(Option<Value>),
    /// `insertOne`, `insertMany`.
    Inserted {
        /// Generated or supplied `_id` values, in input order.
        ids: Vec<Value>,
    },
    /// `updateOne`, `updateMany`.
    Updated {
        /// Documents matched by the filter.
        matched: u64,
        /// Documents changed.
        modified: u64,
        /// `_id` of an upserted document.
        upserted_id: Option<Value>,
    },
    /// `deleteOne`, `deleteMany`.
    Deleted(u64),
    /// `countDocuments`.
    Count(u64),
    /// `createIndex`.
    IndexName(String),
    /// `listIndexes`.
    Indexes(Vec<Value>),
    /// `drop`, `dropIndex`.
    Acknowledged,
}

/// A document-store connection bound to one database.
#[async_trait]
pub trait DocumentClient: Send + Sync {
    /// Run one operation against a collection.
    async fn execute(&self, collection: &str, op: DocumentOp) -> Result<DocumentReply, DbError>;

    /// Names of the collections in the database.
    async fn list_collections(&self) -> Result<Vec<String>, DbError>;

    /// Release the connection. Best-effort.
    async fn close(&self);
}

/// Record a `data` preview of the first `preview_rows` values.
pub(crate) fn push_preview(
    output: &OutputCapture,
    message: String,
    values: &[Value],
    preview_rows: usize,
) {
    output.push(OutputItem::Data {
        message,
        timestamp: chrono::Utc::now(),
        preview: values.iter().take(preview_rows).cloned().collect(),
        total: values.len() as u64,
        truncated: values.len() > preview_rows,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_find_with_options() {
        let op = DocumentOp::parse(
            "find",
            vec![json!({"age": {"$gt": 21}}), json!({"limit": 5, "sort": {"age": -1}})],
        )
        .unwrap();
        match op {
            DocumentOp::Find { filter, options } => {
                assert_eq!(filter["age"]["$gt"], 21);
                assert_eq!(options.limit, Some(5));
                assert_eq!(options.sort, Some(json!({"age": -1})));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_or_null_filter_is_empty() {
        let op = DocumentOp::parse("deleteMany", vec![]).unwrap();
        assert_eq!(op.filter(), Some(&json!({})));
        let op = DocumentOp::parse("countDocuments", vec![Value::Null]).unwrap();
        assert_eq!(op.filter(), Some(&json!({})));
    }

    #[test]
    fn update_reads_upsert_flag() {
        let op = DocumentOp::parse(
            "updateOne",
            vec![json!({"_id": 1}), json!({"$set": {"a": 1}}), json!({"upsert": true})],
        )
        .unwrap();
        assert!(matches!(op, DocumentOp::UpdateOne { upsert: true, .. }));
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(matches!(
            DocumentOp::parse("find", vec![json!("name = 'x'")]),
            Err(DbError::InvalidArgument(_))
        ));
        assert!(DocumentOp::parse("insertMany", vec![json!([])]).is_err());
        assert!(DocumentOp::parse("updateMany", vec![json!({})]).is_err());
        assert!(DocumentOp::parse("dropIndex", vec![]).is_err());
    }

    #[test]
    fn unknown_verbs_are_unsupported() {
        let err = DocumentOp::parse("mapReduce", vec![]).unwrap_err();
        assert!(matches!(err, DbError::Unsupported(ref v) if v == "mapReduce"));
    }

    #[test]
    fn verb_names_round_trip() {
        for verb in [
            "find",
            "findOne",
            "deleteOne",
            "deleteMany",
            "countDocuments",
            "aggregate",
            "listIndexes",
            "drop",
        ] {
            assert_eq!(DocumentOp::parse(verb, vec![]).unwrap().verb(), verb);
        }
    }
}
