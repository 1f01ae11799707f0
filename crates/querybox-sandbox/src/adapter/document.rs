use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Map, Value};

use super::{push_preview, DocumentClient, DocumentOp, DocumentReply};
use crate::error::DbError;
use crate::ipc::ExecutionLimits;
use crate::output::{preview, OutputCapture, OutputItem, Risk};
use crate::redact::redact_error_message;

const FILTER_PREVIEW_CHARS: usize = 100;

/// `db` for document backends.
pub struct DocumentAdapter {
    client: Arc<dyn DocumentClient>,
    output: OutputCapture,
    limits: ExecutionLimits,
    op_count: AtomicU64,
}

fn is_empty_filter(op: &DocumentOp) -> bool {
    op.filter()
        .and_then(Value::as_object)
        .is_some_and(Map::is_empty)
}

fn risk_of(op: &DocumentOp) -> Option<Risk> {
    match op {
        DocumentOp::Drop => Some(Risk::Critical),
        DocumentOp::DeleteMany { .. } | DocumentOp::UpdateMany { .. } if is_empty_filter(op) => {
            Some(Risk::Critical)
        }
        DocumentOp::DeleteMany { .. } | DocumentOp::UpdateMany { .. } | DocumentOp::DropIndex { .. } => {
            Some(Risk::High)
        }
        _ => None,
    }
}

impl DocumentAdapter {
    /// Wrap a client, recording into `output`.
    pub fn new(
        client: Arc<dyn DocumentClient>,
        output: OutputCapture,
        limits: ExecutionLimits,
    ) -> Self {
        Self {
            client,
            output,
            limits,
            op_count: AtomicU64::new(0),
        }
    }

    /// Run `db.collection(collection)[verb](...args)`.
    pub async fn call(
        &self,
        collection: &str,
        verb: &str,
        args: Vec<Value>,
    ) -> Result<Value, DbError> {
        let number = self.op_count.fetch_add(1, Ordering::Relaxed) + 1;
        let op = DocumentOp::parse(verb, args).map_err(|e| self.fail(number, collection, verb, e))?;
        let op = self.cap_reads(op);

        let risk = risk_of(&op);
        let filter = op
            .filter()
            .map(|f| preview(&f.to_string(), FILTER_PREVIEW_CHARS));
        if risk == Some(Risk::Critical) {
            let scope = match &op {
                DocumentOp::Drop => "drops the collection".to_string(),
                _ => "has an empty filter and affects every document".to_string(),
            };
            self.output.warn(
                format!("CRITICAL: {collection}.{verb}() {scope}"),
                Some(Risk::Critical),
            );
        }

        let started = Instant::now();
        let reply = self
            .client
            .execute(collection, op)
            .await
            .map_err(|e| self.fail(number, collection, verb, e))?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (value, count, read) = self.shape(reply);
        self.output.push(OutputItem::Operation {
            message: format!("Operation #{number}: {collection}.{verb}()"),
            timestamp: Utc::now(),
            op_number: number,
            collection: collection.to_string(),
            operation: verb.to_string(),
            filter,
            count,
            duration_ms,
            risk,
        });
        if let Some(docs) = read {
            push_preview(
                &self.output,
                format!("{collection}.{verb}() returned {} documents", docs.len()),
                &docs,
                self.limits.preview_rows,
            );
        }
        Ok(value)
    }

    /// `db.listCollections()`.
    pub async fn list_collections(&self) -> Result<Value, DbError> {
        let number = self.op_count.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();
        let names = self
            .client
            .list_collections()
            .await
            .map_err(|e| self.fail(number, "*", "listCollections", e))?;
        self.output.push(OutputItem::Operation {
            message: format!("Operation #{number}: listCollections()"),
            timestamp: Utc::now(),
            op_number: number,
            collection: "*".into(),
            operation: "listCollections".into(),
            filter: None,
            count: Some(names.len() as u64),
            duration_ms: started.elapsed().as_millis() as u64,
            risk: None,
        });
        Ok(json!(names))
    }

    /// Release the underlying connection.
    pub async fn close(&self) {
        self.client.close().await;
    }

    // Reads never return more than `max_documents`, whatever the script asked for.
    fn cap_reads(&self, op: DocumentOp) -> DocumentOp {
        let max = self.limits.max_documents as u64;
        match op {
            DocumentOp::Find {
                filter,
                mut options,
            } => {
                options.limit = Some(options.limit.filter(|l| *l > 0).map_or(max, |l| l.min(max)));
                DocumentOp::Find { filter, options }
            }
            DocumentOp::Aggregate { mut pipeline } => {
                let writes = pipeline.last().and_then(Value::as_object).is_some_and(|stage| {
                    stage.contains_key("$out") || stage.contains_key("$merge")
                });
                if !writes {
                    pipeline.push(json!({ "$limit": max }));
                }
                DocumentOp::Aggregate { pipeline }
            }
            other => other,
        }
    }

    /// Script-facing value, operation count, and documents to preview.
    fn shape(&self, reply: DocumentReply) -> (Value, Option<u64>, Option<Vec<Value>>) {
        match reply {
            DocumentReply::Documents(mut docs) => {
                docs.truncate(self.limits.max_documents);
                let count = docs.len() as u64;
                (Value::Array(docs.clone()), Some(count), Some(docs))
            }
            DocumentReply::Document(doc) => {
                let count = u64::from(doc.is_some());
                let docs = doc.iter().cloned().collect();
                (doc.unwrap_or(Value::Null), Some(count), Some(docs))
            }
            DocumentReply::Inserted { ids } if ids.len() == 1 => (
                json!({ "acknowledged": true, "insertedId": ids[0] }),
                Some(1),
                None,
            ),
            DocumentReply::Inserted { ids } => {
                let count = ids.len() as u64;
                let by_index: Map<String, Value> = ids
                    .into_iter()
                    .enumerate()
                    .map(|(i, id)| (i.to_string(), id))
                    .collect();
                (
                    json!({
                        "acknowledged": true,
                        "insertedCount": count,
                        "insertedIds": by_index,
                    }),
                    Some(count),
                    None,
                )
            }
            DocumentReply::Updated {
                matched,
                modified,
                upserted_id,
            } => (
                json!({
                    "acknowledged": true,
                    "matchedCount": matched,
                    "modifiedCount": modified,
                    "upsertedId": upserted_id,
                }),
                Some(modified),
                None,
            ),
            DocumentReply::Deleted(n) => (
                json!({ "acknowledged": true, "deletedCount": n }),
                Some(n),
                None,
            ),
            DocumentReply::Count(n) => (json!(n), Some(n), None),
            DocumentReply::IndexName(name) => (json!(name), None, None),
            DocumentReply::Indexes(indexes) => {
                let count = indexes.len() as u64;
                (Value::Array(indexes), Some(count), None)
            }
            DocumentReply::Acknowledged => (json!(true), None, None),
        }
    }

    fn fail(&self, number: u64, collection: &str, verb: &str, err: DbError) -> DbError {
        let code = err.code().map(str::to_string);
        self.output.error(
            format!(
                "Operation #{number} {collection}.{verb}() failed: {}",
                redact_error_message(&err.to_string())
            ),
            code,
        );
        err
    }
}
