//! deno_core ops backing the script namespace.
//!
//! The `#[op2]` macro generates public items that cannot carry doc comments,
//! so `missing_docs` is relaxed for this module.
#![allow(missing_docs)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use deno_core::op2;
use deno_core::OpState;
use deno_error::JsErrorBox;
use serde_json::{json, Value};

use crate::adapter::{DocumentAdapter, SqlAdapter};
use crate::error::DbError;
use crate::output::{preview, OutputCapture, OutputItem, MAX_MESSAGE_CHARS};
use crate::redact::redact_error_message;

/// Longest delay a script timer may request.
pub const MAX_TIMER_MS: u32 = 5000;

/// The adapter bound to `db` for this execution.
#[derive(Clone)]
pub enum DbBinding {
    /// `db.query` / `db.execute`.
    Relational(Arc<SqlAdapter>),
    /// `db.collection(...)` / `db.listCollections`.
    Document(Arc<DocumentAdapter>),
}

/// The JSON envelope the script's wrapper reports on completion.
pub struct ScriptOutcome(pub String);

/// Append a console line to the output log.
#[op2(fast)]
pub fn op_qb_console(state: &mut OpState, #[string] level: &str, #[string] message: &str) {
    let message = preview(message, MAX_MESSAGE_CHARS);
    tracing::trace!(target: "querybox::script", console = level, "{}", message);
    let item = match level {
        "info" => OutputItem::info(message),
        "warn" => OutputItem::warn(message, None),
        "error" => OutputItem::error(message, None),
        _ => OutputItem::log(message),
    };
    state.borrow::<OutputCapture>().push(item);
}

/// Store the completion envelope.
#[op2(fast)]
pub fn op_qb_set_result(state: &mut OpState, #[string] json: &str) {
    state.put(ScriptOutcome(json.to_string()));
}

/// Resolve after `ms` milliseconds, clamped to [`MAX_TIMER_MS`].
#[op2(async)]
pub async fn op_qb_sleep(#[smi] ms: u32) {
    tokio::time::sleep(Duration::from_millis(u64::from(ms.min(MAX_TIMER_MS)))).await;
}

/// `db.query` / `db.execute` on a relational binding.
#[op2(async)]
#[string]
pub async fn op_qb_sql(
    op_state: Rc<RefCell<OpState>>,
    #[string] verb: String,
    #[string] sql: String,
    #[string] params_json: String,
) -> Result<String, JsErrorBox> {
    let adapter = match binding(&op_state)? {
        DbBinding::Relational(adapter) => adapter,
        DbBinding::Document(_) => {
            return Err(JsErrorBox::type_error(
                "SQL statements are not available on a document database",
            ))
        }
    };
    let params: Vec<Value> = match serde_json::from_str(&params_json) {
        Ok(Value::Array(items)) => items,
        Ok(Value::Null) => Vec::new(),
        _ => return Err(JsErrorBox::type_error("query parameters must be an array")),
    };

    tracing::debug!(verb = %verb, sql_len = sql.len(), params = params.len(), "sql dispatched");
    let result = match verb.as_str() {
        "query" => adapter.query(&sql, &params).await,
        "execute" => adapter.execute(&sql, &params).await,
        other => return Err(JsErrorBox::type_error(format!("unknown verb '{other}'"))),
    };
    Ok(envelope(result))
}

/// `db.collection(name)[verb](...)` on a document binding.
#[op2(async)]
#[string]
pub async fn op_qb_document(
    op_state: Rc<RefCell<OpState>>,
    #[string] collection: String,
    #[string] verb: String,
    #[string] args_json: String,
) -> Result<String, JsErrorBox> {
    let adapter = document_adapter(&op_state)?;
    let args: Vec<Value> = match serde_json::from_str(&args_json) {
        Ok(Value::Array(items)) => items,
        _ => return Err(JsErrorBox::type_error("operation arguments must be an array")),
    };

    tracing::debug!(collection = %collection, verb = %verb, "document op dispatched");
    Ok(envelope(adapter.call(&collection, &verb, args).await))
}

/// `db.listCollections()`.
#[op2(async)]
#[string]
pub async fn op_qb_list_collections(
    op_state: Rc<RefCell<OpState>>,
) -> Result<String, JsErrorBox> {
    let adapter = document_adapter(&op_state)?;
    Ok(envelope(adapter.list_collections().await))
}

fn binding(op_state: &Rc<RefCell<OpState>>) -> Result<DbBinding, JsErrorBox> {
    op_state
        .borrow()
        .try_borrow::<DbBinding>()
        .cloned()
        .ok_or_else(|| JsErrorBox::generic("no database is bound to this execution"))
}

fn document_adapter(op_state: &Rc<RefCell<OpState>>) -> Result<Arc<DocumentAdapter>, JsErrorBox> {
    match binding(op_state)? {
        DbBinding::Document(adapter) => Ok(adapter),
        DbBinding::Relational(_) => Err(JsErrorBox::type_error(
            "collections are not available on a relational database",
        )),
    }
}

/// Database failures travel as data so the script sees a `DatabaseError`
/// carrying the backend code.
fn envelope(result: Result<Value, DbError>) -> String {
    let value = match result {
        Ok(value) => json!({ "ok": value }),
        Err(e) => json!({
            "error": {
                "message": redact_error_message(&e.to_string()),
                "code": e.code(),
            }
        }),
    };
    value.to_string()
}

deno_core::extension!(
    querybox_ext,
    ops = [
        op_qb_console,
        op_qb_set_result,
        op_qb_sleep,
        op_qb_sql,
        op_qb_document,
        op_qb_list_collections
    ],
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wraps_values() {
        let out: Value = serde_json::from_str(&envelope(Ok(json!([1, 2])))).unwrap();
        assert_eq!(out["ok"], json!([1, 2]));
    }

    #[test]
    fn envelope_redacts_and_keeps_code() {
        let err = DbError::query(
            "could not reach postgres://admin:pw@10.0.0.5:5432/app",
            Some("08006".into()),
        );
        let out: Value = serde_json::from_str(&envelope(Err(err))).unwrap();
        let message = out["error"]["message"].as_str().unwrap();
        assert!(!message.contains("admin:pw"), "{message}");
        assert_eq!(out["error"]["code"], "08006");
    }

    #[test]
    fn envelope_code_is_null_when_unknown() {
        let out: Value =
            serde_json::from_str(&envelope(Err(DbError::Unsupported("mapReduce".into())))).unwrap();
        assert!(out["error"]["code"].is_null());
    }
}
