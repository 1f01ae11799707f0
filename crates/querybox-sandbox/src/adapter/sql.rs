use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{json, Value};

use super::{push_preview, RelationalClient};
use crate::error::DbError;
use crate::ipc::ExecutionLimits;
use crate::output::{preview, OutputCapture, OutputItem, Risk};
use crate::redact::redact_error_message;

const SQL_PREVIEW_CHARS: usize = 200;

/// How a statement is classified before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatementClass {
    /// Whether the statement produces a result set.
    pub returns_rows: bool,
    /// Destructive-statement marker.
    pub risk: Option<Risk>,
}

/// Classify a statement by its leading keyword and clauses.
pub fn classify_statement(sql: &str) -> StatementClass {
    let upper = sql.to_ascii_uppercase();
    let words: Vec<&str> = upper
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .collect();
    let first = words.first().copied().unwrap_or("");
    let has = |kw: &str| words.contains(&kw);

    let returns_rows = matches!(
        first,
        "SELECT" | "WITH" | "SHOW" | "EXPLAIN" | "VALUES" | "TABLE"
    ) || has("RETURNING");

    let risk = match first {
        "TRUNCATE" => Some(Risk::Critical),
        "DROP" if words.get(1).is_some_and(|w| matches!(*w, "TABLE" | "DATABASE" | "SCHEMA")) => {
            Some(Risk::Critical)
        }
        "DROP" => Some(Risk::High),
        "DELETE" | "UPDATE" if !has("WHERE") => Some(Risk::Critical),
        "ALTER" if has("DROP") => Some(Risk::High),
        _ => None,
    };

    StatementClass { returns_rows, risk }
}

/// First keyword of a statement, uppercased.
fn query_type(sql: &str) -> String {
    sql.split_whitespace()
        .next()
        .map(|w| w.trim_start_matches('(').to_ascii_uppercase())
        .unwrap_or_default()
}

/// `db` for relational backends.
pub struct SqlAdapter {
    client: Arc<dyn RelationalClient>,
    output: OutputCapture,
    limits: ExecutionLimits,
    query_count: AtomicU64,
}

impl SqlAdapter {
    /// Wrap a client, recording into `output`.
    pub fn new(
        client: Arc<dyn RelationalClient>,
        output: OutputCapture,
        limits: ExecutionLimits,
    ) -> Self {
        Self {
            client,
            output,
            limits,
            query_count: AtomicU64::new(0),
        }
    }

    /// `db.query(sql, params)`: `{rows, rowCount, fields}` for row-returning
    /// statements, `{rows: [], rowCount, rowsAffected}` otherwise.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Value, DbError> {
        let class = classify_statement(sql);
        let number = self.begin(sql, class);
        let started = Instant::now();

        if class.returns_rows {
            let set = self
                .client
                .query(sql, params)
                .await
                .map_err(|e| self.fail(number, e))?;
            let rows: Vec<Value> = set.rows.into_iter().map(Value::Object).collect();
            let count = rows.len() as u64;
            self.record(number, sql, class, started, Some(count), None);
            push_preview(
                &self.output,
                format!("Query #{number} returned {count} rows"),
                &rows,
                self.limits.preview_rows,
            );
            Ok(json!({
                "rows": rows,
                "rowCount": count,
                "fields": set.fields,
            }))
        } else {
            let affected = self
                .client
                .execute(sql, params)
                .await
                .map_err(|e| self.fail(number, e))?;
            self.record(number, sql, class, started, None, Some(affected));
            Ok(json!({
                "rows": [],
                "rowCount": affected,
                "rowsAffected": affected,
            }))
        }
    }

    /// `db.execute(sql, params)`: the number of rows affected.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<Value, DbError> {
        let class = classify_statement(sql);
        let number = self.begin(sql, class);
        let started = Instant::now();
        let affected = self
            .client
            .execute(sql, params)
            .await
            .map_err(|e| self.fail(number, e))?;
        self.record(number, sql, class, started, None, Some(affected));
        Ok(json!(affected))
    }

    /// Release the underlying connection.
    pub async fn close(&self) {
        self.client.close().await;
    }

    fn begin(&self, sql: &str, class: StatementClass) -> u64 {
        let number = self.query_count.fetch_add(1, Ordering::Relaxed) + 1;
        if class.risk == Some(Risk::Critical) {
            self.output.warn(
                format!(
                    "CRITICAL: {} statement affects every row: {}",
                    query_type(sql),
                    preview(sql, SQL_PREVIEW_CHARS)
                ),
                Some(Risk::Critical),
            );
        }
        number
    }

    fn record(
        &self,
        number: u64,
        sql: &str,
        class: StatementClass,
        started: Instant,
        row_count: Option<u64>,
        rows_affected: Option<u64>,
    ) {
        let query_type = query_type(sql);
        self.output.push(OutputItem::Query {
            message: format!("Query #{number}: {query_type}"),
            timestamp: Utc::now(),
            query_number: number,
            query_type,
            sql: preview(sql, SQL_PREVIEW_CHARS),
            duration_ms: started.elapsed().as_millis() as u64,
            row_count,
            rows_affected,
            risk: class.risk,
        });
    }

    fn fail(&self, number: u64, err: DbError) -> DbError {
        let code = err.code().map(str::to_string);
        self.output.error(
            format!(
                "Query #{number} failed: {}",
                redact_error_message(&err.to_string())
            ),
            code,
        );
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_reads() {
        assert!(classify_statement("SELECT 1").returns_rows);
        assert!(classify_statement("  with t as (select 1) select * from t").returns_rows);
        assert!(classify_statement("INSERT INTO t (a) VALUES (1) RETURNING id").returns_rows);
        assert!(!classify_statement("INSERT INTO t (a) VALUES (1)").returns_rows);
    }

    #[test]
    fn classifies_destructive_statements() {
        assert_eq!(classify_statement("DELETE FROM users").risk, Some(Risk::Critical));
        assert_eq!(classify_statement("update users set a = 1").risk, Some(Risk::Critical));
        assert_eq!(classify_statement("TRUNCATE logs").risk, Some(Risk::Critical));
        assert_eq!(classify_statement("DROP TABLE logs").risk, Some(Risk::Critical));
        assert_eq!(classify_statement("DROP INDEX idx_a").risk, Some(Risk::High));
        assert_eq!(classify_statement("DELETE FROM users WHERE id = $1").risk, None);
        assert_eq!(classify_statement("SELECT * FROM dropped_items").risk, None);
    }

    #[test]
    fn query_type_is_first_keyword() {
        assert_eq!(query_type("  select * from t"), "SELECT");
        assert_eq!(query_type("(SELECT 1)"), "SELECT");
        assert_eq!(query_type(""), "");
    }
}
