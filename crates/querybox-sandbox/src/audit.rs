//! Audit logging for script executions.
//!
//! Every execution, including ones rejected by validation, emits one
//! [`AuditEntry`]. The script itself is never logged: entries carry its
//! SHA-256 and a redacted 500-character preview.
//!
//! The [`AuditLogger`] trait allows pluggable backends.
//! [`JsonLinesAuditLogger`] writes newline-delimited JSON to any `AsyncWrite`.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::redact::redact_error_message;
use crate::result::{BackendKind, ErrorKind, ExecutionResult, ExecutionSummary};

/// Maximum length of the script preview in audit entries.
const SCRIPT_PREVIEW_MAX: usize = 500;

/// A complete audit record for a single execution.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Execution identifier, shared with the [`ExecutionResult`].
    pub execution_id: String,
    /// When the executor accepted the request.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 of the submitted script.
    pub script_hash: String,
    /// First characters of the script, credentials redacted.
    pub script_preview: String,
    /// Backend kind of the target.
    pub backend_kind: BackendKind,
    /// Catalog instance identifier.
    pub instance_id: String,
    /// Database name.
    pub database_name: String,
    /// Total duration in milliseconds.
    pub duration_ms: u64,
    /// Final outcome.
    pub outcome: AuditOutcome,
    /// Aggregate counts over the execution's output.
    pub summary: ExecutionSummary,
}

/// The outcome of an execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum AuditOutcome {
    /// The script ran to completion.
    Success,
    /// The script was rejected or failed.
    Error {
        /// Taxonomy bucket.
        kind: ErrorKind,
        /// The error message.
        message: String,
    },
    /// The execution deadline passed.
    Timeout,
}

impl AuditEntry {
    /// Build the entry for a finished execution.
    pub fn new(script: &str, result: &ExecutionResult) -> Self {
        let outcome = match &result.error {
            None => AuditOutcome::Success,
            Some(e) if e.kind == ErrorKind::Timeout => AuditOutcome::Timeout,
            Some(e) => AuditOutcome::Error {
                kind: e.kind,
                message: e.message.clone(),
            },
        };
        Self {
            execution_id: result.execution_id.clone(),
            timestamp: result.metadata.executed_at,
            script_hash: sha256_hex(script),
            script_preview: redact_error_message(&script_preview(script)),
            backend_kind: result.metadata.backend_kind,
            instance_id: result.metadata.instance_id.clone(),
            database_name: result.metadata.database_name.clone(),
            duration_ms: result.duration_ms,
            outcome,
            summary: result.summary.clone(),
        }
    }
}

/// Trait for audit log backends.
#[async_trait::async_trait]
pub trait AuditLogger: Send + Sync {
    /// Write an audit entry.
    async fn log(&self, entry: &AuditEntry);
}

/// Writes audit entries as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesAuditLogger<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesAuditLogger<W> {
    /// Create a logger writing to `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AuditLogger for JsonLinesAuditLogger<W> {
    async fn log(&self, entry: &AuditEntry) {
        let mut line = match serde_json::to_string(entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
        let _ = writer.flush().await;
    }
}

/// A no-op audit logger.
pub struct NoopAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _entry: &AuditEntry) {}
}

/// Emits audit entries as `INFO` events with `audit = true`.
pub struct TracingAuditLogger;

#[async_trait::async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, entry: &AuditEntry) {
        let (outcome, error_kind) = match &entry.outcome {
            AuditOutcome::Success => ("success", None),
            AuditOutcome::Error { kind, .. } => ("error", Some(kind.as_str())),
            AuditOutcome::Timeout => ("timeout", None),
        };
        tracing::info!(
            audit = true,
            execution_id = %entry.execution_id,
            backend = %entry.backend_kind,
            instance = %entry.instance_id,
            database = %entry.database_name,
            script_hash = %entry.script_hash,
            duration_ms = entry.duration_ms,
            queries = entry.summary.queries,
            operations = entry.summary.operations,
            critical = entry.summary.critical_operations,
            outcome,
            error_kind,
            "audit"
        );
    }
}

/// SHA-256 of a string, hex encoded.
pub fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(hex, "{b:02x}");
    }
    hex
}

/// First [`SCRIPT_PREVIEW_MAX`] bytes of the script, cut on a char boundary.
pub fn script_preview(script: &str) -> String {
    if script.len() <= SCRIPT_PREVIEW_MAX {
        return script.to_string();
    }
    let mut end = SCRIPT_PREVIEW_MAX;
    while !script.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &script[..end])
}
