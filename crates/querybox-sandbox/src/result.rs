//! Request and result types shared by the supervisor, the worker, and callers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::output::{OutputItem, Risk};
use crate::validator::ValidationResult;

/// Which adapter a script runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Relational database (PostgreSQL).
    Relational,
    /// Document store (MongoDB).
    Document,
}

impl BackendKind {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::Document => "document",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relational" | "postgres" | "postgresql" => Ok(Self::Relational),
            "document" | "mongo" | "mongodb" => Ok(Self::Document),
            other => Err(format!(
                "unknown backend kind '{other}', expected 'relational' or 'document'"
            )),
        }
    }
}

/// A script submitted for execution. Owned by the caller; read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// The script body (the inside of an async function).
    pub script_body: String,
    /// Backend the script targets.
    pub backend_kind: BackendKind,
    /// Catalog identifier of the database instance.
    pub instance_id: String,
    /// Database to open on that instance.
    pub database_name: String,
    /// Optional per-request timeout override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ExecutionRequest {
    /// Create a request with the executor's default timeout.
    pub fn new(
        script_body: impl Into<String>,
        backend_kind: BackendKind,
        instance_id: impl Into<String>,
        database_name: impl Into<String>,
    ) -> Self {
        Self {
            script_body: script_body.into(),
            backend_kind,
            instance_id: instance_id.into(),
            database_name: database_name.into(),
            timeout_ms: None,
        }
    }

    /// Override the timeout for this request.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Caller-facing error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Script failed to parse.
    #[serde(rename = "SyntaxError")]
    Syntax,
    /// Script matched a blocking signature or a size/emptiness rule.
    #[serde(rename = "ValidationError")]
    Validation,
    /// Instance lookup or database connection failed.
    #[serde(rename = "ConnectionError")]
    Connection,
    /// The script threw while running.
    #[serde(rename = "RuntimeError")]
    Runtime,
    /// The execution deadline passed.
    #[serde(rename = "TimeoutError")]
    Timeout,
    /// The worker process crashed or exited before reporting.
    #[serde(rename = "ProcessError")]
    Process,
    /// The worker could not run its protocol (bad config, runtime setup).
    #[serde(rename = "WorkerError")]
    Worker,
}

impl ErrorKind {
    /// The wire name, e.g. `TimeoutError`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syntax => "SyntaxError",
            Self::Validation => "ValidationError",
            Self::Connection => "ConnectionError",
            Self::Runtime => "RuntimeError",
            Self::Timeout => "TimeoutError",
            Self::Process => "ProcessError",
            Self::Worker => "WorkerError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error attached to a failed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Taxonomy bucket.
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    /// Human-readable message (credentials redacted).
    pub message: String,
    /// Native JavaScript error name for runtime failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ErrorInfo {
    /// Create an error without a native name.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            name: None,
        }
    }
}

/// The single terminal message a worker sends back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildProcessResult {
    /// Whether the script completed without throwing.
    pub success: bool,
    /// The script's return value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Everything the script emitted, in order.
    #[serde(default)]
    pub output: Vec<OutputItem>,
}

impl ChildProcessResult {
    /// A successful run.
    pub fn succeeded(result: Value, output: Vec<OutputItem>) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            output,
        }
    }

    /// A failed run.
    pub fn failed(error: ErrorInfo, output: Vec<OutputItem>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
            output,
        }
    }

    /// A failure synthesized on the supervisor side, with no worker output.
    pub fn synthesized(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::failed(ErrorInfo::new(kind, message), Vec::new())
    }
}

/// Aggregate counts over an execution's output, for caller convenience.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Relational statements issued.
    pub queries: u64,
    /// Document-store operations issued.
    pub operations: u64,
    /// Rows returned or affected across all statements.
    pub rows: u64,
    /// Documents returned or affected across all operations.
    pub documents: u64,
    /// `error` items.
    pub errors: u64,
    /// `warn` items.
    pub warnings: u64,
    /// Statements or operations flagged as critical risk.
    pub critical_operations: u64,
}

impl ExecutionSummary {
    /// Compute the summary for an output log.
    pub fn from_output(output: &[OutputItem]) -> Self {
        let mut summary = Self::default();
        for item in output {
            match item {
                OutputItem::Query {
                    row_count,
                    rows_affected,
                    risk,
                    ..
                } => {
                    summary.queries += 1;
                    summary.rows += row_count.or(*rows_affected).unwrap_or(0);
                    if *risk == Some(Risk::Critical) {
                        summary.critical_operations += 1;
                    }
                }
                OutputItem::Operation { count, risk, .. } => {
                    summary.operations += 1;
                    summary.documents += count.unwrap_or(0);
                    if *risk == Some(Risk::Critical) {
                        summary.critical_operations += 1;
                    }
                }
                OutputItem::Error { .. } => summary.errors += 1,
                OutputItem::Warn { .. } => summary.warnings += 1,
                _ => {}
            }
        }
        summary
    }
}

/// Where and when an execution ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    /// Backend kind of the target.
    pub backend_kind: BackendKind,
    /// Database name.
    pub database_name: String,
    /// Catalog instance identifier.
    pub instance_id: String,
    /// When the executor accepted the request.
    pub executed_at: DateTime<Utc>,
}

impl ExecutionMetadata {
    /// Metadata for a request accepted now.
    pub fn for_request(request: &ExecutionRequest, executed_at: DateTime<Utc>) -> Self {
        Self {
            backend_kind: request.backend_kind,
            database_name: request.database_name.clone(),
            instance_id: request.instance_id.clone(),
            executed_at,
        }
    }
}

/// The executor's normalized, JSON-serializable outcome. Contains no credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Unique identifier, shared with the audit entry.
    pub execution_id: String,
    /// Whether the script ran to completion.
    pub success: bool,
    /// The script's return value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Captured output, in emission order.
    pub output: Vec<OutputItem>,
    /// Aggregate counts over `output`.
    pub summary: ExecutionSummary,
    /// Non-blocking validation warnings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Target and timing metadata.
    pub metadata: ExecutionMetadata,
}

impl ExecutionResult {
    /// Normalize a worker's report.
    pub fn from_child(
        execution_id: String,
        child: ChildProcessResult,
        warnings: Vec<String>,
        duration_ms: u64,
        metadata: ExecutionMetadata,
    ) -> Self {
        let summary = ExecutionSummary::from_output(&child.output);
        Self {
            execution_id,
            success: child.success,
            result: child.result,
            error: child.error,
            output: child.output,
            summary,
            warnings,
            duration_ms,
            metadata,
        }
    }

    /// A request rejected by validation before any process was spawned.
    pub fn rejected(
        execution_id: String,
        validation: &ValidationResult,
        duration_ms: u64,
        metadata: ExecutionMetadata,
    ) -> Self {
        let output: Vec<OutputItem> = validation
            .errors
            .iter()
            .map(|e| OutputItem::error(format!("Validation failed: {e}"), None))
            .collect();
        let child = ChildProcessResult::failed(
            ErrorInfo::new(validation.failure_kind(), validation.errors.join("; ")),
            output,
        );
        Self::from_child(
            execution_id,
            child,
            validation.warnings.clone(),
            duration_ms,
            metadata,
        )
    }

    /// The error kind, if the execution failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}
