//! The job a worker process runs: connect, execute, report.
//!
//! Shared by the `querybox-worker` binary and the in-process execution mode so
//! both produce the same [`ChildProcessResult`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::adapter::{DocumentAdapter, SqlAdapter};
use crate::backend::{Connection, Connector};
use crate::error::SandboxError;
use crate::ipc::WorkerConfig;
use crate::ops::DbBinding;
use crate::output::{OutputCapture, OutputItem};
use crate::redact::redact_error_message;
use crate::result::{ChildProcessResult, ErrorInfo, ErrorKind};
use crate::runtime::{run_script, RunLimits};

/// Run one script against one freshly opened connection.
///
/// Never fails: every error is folded into the returned result together with
/// whatever output was captured before it.
pub async fn run_worker_job(config: WorkerConfig, connector: &dyn Connector) -> ChildProcessResult {
    let output = OutputCapture::new(config.limits.max_output_items);

    let mut details = Map::new();
    details.insert("database".into(), Value::from(config.database_name.clone()));
    details.insert("instance".into(), Value::from(config.instance_id.clone()));
    details.insert("databaseType".into(), Value::from(config.backend_kind.as_str()));
    output.push(OutputItem::info_with("Starting script execution...", details));

    if config.connection.backend_kind() != config.backend_kind {
        let message = format!(
            "instance '{}' is not a {} database",
            config.instance_id, config.backend_kind
        );
        output.error(message.clone(), None);
        return ChildProcessResult::failed(ErrorInfo::new(ErrorKind::Connection, message), output.take());
    }

    let connection = match connector
        .connect(&config.connection, &config.database_name)
        .await
    {
        Ok(connection) => connection,
        Err(e) => {
            let message = redact_error_message(&e.to_string());
            tracing::warn!(instance = %config.instance_id, error = %message, "connection failed");
            output.error(
                format!("Connection failed: {message}"),
                e.code().map(str::to_string),
            );
            return ChildProcessResult::failed(
                ErrorInfo::new(ErrorKind::Connection, message),
                output.take(),
            );
        }
    };

    let binding = match &connection {
        Connection::Relational(client) => DbBinding::Relational(Arc::new(SqlAdapter::new(
            client.clone(),
            output.clone(),
            config.limits,
        ))),
        Connection::Document(client) => DbBinding::Document(Arc::new(DocumentAdapter::new(
            client.clone(),
            output.clone(),
            config.limits,
        ))),
    };

    let limits = RunLimits {
        timeout: Duration::from_millis(config.timeout_ms),
        max_heap_size: config.max_heap_size,
    };
    let outcome = run_script(&config.script, Some(binding), &output, limits).await;
    connection.close().await;

    match outcome {
        Ok(value) => {
            output.push(OutputItem::result(value.clone()));
            output.info("Script completed successfully");
            ChildProcessResult::succeeded(value, output.take())
        }
        Err(e) => {
            let error = error_info(&e);
            tracing::debug!(kind = %error.kind, "script failed");
            let label = error.name.as_deref().unwrap_or(error.kind.as_str());
            output.error(format!("{label}: {}", error.message), None);
            ChildProcessResult::failed(error, output.take())
        }
    }
}

/// Caller-facing error details, credentials redacted.
pub fn error_info(err: &SandboxError) -> ErrorInfo {
    let message = match err {
        SandboxError::JsError { message, .. } => message.clone(),
        other => other.to_string(),
    };
    ErrorInfo {
        kind: err.kind(),
        message: redact_error_message(&message),
        name: err.js_name().map(str::to_string),
    }
}
