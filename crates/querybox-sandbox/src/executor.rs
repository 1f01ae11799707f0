//! Script executor: validation, instance resolution, isolation, and result
//! normalization.
//!
//! In production every execution runs in a fresh worker process. V8 isolates
//! are `!Send`, so the in-process mode runs the same worker job on a dedicated
//! thread with its own single-threaded tokio runtime. The public API is fully
//! async and `Send`-safe either way.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLogger, NoopAuditLogger};
use crate::backend::{Connector, NativeConnector};
use crate::catalog::InstanceCatalog;
use crate::host::{find_worker_binary, ExecutorMetrics, WorkerSupervisor};
use crate::ipc::{ExecutionLimits, WorkerConfig, DEFAULT_MAX_IPC_MESSAGE_SIZE};
use crate::output::OutputItem;
use crate::redact::redact_error_message;
use crate::result::{
    ChildProcessResult, ErrorInfo, ErrorKind, ExecutionMetadata, ExecutionRequest,
    ExecutionResult,
};
use crate::runtime::DEFAULT_MAX_HEAP_SIZE;
use crate::validator::{validate_with_limit, ValidationResult, DEFAULT_MAX_SCRIPT_SIZE};
use crate::worker::run_worker_job;

#[cfg(feature = "metrics")]
use crate::metrics::QueryboxMetrics;

/// How the executor isolates scripts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Run the worker job on a dedicated thread of this process (tests, local
    /// development).
    InProcess,
    /// Spawn an isolated worker process per execution.
    #[default]
    ChildProcess,
}

/// Configuration for the executor.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Default script timeout when the request does not set one.
    pub timeout: Duration,
    /// Extra time the supervisor allows beyond the timeout before killing.
    pub grace: Duration,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum concurrent executions; further callers wait.
    pub max_concurrent: usize,
    /// Maximum script size in bytes.
    pub max_script_size: usize,
    /// Adapter and output caps.
    pub limits: ExecutionLimits,
    /// Isolation mode.
    pub execution_mode: ExecutionMode,
    /// Worker binary override. Falls back to discovery.
    pub worker_bin: Option<PathBuf>,
    /// Maximum IPC frame size in bytes.
    pub max_ipc_message_size: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            grace: Duration::from_secs(5),
            max_heap_size: DEFAULT_MAX_HEAP_SIZE,
            max_concurrent: 8,
            max_script_size: DEFAULT_MAX_SCRIPT_SIZE,
            limits: ExecutionLimits::default(),
            execution_mode: ExecutionMode::default(),
            worker_bin: None,
            max_ipc_message_size: DEFAULT_MAX_IPC_MESSAGE_SIZE,
        }
    }
}

/// Runs untrusted scripts against catalog instances.
///
/// `Send + Sync`; share it behind an `Arc`.
pub struct ScriptExecutor {
    config: SandboxConfig,
    catalog: Arc<dyn InstanceCatalog>,
    connector: Arc<dyn Connector>,
    semaphore: Arc<Semaphore>,
    audit_logger: Arc<dyn AuditLogger>,
    metrics: Arc<ExecutorMetrics>,
    #[cfg(feature = "metrics")]
    prometheus: Option<Arc<QueryboxMetrics>>,
}

impl ScriptExecutor {
    /// Create an executor resolving instances through `catalog`.
    pub fn new(config: SandboxConfig, catalog: Arc<dyn InstanceCatalog>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            catalog,
            connector: Arc::new(NativeConnector),
            semaphore,
            audit_logger: Arc::new(NoopAuditLogger),
            metrics: Arc::new(ExecutorMetrics::default()),
            #[cfg(feature = "metrics")]
            prometheus: None,
        }
    }

    /// Connector used by the in-process mode.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Send an audit entry for every execution to `logger`.
    pub fn with_audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.audit_logger = logger;
        self
    }

    /// Record executions into Prometheus metrics.
    #[cfg(feature = "metrics")]
    pub fn with_prometheus(mut self, metrics: Arc<QueryboxMetrics>) -> Self {
        self.prometheus = Some(metrics);
        self
    }

    /// Process lifecycle counters.
    pub fn metrics(&self) -> &Arc<ExecutorMetrics> {
        &self.metrics
    }

    /// The active configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Validate a script without running it.
    pub fn validate(&self, script: &str) -> ValidationResult {
        validate_with_limit(script, self.config.max_script_size)
    }

    /// Run a request to completion. Never panics or returns early: every
    /// failure is reported inside the [`ExecutionResult`].
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let execution_id = Uuid::new_v4().to_string();
        let metadata = ExecutionMetadata::for_request(request, Utc::now());

        tracing::info!(
            execution_id = %execution_id,
            backend = %request.backend_kind,
            instance = %request.instance_id,
            database = %request.database_name,
            script_len = request.script_body.len(),
            "execute: starting"
        );

        let validation = self.validate(&request.script_body);
        let result = if validation.valid {
            let child = self.run_validated(request).await;
            ExecutionResult::from_child(
                execution_id,
                child,
                validation.warnings,
                elapsed_ms(started),
                metadata,
            )
        } else {
            tracing::info!(
                execution_id = %execution_id,
                errors = validation.errors.len(),
                "execute: rejected by validation"
            );
            ExecutionResult::rejected(execution_id, &validation, elapsed_ms(started), metadata)
        };

        self.finish(request, &result).await;
        result
    }

    async fn run_validated(&self, request: &ExecutionRequest) -> ChildProcessResult {
        let connection = match self
            .catalog
            .resolve(&request.instance_id, request.backend_kind)
            .await
        {
            Ok(params) => params,
            Err(e) => {
                let message = redact_error_message(&e.to_string());
                return ChildProcessResult::failed(
                    ErrorInfo::new(ErrorKind::Connection, message.clone()),
                    vec![OutputItem::error(format!("Connection failed: {message}"), None)],
                );
            }
        };

        let timeout_ms = request
            .timeout_ms
            .unwrap_or(self.config.timeout.as_millis() as u64);
        let config = WorkerConfig {
            script: request.script_body.clone(),
            backend_kind: request.backend_kind,
            instance_id: request.instance_id.clone(),
            database_name: request.database_name.clone(),
            timeout_ms,
            max_heap_size: self.config.max_heap_size,
            limits: self.config.limits,
            connection,
            max_ipc_message_size: self.config.max_ipc_message_size,
        };

        let Ok(_permit) = self.semaphore.acquire().await else {
            return ChildProcessResult::synthesized(ErrorKind::Worker, "executor is shut down");
        };

        match self.config.execution_mode {
            ExecutionMode::ChildProcess => {
                let worker_bin = match find_worker_binary(self.config.worker_bin.as_deref()) {
                    Ok(path) => path,
                    Err(e) => {
                        tracing::error!(error = %e, "worker binary unavailable");
                        return ChildProcessResult::synthesized(ErrorKind::Process, e.to_string());
                    }
                };
                #[cfg(feature = "metrics")]
                if let Some(m) = &self.prometheus {
                    m.workers_spawned.inc();
                }
                WorkerSupervisor::new(worker_bin, self.config.grace, self.metrics.clone())
                    .run(config)
                    .await
            }
            ExecutionMode::InProcess => self.run_in_process(config).await,
        }
    }

    /// Run the worker job on a dedicated thread with its own V8 isolate.
    async fn run_in_process(&self, config: WorkerConfig) -> ChildProcessResult {
        let deadline = Duration::from_millis(config.timeout_ms) + self.config.grace;
        let timeout_ms = config.timeout_ms;
        let connector = self.connector.clone();

        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = tx.send(ChildProcessResult::synthesized(
                        ErrorKind::Worker,
                        format!("failed to start runtime: {e}"),
                    ));
                    return;
                }
            };
            let result = rt.block_on(run_worker_job(config, connector.as_ref()));
            if tx.send(result).is_err() {
                tracing::warn!("execution result receiver dropped before result was sent");
            }
        });

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                ChildProcessResult::synthesized(ErrorKind::Process, "execution thread panicked")
            }
            Err(_) => ChildProcessResult::synthesized(
                ErrorKind::Timeout,
                format!("Script execution timed out after {timeout_ms}ms"),
            ),
        }
    }

    async fn finish(&self, request: &ExecutionRequest, result: &ExecutionResult) {
        let entry = AuditEntry::new(&request.script_body, result);
        self.audit_logger.log(&entry).await;

        #[cfg(feature = "metrics")]
        if let Some(m) = &self.prometheus {
            m.record(request.backend_kind, result);
        }

        match &result.error {
            None => tracing::info!(
                execution_id = %result.execution_id,
                duration_ms = result.duration_ms,
                queries = result.summary.queries,
                operations = result.summary.operations,
                "execute: complete"
            ),
            Some(error) => tracing::warn!(
                execution_id = %result.execution_id,
                duration_ms = result.duration_ms,
                kind = %error.kind,
                "execute: failed"
            ),
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{InstanceEntry, StaticCatalog};
    use crate::result::BackendKind;
    use std::collections::BTreeMap;

    fn executor(mode: ExecutionMode) -> ScriptExecutor {
        let mut instances = BTreeMap::new();
        instances.insert(
            "pg".to_string(),
            InstanceEntry {
                kind: Some(BackendKind::Relational),
                host: Some("localhost".into()),
                user: Some("u".into()),
                password: Some("p".into()),
                ..Default::default()
            },
        );
        let config = SandboxConfig {
            execution_mode: mode,
            ..Default::default()
        };
        ScriptExecutor::new(config, Arc::new(StaticCatalog::new(instances)))
    }

    #[test]
    fn defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.grace, Duration::from_secs(5));
        assert_eq!(config.max_concurrent, 8);
        assert_eq!(config.execution_mode, ExecutionMode::ChildProcess);
    }

    #[tokio::test]
    async fn blocked_scripts_never_spawn() {
        let executor = executor(ExecutionMode::ChildProcess);
        let request = ExecutionRequest::new("eval('1')", BackendKind::Relational, "pg", "app");
        let result = executor.execute(&request).await;
        assert!(!result.success);
        assert_eq!(result.error_kind(), Some(ErrorKind::Validation));
        assert_eq!(
            executor
                .metrics()
                .workers_spawned
                .load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }

    #[tokio::test]
    async fn unknown_instances_are_connection_errors() {
        let executor = executor(ExecutionMode::ChildProcess);
        let request = ExecutionRequest::new("return 1;", BackendKind::Relational, "nope", "app");
        let result = executor.execute(&request).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Connection));
        assert_eq!(result.summary.errors, 1);
    }

    #[test]
    fn execution_mode_names() {
        let mode: ExecutionMode = serde_json::from_str("\"in_process\"").unwrap();
        assert_eq!(mode, ExecutionMode::InProcess);
    }
}
