//! Prometheus metrics for script executions.
//!
//! This module is only compiled when the `metrics` feature is enabled.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::result::{BackendKind, ExecutionResult};

/// Per-execution labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RunLabels {
    /// `relational` or `document`.
    pub backend: String,
    /// `success` or the wire name of the error kind, e.g. `TimeoutError`.
    pub outcome: String,
}

/// Per-backend labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
    /// `relational` or `document`.
    pub backend: String,
}

/// Prometheus metrics for the executor.
pub struct QueryboxMetrics {
    /// Finished executions by backend and outcome.
    pub executions: Family<RunLabels, Counter>,
    /// Wall-clock execution time by backend.
    pub duration_seconds: Family<BackendLabels, Histogram>,
    /// Statements and document operations issued by scripts.
    pub db_calls: Family<BackendLabels, Counter>,
    /// Calls flagged as critical risk (unfiltered bulk writes, drops).
    pub critical_calls: Family<BackendLabels, Counter>,
    /// Worker processes spawned.
    pub workers_spawned: Counter,
}

impl QueryboxMetrics {
    /// Create the metrics and register them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            executions: Family::default(),
            // 10ms doubling up to ~40s.
            duration_seconds: Family::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.01, 2.0, 13))
            }),
            db_calls: Family::default(),
            critical_calls: Family::default(),
            workers_spawned: Counter::default(),
        };

        let sub = registry.sub_registry_with_prefix("querybox");
        sub.register(
            "executions",
            "Finished script executions",
            metrics.executions.clone(),
        );
        sub.register(
            "execution_duration_seconds",
            "Script execution wall-clock time",
            metrics.duration_seconds.clone(),
        );
        sub.register(
            "db_calls",
            "Database statements and operations issued by scripts",
            metrics.db_calls.clone(),
        );
        sub.register(
            "critical_db_calls",
            "Database calls flagged as critical risk",
            metrics.critical_calls.clone(),
        );
        sub.register(
            "workers_spawned",
            "Worker processes spawned",
            metrics.workers_spawned.clone(),
        );
        metrics
    }

    /// Record a finished execution.
    pub fn record(&self, backend: BackendKind, result: &ExecutionResult) {
        let backend = backend.as_str().to_string();
        let outcome = match result.error_kind() {
            Some(kind) => kind.as_str().to_string(),
            None => "success".to_string(),
        };
        self.executions
            .get_or_create(&RunLabels {
                backend: backend.clone(),
                outcome,
            })
            .inc();

        let labels = BackendLabels { backend };
        self.duration_seconds
            .get_or_create(&labels)
            .observe(result.duration_ms as f64 / 1000.0);
        let summary = &result.summary;
        if summary.queries + summary.operations > 0 {
            self.db_calls
                .get_or_create(&labels)
                .inc_by(summary.queries + summary.operations);
        }
        if summary.critical_operations > 0 {
            self.critical_calls
                .get_or_create(&labels)
                .inc_by(summary.critical_operations);
        }
    }
}
