//! Parent-side management of worker processes.
//!
//! Each execution spawns one `querybox-worker` with a clean environment, waits
//! for `Ready`, sends the job, and waits for the single `Result`. One deadline
//! (`timeout + grace`) covers the whole exchange. Whatever happens, the child
//! is killed and reaped before [`WorkerSupervisor::run`] returns.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::env::sanitized_env;
use crate::error::SandboxError;
use crate::ipc::{read_message_with_limit, write_message, ChildMessage, ParentMessage, WorkerConfig};
use crate::result::{ChildProcessResult, ErrorKind};

/// Binary name looked up next to the current executable.
pub const WORKER_BIN_NAME: &str = "querybox-worker";

/// How long a worker that already reported may take to exit on its own.
const EXIT_WINDOW: Duration = Duration::from_millis(500);

/// Process lifecycle counters.
#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    /// Worker processes started.
    pub workers_spawned: AtomicU64,
    /// Workers that had to be killed.
    pub workers_killed: AtomicU64,
    /// Executions that hit the supervisor deadline.
    pub timeouts: AtomicU64,
    /// Workers that exited before reporting.
    pub crashes: AtomicU64,
}

impl ExecutorMetrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// How the exchange with a worker ended, short of the deadline.
enum Exchange {
    Reported(ChildProcessResult),
    Ended(String),
}

/// Spawns and supervises worker processes.
pub struct WorkerSupervisor {
    worker_bin: PathBuf,
    grace: Duration,
    metrics: Arc<ExecutorMetrics>,
}

impl WorkerSupervisor {
    /// Supervise workers started from `worker_bin`.
    pub fn new(worker_bin: PathBuf, grace: Duration, metrics: Arc<ExecutorMetrics>) -> Self {
        Self {
            worker_bin,
            grace,
            metrics,
        }
    }

    /// Run one job in a fresh worker.
    pub async fn run(&self, config: WorkerConfig) -> ChildProcessResult {
        let timeout_ms = config.timeout_ms;
        let deadline = Duration::from_millis(timeout_ms) + self.grace;

        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(bin = %self.worker_bin.display(), error = %e, "worker spawn failed");
                return ChildProcessResult::synthesized(
                    ErrorKind::Process,
                    format!("failed to start worker: {e}"),
                );
            }
        };
        ExecutorMetrics::bump(&self.metrics.workers_spawned);
        tracing::debug!(pid = ?child.id(), "worker spawned");

        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            self.reap(&mut child).await;
            return ChildProcessResult::synthesized(ErrorKind::Process, "worker pipes unavailable");
        };
        let mut stdout = BufReader::new(stdout);

        let outcome = tokio::time::timeout(
            deadline,
            exchange(&mut stdin, &mut stdout, config),
        )
        .await;
        drop(stdin);

        match outcome {
            Ok(Exchange::Reported(result)) => {
                if tokio::time::timeout(EXIT_WINDOW, child.wait()).await.is_err() {
                    tracing::debug!("worker lingered after reporting");
                }
                self.reap(&mut child).await;
                result
            }
            Ok(Exchange::Ended(reason)) => {
                ExecutorMetrics::bump(&self.metrics.crashes);
                let status = match tokio::time::timeout(EXIT_WINDOW, child.wait()).await {
                    Ok(Ok(status)) => describe_exit(status),
                    _ => "still running".to_string(),
                };
                self.reap(&mut child).await;
                tracing::warn!(reason = %reason, status = %status, "worker ended without a result");
                ChildProcessResult::synthesized(
                    ErrorKind::Process,
                    format!("worker {reason} ({status})"),
                )
            }
            Err(_elapsed) => {
                ExecutorMetrics::bump(&self.metrics.timeouts);
                self.reap(&mut child).await;
                tracing::warn!(timeout_ms, "worker deadline passed, killed");
                ChildProcessResult::synthesized(
                    ErrorKind::Timeout,
                    format!("Script execution timed out after {timeout_ms}ms"),
                )
            }
        }
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.worker_bin)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if std::env::var_os("QUERYBOX_DEBUG").is_some() {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .env_clear()
            .envs(sanitized_env())
            .kill_on_drop(true)
            .spawn()
    }

    /// Kill the child unless it already exited, then collect its status.
    async fn reap(&self, child: &mut Child) {
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        if child.kill().await.is_ok() {
            ExecutorMetrics::bump(&self.metrics.workers_killed);
        }
    }
}

async fn exchange(
    stdin: &mut ChildStdin,
    stdout: &mut BufReader<ChildStdout>,
    config: WorkerConfig,
) -> Exchange {
    let max = config.max_ipc_message_size;

    match read_message_with_limit::<ChildMessage, _>(stdout, max).await {
        Ok(Some(ChildMessage::Ready)) => {}
        Ok(Some(ChildMessage::Result { .. })) => {
            return Exchange::Ended("reported before the handshake".into())
        }
        Ok(None) => return Exchange::Ended("exited before the handshake".into()),
        Err(e) => return Exchange::Ended(format!("sent an unreadable frame: {e}")),
    }

    if let Err(e) = write_message(stdin, &ParentMessage::Execute { config }).await {
        return Exchange::Ended(format!("did not accept the job: {e}"));
    }

    match read_message_with_limit::<ChildMessage, _>(stdout, max).await {
        Ok(Some(ChildMessage::Result { data })) => Exchange::Reported(data),
        Ok(Some(ChildMessage::Ready)) => Exchange::Ended("repeated the handshake".into()),
        Ok(None) => Exchange::Ended("exited before reporting a result".into()),
        Err(e) => Exchange::Ended(format!("sent an unreadable frame: {e}")),
    }
}

fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("killed by signal {signal}");
        }
    }
    "unknown exit status".to_string()
}

/// Locate the worker binary.
///
/// Search order:
/// 1. `explicit` (from configuration)
/// 2. `QUERYBOX_WORKER_BIN` (must be an absolute path)
/// 3. The directory of the current executable, or its parent for test
///    binaries under `deps/`
pub fn find_worker_binary(explicit: Option<&Path>) -> Result<PathBuf, SandboxError> {
    let named = explicit
        .map(|p| (p.to_path_buf(), "configured worker path"))
        .or_else(|| {
            std::env::var_os("QUERYBOX_WORKER_BIN")
                .map(|p| (PathBuf::from(p), "QUERYBOX_WORKER_BIN"))
        });
    if let Some((path, source)) = named {
        if !path.is_absolute() {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "{source} must be an absolute path, got: {}",
                path.display()
            )));
        }
        if !path.exists() {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "{source} points at a missing file: {}",
                path.display()
            )));
        }
        validate_binary_permissions(&path)?;
        return Ok(path);
    }

    if let Ok(exe) = std::env::current_exe() {
        let dirs = exe
            .parent()
            .into_iter()
            .flat_map(|dir| std::iter::once(dir).chain(dir.parent()));
        for dir in dirs {
            let candidate = dir.join(WORKER_BIN_NAME);
            if candidate.exists() {
                validate_binary_permissions(&candidate)?;
                return Ok(candidate);
            }
        }
    }

    Err(SandboxError::Execution(anyhow::anyhow!(
        "{WORKER_BIN_NAME} binary not found. Set QUERYBOX_WORKER_BIN or install it alongside querybox"
    )))
}

/// Reject world-writable binaries (Unix only).
fn validate_binary_permissions(path: &Path) -> Result<(), SandboxError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(path).map_err(|e| {
            SandboxError::Execution(anyhow::anyhow!(
                "cannot read metadata for {}: {e}",
                path.display()
            ))
        })?;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(SandboxError::Execution(anyhow::anyhow!(
                "insecure permissions on worker binary {}: mode {mode:o} is world-writable",
                path.display(),
            )));
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
