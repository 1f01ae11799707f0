//! querybox worker: isolated child process that runs exactly one script.
//!
//! Spawned by `querybox_sandbox::host::WorkerSupervisor`. Announces itself
//! with `Ready`, receives one `Execute` job on stdin, opens one database
//! connection, runs the script, writes one `Result` to stdout, and exits.
//!
//! **Security**: the environment is cleared before anything else runs.
//! Connection parameters arrive over IPC and are never logged.

use anyhow::{Context, Result};
use querybox_sandbox::backend::NativeConnector;
use querybox_sandbox::ipc::{
    read_message_with_limit, write_message, ChildMessage, ParentMessage,
    DEFAULT_MAX_IPC_MESSAGE_SIZE,
};
use querybox_sandbox::result::{ChildProcessResult, ErrorKind};
use querybox_sandbox::worker::run_worker_job;
use tokio::io::{self, BufReader};

fn main() -> Result<()> {
    // Still single-threaded here, so mutating the environment is sound.
    let keys: Vec<_> = std::env::vars_os().map(|(k, _)| k).collect();
    let debug = std::env::var_os("QUERYBOX_DEBUG").is_some();
    for key in keys {
        std::env::remove_var(key);
    }

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .init();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;
    rt.block_on(run())
}

async fn run() -> Result<()> {
    let mut stdin = BufReader::new(io::stdin());
    let mut stdout = io::stdout();

    write_message(&mut stdout, &ChildMessage::Ready)
        .await
        .context("failed to send Ready")?;

    let msg: Option<ParentMessage> =
        match read_message_with_limit(&mut stdin, DEFAULT_MAX_IPC_MESSAGE_SIZE).await {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "unreadable job");
                let data = ChildProcessResult::synthesized(
                    ErrorKind::Worker,
                    format!("worker could not read its job: {e}"),
                );
                write_message(&mut stdout, &ChildMessage::Result { data })
                    .await
                    .context("failed to send Result")?;
                return Ok(());
            }
        };
    let ParentMessage::Execute { config } =
        msg.context("parent closed stdin before sending Execute")?;

    tracing::debug!(
        instance = %config.instance_id,
        backend = %config.backend_kind,
        timeout_ms = config.timeout_ms,
        "job received"
    );

    let data = run_worker_job(config, &NativeConnector).await;
    write_message(&mut stdout, &ChildMessage::Result { data })
        .await
        .context("failed to send Result")?;
    Ok(())
}
