//! The real worker binary under the real supervisor.
//!
//! Without a database the worker still completes the whole exchange: it
//! announces itself, takes the job, fails to connect, and reports that as a
//! structured result. With `QUERYBOX_TEST_PG_HOST` set the ignored test runs a
//! script end to end.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use querybox_sandbox::ipc::{
    read_message_with_limit, write_message, ChildMessage, ConnectionParams, ParentMessage,
    WorkerConfig, DEFAULT_MAX_IPC_MESSAGE_SIZE,
};
use querybox_sandbox::{
    BackendKind, ErrorKind, ExecutionLimits, ExecutionMode, ExecutionRequest, InstanceEntry,
    OutputItem, SandboxConfig, ScriptExecutor, StaticCatalog,
};
use serial_test::serial;
use tokio::io::BufReader;
use tokio::process::Command;

const WORKER: &str = env!("CARGO_BIN_EXE_querybox-worker");

fn executor(entry: InstanceEntry) -> ScriptExecutor {
    let config = SandboxConfig {
        execution_mode: ExecutionMode::ChildProcess,
        timeout: Duration::from_secs(20),
        worker_bin: Some(PathBuf::from(WORKER)),
        ..Default::default()
    };
    let mut instances = BTreeMap::new();
    instances.insert("pg".to_string(), entry);
    ScriptExecutor::new(config, Arc::new(StaticCatalog::new(instances)))
}

/// Nothing listens on port 1, so the connect fails immediately.
fn unreachable_pg() -> InstanceEntry {
    InstanceEntry {
        kind: Some(BackendKind::Relational),
        host: Some("127.0.0.1".into()),
        port: Some(1),
        user: Some("reader".into()),
        password: Some("hunter2".into()),
        ..Default::default()
    }
}

#[tokio::test]
#[serial]
async fn worker_reports_connection_failure_as_a_result() {
    let exec = executor(unreachable_pg());
    let request = ExecutionRequest::new("return 1 + 1;", BackendKind::Relational, "pg", "app");

    let result = exec.execute(&request).await;

    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(ErrorKind::Connection));
    assert!(!result.error.as_ref().unwrap().message.contains("hunter2"));
    // Lifecycle output only the worker job produces.
    assert!(result.output.iter().any(|item| matches!(
        item,
        OutputItem::Info { message, .. } if message == "Starting script execution..."
    )));
    assert!(result
        .output
        .iter()
        .any(|item| matches!(item, OutputItem::Error { message, .. } if message.starts_with("Connection failed"))));

    let metrics = exec.metrics();
    assert_eq!(metrics.workers_spawned.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.crashes.load(Ordering::Relaxed), 0);
    assert_eq!(metrics.workers_killed.load(Ordering::Relaxed), 0);
}

#[tokio::test]
#[serial]
async fn worker_speaks_the_frame_protocol() {
    let mut child = Command::new(WORKER)
        .env_clear()
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    let mut stdin = child.stdin.take().unwrap();
    let mut stdout = BufReader::new(child.stdout.take().unwrap());

    let ready: Option<ChildMessage> = read_message_with_limit(&mut stdout, DEFAULT_MAX_IPC_MESSAGE_SIZE)
        .await
        .unwrap();
    assert!(matches!(ready, Some(ChildMessage::Ready)));

    let config = WorkerConfig {
        script: "return 1 + 1;".into(),
        backend_kind: BackendKind::Relational,
        instance_id: "pg".into(),
        database_name: "app".into(),
        timeout_ms: 5_000,
        max_heap_size: 64 * 1024 * 1024,
        limits: ExecutionLimits::default(),
        connection: ConnectionParams::Relational {
            host: "127.0.0.1".into(),
            port: 1,
            user: "reader".into(),
            password: "hunter2".into(),
        },
        max_ipc_message_size: DEFAULT_MAX_IPC_MESSAGE_SIZE,
    };
    write_message(&mut stdin, &ParentMessage::Execute { config })
        .await
        .unwrap();

    let reply: Option<ChildMessage> = read_message_with_limit(&mut stdout, DEFAULT_MAX_IPC_MESSAGE_SIZE)
        .await
        .unwrap();
    match reply {
        Some(ChildMessage::Result { data }) => {
            assert!(!data.success);
            assert_eq!(data.error.unwrap().kind, ErrorKind::Connection);
        }
        other => panic!("expected a result frame, got {other:?}"),
    }

    let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
#[serial]
#[ignore = "needs a PostgreSQL server: set QUERYBOX_TEST_PG_HOST and friends"]
async fn worker_runs_a_script_against_postgres() {
    let var = |name: &str, default: &str| std::env::var(name).unwrap_or_else(|_| default.into());
    let exec = executor(InstanceEntry {
        kind: Some(BackendKind::Relational),
        host: Some(var("QUERYBOX_TEST_PG_HOST", "localhost")),
        port: var("QUERYBOX_TEST_PG_PORT", "5432").parse().ok(),
        user: Some(var("QUERYBOX_TEST_PG_USER", "postgres")),
        password: Some(var("QUERYBOX_TEST_PG_PASSWORD", "postgres")),
        ..Default::default()
    });
    let database = var("QUERYBOX_TEST_PG_DB", "postgres");
    let request = ExecutionRequest::new(
        "const res = await db.query('SELECT 1 + 1 AS two');\nreturn res.rows[0].two;",
        BackendKind::Relational,
        "pg",
        database,
    );

    let result = exec.execute(&request).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result, Some(serde_json::json!(2)));
    assert_eq!(result.summary.queries, 1);
}
