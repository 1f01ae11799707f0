//! End-to-end executions in in-process mode against in-memory backends.
//!
//! Each execution still gets its own thread and V8 isolate; only the worker
//! process is skipped. Serialized to keep isolate creation off the hot path
//! of other tests.

mod common;

use common::{in_process_executor, MONGO, PG};
use querybox_sandbox::{BackendKind, ErrorKind, ExecutionRequest, OutputItem, Risk};
use serde_json::json;
use serial_test::serial;

fn relational(script: &str) -> ExecutionRequest {
    ExecutionRequest::new(script, BackendKind::Relational, PG, "app")
}

fn document(script: &str) -> ExecutionRequest {
    ExecutionRequest::new(script, BackendKind::Document, MONGO, "events")
}

#[tokio::test]
#[serial]
async fn arithmetic_script_succeeds() {
    let (executor, _) = in_process_executor();
    let result = executor.execute(&relational("return 1+1;")).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result, Some(json!(2)));
    assert!(result.error.is_none());
    assert!(result
        .output
        .iter()
        .any(|item| matches!(item, OutputItem::Info { .. })));
    assert_eq!(result.summary.errors, 0);
    assert_eq!(result.metadata.instance_id, PG);
}

#[tokio::test]
#[serial]
async fn console_output_is_captured_in_order() {
    let (executor, _) = in_process_executor();
    let result = executor
        .execute(&relational(
            "console.log('first');\nconsole.warn('second');\nprint('third');\nreturn null;",
        ))
        .await;

    assert!(result.success, "{:?}", result.error);
    let messages: Vec<&str> = result
        .output
        .iter()
        .filter(|item| !matches!(item, OutputItem::Result { .. }))
        .map(OutputItem::message)
        .collect();
    let first = messages.iter().position(|m| *m == "first").unwrap();
    let second = messages.iter().position(|m| *m == "second").unwrap();
    let third = messages.iter().position(|m| *m == "third").unwrap();
    assert!(first < second && second < third, "{messages:?}");
    assert_eq!(result.summary.warnings, 1);
}

#[tokio::test]
#[serial]
async fn relational_query_records_statement_and_preview() {
    let (executor, _) = in_process_executor();
    let result = executor
        .execute(&relational(
            "const res = await db.query('SELECT id, name FROM users');\nreturn res.rows.map(r => r.name);",
        ))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result, Some(json!(["ada", "grace", "linus"])));
    assert_eq!(result.summary.queries, 1);
    assert_eq!(result.summary.rows, 3);

    let query = result
        .output
        .iter()
        .find_map(|item| match item {
            OutputItem::Query {
                query_number,
                query_type,
                row_count,
                ..
            } => Some((*query_number, query_type.clone(), *row_count)),
            _ => None,
        })
        .expect("query item");
    assert_eq!(query, (1, "SELECT".to_string(), Some(3)));

    let preview = result
        .output
        .iter()
        .find_map(|item| match item {
            OutputItem::Data { total, preview, .. } => Some((*total, preview.len())),
            _ => None,
        })
        .expect("data item");
    assert_eq!(preview, (3, 3));
}

#[tokio::test]
#[serial]
async fn database_errors_can_be_caught_by_the_script() {
    let (executor, _) = in_process_executor();
    let result = executor
        .execute(&relational(
            "try {\n  await db.query('SELECT * FROM fail');\n} catch (e) {\n  return { name: e.name, code: e.code };\n}",
        ))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        result.result,
        Some(json!({ "name": "DatabaseError", "code": "42P01" }))
    );
    assert_eq!(result.summary.errors, 1);
}

#[tokio::test]
#[serial]
async fn uncaught_errors_fail_the_execution() {
    let (executor, _) = in_process_executor();
    let result = executor
        .execute(&relational("throw new TypeError('bad input');"))
        .await;

    assert!(!result.success);
    let error = result.error.expect("error");
    assert_eq!(error.kind, ErrorKind::Runtime);
    assert_eq!(error.name.as_deref(), Some("TypeError"));
    assert!(error.message.contains("bad input"), "{}", error.message);
    assert!(result
        .output
        .iter()
        .any(|item| matches!(item, OutputItem::Error { message, .. } if message.contains("bad input"))));
}

#[tokio::test]
#[serial]
async fn unbounded_delete_runs_and_is_marked_critical() {
    let (executor, documents) = in_process_executor();
    let result = executor
        .execute(&document(
            "const res = await db.collection('events').deleteMany({});\nreturn res.deletedCount;",
        ))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result, Some(json!(4)));
    assert!(!result.warnings.is_empty(), "validator should warn");
    assert_eq!(documents.len("events"), 0);

    let critical = result.output.iter().any(|item| {
        matches!(
            item,
            OutputItem::Operation {
                operation,
                risk: Some(Risk::Critical),
                ..
            } if operation == "deleteMany"
        )
    });
    assert!(critical, "{:#?}", result.output);
    assert_eq!(result.summary.critical_operations, 1);
}

#[tokio::test]
#[serial]
async fn document_reads_use_cursor_options() {
    let (executor, _) = in_process_executor();
    let result = executor
        .execute(&document(
            "const clicks = await db.collection('events').find({ kind: 'click' }).toArray();\nconst first = await db.collection('events').find().limit(1);\nconst count = await db.collection('events').countDocuments({ kind: 'view' });\nreturn { clicks: clicks.length, first: first.length, count };",
        ))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        result.result,
        Some(json!({ "clicks": 2, "first": 1, "count": 2 }))
    );
    assert_eq!(result.summary.operations, 3);
}

#[tokio::test]
#[serial]
async fn unsafe_globals_are_undefined() {
    let (executor, _) = in_process_executor();
    let result = executor
        .execute(&relational(
            "return [typeof process, typeof require, typeof window, typeof Buffer, typeof module];",
        ))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        result.result,
        Some(json!([
            "undefined",
            "undefined",
            "undefined",
            "undefined",
            "undefined"
        ]))
    );
}

#[tokio::test]
#[serial]
async fn instance_constructors_lead_nowhere() {
    let (executor, _) = in_process_executor();
    let result = executor
        .execute(&relational(
            r#"const E = new Error('x').constructor;
let hooked = 'installed';
try { E.prepareStackTrace = (e, sites) => sites; } catch (e) { hooked = e.name; }
let stack;
try { Array(-1); } catch (e) { stack = e.stack; }
const receivers = Array.isArray(stack) ? stack.map((site) => typeof site.getThis()) : [];
const key = 'constr' + 'uctor';
const ctors = [[].constructor, ({}).constructor, E, Promise.resolve(1).constructor];
return { hooked, stack: typeof stack, receivers, reachable: ctors.map((C) => typeof C[key]) };"#,
        ))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        result.result,
        Some(json!({
            "hooked": "TypeError",
            "stack": "string",
            "receivers": [],
            "reachable": ["undefined", "undefined", "undefined", "undefined"],
        }))
    );
}

#[tokio::test]
#[serial]
async fn database_errors_extend_the_script_error() {
    let (executor, _) = in_process_executor();
    let result = executor
        .execute(&relational(
            "try {\n  await db.query('SELECT * FROM fail');\n} catch (e) {\n  const parent = Object.getPrototypeOf(e.constructor);\n  return [e instanceof Error, parent === Error, typeof parent.captureStackTrace];\n}",
        ))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result, Some(json!([true, true, "undefined"])));
}

#[tokio::test]
#[serial]
async fn json_parse_failures_are_runtime_errors() {
    let (executor, _) = in_process_executor();
    let result = executor.execute(&relational("return JSON.parse('{bad');")).await;

    assert!(!result.success);
    let error = result.error.expect("error");
    assert_eq!(error.kind, ErrorKind::Runtime);
    assert_eq!(error.name.as_deref(), Some("SyntaxError"));
}

#[tokio::test]
#[serial]
async fn document_reads_stop_at_the_document_cap() {
    let (executor, _) = in_process_executor();
    let result = executor
        .execute(&document(
            "const docs = [];\nfor (let i = 0; i < 1200; i++) docs.push({ _id: 100 + i, kind: 'bulk' });\nawait db.collection('bulk').insertMany(docs);\nconst all = await db.collection('bulk').find();\nconst many = await db.collection('bulk').find({}, { limit: 5000 });\nconst agg = await db.collection('bulk').aggregate([{ $match: { kind: 'bulk' } }]);\nconst few = await db.collection('bulk').aggregate([{ $limit: 7 }]);\nreturn [all.length, many.length, agg.length, few.length];",
        ))
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.result, Some(json!([1000, 1000, 1000, 7])));
}

#[tokio::test]
#[serial]
async fn relational_scripts_cannot_reach_document_verbs() {
    let (executor, _) = in_process_executor();
    let result = executor
        .execute(&relational("return typeof db.collection;"))
        .await;
    assert_eq!(result.result, Some(json!("undefined")));
}

#[tokio::test]
#[serial]
async fn sleeping_past_the_timeout_is_a_timeout_error() {
    let (executor, _) = in_process_executor();
    let request = relational("await sleep(3000);\nreturn 'late';").with_timeout_ms(300);
    let result = executor.execute(&request).await;

    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    assert!(result.result.is_none());
}

#[tokio::test]
#[serial]
async fn blocked_script_reports_validation_error() {
    let (executor, _) = in_process_executor();
    let result = executor.execute(&relational("return eval('1+1');")).await;

    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(ErrorKind::Validation));
    assert!(!result
        .output
        .iter()
        .any(|item| matches!(item, OutputItem::Query { .. })));
}

#[tokio::test]
#[serial]
async fn concurrent_executions_are_isolated() {
    let (executor, _) = in_process_executor();
    let requests: Vec<_> = (0..4)
        .map(|i| relational(&format!("console.log('run {i}');\nreturn {i};")))
        .collect();
    let results = futures::future::join_all(requests.iter().map(|r| executor.execute(r))).await;

    for (i, result) in results.iter().enumerate() {
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.result, Some(json!(i)));
        let logs: Vec<_> = result
            .output
            .iter()
            .filter(|item| matches!(item, OutputItem::Log { .. }))
            .map(OutputItem::message)
            .collect();
        assert_eq!(logs, vec![format!("run {i}").as_str()]);
    }
    let ids: std::collections::HashSet<_> = results.iter().map(|r| &r.execution_id).collect();
    assert_eq!(ids.len(), 4);
}
