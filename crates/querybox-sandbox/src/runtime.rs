//! The embedded V8 runtime a script body runs in.
//!
//! One fresh [`JsRuntime`] per script. The bootstrap runs in strict mode: it
//! captures the op table, builds the capability objects, pins every built-in
//! prototype's `constructor` to a frozen stand-in, disables the stack-trace
//! hooks, cuts the function-constructor chain, and deletes `Deno`, `eval`,
//! `Function`, `Reflect` and friends from the global object before any user
//! code is compiled. The body itself only ever sees the namespace parameters.
//!
//! [`run_script`] must be awaited on a current-thread runtime: `JsRuntime` is
//! `!Send`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde_json::Value;

use crate::error::SandboxError;
use crate::namespace::{names, wrap_script_body};
use crate::ops::{querybox_ext, DbBinding, ScriptOutcome, MAX_TIMER_MS};
use crate::output::OutputCapture;
use crate::redact::redact_error_message;
use crate::syntax::check_syntax;

/// Default V8 heap ceiling (128 MB).
pub const DEFAULT_MAX_HEAP_SIZE: usize = 128 * 1024 * 1024;

/// Limits applied to a single run.
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    /// Wall-clock budget covering compile, CPU, and pending database calls.
    pub timeout: Duration,
    /// V8 heap ceiling in bytes.
    pub max_heap_size: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_heap_size: DEFAULT_MAX_HEAP_SIZE,
        }
    }
}

const BOOTSTRAP: &str = r#"
"use strict";
((ops, names, backend, maxTimerMs) => {
  const RealObject = Object;
  const RealError = Error;
  const RealTypeError = TypeError;
  const RealMap = Map;
  const construct = Reflect.construct;
  const ownNames = Object.getOwnPropertyNames;
  const getPrototypeOf = Object.getPrototypeOf;
  const defineProperty = Object.defineProperty;
  const freeze = Object.freeze;
  const hasOwn = Object.prototype.hasOwnProperty;
  const JSONparse = JSON.parse;
  const JSONstringify = JSON.stringify;
  const StringOf = String;
  const floor = Math.floor;

  const SKIP_STATICS = ["prototype", "length", "name", "caller", "arguments",
    "setPrototypeOf", "defineProperty", "defineProperties",
    "captureStackTrace", "prepareStackTrace", "stackTraceLimit"];

  // Every built-in constructor an instance or a global name can lead back to
  // gets a frozen stand-in; `Real.prototype.constructor` and the global
  // binding are both pointed at it.
  const standIns = new RealMap();
  const wrap = (Real) => {
    const known = standIns.get(Real);
    if (known) return known;
    const Safe = function (...args) {
      return new.target ? construct(Real, args, new.target) : Real(...args);
    };
    Safe.prototype = Real.prototype;
    defineProperty(Safe, "name", { value: Real.name });
    for (const key of ownNames(Real)) {
      if (SKIP_STATICS.includes(key)) continue;
      const value = Real[key];
      Safe[key] = typeof value === "function" ? value.bind(Real) : value;
    }
    freeze(Safe);
    standIns.set(Real, Safe);
    return Safe;
  };

  const TypedArray = getPrototypeOf(Int8Array);
  const reachable = [Object, Array, String, Number, Boolean, Symbol, BigInt, Date, RegExp,
    Map, Set, WeakMap, WeakSet, WeakRef, FinalizationRegistry, Promise,
    Error, TypeError, RangeError, SyntaxError, ReferenceError, EvalError, URIError,
    AggregateError, ArrayBuffer, DataView, TypedArray, Int8Array, Uint8Array,
    Uint8ClampedArray, Int16Array, Uint16Array, Int32Array, Uint32Array, Float32Array,
    Float64Array, BigInt64Array, BigUint64Array];
  for (const name of ["Iterator", "Float16Array"]) {
    if (typeof globalThis[name] === "function") reachable.push(globalThis[name]);
  }
  for (const Real of reachable) wrap(Real);

  const mathCopy = {};
  for (const key of ownNames(Math)) mathCopy[key] = Math[key];

  const render = (value) => {
    if (typeof value === "string") return value;
    try {
      if (value instanceof RealError) return `${value.name}: ${value.message}`;
      const text = JSONstringify(value);
      return text === undefined ? StringOf(value) : text;
    } catch (_) {
      return "[Unserializable]";
    }
  };
  const emit = (level) => (...args) => {
    ops.op_qb_console(level, args.map(render).join(" "));
  };

  const clampDelay = (ms) => {
    const n = +ms;
    if (!(n > 0)) return 0;
    return n > maxTimerMs ? maxTimerMs : floor(n);
  };
  const timers = new RealMap();
  let nextTimerId = 1;
  const setTimeout = (callback, ms, ...args) => {
    if (typeof callback !== "function") {
      throw new RealTypeError("setTimeout requires a function");
    }
    const id = nextTimerId++;
    timers.set(id, true);
    ops.op_qb_sleep(clampDelay(ms))
      .then(() => (timers.delete(id) ? callback(...args) : undefined))
      .catch((e) => emit("error")(`Uncaught error in timer: ${render(e)}`));
    return id;
  };
  const clearTimeout = (id) => {
    timers.delete(id);
  };

  class DatabaseError extends wrap(RealError) {
    constructor(message, code) {
      super(message);
      this.name = "DatabaseError";
      if (code !== null && code !== undefined) this.code = code;
    }
  }
  const unwrap = (text) => {
    const reply = JSONparse(text);
    if (reply.error) throw new DatabaseError(reply.error.message, reply.error.code);
    return reply.ok;
  };

  const sql = (verb) => async (statement, params) => {
    if (typeof statement !== "string") {
      throw new RealTypeError(`db.${verb} requires a SQL string`);
    }
    const values = params === undefined || params === null ? [] : params;
    return unwrap(await ops.op_qb_sql(verb, statement, JSONstringify(values)));
  };

  const call = async (name, verb, args) =>
    unwrap(await ops.op_qb_document(name, verb, JSONstringify(args)));
  const thenable = (target, run) => {
    target.toArray = run;
    target.then = (ok, fail) => run().then(ok, fail);
    return target;
  };
  const findCursor = (name, filter, options) => {
    const opts = RealObject.assign({}, options || {});
    const cursor = {
      limit: (n) => { opts.limit = n; return cursor; },
      skip: (n) => { opts.skip = n; return cursor; },
      sort: (spec) => { opts.sort = spec; return cursor; },
      project: (spec) => { opts.projection = spec; return cursor; },
    };
    return thenable(cursor, () => call(name, "find", [filter === undefined ? {} : filter, opts]));
  };
  const VERBS = ["findOne", "insertOne", "insertMany", "updateOne", "updateMany",
    "deleteOne", "deleteMany", "countDocuments", "createIndex", "dropIndex",
    "listIndexes", "drop"];
  const collection = (name) => {
    if (typeof name !== "string" || name === "") {
      throw new RealTypeError("db.collection requires a collection name");
    }
    const handle = {
      find: (filter, options) => findCursor(name, filter, options),
      aggregate: (pipeline) =>
        freeze(thenable({}, () => call(name, "aggregate", [pipeline === undefined ? [] : pipeline]))),
    };
    for (const verb of VERBS) handle[verb] = (...args) => call(name, verb, args);
    return freeze(handle);
  };

  let db;
  if (backend === "relational") {
    db = freeze({ query: sql("query"), execute: sql("execute") });
  } else if (backend === "document") {
    db = freeze({
      collection,
      listCollections: async () => unwrap(await ops.op_qb_list_collections()),
    });
  }

  const capabilities = {
    db,
    console: freeze({
      log: emit("log"),
      info: emit("info"),
      warn: emit("warn"),
      error: emit("error"),
      debug: emit("log"),
    }),
    print: emit("info"),
    sleep: (ms) => ops.op_qb_sleep(clampDelay(ms)),
    setTimeout,
    clearTimeout,
    JSON: freeze({ parse: JSONparse, stringify: JSONstringify }),
    Math: freeze(mathCopy),
    Object: wrap(Object),
    Array: wrap(Array),
    String: wrap(String),
    Number: wrap(Number),
    Boolean: wrap(Boolean),
    Date: wrap(Date),
    Map: wrap(Map),
    Set: wrap(Set),
    Promise: wrap(Promise),
    Error: wrap(Error),
    TypeError: wrap(TypeError),
    RangeError: wrap(RangeError),
  };
  const values = names.map((n) => (hasOwn.call(capabilities, n) ? capabilities[n] : undefined));

  const setResult = (envelope) => ops.op_qb_set_result(JSONstringify(envelope));
  const describe = (e) => {
    try {
      if (e instanceof RealError) {
        return { name: StringOf(e.name || "Error"), message: StringOf(e.message) };
      }
    } catch (_) {}
    return { name: "Error", message: render(e) };
  };

  globalThis.__querybox_run = async (fn) => {
    let value;
    try {
      value = await fn(...values);
    } catch (e) {
      setResult({ error: describe(e) });
      return;
    }
    try {
      setResult({ ok: value === undefined ? null : value });
    } catch (e) {
      setResult({
        error: { name: "TypeError", message: `Script result is not serializable: ${describe(e).message}` },
      });
    }
  };

  const pin = (target, key, value) =>
    defineProperty(target, key, { value, writable: false, configurable: false, enumerable: false });

  for (const [Real, Safe] of standIns) {
    pin(Real.prototype, "constructor", Safe);
    if (globalThis[Real.name] === Real) globalThis[Real.name] = Safe;
  }

  // Stack-trace hooks hand out call sites, and call sites hand out receivers.
  pin(RealError, "prepareStackTrace", undefined);
  delete RealError.captureStackTrace;

  const AsyncFunction = (async function () {}).constructor;
  const GeneratorFunction = (function* () {}).constructor;
  const AsyncGeneratorFunction = (async function* () {}).constructor;
  for (const F of [Function, AsyncFunction, GeneratorFunction, AsyncGeneratorFunction]) {
    pin(F.prototype, "constructor", undefined);
  }

  for (const key of ["Deno", "eval", "WebAssembly", "Function", "Reflect", "Proxy",
    "SharedArrayBuffer", "Atomics"]) {
    delete globalThis[key];
  }
})(Deno.core.ops, __NAMES__, __BACKEND__, __MAX_TIMER_MS__);
"#;

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points at the boxed HeapLimitState owned by `run_script`,
    // which unregisters this callback before the box is dropped.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    // 1MB of headroom so the termination can unwind.
    current_heap_limit + 1024 * 1024
}

/// Create a runtime with the querybox extension and heap ceiling.
fn create_runtime(
    binding: Option<DbBinding>,
    output: &OutputCapture,
    max_heap_size: usize,
) -> JsRuntime {
    let create_params = v8::CreateParams::default().heap_limits(0, max_heap_size);
    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![querybox_ext::init_ops_and_esm()],
        create_params: Some(create_params),
        ..Default::default()
    });

    {
        let state = runtime.op_state();
        let mut state = state.borrow_mut();
        state.put(output.clone());
        if let Some(binding) = binding {
            state.put(binding);
        }
    }
    runtime
}

fn bootstrap_source(binding: Option<&DbBinding>) -> Result<String, SandboxError> {
    let backend = match binding {
        Some(DbBinding::Relational(_)) => "relational",
        Some(DbBinding::Document(_)) => "document",
        None => "none",
    };
    Ok(BOOTSTRAP
        .replace("__NAMES__", &serde_json::to_string(&names())?)
        .replace("__BACKEND__", &serde_json::to_string(backend)?)
        .replace("__MAX_TIMER_MS__", &MAX_TIMER_MS.to_string()))
}

enum LoopEnd {
    Done,
    Failed(String),
    TimedOut,
}

/// Compile and run a script body, returning its JSON-serialized return value.
///
/// Output the script emits goes to `output` as it happens, so it is kept
/// even when the run fails.
pub async fn run_script(
    body: &str,
    binding: Option<DbBinding>,
    output: &OutputCapture,
    limits: RunLimits,
) -> Result<Value, SandboxError> {
    // The worker receives the body over IPC; it is re-checked here so the
    // wrapped text below is known to be a single function expression.
    if let Err(issue) = check_syntax(body) {
        return Err(SandboxError::Syntax {
            message: issue.to_string(),
        });
    }

    let bootstrap = bootstrap_source(binding.as_ref())?;
    let mut runtime = create_runtime(binding, output, limits.max_heap_size);
    runtime
        .execute_script("[querybox:bootstrap]", bootstrap)
        .map_err(|e| SandboxError::Execution(anyhow::anyhow!("bootstrap failed: {e}")))?;

    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut std::ffi::c_void,
    );

    // CPU watchdog for loops that never yield to the event loop.
    let watchdog_handle = runtime.v8_isolate().thread_safe_handle();
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog_timed_out = timed_out.clone();
    let timeout = limits.timeout;
    let (cancel_tx, cancel_rx) = std::sync::mpsc::channel::<()>();
    let watchdog = std::thread::spawn(move || {
        if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
            watchdog_timed_out.store(true, Ordering::SeqCst);
            watchdog_handle.terminate_execution();
        }
    });

    let source = format!(
        "(async () => {{\nconst run = globalThis.__querybox_run;\ndelete globalThis.__querybox_run;\nawait run({});\n}})();",
        wrap_script_body(body)
    );

    let end = match runtime.execute_script("[querybox:script]", source) {
        Ok(_) => {
            match tokio::time::timeout(
                timeout,
                runtime.run_event_loop(PollEventLoopOptions::default()),
            )
            .await
            {
                Ok(Ok(())) => LoopEnd::Done,
                Ok(Err(e)) => LoopEnd::Failed(e.to_string()),
                Err(_) => LoopEnd::TimedOut,
            }
        }
        Err(e) => LoopEnd::Failed(e.to_string()),
    };

    let _ = cancel_tx.send(());
    let _ = watchdog.join();
    runtime
        .v8_isolate()
        .remove_near_heap_limit_callback(near_heap_limit_callback, 0);

    if heap_state.triggered.load(Ordering::SeqCst) {
        return Err(SandboxError::HeapLimitExceeded {
            max_bytes: limits.max_heap_size,
        });
    }
    let timeout_err = || SandboxError::Timeout {
        timeout_ms: timeout.as_millis() as u64,
    };
    if timed_out.load(Ordering::SeqCst) {
        return Err(timeout_err());
    }

    let outcome = runtime.op_state().borrow_mut().try_take::<ScriptOutcome>();
    match (outcome, end) {
        (_, LoopEnd::TimedOut) => Err(timeout_err()),
        (Some(ScriptOutcome(json)), end) => {
            if let LoopEnd::Failed(message) = end {
                let (name, message) = split_js_error(&message);
                output.error(
                    format!("Unhandled {name} after completion: {}", redact_error_message(&message)),
                    None,
                );
            }
            parse_outcome(&json)
        }
        (None, LoopEnd::Failed(message)) => {
            let (name, message) = split_js_error(&message);
            Err(SandboxError::JsError { name, message })
        }
        (None, LoopEnd::Done) => Err(SandboxError::JsError {
            name: "Error".into(),
            message: "script finished without reporting a result".into(),
        }),
    }
}

fn parse_outcome(json: &str) -> Result<Value, SandboxError> {
    let mut envelope: Value = serde_json::from_str(json)?;
    if let Some(error) = envelope.get("error") {
        let field = |key: &str| error.get(key).and_then(Value::as_str).map(str::to_string);
        return Err(SandboxError::JsError {
            name: field("name").unwrap_or_else(|| "Error".into()),
            message: field("message").unwrap_or_default(),
        });
    }
    Ok(envelope
        .get_mut("ok")
        .map(Value::take)
        .unwrap_or(Value::Null))
}

/// Split `Uncaught TypeError: x is not a function\n    at ...` into
/// `("TypeError", "x is not a function")`.
fn split_js_error(text: &str) -> (String, String) {
    let first = text.lines().next().unwrap_or_default().trim();
    let first = first
        .strip_prefix("Uncaught (in promise) ")
        .or_else(|| first.strip_prefix("Uncaught "))
        .unwrap_or(first);
    match first.split_once(": ") {
        Some((name, message))
            if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            (name.to_string(), message.to_string())
        }
        _ => ("Error".to_string(), first.to_string()),
    }
}
