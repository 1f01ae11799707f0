#![warn(missing_docs)]

//! # querybox-sandbox
//!
//! Isolated execution of untrusted database scripts.
//!
//! A script is the body of an async JavaScript function. It is validated
//! against a pattern blocklist, then run in a fresh worker process inside a
//! deno_core isolate whose only capabilities are one database adapter (`db`),
//! a capturing console, bounded timers, and frozen copies of safe built-ins.
//!
//! ## Security model
//!
//! - **Process isolation**: one short-lived worker per execution, killed and
//!   reaped on every path
//! - **Restricted namespace**: unsafe globals are shadowed by `undefined`
//!   parameters; `eval`, `Deno`, and function constructors are removed
//! - **Pre-execution validation**: blocking signatures never reach a process
//! - **Hard deadline**: `timeout + grace`, enforced by the supervisor
//! - **Credentials stay out of scripts**: connection parameters reach the
//!   worker over IPC only, and error messages are redacted

pub mod adapter;
pub mod audit;
pub mod backend;
pub mod catalog;
pub mod env;
pub mod error;
pub mod executor;
pub mod host;
pub mod ipc;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod namespace;
pub mod ops;
pub mod output;
pub mod redact;
pub mod result;
pub mod runtime;
pub mod syntax;
pub mod validator;
pub mod worker;

pub use catalog::{CatalogError, InstanceCatalog, InstanceEntry, StaticCatalog};
pub use error::{DbError, SandboxError};
pub use executor::{ExecutionMode, SandboxConfig, ScriptExecutor};
pub use host::ExecutorMetrics;
pub use ipc::ExecutionLimits;
pub use output::{OutputItem, Risk};
pub use result::{
    BackendKind, ErrorInfo, ErrorKind, ExecutionRequest, ExecutionResult, ExecutionSummary,
};
pub use validator::{validate, ValidationResult};
