//! Error types for the querybox sandbox.

use thiserror::Error;

use crate::result::ErrorKind;

/// Errors raised while running a script inside the embedded runtime.
///
/// These never cross the process boundary as-is: the worker folds them into a
/// [`ChildProcessResult`](crate::result::ChildProcessResult) using [`SandboxError::kind`].
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The body failed the parse check before any code was compiled.
    #[error("{message}")]
    Syntax {
        /// Parser message with the body-relative line.
        message: String,
    },

    /// Execution timed out (async event loop or CPU-bound watchdog).
    #[error("execution timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// A JavaScript error escaped the script body.
    #[error("{name}: {message}")]
    JsError {
        /// The JavaScript error name (`TypeError`, `DatabaseError`, ...).
        name: String,
        /// The error message from JavaScript.
        message: String,
    },

    /// V8 heap memory limit was exceeded.
    #[error("heap limit of {max_bytes} bytes exceeded")]
    HeapLimitExceeded {
        /// Configured heap ceiling.
        max_bytes: usize,
    },

    /// Result serialization failed.
    #[error("result serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic execution failure.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),
}

impl SandboxError {
    /// Map onto the caller-facing error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Syntax { .. } => ErrorKind::Syntax,
            Self::Timeout { .. } => ErrorKind::Timeout,
            // A SyntaxError thrown while running (JSON.parse, a script's own
            // throw) is an ordinary runtime failure.
            Self::JsError { .. } | Self::HeapLimitExceeded { .. } => ErrorKind::Runtime,
            Self::Serialization(_) | Self::Execution(_) => ErrorKind::Worker,
        }
    }

    /// The native error name reported alongside runtime failures.
    pub fn js_name(&self) -> Option<&str> {
        match self {
            Self::JsError { name, .. } => Some(name),
            Self::Syntax { .. } => Some("SyntaxError"),
            Self::HeapLimitExceeded { .. } => Some("RangeError"),
            _ => None,
        }
    }
}

/// Errors produced by the database clients behind the adapters.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum DbError {
    /// The connection could not be established or was lost.
    #[error("{0}")]
    Connection(String),

    /// The backend rejected a statement or command.
    #[error("{message}")]
    Query {
        /// Native error message.
        message: String,
        /// Backend error code (SQLSTATE, MongoDB error code).
        code: Option<String>,
    },

    /// The script passed an argument the adapter cannot translate.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested verb does not exist for this backend.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl DbError {
    /// Build a query error with an optional backend code.
    pub fn query(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Query {
            message: message.into(),
            code,
        }
    }

    /// Backend-specific error code, when the backend supplied one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_parse_check_is_a_syntax_error() {
        let err = SandboxError::Syntax {
            message: "SyntaxError at line 2: Unexpected token".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Syntax);
        assert_eq!(err.js_name(), Some("SyntaxError"));

        let err = SandboxError::JsError {
            name: "SyntaxError".into(),
            message: "Unexpected token b in JSON at position 1".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Runtime);
        assert_eq!(err.js_name(), Some("SyntaxError"));

        let err = SandboxError::JsError {
            name: "TypeError".into(),
            message: "x is not a function".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Runtime);
        assert_eq!(err.js_name(), Some("TypeError"));
    }

    #[test]
    fn heap_limit_reports_range_error() {
        let err = SandboxError::HeapLimitExceeded { max_bytes: 1024 };
        assert_eq!(err.kind(), ErrorKind::Runtime);
        assert_eq!(err.js_name(), Some("RangeError"));
    }

    #[test]
    fn db_error_code_only_for_query_errors() {
        let err = DbError::query("duplicate key", Some("23505".into()));
        assert_eq!(err.code(), Some("23505"));
        assert_eq!(err.to_string(), "duplicate key");
        assert_eq!(DbError::Connection("refused".into()).code(), None);
    }
}
