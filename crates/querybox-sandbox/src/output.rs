//! Structured output captured from a running script.
//!
//! Every console call, statement, and document operation becomes one
//! [`OutputItem`]. Items are appended in emission order to an [`OutputCapture`]
//! that lives exactly as long as one execution.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum characters kept from a single console message.
pub const MAX_MESSAGE_CHARS: usize = 10_000;

/// Risk marker attached to destructive statements and operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    /// Scoped destructive operation (filtered bulk delete/update, index drop).
    High,
    /// Unbounded destructive operation (empty filter, collection/table drop).
    Critical,
}

/// One unit of captured script activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputItem {
    /// `console.log` / `console.debug`.
    Log {
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// `console.info`, `print`, and lifecycle notes.
    Info {
        message: String,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        details: Map<String, Value>,
    },
    /// `console.warn` and destructive-operation notices.
    Warn {
        message: String,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        risk: Option<Risk>,
    },
    /// `console.error`, database errors, and the final failure note.
    Error {
        message: String,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    /// A relational statement.
    Query {
        message: String,
        timestamp: DateTime<Utc>,
        query_number: u64,
        query_type: String,
        sql: String,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        row_count: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows_affected: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        risk: Option<Risk>,
    },
    /// A bounded preview of rows or documents read.
    Data {
        message: String,
        timestamp: DateTime<Utc>,
        preview: Vec<Value>,
        total: u64,
        truncated: bool,
    },
    /// A document-store operation.
    Operation {
        message: String,
        timestamp: DateTime<Utc>,
        op_number: u64,
        collection: String,
        operation: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<u64>,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        risk: Option<Risk>,
    },
    /// The script's return value.
    Result {
        message: String,
        timestamp: DateTime<Utc>,
        value: Value,
    },
}

impl OutputItem {
    /// A `log` item stamped now.
    pub fn log(message: impl Into<String>) -> Self {
        Self::Log {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// An `info` item stamped now.
    pub fn info(message: impl Into<String>) -> Self {
        Self::info_with(message, Map::new())
    }

    /// An `info` item with structured details.
    pub fn info_with(message: impl Into<String>, details: Map<String, Value>) -> Self {
        Self::Info {
            message: message.into(),
            timestamp: Utc::now(),
            details,
        }
    }

    /// A `warn` item stamped now.
    pub fn warn(message: impl Into<String>, risk: Option<Risk>) -> Self {
        Self::Warn {
            message: message.into(),
            timestamp: Utc::now(),
            risk,
        }
    }

    /// An `error` item stamped now.
    pub fn error(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: Utc::now(),
            code,
        }
    }

    /// A `result` item carrying the script's return value.
    pub fn result(value: Value) -> Self {
        Self::Result {
            message: "Script returned a value".into(),
            timestamp: Utc::now(),
            value,
        }
    }

    /// The wire tag of this item.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Log { .. } => "log",
            Self::Info { .. } => "info",
            Self::Warn { .. } => "warn",
            Self::Error { .. } => "error",
            Self::Query { .. } => "query",
            Self::Data { .. } => "data",
            Self::Operation { .. } => "operation",
            Self::Result { .. } => "result",
        }
    }

    /// The item's message text.
    pub fn message(&self) -> &str {
        match self {
            Self::Log { message, .. }
            | Self::Info { message, .. }
            | Self::Warn { message, .. }
            | Self::Error { message, .. }
            | Self::Query { message, .. }
            | Self::Data { message, .. }
            | Self::Operation { message, .. }
            | Self::Result { message, .. } => message,
        }
    }

    /// When the item was emitted.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Log { timestamp, .. }
            | Self::Info { timestamp, .. }
            | Self::Warn { timestamp, .. }
            | Self::Error { timestamp, .. }
            | Self::Query { timestamp, .. }
            | Self::Data { timestamp, .. }
            | Self::Operation { timestamp, .. }
            | Self::Result { timestamp, .. } => *timestamp,
        }
    }

    /// Risk marker for statements, operations, and warnings.
    pub fn risk(&self) -> Option<Risk> {
        match self {
            Self::Warn { risk, .. } | Self::Query { risk, .. } | Self::Operation { risk, .. } => {
                *risk
            }
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct CaptureState {
    items: Vec<OutputItem>,
    dropped: u64,
}

/// Append-only, per-execution output log.
///
/// Cheap to clone; clones share the same log. Once `max_items` is reached a
/// single `warn` item is recorded and later items are counted but discarded.
#[derive(Debug, Clone)]
pub struct OutputCapture {
    state: Arc<Mutex<CaptureState>>,
    max_items: usize,
}

impl Default for OutputCapture {
    fn default() -> Self {
        Self::new(crate::ExecutionLimits::default().max_output_items)
    }
}

impl OutputCapture {
    /// Create an empty log bounded to `max_items` entries.
    pub fn new(max_items: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(CaptureState::default())),
            max_items: max_items.max(1),
        }
    }

    /// Append an item.
    pub fn push(&self, item: OutputItem) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        // Reserve the last slot for the overflow notice.
        if state.items.len() + 1 < self.max_items {
            state.items.push(item);
            return;
        }
        if state.dropped == 0 {
            state.items.push(OutputItem::warn(
                format!(
                    "Output limit of {} items reached; further output discarded",
                    self.max_items
                ),
                None,
            ));
        }
        state.dropped += 1;
    }

    /// Append a `log` item.
    pub fn log(&self, message: impl Into<String>) {
        self.push(OutputItem::log(message));
    }

    /// Append an `info` item.
    pub fn info(&self, message: impl Into<String>) {
        self.push(OutputItem::info(message));
    }

    /// Append a `warn` item.
    pub fn warn(&self, message: impl Into<String>, risk: Option<Risk>) {
        self.push(OutputItem::warn(message, risk));
    }

    /// Append an `error` item.
    pub fn error(&self, message: impl Into<String>, code: Option<String>) {
        self.push(OutputItem::error(message, code));
    }

    /// Number of items discarded after the limit was reached.
    pub fn dropped(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).dropped
    }

    /// Number of items recorded.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).items.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the current log.
    pub fn snapshot(&self) -> Vec<OutputItem> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .items
            .clone()
    }

    /// Take the log, leaving it empty.
    pub fn take(&self) -> Vec<OutputItem> {
        std::mem::take(&mut self.state.lock().unwrap_or_else(|e| e.into_inner()).items)
    }
}

/// Truncate `text` to at most `max_chars` characters, appending `...` when cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}
