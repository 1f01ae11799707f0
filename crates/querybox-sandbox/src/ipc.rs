//! Supervisor ↔ worker protocol.
//!
//! Frames are a 4-byte big-endian length followed by a JSON payload. The
//! exchange is fixed: the worker sends [`ChildMessage::Ready`], the supervisor
//! answers with one [`ParentMessage::Execute`], and the worker finishes with one
//! [`ChildMessage::Result`].

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::result::{BackendKind, ChildProcessResult};

/// Default maximum frame size: 64 MB.
pub const DEFAULT_MAX_IPC_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Supervisor → worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParentMessage {
    /// Run this job. Sent once, after `Ready`.
    Execute {
        /// Everything the worker needs.
        config: WorkerConfig,
    },
}

/// Worker → supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChildMessage {
    /// The worker is up and waiting for its job.
    Ready,
    /// Terminal report.
    Result {
        /// The outcome and the captured output.
        data: ChildProcessResult,
    },
}

/// Caps applied by the adapters and the output log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Rows/documents included in each `data` preview.
    pub preview_rows: usize,
    /// Hard cap on documents returned by a single read.
    pub max_documents: usize,
    /// Maximum number of output items kept per execution.
    pub max_output_items: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            preview_rows: 10,
            max_documents: 1000,
            max_output_items: 10_000,
        }
    }
}

/// Resolved connection parameters for one database instance.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConnectionParams {
    /// PostgreSQL host credentials.
    Relational {
        /// Server host name.
        host: String,
        /// Server port.
        port: u16,
        /// Login role.
        user: String,
        /// Login password.
        password: String,
    },
    /// MongoDB connection string.
    Document {
        /// `mongodb://` or `mongodb+srv://` URI.
        uri: String,
    },
}

impl ConnectionParams {
    /// The backend these parameters connect to.
    pub fn backend_kind(&self) -> BackendKind {
        match self {
            Self::Relational { .. } => BackendKind::Relational,
            Self::Document { .. } => BackendKind::Document,
        }
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relational { host, port, .. } => f
                .debug_struct("Relational")
                .field("host", host)
                .field("port", port)
                .field("user", &"[redacted]")
                .field("password", &"[redacted]")
                .finish(),
            Self::Document { .. } => f
                .debug_struct("Document")
                .field("uri", &"[redacted]")
                .finish(),
        }
    }
}

/// The job handed to a worker. Crosses the process boundary once and is
/// never logged or persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Script body.
    pub script: String,
    /// Backend the script targets.
    pub backend_kind: BackendKind,
    /// Catalog instance identifier (for output and logs only).
    pub instance_id: String,
    /// Database to open.
    pub database_name: String,
    /// Execution timeout in milliseconds.
    pub timeout_ms: u64,
    /// V8 heap ceiling in bytes.
    pub max_heap_size: usize,
    /// Adapter and output caps.
    #[serde(default)]
    pub limits: ExecutionLimits,
    /// Where to connect.
    pub connection: ConnectionParams,
    /// Maximum frame size the worker will accept.
    #[serde(default = "default_max_ipc_message_size")]
    pub max_ipc_message_size: usize,
}

fn default_max_ipc_message_size() -> usize {
    DEFAULT_MAX_IPC_MESSAGE_SIZE
}

/// Write one frame and flush.
pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> io::Result<()> {
    let payload =
        serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("IPC payload of {} bytes does not fit a frame", payload.len()),
        )
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

/// Read one frame, rejecting payloads over `max_size` bytes. `None` on clean EOF.
pub async fn read_message_with_limit<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> io::Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("IPC message too large: {len} bytes (limit: {max_size} bytes)"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
