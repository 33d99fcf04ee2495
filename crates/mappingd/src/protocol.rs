//! IPC protocol for mappingd communication.
//!
//! Messages are newline-delimited JSON (NDJSON) for simplicity.

use chrono::{DateTime, Utc};
use kernel_mapping::{KernelModel, LaunchOptions, MappingError, Visibility};
use serde::{Deserialize, Serialize};

/// Requests that clients can send to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Start a kernel, or reuse the live kernel of the given session.
    StartKernel {
        #[serde(default)]
        options: LaunchOptions,
    },

    /// Shutdown a kernel.
    ShutdownKernel {
        kernel_id: String,
        #[serde(default)]
        now: bool,
    },

    /// Restart a kernel in place.
    RestartKernel {
        kernel_id: String,
        #[serde(default)]
        now: bool,
    },

    /// Interrupt a kernel.
    InterruptKernel { kernel_id: String },

    /// Record a kernel's websocket URL and return its model.
    KernelModel { kernel_id: String, ws_url: String },

    /// Look up a kernel's visible record without changing it.
    GetKernel { kernel_id: String },

    /// List visible kernels.
    ListKernels,

    /// Get daemon status.
    Status,

    /// Ping to check if daemon is alive.
    Ping,

    /// Request daemon shutdown. All kernels are shut down with it.
    Shutdown,
}

/// Responses from the daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// A kernel was started (or reused).
    KernelStarted { kernel_id: String },

    /// A single kernel model.
    Kernel { kernel: KernelModel },

    /// A running kernel that may not be listed yet.
    KernelLookup { kernel: Option<KernelModel> },

    /// Visible kernels in registration order.
    Kernels { kernels: Vec<KernelModel> },

    /// The request succeeded with nothing to report.
    Ok,

    /// Daemon status.
    Status { status: DaemonStatus },

    /// Pong response to ping.
    Pong,

    /// Shutdown acknowledged.
    ShuttingDown,

    /// An error occurred. `status` follows HTTP semantics (404 for unknown kernels).
    Error { status: u16, message: String },
}

/// Daemon status snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Kernels the registry tracks.
    pub running_kernels: usize,
    /// Kernels visible in listings.
    pub visible_kernels: usize,
    pub visibility: Visibility,
    pub version: String,
    pub started_at: DateTime<Utc>,
}

impl Request {
    /// Serialize request to JSON line (with newline terminator).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse request from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl Response {
    /// Serialize response to JSON line (with newline terminator).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse response from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    /// Render a mapping error, keeping its HTTP status.
    pub fn from_error(err: &MappingError) -> Self {
        Response::Error {
            status: err.status_code(),
            message: err.to_string(),
        }
    }
}

impl From<Result<(), MappingError>> for Response {
    fn from(result: Result<(), MappingError>) -> Self {
        match result {
            Ok(()) => Response::Ok,
            Err(e) => Response::from_error(&e),
        }
    }
}
