//! Client for communicating with mappingd.
//!
//! Notebook servers use this client to start kernels and resolve kernel ids
//! through the central daemon.

use std::path::PathBuf;
use std::time::Duration;

use kernel_mapping::{KernelModel, LaunchOptions};
use log::info;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::default_socket_path;
use crate::protocol::{DaemonStatus, Request, Response};

/// Error type for client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon: {0}")]
    ConnectionFailed(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The daemon answered 404.
    #[error("{0}")]
    NotFound(String),

    #[error("Daemon returned error ({status}): {message}")]
    DaemonError { status: u16, message: String },

    #[error("Connection timeout")]
    Timeout,
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

/// Map a response the caller did not expect to an error.
fn unexpected(response: Response) -> ClientError {
    match response {
        Response::Error { status: 404, message } => ClientError::NotFound(message),
        Response::Error { status, message } => ClientError::DaemonError { status, message },
        other => ClientError::ProtocolError(format!("Unexpected response: {:?}", other)),
    }
}

/// Client for mappingd.
pub struct MappingClient {
    socket_path: PathBuf,
    connect_timeout: Duration,
}

impl Default for MappingClient {
    fn default() -> Self {
        Self::new(default_socket_path())
    }
}

impl MappingClient {
    /// Create a new client with a custom socket path.
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            connect_timeout: Duration::from_secs(2),
        }
    }

    /// Set the connection timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Check if the daemon is running.
    pub async fn is_daemon_running(&self) -> bool {
        self.ping().await.is_ok()
    }

    /// Ping the daemon to check if it's alive.
    pub async fn ping(&self) -> Result<(), ClientError> {
        match self.send_request(Request::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Start a kernel (or reuse the session's kernel). Returns its id.
    pub async fn start_kernel(&self, options: LaunchOptions) -> Result<String, ClientError> {
        match self.send_request(Request::StartKernel { options }).await? {
            Response::KernelStarted { kernel_id } => {
                info!("[mappingd-client] Kernel started: {}", kernel_id);
                Ok(kernel_id)
            }
            other => Err(unexpected(other)),
        }
    }

    /// Shutdown a kernel.
    pub async fn shutdown_kernel(&self, kernel_id: &str, now: bool) -> Result<(), ClientError> {
        let request = Request::ShutdownKernel {
            kernel_id: kernel_id.to_string(),
            now,
        };
        self.expect_ok(request).await
    }

    /// Restart a kernel.
    pub async fn restart_kernel(&self, kernel_id: &str, now: bool) -> Result<(), ClientError> {
        let request = Request::RestartKernel {
            kernel_id: kernel_id.to_string(),
            now,
        };
        self.expect_ok(request).await
    }

    /// Interrupt a kernel.
    pub async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), ClientError> {
        let request = Request::InterruptKernel {
            kernel_id: kernel_id.to_string(),
        };
        self.expect_ok(request).await
    }

    /// Record the websocket URL for a kernel and get its model.
    pub async fn kernel_model(
        &self,
        kernel_id: &str,
        ws_url: &str,
    ) -> Result<KernelModel, ClientError> {
        let request = Request::KernelModel {
            kernel_id: kernel_id.to_string(),
            ws_url: ws_url.to_string(),
        };
        match self.send_request(request).await? {
            Response::Kernel { kernel } => Ok(kernel),
            other => Err(unexpected(other)),
        }
    }

    /// Get a running kernel's visible record, `None` if it is not listed.
    pub async fn get_kernel(&self, kernel_id: &str) -> Result<Option<KernelModel>, ClientError> {
        let request = Request::GetKernel {
            kernel_id: kernel_id.to_string(),
        };
        match self.send_request(request).await? {
            Response::KernelLookup { kernel } => Ok(kernel),
            other => Err(unexpected(other)),
        }
    }

    /// List visible kernels.
    pub async fn list_kernels(&self) -> Result<Vec<KernelModel>, ClientError> {
        match self.send_request(Request::ListKernels).await? {
            Response::Kernels { kernels } => Ok(kernels),
            other => Err(unexpected(other)),
        }
    }

    /// Get daemon status.
    pub async fn status(&self) -> Result<DaemonStatus, ClientError> {
        match self.send_request(Request::Status).await? {
            Response::Status { status } => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Request daemon shutdown.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        match self.send_request(Request::Shutdown).await? {
            Response::ShuttingDown => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn expect_ok(&self, request: Request) -> Result<(), ClientError> {
        match self.send_request(request).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Send a request to the daemon and receive a response.
    async fn send_request(&self, request: Request) -> Result<Response, ClientError> {
        let connect_result = tokio::time::timeout(
            self.connect_timeout,
            UnixStream::connect(&self.socket_path),
        )
        .await;

        let stream = match connect_result {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(ClientError::ConnectionFailed(e)),
            Err(_) => return Err(ClientError::Timeout),
        };

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        // Send request
        let line = request
            .to_line()
            .map_err(|e| ClientError::ProtocolError(format!("Failed to serialize: {}", e)))?;
        writer.write_all(line.as_bytes()).await?;

        // Read response
        let mut response_line = String::new();
        reader.read_line(&mut response_line).await?;

        Response::from_line(&response_line)
            .map_err(|e| ClientError::ProtocolError(format!("Failed to parse response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_default() {
        let client = MappingClient::default();
        assert!(client
            .socket_path
            .to_string_lossy()
            .contains("mappingd.sock"));
    }

    #[test]
    fn test_client_custom_path() {
        let client = MappingClient::new(PathBuf::from("/tmp/test.sock"))
            .with_timeout(Duration::from_millis(100));
        assert_eq!(client.socket_path, PathBuf::from("/tmp/test.sock"));
        assert_eq!(client.connect_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_unexpected_maps_status() {
        let err = unexpected(Response::Error {
            status: 404,
            message: "Kernel does not exist: k".to_string(),
        });
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Kernel does not exist: k");

        let err = unexpected(Response::Error {
            status: 500,
            message: "boom".to_string(),
        });
        assert!(matches!(err, ClientError::DaemonError { status: 500, .. }));

        assert!(matches!(
            unexpected(Response::Pong),
            ClientError::ProtocolError(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_daemon_is_connection_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let client = MappingClient::new(tmp.path().join("absent.sock"));
        assert!(!client.is_daemon_running().await);
        assert!(matches!(
            client.list_kernels().await,
            Err(ClientError::ConnectionFailed(_))
        ));
    }
}
