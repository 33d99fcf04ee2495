//! mappingd server implementation.
//!
//! The daemon serves one [`MappingKernelManager`] to notebook servers via Unix
//! domain socket. Each connection gets its own task; requests on a connection
//! are answered in order.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kernel_mapping::{KernelRegistry, MappingKernelManager};
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;

use crate::default_socket_path;
use crate::protocol::{DaemonStatus, Request, Response};

/// Configuration for the daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Socket path for IPC.
    pub socket_path: PathBuf,
    /// Shut kernels down immediately (no shutdown request) when the daemon stops.
    pub kill_kernels_on_exit: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            kill_kernels_on_exit: false,
        }
    }
}

/// The daemon state.
pub struct Daemon<R: KernelRegistry> {
    config: DaemonConfig,
    manager: MappingKernelManager<R>,
    started_at: DateTime<Utc>,
    /// Notifier to wake up the accept loop on shutdown.
    shutdown_notify: Notify,
}

impl<R: KernelRegistry> Daemon<R> {
    /// Create a new daemon serving `manager`.
    pub fn new(config: DaemonConfig, manager: MappingKernelManager<R>) -> Arc<Self> {
        Arc::new(Self {
            config,
            manager,
            started_at: Utc::now(),
            shutdown_notify: Notify::new(),
        })
    }

    pub fn manager(&self) -> &MappingKernelManager<R> {
        &self.manager
    }

    /// Ask the accept loop to stop.
    pub fn request_shutdown(&self) {
        self.shutdown_notify.notify_one();
    }

    /// Run the daemon server until shutdown is requested.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        // Ensure socket directory exists
        if let Some(parent) = self.config.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Remove stale socket file
        if self.config.socket_path.exists() {
            tokio::fs::remove_file(&self.config.socket_path).await?;
        }

        let listener = UnixListener::bind(&self.config.socket_path)?;
        info!("[mappingd] Listening on {:?}", self.config.socket_path);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            let daemon = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = daemon.handle_connection(stream).await {
                                    error!("[mappingd] Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("[mappingd] Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown_notify.notified() => {
                    info!("[mappingd] Shutting down");
                    break;
                }
            }
        }

        if let Err(e) = self
            .manager
            .shutdown_all(self.config.kill_kernels_on_exit)
            .await
        {
            warn!("[mappingd] Not every kernel shut down cleanly: {}", e);
        }

        // Cleanup socket
        tokio::fs::remove_file(&self.config.socket_path).await.ok();

        Ok(())
    }

    /// Handle a single client connection.
    async fn handle_connection(self: Arc<Self>, stream: UnixStream) -> anyhow::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;
            if bytes_read == 0 {
                // Connection closed
                break;
            }

            let response = match Request::from_line(&line) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => Response::Error {
                    status: 400,
                    message: format!("Invalid request: {}", e),
                },
            };
            writer.write_all(response.to_line()?.as_bytes()).await?;
        }

        Ok(())
    }

    /// Handle a single request.
    async fn handle_request(&self, request: Request) -> Response {
        match request {
            Request::StartKernel { options } => match self.manager.start_kernel(options).await {
                Ok(kernel_id) => Response::KernelStarted { kernel_id },
                Err(e) => {
                    error!("[mappingd] Failed to start kernel: {}", e);
                    Response::from_error(&e)
                }
            },

            Request::ShutdownKernel { kernel_id, now } => {
                self.manager.shutdown_kernel(&kernel_id, now).await.into()
            }

            Request::RestartKernel { kernel_id, now } => {
                self.manager.restart_kernel(&kernel_id, now).await.into()
            }

            Request::InterruptKernel { kernel_id } => {
                self.manager.interrupt_kernel(&kernel_id).await.into()
            }

            Request::KernelModel { kernel_id, ws_url } => {
                match self.manager.kernel_model(&kernel_id, &ws_url) {
                    Ok(kernel) => Response::Kernel { kernel },
                    Err(e) => Response::from_error(&e),
                }
            }

            Request::GetKernel { kernel_id } => match self.manager.get_kernel_model(&kernel_id) {
                Ok(kernel) => Response::KernelLookup { kernel },
                Err(e) => Response::from_error(&e),
            },

            Request::ListKernels => Response::Kernels {
                kernels: self.manager.list_kernels(),
            },

            Request::Status => Response::Status {
                status: DaemonStatus {
                    running_kernels: self.manager.kernel_ids().len(),
                    visible_kernels: self.manager.list_kernels().len(),
                    visibility: self.manager.config().visibility,
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    started_at: self.started_at,
                },
            },

            Request::Ping => Response::Pong,

            Request::Shutdown => {
                self.request_shutdown();
                Response::ShuttingDown
            }
        }
    }
}
