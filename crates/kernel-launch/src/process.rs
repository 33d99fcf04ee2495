//! A single kernel process and the files and tasks that belong to it.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jupyter_protocol::{ConnectionInfo, JupyterMessage, ShutdownRequest};
use kernel_mapping::{KernelChannel, LaunchOptions, MessageHook};
use log::{debug, error, info, warn};
use uuid::Uuid;

/// Connection file name for a kernel id.
pub fn connection_file_name(kernel_id: &str) -> String {
    format!("kernel-{}.json", kernel_id)
}

/// What is needed to (re)launch a kernel.
#[derive(Debug, Clone)]
pub(crate) struct LaunchSpec {
    pub kernel_id: String,
    pub kernel_name: String,
    pub options: LaunchOptions,
}

pub(crate) struct KernelProcess {
    spec: LaunchSpec,
    hook: Arc<dyn MessageHook>,
    connection_info: ConnectionInfo,
    /// Taken when the process is stopped so a relaunch keeps its fresh file.
    connection_file: Option<PathBuf>,
    session_id: String,
    child: tokio::process::Child,
    /// Process group ID for cleanup (Unix only)
    #[cfg(unix)]
    process_group_id: Option<i32>,
    iopub_task: Option<tokio::task::JoinHandle<()>>,
}

impl KernelProcess {
    /// Launch a kernel process from its kernelspec.
    pub async fn launch(spec: LaunchSpec, hook: Arc<dyn MessageHook>) -> Result<Self> {
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let ports = runtimelib::peek_ports(ip, 5).await?;

        let connection_info = ConnectionInfo {
            transport: jupyter_protocol::connection_info::Transport::TCP,
            ip: ip.to_string(),
            stdin_port: ports[0],
            control_port: ports[1],
            hb_port: ports[2],
            shell_port: ports[3],
            iopub_port: ports[4],
            signature_scheme: "hmac-sha256".to_string(),
            key: Uuid::new_v4().to_string(),
            kernel_name: Some(spec.kernel_name.clone()),
        };

        let kernelspec = runtimelib::find_kernelspec(&spec.kernel_name)
            .await
            .with_context(|| format!("No kernelspec named {}", spec.kernel_name))?;

        let runtime_dir = runtimelib::dirs::runtime_dir();
        tokio::fs::create_dir_all(&runtime_dir).await?;
        let connection_file = runtime_dir.join(connection_file_name(&spec.kernel_id));
        let mut cmd =
            kernelspec.command(&connection_file, Some(Stdio::null()), Some(Stdio::null()))?;
        cmd.args(&spec.options.extra_arguments);
        cmd.envs(&spec.options.env);
        if let Some(ref cwd) = spec.options.cwd {
            cmd.current_dir(cwd);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        write_connection_file(&connection_file, &connection_info).await?;
        let child = match cmd.kill_on_drop(true).spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = tokio::fs::remove_file(&connection_file).await;
                return Err(e).with_context(|| {
                    format!("spawning {} kernel {}", spec.kernel_name, spec.kernel_id)
                });
            }
        };

        info!(
            "[kernel-launch] Started {} kernel {} (pid {:?})",
            spec.kernel_name,
            spec.kernel_id,
            child.id()
        );

        let session_id = Uuid::new_v4().to_string();
        let iopub_task = spawn_iopub_watcher(
            spec.kernel_id.clone(),
            connection_info.clone(),
            session_id.clone(),
            hook.clone(),
        );

        Ok(Self {
            #[cfg(unix)]
            process_group_id: child.id().map(|pid| pid as i32),
            spec,
            hook,
            connection_info,
            connection_file: Some(connection_file),
            session_id,
            child,
            iopub_task: Some(iopub_task),
        })
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn connection_file(&self) -> Option<&Path> {
        self.connection_file.as_deref()
    }

    /// Whether the process is still running.
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(
                    "[kernel-launch] Kernel {} exited with {}",
                    self.spec.kernel_id, status
                );
                false
            }
            Err(e) => {
                warn!(
                    "[kernel-launch] Could not poll kernel {}: {}",
                    self.spec.kernel_id, e
                );
                false
            }
        }
    }

    /// Stop the process and launch a fresh one with the same spec.
    pub async fn relaunch(&mut self, now: bool, shutdown_wait: Duration) -> Result<()> {
        self.stop(now, shutdown_wait).await;
        let fresh = KernelProcess::launch(self.spec.clone(), self.hook.clone()).await?;
        *self = fresh;
        Ok(())
    }

    /// Stop the process, gracefully unless `now`.
    pub async fn stop(&mut self, now: bool, shutdown_wait: Duration) {
        if let Some(task) = self.iopub_task.take() {
            task.abort();
        }

        if !now && self.is_alive() {
            match self.request_shutdown().await {
                Ok(()) => {
                    if tokio::time::timeout(shutdown_wait, self.child.wait())
                        .await
                        .is_err()
                    {
                        warn!(
                            "[kernel-launch] Kernel {} did not exit within {:?}, killing",
                            self.spec.kernel_id, shutdown_wait
                        );
                    }
                }
                Err(e) => warn!(
                    "[kernel-launch] Shutdown request to {} failed: {}",
                    self.spec.kernel_id, e
                ),
            }
        }

        self.kill();
        let _ = self.child.wait().await;
        if let Some(path) = self.connection_file.take() {
            let _ = tokio::fs::remove_file(path).await;
        }
    }

    /// Send SIGINT to the kernel's process group, or an interrupt request
    /// on the control channel where signals are unavailable.
    pub async fn interrupt(&self) -> Result<()> {
        #[cfg(unix)]
        if let Some(pgid) = self.process_group_id {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            killpg(Pid::from_raw(pgid), Signal::SIGINT)?;
            info!("[kernel-launch] Sent SIGINT to kernel {}", self.spec.kernel_id);
            return Ok(());
        }

        let mut control =
            runtimelib::create_client_control_connection(&self.connection_info, &self.session_id)
                .await?;
        let request: JupyterMessage = jupyter_protocol::InterruptRequest {}.into();
        control.send(request).await?;
        info!(
            "[kernel-launch] Sent interrupt_request to kernel {}",
            self.spec.kernel_id
        );
        Ok(())
    }

    async fn request_shutdown(&self) -> Result<()> {
        let mut control =
            runtimelib::create_client_control_connection(&self.connection_info, &self.session_id)
                .await?;
        let request: JupyterMessage = ShutdownRequest { restart: false }.into();
        control.send(request).await?;
        Ok(())
    }

    fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.process_group_id.take() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    error!(
                        "[kernel-launch] Failed to kill process group {}: {}",
                        pgid, e
                    );
                }
            }
        }
        let _ = self.child.start_kill();
    }
}

impl Drop for KernelProcess {
    fn drop(&mut self) {
        if let Some(task) = self.iopub_task.take() {
            task.abort();
        }

        #[cfg(unix)]
        if let Some(pgid) = self.process_group_id.take() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
        }

        if let Some(path) = self.connection_file.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

pub(crate) async fn write_connection_file(path: &Path, info: &ConnectionInfo) -> Result<()> {
    tokio::fs::write(path, serde_json::to_string_pretty(info)?)
        .await
        .with_context(|| format!("writing connection file {:?}", path))
}

/// Forward every iopub message type to the hook until the socket closes.
fn spawn_iopub_watcher(
    kernel_id: String,
    connection_info: ConnectionInfo,
    session_id: String,
    hook: Arc<dyn MessageHook>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut iopub =
            match runtimelib::create_client_iopub_connection(&connection_info, "", &session_id)
                .await
            {
                Ok(iopub) => iopub,
                Err(e) => {
                    warn!(
                        "[kernel-launch] Could not connect to iopub of {}: {}",
                        kernel_id, e
                    );
                    return;
                }
            };

        loop {
            match iopub.read().await {
                Ok(message) => {
                    hook.on_message(&kernel_id, KernelChannel::IoPub, &message.header.msg_type)
                }
                Err(e) => {
                    debug!("[kernel-launch] iopub of {} closed: {}", kernel_id, e);
                    break;
                }
            }
        }
    })
}
