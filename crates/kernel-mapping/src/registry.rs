//! The seam between the mapping core and whatever owns kernel processes.
//!
//! A registry allocates kernel ids, owns the process/connection for each one,
//! and reports lifecycle events back through restart callbacks. The mapping
//! core never caches the registry's answer to "is this id alive".

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MappingError;

/// Callback fired by a registry for a lifecycle event of one kernel.
///
/// Callbacks are bound to their kernel id when they are created.
pub type RestartCallback = Arc<dyn Fn() + Send + Sync>;

/// Lifecycle events a registry reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartEvent {
    /// The kernel died and is being restarted automatically.
    Restart,
    /// The kernel died and will not be restarted.
    Dead,
}

impl std::fmt::Display for RestartEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartEvent::Restart => write!(f, "restart"),
            RestartEvent::Dead => write!(f, "dead"),
        }
    }
}

/// Options for launching a kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchOptions {
    /// Notebook session to associate with the kernel. Repeated starts for the
    /// same session reuse its kernel while it is alive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Kernelspec name; the registry picks its default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_name: Option<String>,
    /// Working directory for the kernel process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Extra environment variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Arguments appended to the kernel command line.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_arguments: Vec<String>,
}

impl LaunchOptions {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }
}

/// Owner of kernel processes.
///
/// Implementations must not hold their own locks while invoking callbacks:
/// the mapping core calls back into [`KernelRegistry::remove_kernel`] from its
/// death handler.
#[async_trait]
pub trait KernelRegistry: Send + Sync + 'static {
    /// Launch a kernel and return its newly allocated id.
    async fn start_kernel(&self, options: LaunchOptions) -> Result<String, MappingError>;

    /// Stop a kernel. `now` skips the graceful shutdown request.
    async fn shutdown_kernel(&self, kernel_id: &str, now: bool) -> Result<(), MappingError>;

    /// Stop and relaunch a kernel under the same id.
    async fn restart_kernel(&self, kernel_id: &str, now: bool) -> Result<(), MappingError>;

    /// Interrupt whatever the kernel is executing.
    async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), MappingError>;

    /// Forget a kernel whose process is already gone. Returns whether it was known.
    fn remove_kernel(&self, kernel_id: &str) -> bool;

    /// Register a callback for a lifecycle event of `kernel_id`.
    fn add_restart_callback(
        &self,
        kernel_id: &str,
        callback: RestartCallback,
        event: RestartEvent,
    ) -> Result<(), MappingError>;

    /// Whether the registry currently tracks `kernel_id`.
    fn contains(&self, kernel_id: &str) -> bool;

    /// Ids of all tracked kernels.
    fn kernel_ids(&self) -> Vec<String>;
}
