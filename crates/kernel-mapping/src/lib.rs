//! Session-to-kernel mapping for a notebook server.
//!
//! The mapping core tracks which kernels are visible to API consumers and
//! which notebook session each kernel belongs to. Process lifecycle (launch,
//! teardown, death detection) is delegated to a [`KernelRegistry`]; the core
//! only keeps the metadata overlay and reacts to the registry's death
//! notifications.
//!
//! ```ignore
//! use kernel_mapping::{LaunchOptions, ManagerConfig, MappingKernelManager};
//!
//! let manager = MappingKernelManager::new(registry, ManagerConfig::default());
//! let kernel_id = manager.start_kernel(LaunchOptions::default()).await?;
//! let model = manager.kernel_model(&kernel_id, "ws://127.0.0.1:8888")?;
//! ```

use serde::{Deserialize, Serialize};

pub mod channel;
pub mod error;
pub mod manager;
pub mod registry;

pub use channel::{ChannelLogging, KernelChannel, LoggingHook, MessageHook, SilentHook};
pub use error::MappingError;
pub use manager::{ManagerConfig, MappingKernelManager};
pub use registry::{KernelRegistry, LaunchOptions, RestartCallback, RestartEvent};

/// A kernel as exposed to API consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelModel {
    pub id: String,
    pub ws_url: String,
}

/// When a started kernel becomes visible in `list_kernels`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Listed as soon as it starts, with the manager's configured websocket URL.
    #[default]
    OnStart,
    /// Listed only once a client has requested its model.
    OnRequest,
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Visibility::OnStart => write!(f, "on_start"),
            Visibility::OnRequest => write!(f, "on_request"),
        }
    }
}
