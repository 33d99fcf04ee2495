//! Kernel process registry for the mapping kernel manager.
//!
//! [`ProcessRegistry`] implements [`kernel_mapping::KernelRegistry`] on top of
//! real kernel processes:
//!
//! - Kernels are resolved from installed kernelspecs and launched in their own
//!   process group with a connection file in the Jupyter runtime directory
//! - An auto-restarter polls each kernel and relaunches it when it dies,
//!   reporting `restart` and, once it gives up, `dead` to registered callbacks
//! - iopub traffic is passed to the configured [`kernel_mapping::MessageHook`]
//!
//! ```ignore
//! use kernel_launch::{LaunchConfig, ProcessRegistry};
//! use kernel_mapping::{ManagerConfig, MappingKernelManager};
//!
//! let registry = ProcessRegistry::new(LaunchConfig::default());
//! let manager = MappingKernelManager::new(registry, ManagerConfig::default());
//! ```

use std::time::Duration;

use kernel_mapping::ChannelLogging;

mod process;
pub mod registry;
mod restarter;
#[cfg(test)]
mod test_kernels;

pub use process::connection_file_name;
pub use registry::ProcessRegistry;

/// Configuration for a [`ProcessRegistry`].
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Kernelspec used when a launch does not name one.
    pub default_kernel_name: String,
    /// Consecutive automatic restarts before a kernel is declared dead.
    pub restart_limit: u32,
    /// Interval between liveness polls.
    pub time_to_dead: Duration,
    /// How long a graceful shutdown may take before the kernel is killed.
    pub shutdown_wait: Duration,
    /// Whether iopub messages are logged.
    pub channel_logging: ChannelLogging,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            default_kernel_name: "python3".to_string(),
            restart_limit: 5,
            time_to_dead: Duration::from_secs(3),
            shutdown_wait: Duration::from_secs(5),
            channel_logging: ChannelLogging::Off,
        }
    }
}
