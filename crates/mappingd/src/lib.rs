//! mappingd - serves the mapping kernel manager to notebook servers.
//!
//! The daemon owns a [`kernel_mapping::MappingKernelManager`] backed by the
//! process registry from `kernel-launch`. Notebook servers talk to it over a
//! Unix domain socket using newline-delimited JSON (see [`protocol`]); lookups
//! of unknown kernels come back as 404 errors carrying the kernel id.

use std::path::PathBuf;

pub mod client;
pub mod daemon;
pub mod protocol;
pub mod settings;

/// Base directory for daemon runtime files.
pub fn daemon_base_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("kernel-mapping")
}

/// Get the default socket path for the daemon.
pub fn default_socket_path() -> PathBuf {
    daemon_base_dir().join("mappingd.sock")
}

/// Get the path to the JSON settings file.
pub fn settings_json_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kernel-mapping")
        .join("settings.json")
}
