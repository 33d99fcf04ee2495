//! Hooks for observing messages a kernel sends on its channels.
//!
//! Registries call [`MessageHook::on_message`] for every message they read.
//! Which hook is used is a configuration choice ([`ChannelLogging`]).
//!
//! The process registry in `kernel-launch` only subscribes to iopub, so that
//! is the only channel its hook sees. The other [`KernelChannel`] values are
//! for registries that also read shell, stdin, control or heartbeat traffic.

use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};

/// Jupyter kernel channels a registry may report messages from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelChannel {
    Shell,
    IoPub,
    Stdin,
    Control,
    Heartbeat,
}

impl std::fmt::Display for KernelChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelChannel::Shell => write!(f, "shell"),
            KernelChannel::IoPub => write!(f, "iopub"),
            KernelChannel::Stdin => write!(f, "stdin"),
            KernelChannel::Control => write!(f, "control"),
            KernelChannel::Heartbeat => write!(f, "hb"),
        }
    }
}

/// Receives every message read from a kernel channel.
pub trait MessageHook: Send + Sync {
    fn on_message(&self, kernel_id: &str, channel: KernelChannel, msg_type: &str);
}

/// Logs each received message type.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHook;

impl MessageHook for LoggingHook {
    fn on_message(&self, kernel_id: &str, channel: KernelChannel, msg_type: &str) {
        info!(
            "[channel] {} {}: Message received, type: {}",
            kernel_id, channel, msg_type
        );
    }
}

/// Ignores messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentHook;

impl MessageHook for SilentHook {
    fn on_message(&self, _kernel_id: &str, _channel: KernelChannel, _msg_type: &str) {}
}

/// Channel logging setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelLogging {
    #[default]
    Off,
    Log,
}

impl ChannelLogging {
    /// The hook this setting selects.
    pub fn hook(self) -> Arc<dyn MessageHook> {
        match self {
            ChannelLogging::Off => Arc::new(SilentHook),
            ChannelLogging::Log => Arc::new(LoggingHook),
        }
    }

    pub fn is_enabled(self) -> bool {
        self == ChannelLogging::Log
    }
}
