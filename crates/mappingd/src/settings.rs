//! Daemon settings.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/kernel-mapping/settings.json
//! - Linux: ~/.config/kernel-mapping/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\kernel-mapping\settings.json
//!
//! Missing fields take their defaults; an unreadable file yields defaults.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use kernel_launch::LaunchConfig;
use kernel_mapping::{ChannelLogging, ManagerConfig, Visibility};
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};

use crate::settings_json_path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Arguments passed to every kernel
    #[serde(deserialize_with = "deserialize_argv")]
    pub kernel_argv: Vec<String>,

    /// Kernelspec used when a start request does not name one
    pub kernel_name: String,

    /// Websocket URL recorded for kernels listed at start time
    pub ws_url: String,

    /// When started kernels become visible in kernel listings
    pub visibility: Visibility,

    /// Log every message kernels publish on iopub
    pub channel_logging: ChannelLogging,

    /// Consecutive automatic restarts before a kernel is declared dead
    pub restart_limit: u32,

    /// Liveness poll interval in milliseconds
    pub time_to_dead_ms: u64,

    /// Grace period for kernel shutdown in milliseconds
    pub shutdown_wait_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let manager = ManagerConfig::default();
        let launch = LaunchConfig::default();
        Self {
            kernel_argv: manager.kernel_argv,
            kernel_name: launch.default_kernel_name,
            ws_url: manager.ws_url,
            visibility: manager.visibility,
            channel_logging: launch.channel_logging,
            restart_limit: launch.restart_limit,
            time_to_dead_ms: launch.time_to_dead.as_millis() as u64,
            shutdown_wait_ms: launch.shutdown_wait.as_millis() as u64,
        }
    }
}

impl Settings {
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            kernel_argv: self.kernel_argv.clone(),
            ws_url: self.ws_url.clone(),
            visibility: self.visibility,
        }
    }

    pub fn launch_config(&self) -> LaunchConfig {
        LaunchConfig {
            default_kernel_name: self.kernel_name.clone(),
            restart_limit: self.restart_limit,
            time_to_dead: Duration::from_millis(self.time_to_dead_ms),
            shutdown_wait: Duration::from_millis(self.shutdown_wait_ms),
            channel_logging: self.channel_logging,
        }
    }
}

/// Deserialize kernel arguments that accept both:
/// - A shell-style string: `"--matplotlib=inline --debug"`
/// - A JSON array: `["--matplotlib=inline", "--debug"]`
fn deserialize_argv<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct ArgvVisitor;

    impl<'de> de::Visitor<'de> for ArgvVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Vec<String>, E> {
            Ok(v.split_whitespace().map(str::to_string).collect())
        }

        fn visit_seq<A: de::SeqAccess<'de>>(
            self,
            mut seq: A,
        ) -> std::result::Result<Vec<String>, A::Error> {
            let mut items = Vec::new();
            while let Some(item) = seq.next_element::<String>()? {
                if !item.is_empty() {
                    items.push(item);
                }
            }
            Ok(items)
        }
    }

    deserializer.deserialize_any(ArgvVisitor)
}

/// Load settings from the default location.
pub fn load_settings() -> Settings {
    load_settings_from(&settings_json_path())
}

/// Load settings from `path`, returning defaults if it is missing or invalid.
pub fn load_settings_from(path: &Path) -> Settings {
    if !path.exists() {
        return Settings::default();
    }
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("[settings] Ignoring invalid settings at {:?}: {}", path, e);
            Settings::default()
        }),
        Err(e) => {
            warn!("[settings] Could not read {:?}: {}", path, e);
            Settings::default()
        }
    }
}

/// Save settings to `path`, creating its directory.
pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}
