//! Registry of running kernel processes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use async_trait::async_trait;
use kernel_mapping::{
    KernelRegistry, LaunchOptions, MappingError, MessageHook, RestartCallback, RestartEvent,
};
use log::{debug, info};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::process::{KernelProcess, LaunchSpec};
use crate::restarter;
use crate::LaunchConfig;

struct Entry {
    process: Arc<Mutex<KernelProcess>>,
    callbacks: Vec<(RestartEvent, RestartCallback)>,
    restarter: tokio::task::JoinHandle<()>,
}

/// Owns kernel processes, keyed by kernel id.
pub struct ProcessRegistry {
    config: LaunchConfig,
    hook: Arc<dyn MessageHook>,
    kernels: StdMutex<HashMap<String, Entry>>,
    me: Weak<ProcessRegistry>,
}

impl ProcessRegistry {
    /// Create a registry using the message hook selected by `config.channel_logging`.
    pub fn new(config: LaunchConfig) -> Arc<Self> {
        let hook = config.channel_logging.hook();
        Self::with_hook(config, hook)
    }

    /// Create a registry with a custom message hook.
    pub fn with_hook(config: LaunchConfig, hook: Arc<dyn MessageHook>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            config,
            hook,
            kernels: StdMutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    fn kernels(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.kernels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn process(&self, kernel_id: &str) -> Option<Arc<Mutex<KernelProcess>>> {
        self.kernels()
            .get(kernel_id)
            .map(|entry| entry.process.clone())
    }

    /// Run the callbacks registered for `event`, outside the registry lock.
    pub(crate) fn fire(&self, kernel_id: &str, event: RestartEvent) {
        let callbacks: Vec<RestartCallback> = match self.kernels().get(kernel_id) {
            Some(entry) => entry
                .callbacks
                .iter()
                .filter(|(e, _)| *e == event)
                .map(|(_, callback)| callback.clone())
                .collect(),
            None => return,
        };
        debug!(
            "[kernel-launch] Firing {} {} callback(s) for {}",
            callbacks.len(),
            event,
            kernel_id
        );
        for callback in callbacks {
            callback();
        }
    }
}

#[async_trait]
impl KernelRegistry for ProcessRegistry {
    async fn start_kernel(&self, options: LaunchOptions) -> Result<String, MappingError> {
        let kernel_id = Uuid::new_v4().to_string();
        let kernel_name = options
            .kernel_name
            .clone()
            .unwrap_or_else(|| self.config.default_kernel_name.clone());
        let spec = LaunchSpec {
            kernel_id: kernel_id.clone(),
            kernel_name,
            options,
        };

        let process = KernelProcess::launch(spec, self.hook.clone())
            .await
            .map_err(MappingError::KernelStart)?;
        debug!(
            "[kernel-launch] Kernel {} connection file: {:?}",
            kernel_id,
            process.connection_file()
        );

        // The entry goes in before the restarter can poll for it.
        let mut kernels = self.kernels();
        let restarter = tokio::spawn(restarter::watch(
            self.me.clone(),
            kernel_id.clone(),
            self.config.restart_limit,
            self.config.time_to_dead,
        ));
        kernels.insert(
            kernel_id.clone(),
            Entry {
                process: Arc::new(Mutex::new(process)),
                callbacks: Vec::new(),
                restarter,
            },
        );
        drop(kernels);

        Ok(kernel_id)
    }

    async fn shutdown_kernel(&self, kernel_id: &str, now: bool) -> Result<(), MappingError> {
        let entry = self
            .kernels()
            .remove(kernel_id)
            .ok_or_else(|| MappingError::not_found(kernel_id))?;
        entry.restarter.abort();

        info!(
            "[kernel-launch] Shutting down kernel {}{}",
            kernel_id,
            if now { " (now)" } else { "" }
        );
        entry
            .process
            .lock()
            .await
            .stop(now, self.config.shutdown_wait)
            .await;
        info!("[kernel-launch] Kernel {} shutdown complete", kernel_id);
        Ok(())
    }

    async fn restart_kernel(&self, kernel_id: &str, now: bool) -> Result<(), MappingError> {
        let handle = self
            .process(kernel_id)
            .ok_or_else(|| MappingError::not_found(kernel_id))?;
        let mut process = handle.lock().await;
        info!(
            "[kernel-launch] Restarting {} kernel {}",
            process.spec().kernel_name,
            kernel_id
        );
        process
            .relaunch(now, self.config.shutdown_wait)
            .await
            .map_err(MappingError::KernelStart)
    }

    async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), MappingError> {
        let handle = self
            .process(kernel_id)
            .ok_or_else(|| MappingError::not_found(kernel_id))?;
        let process = handle.lock().await;
        process.interrupt().await.map_err(MappingError::Registry)
    }

    fn remove_kernel(&self, kernel_id: &str) -> bool {
        let removed = self.kernels().remove(kernel_id);
        match removed {
            Some(entry) => {
                entry.restarter.abort();
                debug!("[kernel-launch] Removed kernel {}", kernel_id);
                true
            }
            None => false,
        }
    }

    fn add_restart_callback(
        &self,
        kernel_id: &str,
        callback: RestartCallback,
        event: RestartEvent,
    ) -> Result<(), MappingError> {
        let mut kernels = self.kernels();
        let entry = kernels
            .get_mut(kernel_id)
            .ok_or_else(|| MappingError::not_found(kernel_id))?;
        entry.callbacks.push((event, callback));
        Ok(())
    }

    fn contains(&self, kernel_id: &str) -> bool {
        self.kernels().contains_key(kernel_id)
    }

    fn kernel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.kernels().keys().cloned().collect();
        ids.sort();
        ids
    }
}
