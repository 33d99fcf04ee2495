//! The mapping kernel manager.
//!
//! Relates notebook sessions to kernels and keeps the list of kernels that
//! API consumers can see. Every lookup is validated against the registry, so
//! an id the registry no longer tracks is reported as not found even if a
//! stale record were somehow left behind.
//!
//! Deregistration has a single path: explicit shutdown and the registry's
//! death notification both drop the visible record and any session that
//! pointed at the kernel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use log::{debug, info, warn};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::MappingError;
use crate::registry::{KernelRegistry, LaunchOptions, RestartCallback, RestartEvent};
use crate::{KernelModel, Visibility};

/// Configuration for a [`MappingKernelManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Arguments passed to every kernel started through this manager.
    pub kernel_argv: Vec<String>,
    /// Websocket URL recorded for kernels listed at start time.
    pub ws_url: String,
    /// When started kernels show up in `list_kernels`.
    pub visibility: Visibility,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            kernel_argv: Vec::new(),
            ws_url: "ws://127.0.0.1:8888".to_string(),
            visibility: Visibility::OnStart,
        }
    }
}

#[derive(Debug, Default)]
struct MappingState {
    /// Visible kernels in insertion order, at most one record per id.
    kernels: Vec<KernelModel>,
    /// session_id → kernel_id
    sessions: HashMap<String, String>,
    /// Held from the session lookup until the started kernel is recorded.
    session_starts: HashMap<String, Arc<AsyncMutex<()>>>,
}

impl MappingState {
    fn upsert(&mut self, model: KernelModel) -> KernelModel {
        match self.kernels.iter_mut().find(|k| k.id == model.id) {
            Some(existing) => existing.ws_url = model.ws_url.clone(),
            None => self.kernels.push(model.clone()),
        }
        model
    }

    fn deregister(&mut self, kernel_id: &str) -> bool {
        let before = self.kernels.len();
        self.kernels.retain(|k| k.id != kernel_id);
        let sessions = &mut self.sessions;
        self.session_starts.retain(|session_id, _| {
            sessions.get(session_id).map(String::as_str) != Some(kernel_id)
        });
        sessions.retain(|_, k| k != kernel_id);
        before != self.kernels.len()
    }
}

fn lock(state: &StdMutex<MappingState>) -> MutexGuard<'_, MappingState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn handle_kernel_died<R: KernelRegistry + ?Sized>(
    state: &StdMutex<MappingState>,
    registry: &R,
    kernel_id: &str,
) {
    warn!("[mapping] Kernel {} died, removing from map.", kernel_id);
    lock(state).deregister(kernel_id);
    registry.remove_kernel(kernel_id);
}

/// Maps sessions to kernels on top of a [`KernelRegistry`].
pub struct MappingKernelManager<R: KernelRegistry> {
    registry: Arc<R>,
    config: ManagerConfig,
    state: Arc<StdMutex<MappingState>>,
}

impl<R: KernelRegistry> MappingKernelManager<R> {
    pub fn new(registry: Arc<R>, config: ManagerConfig) -> Self {
        Self {
            registry,
            config,
            state: Arc::new(StdMutex::new(MappingState::default())),
        }
    }

    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Start a kernel, or reuse the live kernel of `options.session_id`.
    ///
    /// The manager's `kernel_argv` is placed in front of any
    /// `extra_arguments` the caller supplied. Registry failures are returned
    /// unchanged.
    pub async fn start_kernel(&self, mut options: LaunchOptions) -> Result<String, MappingError> {
        // Concurrent starts for one session must agree on a single kernel.
        let _session_start = match options.session_id.as_deref() {
            Some(session_id) => Some(self.session_start_lock(session_id).lock_owned().await),
            None => None,
        };

        if let Some(kernel_id) = options
            .session_id
            .as_deref()
            .and_then(|session_id| self.kernel_for_session(session_id))
        {
            info!("[mapping] Using existing kernel: {}", kernel_id);
            return Ok(kernel_id);
        }

        let mut extra_arguments = self.config.kernel_argv.clone();
        extra_arguments.append(&mut options.extra_arguments);
        options.extra_arguments = extra_arguments;
        let session_id = options.session_id.clone();

        debug!("[mapping] Kernel args: {:?}", options);
        let kernel_id = self.registry.start_kernel(options).await?;
        info!("[mapping] Kernel started: {}", kernel_id);

        // If this fails the kernel stays started; the caller sees the error.
        self.registry.add_restart_callback(
            &kernel_id,
            self.death_callback(&kernel_id),
            RestartEvent::Dead,
        )?;

        let mut state = lock(&self.state);
        if let Some(session_id) = session_id {
            state.sessions.insert(session_id, kernel_id.clone());
        }
        if self.config.visibility == Visibility::OnStart {
            state.upsert(KernelModel {
                id: kernel_id.clone(),
                ws_url: self.config.ws_url.clone(),
            });
        }

        Ok(kernel_id)
    }

    /// Shutdown a kernel by id.
    ///
    /// Local records are dropped first; the registry call still runs (and
    /// reports not found) for ids it does not know.
    pub async fn shutdown_kernel(&self, kernel_id: &str, now: bool) -> Result<(), MappingError> {
        if lock(&self.state).deregister(kernel_id) {
            debug!("[mapping] Removed {} from the kernel list", kernel_id);
        }
        self.registry.shutdown_kernel(kernel_id, now).await
    }

    /// Restart a kernel in place. Its record and sessions are kept.
    pub async fn restart_kernel(&self, kernel_id: &str, now: bool) -> Result<(), MappingError> {
        self.check_kernel_id(kernel_id)?;
        info!("[mapping] Restarting kernel: {}", kernel_id);
        self.registry.restart_kernel(kernel_id, now).await
    }

    pub async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), MappingError> {
        self.check_kernel_id(kernel_id)?;
        info!("[mapping] Interrupting kernel: {}", kernel_id);
        self.registry.interrupt_kernel(kernel_id).await
    }

    /// Shutdown every kernel the registry tracks.
    ///
    /// Continues past individual failures and returns the first one.
    pub async fn shutdown_all(&self, now: bool) -> Result<(), MappingError> {
        let mut first_error = None;
        for kernel_id in self.registry.kernel_ids() {
            if let Err(e) = self.shutdown_kernel(&kernel_id, now).await {
                warn!("[mapping] Failed to shut down kernel {}: {}", kernel_id, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Record the websocket URL for a kernel and make it visible.
    ///
    /// Calling this again for the same kernel replaces the URL in place.
    pub fn kernel_model(&self, kernel_id: &str, ws_url: &str) -> Result<KernelModel, MappingError> {
        self.check_kernel_id(kernel_id)?;
        Ok(lock(&self.state).upsert(KernelModel {
            id: kernel_id.to_string(),
            ws_url: ws_url.to_string(),
        }))
    }

    /// The visible record for a live kernel, if it has one.
    pub fn get_kernel_model(&self, kernel_id: &str) -> Result<Option<KernelModel>, MappingError> {
        self.check_kernel_id(kernel_id)?;
        Ok(lock(&self.state)
            .kernels
            .iter()
            .find(|k| k.id == kernel_id)
            .cloned())
    }

    /// Visible kernels in the order they were registered.
    pub fn list_kernels(&self) -> Vec<KernelModel> {
        lock(&self.state).kernels.clone()
    }

    /// Ids of every kernel the registry tracks, visible or not.
    pub fn kernel_ids(&self) -> Vec<String> {
        self.registry.kernel_ids()
    }

    /// The live kernel associated with a session.
    pub fn kernel_for_session(&self, session_id: &str) -> Option<String> {
        let kernel_id = lock(&self.state).sessions.get(session_id).cloned()?;
        self.registry.contains(&kernel_id).then_some(kernel_id)
    }

    /// Fail with [`MappingError::KernelNotFound`] unless the registry knows `kernel_id`.
    pub fn check_kernel_id(&self, kernel_id: &str) -> Result<(), MappingError> {
        if self.registry.contains(kernel_id) {
            Ok(())
        } else {
            Err(MappingError::not_found(kernel_id))
        }
    }

    /// Deregister a kernel whose process is gone.
    ///
    /// Normally reached through the `dead` callback registered at start.
    pub fn handle_kernel_died(&self, kernel_id: &str) {
        handle_kernel_died(&self.state, self.registry.as_ref(), kernel_id);
    }

    fn session_start_lock(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        lock(&self.state)
            .session_starts
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    fn death_callback(&self, kernel_id: &str) -> RestartCallback {
        // Weak handles: the registry's callback table must not keep us alive.
        let state = Arc::downgrade(&self.state);
        let registry = Arc::downgrade(&self.registry);
        let kernel_id = kernel_id.to_string();
        Arc::new(move || {
            let (Some(state), Some(registry)) = (state.upgrade(), registry.upgrade()) else {
                return;
            };
            handle_kernel_died(&state, registry.as_ref(), &kernel_id);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeRegistry {
        kernels: StdMutex<HashMap<String, LaunchOptions>>,
        callbacks: StdMutex<Vec<(String, RestartEvent, RestartCallback)>>,
        shutdowns: StdMutex<Vec<(String, bool)>>,
        next_id: AtomicUsize,
        fail_start: AtomicBool,
        /// Milliseconds `start_kernel` waits before launching.
        start_delay_ms: AtomicU64,
    }

    impl FakeRegistry {
        /// Simulate the auto-restarter giving up on a kernel.
        fn die(&self, kernel_id: &str) {
            let callbacks: Vec<RestartCallback> = self
                .callbacks
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, event, _)| id == kernel_id && *event == RestartEvent::Dead)
                .map(|(_, _, cb)| cb.clone())
                .collect();
            for callback in callbacks {
                callback();
            }
        }

        fn launched_with(&self, kernel_id: &str) -> LaunchOptions {
            self.kernels.lock().unwrap()[kernel_id].clone()
        }
    }

    #[async_trait]
    impl KernelRegistry for FakeRegistry {
        async fn start_kernel(&self, options: LaunchOptions) -> Result<String, MappingError> {
            let delay = self.start_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(MappingError::KernelStart(anyhow::anyhow!(
                    "No kernelspec named python3"
                )));
            }
            let kernel_id = format!("kernel-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.kernels
                .lock()
                .unwrap()
                .insert(kernel_id.clone(), options);
            Ok(kernel_id)
        }

        async fn shutdown_kernel(&self, kernel_id: &str, now: bool) -> Result<(), MappingError> {
            self.shutdowns
                .lock()
                .unwrap()
                .push((kernel_id.to_string(), now));
            if self.kernels.lock().unwrap().remove(kernel_id).is_none() {
                return Err(MappingError::not_found(kernel_id));
            }
            self.callbacks
                .lock()
                .unwrap()
                .retain(|(id, _, _)| id != kernel_id);
            Ok(())
        }

        async fn restart_kernel(&self, kernel_id: &str, _now: bool) -> Result<(), MappingError> {
            if self.contains(kernel_id) {
                Ok(())
            } else {
                Err(MappingError::not_found(kernel_id))
            }
        }

        async fn interrupt_kernel(&self, kernel_id: &str) -> Result<(), MappingError> {
            self.restart_kernel(kernel_id, true).await
        }

        fn remove_kernel(&self, kernel_id: &str) -> bool {
            self.kernels.lock().unwrap().remove(kernel_id).is_some()
        }

        fn add_restart_callback(
            &self,
            kernel_id: &str,
            callback: RestartCallback,
            event: RestartEvent,
        ) -> Result<(), MappingError> {
            if !self.contains(kernel_id) {
                return Err(MappingError::not_found(kernel_id));
            }
            self.callbacks
                .lock()
                .unwrap()
                .push((kernel_id.to_string(), event, callback));
            Ok(())
        }

        fn contains(&self, kernel_id: &str) -> bool {
            self.kernels.lock().unwrap().contains_key(kernel_id)
        }

        fn kernel_ids(&self) -> Vec<String> {
            let mut ids: Vec<String> = self.kernels.lock().unwrap().keys().cloned().collect();
            ids.sort();
            ids
        }
    }

    fn manager_with(visibility: Visibility) -> (Arc<FakeRegistry>, MappingKernelManager<FakeRegistry>) {
        let registry = Arc::new(FakeRegistry::default());
        let config = ManagerConfig {
            visibility,
            ..Default::default()
        };
        (registry.clone(), MappingKernelManager::new(registry, config))
    }

    #[test]
    fn test_check_unknown_kernel_is_not_found() {
        let (_registry, manager) = manager_with(Visibility::OnStart);
        let err = manager.check_kernel_id("nope").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Kernel does not exist: nope");
    }

    #[tokio::test]
    async fn test_started_kernel_is_known_until_shutdown() {
        let (registry, manager) = manager_with(Visibility::OnStart);
        let kernel_id = manager.start_kernel(LaunchOptions::default()).await.unwrap();
        assert!(manager.check_kernel_id(&kernel_id).is_ok());

        manager.shutdown_kernel(&kernel_id, false).await.unwrap();
        assert!(manager.check_kernel_id(&kernel_id).unwrap_err().is_not_found());
        assert!(manager.list_kernels().iter().all(|k| k.id != kernel_id));
        assert_eq!(
            registry.shutdowns.lock().unwrap().as_slice(),
            &[(kernel_id, false)]
        );
    }

    #[tokio::test]
    async fn test_on_request_list_starts_empty() {
        let (_registry, manager) = manager_with(Visibility::OnRequest);
        let kernel_id = manager.start_kernel(LaunchOptions::default()).await.unwrap();
        assert!(manager.list_kernels().is_empty());

        let model = manager.kernel_model(&kernel_id, "ws://host/k").unwrap();
        assert_eq!(
            manager.list_kernels(),
            vec![KernelModel {
                id: kernel_id,
                ws_url: "ws://host/k".to_string(),
            }]
        );
        assert_eq!(model.ws_url, "ws://host/k");
    }

    #[tokio::test]
    async fn test_on_request_list_follows_call_order() {
        let (_registry, manager) = manager_with(Visibility::OnRequest);
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(manager.start_kernel(LaunchOptions::default()).await.unwrap());
        }
        ids.reverse();
        for id in &ids {
            manager.kernel_model(id, "ws://host").unwrap();
        }

        let listed: Vec<String> = manager.list_kernels().into_iter().map(|k| k.id).collect();
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn test_repeated_model_request_does_not_duplicate() {
        let (_registry, manager) = manager_with(Visibility::OnRequest);
        let kernel_id = manager.start_kernel(LaunchOptions::default()).await.unwrap();
        manager.kernel_model(&kernel_id, "ws://old").unwrap();
        manager.kernel_model(&kernel_id, "ws://new").unwrap();

        let kernels = manager.list_kernels();
        assert_eq!(kernels.len(), 1);
        assert_eq!(kernels[0].ws_url, "ws://new");
    }

    #[tokio::test]
    async fn test_on_start_lists_with_configured_url() {
        let (_registry, manager) = manager_with(Visibility::OnStart);
        let first = manager.start_kernel(LaunchOptions::default()).await.unwrap();
        let second = manager.start_kernel(LaunchOptions::default()).await.unwrap();

        let kernels = manager.list_kernels();
        assert_eq!(kernels.len(), 2);
        assert_eq!(kernels[0].id, first);
        assert_eq!(kernels[1].id, second);
        assert!(kernels.iter().all(|k| k.ws_url == "ws://127.0.0.1:8888"));

        manager.kernel_model(&first, "ws://elsewhere").unwrap();
        let kernels = manager.list_kernels();
        assert_eq!(kernels[0].id, first);
        assert_eq!(kernels[0].ws_url, "ws://elsewhere");
    }

    #[tokio::test]
    async fn test_shutdown_unknown_kernel() {
        let (registry, manager) = manager_with(Visibility::OnStart);
        let kernel_id = manager.start_kernel(LaunchOptions::default()).await.unwrap();

        let err = manager.shutdown_kernel("never-started", true).await.unwrap_err();
        assert!(err.is_not_found());
        // The registry was still asked, and nothing else changed.
        assert_eq!(registry.shutdowns.lock().unwrap().len(), 1);
        assert_eq!(manager.list_kernels().len(), 1);
        assert!(manager.check_kernel_id(&kernel_id).is_ok());
    }

    #[tokio::test]
    async fn test_death_deregisters_kernel() {
        let (registry, manager) = manager_with(Visibility::OnStart);
        let kernel_id = manager
            .start_kernel(LaunchOptions::for_session("s-1"))
            .await
            .unwrap();
        let survivor = manager.start_kernel(LaunchOptions::default()).await.unwrap();

        registry.die(&kernel_id);

        assert!(!registry.contains(&kernel_id));
        assert!(manager.check_kernel_id(&kernel_id).unwrap_err().is_not_found());
        let listed: Vec<String> = manager.list_kernels().into_iter().map(|k| k.id).collect();
        assert_eq!(listed, vec![survivor]);
        assert_eq!(manager.kernel_for_session("s-1"), None);
        // Death does not go through the registry's shutdown.
        assert!(registry.shutdowns.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_starts_share_session_kernel() {
        let (registry, manager) = manager_with(Visibility::OnStart);
        registry.start_delay_ms.store(50, Ordering::SeqCst);

        let (a, b) = tokio::join!(
            manager.start_kernel(LaunchOptions::for_session("nb")),
            manager.start_kernel(LaunchOptions::for_session("nb")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a, b);
        assert_eq!(registry.kernel_ids(), vec![a.clone()]);
        assert_eq!(manager.list_kernels().len(), 1);
        assert_eq!(manager.kernel_for_session("nb"), Some(a));
    }

    #[tokio::test]
    async fn test_concurrent_starts_for_other_sessions_are_independent() {
        let (registry, manager) = manager_with(Visibility::OnStart);
        registry.start_delay_ms.store(20, Ordering::SeqCst);

        let (a, b) = tokio::join!(
            manager.start_kernel(LaunchOptions::for_session("nb-1")),
            manager.start_kernel(LaunchOptions::for_session("nb-2")),
        );
        assert_ne!(a.unwrap(), b.unwrap());
        assert_eq!(registry.kernel_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_session_reuses_live_kernel() {
        let (registry, manager) = manager_with(Visibility::OnStart);
        let first = manager
            .start_kernel(LaunchOptions::for_session("notebook-a"))
            .await
            .unwrap();
        let again = manager
            .start_kernel(LaunchOptions::for_session("notebook-a"))
            .await
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(registry.kernel_ids().len(), 1);

        manager.shutdown_kernel(&first, false).await.unwrap();
        let fresh = manager
            .start_kernel(LaunchOptions::for_session("notebook-a"))
            .await
            .unwrap();
        assert_ne!(first, fresh);
        assert_eq!(manager.kernel_for_session("notebook-a"), Some(fresh));
    }

    #[tokio::test]
    async fn test_kernel_argv_goes_first() {
        let registry = Arc::new(FakeRegistry::default());
        let config = ManagerConfig {
            kernel_argv: vec!["--matplotlib=inline".to_string()],
            ..Default::default()
        };
        let manager = MappingKernelManager::new(registry.clone(), config);

        let options = LaunchOptions {
            extra_arguments: vec!["--debug".to_string()],
            ..Default::default()
        };
        let kernel_id = manager.start_kernel(options).await.unwrap();
        assert_eq!(
            registry.launched_with(&kernel_id).extra_arguments,
            vec!["--matplotlib=inline".to_string(), "--debug".to_string()]
        );
    }

    #[tokio::test]
    async fn test_start_failure_propagates() {
        let (registry, manager) = manager_with(Visibility::OnStart);
        registry.fail_start.store(true, Ordering::SeqCst);

        let err = manager
            .start_kernel(LaunchOptions::for_session("s"))
            .await
            .unwrap_err();
        assert!(matches!(err, MappingError::KernelStart(_)));
        assert!(manager.list_kernels().is_empty());
        assert_eq!(manager.kernel_for_session("s"), None);
    }

    #[test]
    fn test_model_for_unknown_kernel_is_not_recorded() {
        let (_registry, manager) = manager_with(Visibility::OnRequest);
        let err = manager.kernel_model("ghost", "ws://host").unwrap_err();
        assert!(err.is_not_found());
        assert!(manager.list_kernels().is_empty());
        assert!(manager.get_kernel_model("ghost").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_restart_and_interrupt_require_known_kernel() {
        let (_registry, manager) = manager_with(Visibility::OnStart);
        assert!(manager.restart_kernel("ghost", false).await.unwrap_err().is_not_found());
        assert!(manager.interrupt_kernel("ghost").await.unwrap_err().is_not_found());

        let kernel_id = manager.start_kernel(LaunchOptions::default()).await.unwrap();
        manager.restart_kernel(&kernel_id, true).await.unwrap();
        manager.interrupt_kernel(&kernel_id).await.unwrap();
        assert_eq!(manager.list_kernels().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let (registry, manager) = manager_with(Visibility::OnStart);
        for _ in 0..3 {
            manager.start_kernel(LaunchOptions::default()).await.unwrap();
        }
        manager.shutdown_all(true).await.unwrap();
        assert!(registry.kernel_ids().is_empty());
        assert!(manager.list_kernels().is_empty());
        assert!(registry
            .shutdowns
            .lock()
            .unwrap()
            .iter()
            .all(|(_, now)| *now));
    }

    #[tokio::test]
    async fn test_death_after_manager_dropped_is_ignored() {
        let (registry, manager) = manager_with(Visibility::OnStart);
        let kernel_id = manager.start_kernel(LaunchOptions::default()).await.unwrap();
        drop(manager);

        registry.die(&kernel_id);
        // The callback could not reach the dropped manager, so nothing was removed.
        assert!(registry.contains(&kernel_id));
    }
}
