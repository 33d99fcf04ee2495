//! Automatic restart of kernels that die on their own.
//!
//! Each kernel gets a task that polls its process every `time_to_dead`. A dead
//! process is relaunched up to `restart_limit` consecutive times; after that
//! the `dead` callbacks fire and the task ends.

use std::sync::Weak;
use std::time::Duration;

use kernel_mapping::RestartEvent;
use log::{error, info, warn};

use crate::registry::ProcessRegistry;

/// Shortest interval between liveness polls.
pub(crate) const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn poll_interval(time_to_dead: Duration) -> Duration {
    time_to_dead.max(MIN_POLL_INTERVAL)
}

/// What to do after a liveness poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Alive,
    Restart { attempt: u32 },
    GiveUp,
}

/// Counts consecutive restarts of one kernel.
#[derive(Debug)]
pub(crate) struct RestartTracker {
    restart_limit: u32,
    restart_count: u32,
}

impl RestartTracker {
    pub fn new(restart_limit: u32) -> Self {
        Self {
            restart_limit,
            restart_count: 0,
        }
    }

    pub fn on_poll(&mut self, alive: bool) -> Verdict {
        if alive {
            self.restart_count = 0;
            return Verdict::Alive;
        }
        self.restart_count += 1;
        if self.restart_count > self.restart_limit {
            Verdict::GiveUp
        } else {
            Verdict::Restart {
                attempt: self.restart_count,
            }
        }
    }
}

pub(crate) async fn watch(
    registry: Weak<ProcessRegistry>,
    kernel_id: String,
    restart_limit: u32,
    time_to_dead: Duration,
) {
    let mut tracker = RestartTracker::new(restart_limit);
    let interval = poll_interval(time_to_dead);

    loop {
        tokio::time::sleep(interval).await;

        let Some(registry) = registry.upgrade() else {
            break;
        };
        // Shut down or removed: nothing left to watch.
        let Some(handle) = registry.process(&kernel_id) else {
            break;
        };

        let alive = handle.lock().await.is_alive();
        match tracker.on_poll(alive) {
            Verdict::Alive => {}
            Verdict::Restart { attempt } => {
                warn!(
                    "[kernel-launch] Kernel {} died, restarting ({}/{})",
                    kernel_id, attempt, restart_limit
                );
                registry.fire(&kernel_id, RestartEvent::Restart);
                let shutdown_wait = registry.config().shutdown_wait;
                let relaunched = handle.lock().await.relaunch(true, shutdown_wait).await;
                match relaunched {
                    Ok(()) => info!("[kernel-launch] Kernel {} restarted", kernel_id),
                    Err(e) => error!(
                        "[kernel-launch] Failed to restart kernel {}: {:#}",
                        kernel_id, e
                    ),
                }
            }
            Verdict::GiveUp => {
                warn!(
                    "[kernel-launch] Kernel {} died {} times in a row, giving up",
                    kernel_id,
                    restart_limit + 1
                );
                registry.fire(&kernel_id, RestartEvent::Dead);
                break;
            }
        }
    }
}
