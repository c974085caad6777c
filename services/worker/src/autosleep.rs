//! Auto-sleep: per-workspace expiry timers.
//!
//! Each timer is a sleeping task that, when it wakes, hands its target to the
//! expiry loop. The loop claims the timer entry before tearing anything down,
//! so a timer that was cancelled or replaced in the meantime does nothing and
//! a workspace is torn down at most once per schedule.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::WorkerError;

/// The workspace a timer guards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SleepTarget {
    pub container_id: String,
    pub namespace: String,
}

/// Tears down an expired workspace.
#[async_trait]
pub trait Teardown: Send + Sync {
    async fn teardown(&self, target: &SleepTarget) -> Result<(), WorkerError>;
}

struct SleepTimer {
    expires_at: i64,
    generation: u64,
    handle: JoinHandle<()>,
}

struct Fired {
    target: SleepTarget,
    generation: u64,
}

/// Receiving end of fired timers, consumed by [`AutoSleepScheduler::run_expiry_loop`].
pub struct Expirations(mpsc::UnboundedReceiver<Fired>);

/// Per-workspace expiry timers.
pub struct AutoSleepScheduler {
    timers: Mutex<HashMap<String, SleepTimer>>,
    generation: AtomicU64,
    fired: mpsc::UnboundedSender<Fired>,
}

impl AutoSleepScheduler {
    /// Create a scheduler and the receiver its expiry loop consumes.
    pub fn new() -> (Self, Expirations) {
        let (fired, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            timers: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            fired,
        };
        (scheduler, Expirations(rx))
    }

    fn timers(&self) -> std::sync::MutexGuard<'_, HashMap<String, SleepTimer>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm a timer for `target` expiring at `expires_at` (epoch ms).
    ///
    /// Replaces any timer already registered for the same container.
    pub fn schedule(&self, target: SleepTarget, expires_at: i64) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = Duration::from_millis((expires_at - Utc::now().timestamp_millis()).max(0) as u64);
        let container_id = target.container_id.clone();

        let fired = self.fired.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fired.send(Fired { target, generation });
        });

        let previous = self.timers().insert(
            container_id.clone(),
            SleepTimer {
                expires_at,
                generation,
                handle,
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
            debug!(container_id = %container_id, "replaced auto-sleep timer");
        }
        info!(
            container_id = %container_id,
            expires_at,
            delay_secs = delay.as_secs(),
            "scheduled auto-sleep"
        );
    }

    /// Disarm the timer for `container_id`. Returns false if none was armed.
    pub fn cancel(&self, container_id: &str) -> bool {
        match self.timers().remove(container_id) {
            Some(timer) => {
                timer.handle.abort();
                debug!(container_id, "cancelled auto-sleep timer");
                true
            }
            None => false,
        }
    }

    /// Expiry of the armed timer, if any.
    pub fn expires_at(&self, container_id: &str) -> Option<i64> {
        self.timers().get(container_id).map(|t| t.expires_at)
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.timers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the entry for a fired timer if it is still the armed one.
    fn claim(&self, fired: &Fired) -> bool {
        let mut timers = self.timers();
        match timers.get(&fired.target.container_id) {
            Some(timer) if timer.generation == fired.generation => {
                timers.remove(&fired.target.container_id);
                true
            }
            _ => false,
        }
    }

    /// Tear down workspaces as their timers fire, until shutdown.
    pub async fn run_expiry_loop(
        self: Arc<Self>,
        mut expirations: Expirations,
        teardown: Arc<dyn Teardown>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                fired = expirations.0.recv() => {
                    let Some(fired) = fired else { break };
                    if !self.claim(&fired) {
                        debug!(container_id = %fired.target.container_id, "stale auto-sleep timer ignored");
                        continue;
                    }

                    info!(
                        container_id = %fired.target.container_id,
                        namespace = %fired.target.namespace,
                        "auto-sleep expired, tearing down workspace"
                    );
                    let teardown = Arc::clone(&teardown);
                    tokio::spawn(async move {
                        if let Err(e) = teardown.teardown(&fired.target).await {
                            warn!(
                                container_id = %fired.target.container_id,
                                error = %e,
                                "auto-sleep teardown failed"
                            );
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("auto-sleep loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

impl Drop for AutoSleepScheduler {
    fn drop(&mut self) {
        for (_, timer) in self.timers().drain() {
            timer.handle.abort();
        }
    }
}
