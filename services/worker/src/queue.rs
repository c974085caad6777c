//! Request queue poller.
//!
//! The poller:
//! - Periodically fetches pending requests from the control plane
//! - Orders them by creation time and skips requests already in flight
//! - Runs requests that target the same object one after another
//! - Sends each response back as soon as its request finishes
//!
//! Delivery is at least once. A request whose response could not be sent
//! leaves the in-flight set and is handled again when redelivered.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use connect_protocol::RequestEnvelope;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::ControlPlane;
use crate::worker::WorkerCore;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Polls the control plane and dispatches requests to the worker core.
pub struct RequestQueue {
    core: Arc<WorkerCore>,
    control: Arc<dyn ControlPlane>,
    interval: Duration,
    in_flight: Arc<Mutex<HashSet<String>>>,
    /// Last task per target key. Each new task for a key awaits its predecessor.
    chains: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Tasks for requests that create fresh objects.
    detached: Mutex<Vec<JoinHandle<()>>>,
}

impl RequestQueue {
    pub fn new(core: Arc<WorkerCore>, control: Arc<dyn ControlPlane>, interval: Duration) -> Self {
        Self {
            core,
            control,
            interval,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            chains: Mutex::new(HashMap::new()),
            detached: Mutex::new(Vec::new()),
        }
    }

    /// Number of requests dispatched but not yet answered.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Fetch and dispatch one batch. Returns how many requests were dispatched.
    pub async fn poll_once(&self) -> Result<usize> {
        let mut requests = self.control.fetch_requests().await?;
        requests.sort_by_key(|r| r.created_at);

        let fresh: Vec<RequestEnvelope> = {
            let mut in_flight = lock(&self.in_flight);
            requests
                .into_iter()
                .filter(|r| in_flight.insert(r.request_id.clone()))
                .collect()
        };
        let dispatched = fresh.len();

        // Requests that fail to decode run alone and are answered with the error.
        let mut groups: Vec<(Option<String>, Vec<RequestEnvelope>)> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();
        for request in fresh {
            match request.decode().ok().and_then(|r| r.target_key()) {
                Some(key) => match by_key.get(&key) {
                    Some(&index) => groups[index].1.push(request),
                    None => {
                        by_key.insert(key.clone(), groups.len());
                        groups.push((Some(key), vec![request]));
                    }
                },
                None => groups.push((None, vec![request])),
            }
        }

        self.prune();
        for (key, group) in groups {
            self.spawn_group(key, group);
        }

        if dispatched > 0 {
            debug!(dispatched, "Dispatched requests");
        }
        Ok(dispatched)
    }

    fn spawn_group(&self, key: Option<String>, group: Vec<RequestEnvelope>) {
        let core = self.core.clone();
        let control = self.control.clone();
        let in_flight = self.in_flight.clone();

        let mut chains = lock(&self.chains);
        let previous = key.as_ref().and_then(|k| chains.remove(k));

        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    warn!(error = %e, "Previous request task failed");
                }
            }
            for request in group {
                process(&core, control.as_ref(), &in_flight, request).await;
            }
        });

        match key {
            Some(key) => {
                chains.insert(key, handle);
            }
            None => lock(&self.detached).push(handle),
        }
    }

    fn prune(&self) {
        lock(&self.chains).retain(|_, handle| !handle.is_finished());
        lock(&self.detached).retain(|handle| !handle.is_finished());
    }

    /// Wait until every dispatched request has been handled.
    pub async fn wait_idle(&self) {
        loop {
            let mut handles: Vec<JoinHandle<()>> =
                lock(&self.chains).drain().map(|(_, handle)| handle).collect();
            handles.append(&mut lock(&self.detached));
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Request task failed");
                }
            }
        }
    }

    /// Run the poll loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting request queue");

        let mut consecutive_failures = 0u32;
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.poll_once().await {
                        Ok(_) => consecutive_failures = 0,
                        Err(e) => {
                            consecutive_failures += 1;
                            if consecutive_failures <= 3 {
                                warn!(error = %e, consecutive_failures, "Failed to fetch requests");
                            } else {
                                error!(error = %e, consecutive_failures, "Failed to fetch requests repeatedly");
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Request queue shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn process(
    core: &WorkerCore,
    control: &dyn ControlPlane,
    in_flight: &Mutex<HashSet<String>>,
    request: RequestEnvelope,
) {
    let response = core.handle(&request).await;
    if let Err(e) = control
        .send_response(&request.request_id, &request.user_address, &response)
        .await
    {
        warn!(
            request_id = %request.request_id,
            error = %e,
            "Failed to send response, request will be redelivered"
        );
    }
    lock(in_flight).remove(&request.request_id);
}
