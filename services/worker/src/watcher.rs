//! Cluster state watching.
//!
//! One long-lived pod watch feeds phase reports to the control plane. The
//! watch is an explicit state machine (`Disconnected -> Connecting ->
//! Streaming`) driven by a supervisor that restarts it whenever it has
//! stopped. A stream error, an expired resource version or an `ERROR` event
//! marks the watcher for a full resync, which runs before the next watch and
//! deletes every status record the cluster no longer backs.
//!
//! Capacity is recomputed on its own interval and published as a whole
//! snapshot; readers never see a partially updated one.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use arc_swap::ArcSwap;
use connect_protocol::{ClusterStatus, NodePoolSnapshot, PodPhase, PodStatusReport};
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::ControlPlane;
use crate::config::Intervals;
use crate::k8s::pod::{compute_snapshot, PodInfo};
use crate::k8s::{object_labels, resource_version, ClusterApi, ResourceKind, WatchEvent};
use crate::labels;

/// Connection state of the pod watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Disconnected,
    Connecting,
    Streaming,
}

/// What a resync removed and re-reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncSummary {
    pub stale_pods: usize,
    pub stale_storages: usize,
    pub reported: usize,
}

/// (workspace id, pod name)
type PodKey = (String, String);

/// Watches pod state and node capacity for one cluster.
pub struct ClusterStateWatcher {
    cluster_name: String,
    intervals: Intervals,
    api: Arc<dyn ClusterApi>,
    control: Arc<dyn ControlPlane>,
    /// Last observed phase per managed pod.
    observed: Mutex<HashMap<PodKey, PodPhase>>,
    resource_version: Mutex<Option<String>>,
    needs_resync: AtomicBool,
    snapshot: ArcSwap<NodePoolSnapshot>,
    state: watch::Sender<WatchState>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn log_failure(what: &str, consecutive_failures: u32, e: &anyhow::Error) {
    if consecutive_failures <= 3 {
        warn!(error = %e, consecutive_failures, "{} failed", what);
    } else {
        error!(error = %e, consecutive_failures, "{} failed repeatedly", what);
    }
}

impl ClusterStateWatcher {
    pub fn new(
        cluster_name: impl Into<String>,
        intervals: Intervals,
        api: Arc<dyn ClusterApi>,
        control: Arc<dyn ControlPlane>,
    ) -> Self {
        let (state, _) = watch::channel(WatchState::Disconnected);
        Self {
            cluster_name: cluster_name.into(),
            intervals,
            api,
            control,
            observed: Mutex::new(HashMap::new()),
            resource_version: Mutex::new(None),
            // The first watch starts from a full list.
            needs_resync: AtomicBool::new(true),
            snapshot: ArcSwap::from_pointee(NodePoolSnapshot::default()),
            state,
        }
    }

    /// Current watch state.
    pub fn state(&self) -> WatchState {
        *self.state.borrow()
    }

    /// Follow watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<WatchState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WatchState) {
        self.state.send_replace(state);
    }

    /// Latest capacity snapshot.
    pub fn snapshot(&self) -> Arc<NodePoolSnapshot> {
        self.snapshot.load_full()
    }

    /// Force a full resync before the next watch.
    pub fn request_resync(&self) {
        self.needs_resync.store(true, Ordering::SeqCst);
    }

    pub fn needs_resync(&self) -> bool {
        self.needs_resync.load(Ordering::SeqCst)
    }

    /// Resource version the next watch resumes from.
    pub fn resource_version(&self) -> Option<String> {
        lock(&self.resource_version).clone()
    }

    fn set_resource_version(&self, version: Option<String>) {
        if version.is_some() {
            *lock(&self.resource_version) = version;
        }
    }

    /// Last observed phase of a pod.
    pub fn observed_phase(&self, container_id: &str, pod: &str) -> Option<PodPhase> {
        lock(&self.observed)
            .get(&(container_id.to_string(), pod.to_string()))
            .copied()
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Record an added or modified pod and report a changed phase.
    ///
    /// Returns true if a report was sent. Unmanaged pods are ignored and the
    /// transient `createContainer` phase is recorded but not reported.
    pub async fn observe_pod(&self, pod: &PodInfo) -> Result<bool> {
        let Some(app) = pod.app().filter(|_| pod.is_managed()) else {
            return Ok(false);
        };
        let key = (app.to_string(), pod.name.clone());

        let previous = lock(&self.observed).insert(key.clone(), pod.phase);
        if previous == Some(pod.phase) || pod.phase == PodPhase::CreateContainer {
            return Ok(false);
        }

        debug!(
            container_id = %app,
            pod = %pod.name,
            from = ?previous,
            to = %pod.phase,
            "pod phase changed"
        );
        let report = PodStatusReport {
            container_id: app.to_string(),
            pod_id: pod.name.clone(),
            pod_status: pod.status(),
        };
        if let Err(e) = self.control.set_pod_status(&report).await {
            // Unrecord so the next event retries the report.
            let mut observed = lock(&self.observed);
            match previous {
                Some(phase) => observed.insert(key, phase),
                None => observed.remove(&key),
            };
            return Err(e);
        }
        Ok(true)
    }

    /// Drop a deleted pod and its status record.
    pub async fn forget_pod(&self, pod: &PodInfo) -> Result<()> {
        let Some(app) = pod.app() else {
            return Ok(());
        };
        lock(&self.observed).remove(&(app.to_string(), pod.name.clone()));
        if !pod.is_managed() {
            return Ok(());
        }

        if pod.is_storage() {
            debug!(storage_id = %app, "storage pod deleted");
            self.control.delete_storage_status(app).await
        } else {
            debug!(container_id = %app, pod = %pod.name, "pod deleted");
            self.control.delete_pod_status(app, &pod.name).await
        }
    }

    /// Apply one watch event. Returns false if the watch must stop.
    pub async fn handle_event(&self, event: WatchEvent) -> bool {
        if let Some(object) = event.object() {
            self.set_resource_version(resource_version(object));
        }

        match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                if let Some(pod) = PodInfo::from_object(&object) {
                    if let Err(e) = self.observe_pod(&pod).await {
                        warn!(pod = %pod.name, error = %e, "failed to report pod status");
                    }
                }
                true
            }
            WatchEvent::Deleted(object) => {
                if let Some(pod) = PodInfo::from_object(&object) {
                    if let Err(e) = self.forget_pod(&pod).await {
                        warn!(pod = %pod.name, error = %e, "failed to delete pod status");
                    }
                }
                true
            }
            WatchEvent::Bookmark(version) => {
                self.set_resource_version(Some(version));
                true
            }
            WatchEvent::Error { code, message } => {
                warn!(code, message = %message, "watch error event");
                if code == 410 {
                    *lock(&self.resource_version) = None;
                }
                self.request_resync();
                false
            }
        }
    }

    // =========================================================================
    // Watch
    // =========================================================================

    /// Resync if needed, then stream pod events until the watch ends.
    pub async fn run_watch_once(&self) {
        self.set_state(WatchState::Connecting);

        if self.needs_resync.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.resync().await {
                warn!(error = %e, "resync failed");
                self.request_resync();
                self.set_state(WatchState::Disconnected);
                return;
            }
        }

        let version = self.resource_version();
        let mut stream = match self.api.watch(ResourceKind::Pod, version.as_deref()).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "failed to start pod watch");
                if e.is_gone() {
                    *lock(&self.resource_version) = None;
                }
                self.request_resync();
                self.set_state(WatchState::Disconnected);
                return;
            }
        };

        self.set_state(WatchState::Streaming);
        info!(resource_version = ?version, "pod watch streaming");

        loop {
            match tokio::time::timeout(self.intervals.watch_idle_timeout, stream.next()).await {
                Err(_) => {
                    debug!("pod watch idle, reconnecting");
                    break;
                }
                Ok(None) => {
                    debug!("pod watch closed");
                    break;
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "pod watch failed");
                    if e.is_gone() {
                        *lock(&self.resource_version) = None;
                    }
                    self.request_resync();
                    break;
                }
                Ok(Some(Ok(event))) => {
                    if !self.handle_event(event).await {
                        break;
                    }
                }
            }
        }

        self.set_state(WatchState::Disconnected);
    }

    /// Re-list pods and storage and reconcile reported status against them.
    pub async fn resync(&self) -> Result<ResyncSummary> {
        let mut summary = ResyncSummary::default();

        let list = self.api.list(ResourceKind::Pod, None, None).await?;
        let pods: Vec<PodInfo> = list.items.iter().filter_map(PodInfo::from_object).collect();
        let live: HashSet<PodKey> = pods
            .iter()
            .filter(|p| p.is_managed())
            .filter_map(|p| p.app().map(|app| (app.to_string(), p.name.clone())))
            .collect();

        for (container_id, reported) in self.control.list_pod_status().await? {
            for pod in reported {
                if !live.contains(&(container_id.clone(), pod.clone())) {
                    self.control.delete_pod_status(&container_id, &pod).await?;
                    summary.stale_pods += 1;
                }
            }
        }

        lock(&self.observed).retain(|key, _| live.contains(key));
        for pod in &pods {
            if self.observe_pod(pod).await? {
                summary.reported += 1;
            }
        }
        *lock(&self.resource_version) = list.resource_version;

        let selector = labels::selector(&[(labels::K8S_MANAGED, labels::K8S_MANAGED_VALUE)]);
        let claims = self
            .api
            .list(ResourceKind::PersistentVolumeClaim, None, Some(&selector))
            .await?;
        let storages: HashSet<String> = claims
            .items
            .iter()
            .filter_map(|claim| object_labels(claim).remove(labels::APP))
            .collect();
        for storage_id in self.control.list_storage_status().await? {
            if !storages.contains(&storage_id) {
                self.control.delete_storage_status(&storage_id).await?;
                summary.stale_storages += 1;
            }
        }

        info!(
            stale_pods = summary.stale_pods,
            stale_storages = summary.stale_storages,
            reported = summary.reported,
            "resynced cluster state"
        );
        Ok(summary)
    }

    /// Restart the watch whenever it has stopped, until shutdown.
    pub async fn run_supervisor(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.intervals.watch_supervise);
        let mut task: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stopped = task.as_ref().map(JoinHandle::is_finished).unwrap_or(true);
                    if stopped {
                        if task.is_some() {
                            info!("pod watch stopped, restarting");
                        }
                        let watcher = Arc::clone(&self);
                        task = Some(tokio::spawn(async move { watcher.run_watch_once().await }));
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        if let Some(task) = task.take() {
                            task.abort();
                        }
                        self.set_state(WatchState::Disconnected);
                        info!("watch supervisor shutting down");
                        break;
                    }
                }
            }
        }
    }

    // =========================================================================
    // Capacity
    // =========================================================================

    /// Recompute node-pool capacity and publish it.
    pub async fn refresh_capacity(&self) -> Result<Arc<NodePoolSnapshot>> {
        let nodes = self.api.list(ResourceKind::Node, None, None).await?;
        let pods = self.api.list(ResourceKind::Pod, None, None).await?;
        let pods: Vec<PodInfo> = pods.items.iter().filter_map(PodInfo::from_object).collect();

        let snapshot = Arc::new(compute_snapshot(&nodes.items, &pods));
        debug!(pools = snapshot.len(), pods = pods.len(), "recomputed capacity");
        self.snapshot.store(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Push the current snapshot to the control plane.
    pub async fn push_health(&self) -> Result<()> {
        let status = ClusterStatus {
            cluster_name: self.cluster_name.clone(),
            node_pool: self.snapshot().as_ref().clone(),
        };
        self.control.set_cluster_status(&status).await
    }

    /// Recompute capacity every capacity interval until shutdown.
    pub async fn run_capacity_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.intervals.capacity);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.refresh_capacity().await {
                        Ok(_) => consecutive_failures = 0,
                        Err(e) => {
                            consecutive_failures += 1;
                            log_failure("Capacity refresh", consecutive_failures, &e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("capacity loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Push cluster health every health interval until shutdown.
    pub async fn run_health_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.intervals.health);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.push_health().await {
                        Ok(()) => consecutive_failures = 0,
                        Err(e) => {
                            consecutive_failures += 1;
                            log_failure("Health push", consecutive_failures, &e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("health loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RecordingControlPlane;
    use crate::k8s::{KubeError, MockCluster};
    use serde_json::{json, Value};
    use std::time::Duration;

    fn pod(name: &str, app: &str, phase: &str, waiting: Option<&str>) -> Value {
        let mut pod = json!({
            "metadata": {
                "name": name,
                "namespace": "ns1",
                "resourceVersion": "10",
                "labels": {labels::APP: app, labels::K8S_MANAGED: labels::K8S_MANAGED_VALUE}
            },
            "spec": {"nodeName": "node-1", "containers": [{"image": "nginx:1.27"}]},
            "status": {"phase": phase}
        });
        if let Some(reason) = waiting {
            pod["status"]["containerStatuses"] = json!([{"state": {"waiting": {"reason": reason}}}]);
        }
        pod
    }

    fn setup() -> (Arc<MockCluster>, Arc<RecordingControlPlane>, Arc<ClusterStateWatcher>) {
        let cluster = Arc::new(MockCluster::new());
        let control = Arc::new(RecordingControlPlane::new());
        let intervals = Intervals {
            watch_idle_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let watcher = Arc::new(ClusterStateWatcher::new(
            "c1",
            intervals,
            cluster.clone(),
            control.clone(),
        ));
        (cluster, control, watcher)
    }

    #[tokio::test]
    async fn test_reports_only_phase_changes() {
        let (_, control, watcher) = setup();

        let events = [
            pod("p1", "w1", "Pending", Some("ContainerCreating")),
            pod("p1", "w1", "Pending", Some("ContainerCreating")),
            pod("p1", "w1", "Running", None),
            pod("p1", "w1", "Running", None),
            pod("p1", "w1", "Failed", None),
        ];
        for object in events {
            assert!(watcher.handle_event(WatchEvent::Modified(object)).await);
        }

        let phases: Vec<PodPhase> = control
            .pod_reports()
            .iter()
            .map(|r| r.pod_status.status.phase)
            .collect();
        assert_eq!(phases, vec![PodPhase::Success, PodPhase::Failed]);
        assert_eq!(watcher.observed_phase("w1", "p1"), Some(PodPhase::Failed));
    }

    #[tokio::test]
    async fn test_unmanaged_pods_ignored() {
        let (_, control, watcher) = setup();
        let mut object = pod("p1", "w1", "Running", None);
        object["metadata"]["labels"] = json!({labels::APP: "w1"});

        watcher.handle_event(WatchEvent::Added(object)).await;
        assert!(control.pod_reports().is_empty());
    }

    #[tokio::test]
    async fn test_delete_distinguishes_storage() {
        let (_, control, watcher) = setup();
        control.seed_pod("w1", "p1");
        control.seed_storage("s1");

        watcher
            .handle_event(WatchEvent::Deleted(pod("p1", "w1", "Running", None)))
            .await;
        let mut storage = pod("nfs-0", "s1", "Running", None);
        storage["metadata"]["labels"][labels::NFS] = json!("true");
        watcher.handle_event(WatchEvent::Deleted(storage)).await;

        assert!(control.pods().is_empty());
        assert!(control.storages().is_empty());
    }

    #[tokio::test]
    async fn test_failed_report_is_retried() {
        let (_, control, watcher) = setup();
        control.set_fail(true);
        watcher
            .handle_event(WatchEvent::Modified(pod("p1", "w1", "Running", None)))
            .await;
        assert_eq!(watcher.observed_phase("w1", "p1"), None);

        control.set_fail(false);
        watcher
            .handle_event(WatchEvent::Modified(pod("p1", "w1", "Running", None)))
            .await;
        assert_eq!(control.pod_reports().len(), 1);
    }

    #[tokio::test]
    async fn test_error_event_requests_resync() {
        let (_, _, watcher) = setup();
        watcher.needs_resync.store(false, Ordering::SeqCst);
        watcher.set_resource_version(Some("42".to_string()));

        let keep_going = watcher
            .handle_event(WatchEvent::Error {
                code: 410,
                message: "too old".to_string(),
            })
            .await;
        assert!(!keep_going);
        assert!(watcher.needs_resync());
        assert_eq!(watcher.resource_version(), None);
    }

    #[tokio::test]
    async fn test_bookmark_advances_version() {
        let (_, _, watcher) = setup();
        watcher
            .handle_event(WatchEvent::Bookmark("77".to_string()))
            .await;
        assert_eq!(watcher.resource_version().as_deref(), Some("77"));
    }

    #[tokio::test]
    async fn test_resync_removes_stale_records() {
        let (cluster, control, watcher) = setup();
        cluster.insert(ResourceKind::Pod, Some("ns1"), pod("p1", "w1", "Running", None));
        cluster.insert(
            ResourceKind::PersistentVolumeClaim,
            Some("ns1"),
            json!({"metadata": {"name": "s1", "labels": {
                labels::APP: "s1", labels::K8S_MANAGED: labels::K8S_MANAGED_VALUE
            }}}),
        );
        control.seed_pod("w1", "p1");
        control.seed_pod("w1", "p-gone");
        control.seed_pod("w-gone", "p9");
        control.seed_storage("s1");
        control.seed_storage("s-gone");

        let summary = watcher.resync().await.unwrap();
        assert_eq!(summary.stale_pods, 2);
        assert_eq!(summary.stale_storages, 1);
        assert_eq!(summary.reported, 1);

        let pods = control.pods();
        assert_eq!(pods.len(), 1);
        assert!(pods["w1"].contains("p1"));
        assert_eq!(control.storages().into_iter().collect::<Vec<_>>(), vec!["s1"]);
        assert!(watcher.resource_version().is_some());
    }

    #[tokio::test]
    async fn test_watch_once_resyncs_then_resumes() {
        let (cluster, control, watcher) = setup();
        cluster.push_watch(vec![
            Ok(WatchEvent::Added(pod("p1", "w1", "Running", None))),
            Err(KubeError::Api {
                status: 500,
                reason: "InternalError".to_string(),
                message: "stream reset".to_string(),
            }),
        ]);

        watcher.run_watch_once().await;
        assert_eq!(watcher.state(), WatchState::Disconnected);
        assert_eq!(control.pod_reports().len(), 1);
        assert!(watcher.needs_resync());
        assert_eq!(cluster.watch_calls(), 1);
        assert_eq!(cluster.watch_versions()[0].as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_failed_resync_skips_watch() {
        let (cluster, _, watcher) = setup();
        cluster.set_fail_lists(true);

        watcher.run_watch_once().await;
        assert_eq!(cluster.watch_calls(), 0);
        assert!(watcher.needs_resync());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_watch_is_restarted() {
        let (cluster, _, watcher) = setup();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&watcher).run_supervisor(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(watcher.state(), WatchState::Streaming);
        assert_eq!(cluster.watch_calls(), 1);

        // Idle timeout (5s) ends the first watch; the next supervisor tick (15s) restarts it.
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(cluster.watch_calls(), 2);

        shutdown_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(watcher.state(), WatchState::Disconnected);
    }

    #[tokio::test]
    async fn test_refresh_capacity_replaces_snapshot() {
        let (cluster, control, watcher) = setup();
        cluster.insert(
            ResourceKind::Node,
            None,
            json!({
                "metadata": {"name": "node-1", "labels": {labels::NODE_POOL: "pool-a"}},
                "status": {"allocatable": {"cpu": "4", "memory": "8Gi"}}
            }),
        );
        let before = watcher.snapshot();
        assert!(before.is_empty());

        let snapshot = watcher.refresh_capacity().await.unwrap();
        let node = &snapshot.pool("pool-a").unwrap().nodes["node-1"];
        assert_eq!(node.capacity.cpu, 4000);
        assert_eq!(node.allocatable.memory, 8192);
        assert!(before.is_empty());

        watcher.push_health().await.unwrap();
        let statuses = control.cluster_statuses();
        assert_eq!(statuses[0].cluster_name, "c1");
        assert_eq!(statuses[0].node_pool.len(), 1);
    }
}
