//! Container lifecycle on the local runtime.
//!
//! A run walks `Requested -> PortsReserved -> GpuReserved -> ImageReady ->
//! Started`. Any failed step rolls back everything reserved so far. Kill
//! checks ownership against the live container labels before touching any
//! state. Both hold the per-container lock for their whole sequence, but
//! never hold pool or record state across a runtime call.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use connect_id::ContainerId;
use connect_protocol::{CreateContainerParams, DeleteContainerParams};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::config::DockerConfig;
use crate::error::WorkerError;
use crate::image::ImageCache;
use crate::keyed_lock::KeyedLocks;
use crate::labels::{self, Ownership, Requester};
use crate::resources::{CpuRange, ResourcePool};
use crate::runtime::{ContainerDetails, ContainerRuntime, CreateSpec, GpuRequest};

/// Shared memory given to every container.
pub const SHM_SIZE_BYTES: u64 = 4 * 1024 * 1024 * 1024;

const GIB: u64 = 1024 * 1024 * 1024;

/// Name of the throwaway container used to verify GPU support.
const GPU_CHECK_NAME: &str = "connectGpuChecker";

/// Limits for the GPU check container, independent of the configured ones.
const GPU_CHECK_LIMITS: Limits = Limits {
    vcpu: 1,
    memory_gb: 1,
};

/// Where a container sees its shared directory.
pub const CONTAINER_ROOT_PATH: &str = "/connect";

/// File a container may write into its shared directory to report logs.
pub const LOG_FILE_NAME: &str = "log.json";

/// Per-container limits.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub vcpu: u32,
    pub memory_gb: u32,
    pub gpu_per_container: u32,
    /// Public address for endpoints. Ports are refused without it.
    pub node_port_ip: Option<String>,
    /// Host directory holding one subdirectory per create request.
    pub shared_path: Option<PathBuf>,
}

impl LifecycleConfig {
    fn limits(&self) -> Limits {
        Limits {
            vcpu: self.vcpu,
            memory_gb: self.memory_gb,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    vcpu: u32,
    memory_gb: u32,
}

impl From<&DockerConfig> for LifecycleConfig {
    fn from(config: &DockerConfig) -> Self {
        Self {
            vcpu: config.vcpu,
            memory_gb: config.memory_gb,
            gpu_per_container: config.gpu_per_container,
            node_port_ip: config.node_port_ip.clone(),
            shared_path: config.shared_path.as_ref().map(PathBuf::from),
        }
    }
}

/// One tracked container.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub container_id: String,
    /// Normalized image reference.
    pub image: String,
    pub external_ports: Vec<u16>,
    pub gpu_ids: Vec<String>,
    /// Unknown for recovered containers.
    pub cpu_range: Option<CpuRange>,
    pub ownership: Ownership,
    /// Create request this container answers to.
    pub request_id: Option<String>,
    pub started: bool,
}

/// A container to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub container_id: String,
    pub image: String,
    /// Internal ports to publish, in order.
    pub ports: Vec<u16>,
    pub env: BTreeMap<String, String>,
    pub command: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub gpu_count: u32,
    pub binds: Vec<String>,
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// `(external, internal)` in request order.
    pub ports: Vec<(u16, u16)>,
    pub gpu_ids: Vec<String>,
    pub cpu_range: CpuRange,
}

impl RunOutcome {
    /// External to internal port mapping.
    pub fn port_map(&self) -> BTreeMap<u16, u16> {
        self.ports.iter().copied().collect()
    }
}

/// Response data for `createContainer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOutcome {
    pub container_id: ContainerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<BTreeMap<String, String>>,
}

/// Response data for `deleteContainer` and for reaped containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub container_id: String,
    pub status: String,
    pub terminated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Log document of the terminated container, sent to the create request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Value>,
}

/// A managed container as seen by the runtime.
#[derive(Debug, Clone)]
pub struct ObservedContainer {
    pub container_id: String,
    pub details: ContainerDetails,
    pub ownership: Ownership,
    pub request_id: Option<String>,
}

/// What a run has reserved so far.
#[derive(Default)]
struct Reservation {
    slot: bool,
    ports: Vec<u16>,
    gpus: Vec<String>,
    image: Option<String>,
    record: bool,
}

/// Orchestrates container create/run/kill on the local runtime.
pub struct ContainerLifecycle {
    config: LifecycleConfig,
    runtime: Arc<dyn ContainerRuntime>,
    pool: Arc<ResourcePool>,
    images: Arc<ImageCache>,
    records: Mutex<HashMap<String, ContainerRecord>>,
    locks: KeyedLocks,
}

impl ContainerLifecycle {
    pub fn new(
        config: LifecycleConfig,
        runtime: Arc<dyn ContainerRuntime>,
        pool: Arc<ResourcePool>,
        images: Arc<ImageCache>,
    ) -> Self {
        Self {
            config,
            runtime,
            pool,
            images,
            records: Mutex::new(HashMap::new()),
            locks: KeyedLocks::new(),
        }
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, ContainerRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    pub fn images(&self) -> &ImageCache {
        &self.images
    }

    /// Number of tracked containers.
    pub fn container_count(&self) -> usize {
        self.records().len()
    }

    /// Copy of one record.
    pub fn record(&self, container_id: &str) -> Option<ContainerRecord> {
        self.records().get(container_id).cloned()
    }

    // =========================================================================
    // Run
    // =========================================================================

    /// Reserve resources, pull the image, then create and start the container.
    #[instrument(skip(self, request), fields(container_id = %request.container_id))]
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome, WorkerError> {
        self.run_limited(request, self.config.limits()).await
    }

    async fn run_limited(
        &self,
        request: RunRequest,
        limits: Limits,
    ) -> Result<RunOutcome, WorkerError> {
        let id = request.container_id.clone();
        let _guard = self.locks.lock(&id).await;

        if self.records().contains_key(&id) {
            return Err(WorkerError::AlreadyExists(
                "Container Already Exists".to_string(),
            ));
        }
        if self.runtime.inspect_container(&id).await?.is_some() {
            return Err(WorkerError::AlreadyExists(
                "Container Already Exist".to_string(),
            ));
        }

        let mut reservation = Reservation::default();
        match self.run_steps(&request, limits, &mut reservation).await {
            Ok(outcome) => {
                if let Some(record) = self.records().get_mut(&id) {
                    record.started = true;
                }
                info!(
                    image = %request.image,
                    cpuset = %outcome.cpu_range,
                    ports = ?outcome.ports,
                    "container started"
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(error = %e, "container run failed, rolling back");
                self.roll_back(&id, reservation).await;
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        request: &RunRequest,
        limits: Limits,
        reservation: &mut Reservation,
    ) -> Result<RunOutcome, WorkerError> {
        let id = &request.container_id;

        // Requested
        let running = self.pool.reserve_slot()?;
        reservation.slot = true;

        // PortsReserved
        reservation.ports = self.pool.allocate_ports(request.ports.len())?;

        // GpuReserved
        reservation.gpus = self.pool.allocate_gpus(request.gpu_count as usize)?;

        let cpu_range = CpuRange::for_slot(running, limits.vcpu);
        let ownership = Ownership::from_labels(&request.labels, labels::OWNER);
        self.records().insert(
            id.clone(),
            ContainerRecord {
                container_id: id.clone(),
                image: request.image.clone(),
                external_ports: reservation.ports.clone(),
                gpu_ids: reservation.gpus.clone(),
                cpu_range: Some(cpu_range),
                ownership,
                request_id: request.labels.get(labels::REQUEST_ID).cloned(),
                started: false,
            },
        );
        reservation.record = true;

        // ImageReady
        let image = self.images.acquire(&request.image).await?;
        reservation.image = Some(image.clone());
        if let Some(record) = self.records().get_mut(id) {
            record.image = image.clone();
        }

        let ports: Vec<(u16, u16)> = reservation
            .ports
            .iter()
            .copied()
            .zip(request.ports.iter().copied())
            .collect();

        let spec = CreateSpec {
            name: id.clone(),
            image,
            env: request
                .env
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
            command: request.command.clone(),
            labels: request.labels.clone(),
            port_bindings: ports.iter().copied().collect(),
            gpus: GpuRequest {
                device_ids: reservation.gpus.clone(),
            },
            cpuset: cpu_range.to_string(),
            memory_bytes: u64::from(limits.memory_gb) * GIB,
            shm_size: SHM_SIZE_BYTES,
            binds: request.binds.clone(),
        };

        // Started
        self.runtime.create_container(&spec).await?;
        if let Err(e) = self.runtime.start_container(id).await {
            if let Err(remove_err) = self.runtime.remove_container(id).await {
                warn!(error = %remove_err, "failed to remove partially created container");
            }
            return Err(e.into());
        }

        Ok(RunOutcome {
            ports,
            gpu_ids: reservation.gpus.clone(),
            cpu_range,
        })
    }

    async fn roll_back(&self, container_id: &str, reservation: Reservation) {
        if reservation.record {
            self.records().remove(container_id);
        }
        if let Some(image) = &reservation.image {
            self.images.release(image).await;
        }
        self.pool.release_gpus(&reservation.gpus);
        self.pool.release_ports(&reservation.ports);
        if reservation.slot {
            self.pool.release_slot();
        }
    }

    // =========================================================================
    // Kill
    // =========================================================================

    /// Remove a container and return its resources.
    ///
    /// When `required` is given, every label in it must match the live
    /// container or the call fails with `Unauthorized` and changes nothing.
    /// Returns the request id that created the container.
    #[instrument(skip(self, required))]
    pub async fn kill(
        &self,
        container_id: &str,
        required: Option<&BTreeMap<String, String>>,
    ) -> Result<Option<String>, WorkerError> {
        let _guard = self.locks.lock(container_id).await;

        let record = self
            .record(container_id)
            .ok_or_else(|| WorkerError::NotExist("Container Not Exist".to_string()))?;
        if !record.started {
            return Err(WorkerError::NotStarted("Container Not Started".to_string()));
        }

        let live = self.runtime.inspect_container(container_id).await?;
        let live_labels = match &live {
            Some(details) => details.labels.clone(),
            None => record_labels(&record),
        };

        if let Some(required) = required {
            if !labels::labels_match(required, &live_labels) {
                warn!(container_id, "kill refused, labels do not match");
                return Err(WorkerError::unauthorized());
            }
        }

        self.runtime.remove_container(container_id).await?;

        self.records().remove(container_id);
        self.pool.release_ports(&record.external_ports);
        self.pool.release_gpus(&record.gpu_ids);
        self.pool.release_slot();
        self.images.release(&record.image).await;

        info!(container_id, "container removed");
        Ok(live_labels
            .get(labels::REQUEST_ID)
            .cloned()
            .or(record.request_id))
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Handle `createContainer` for `owner`.
    pub async fn create(
        &self,
        params: CreateContainerParams,
        owner: &str,
        request_id: &str,
    ) -> Result<CreateOutcome, WorkerError> {
        if self.config.node_port_ip.is_none() && !params.ports.is_empty() {
            return Err(WorkerError::NotSupported(
                "ENDPOINT Not Supported".to_string(),
            ));
        }

        let container_id = ContainerId::new();
        let services: Vec<(String, u16)> = params.ports.into_iter().collect();

        let outcome = self
            .run(RunRequest {
                container_id: container_id.to_string(),
                image: params.image_path,
                ports: services.iter().map(|(_, port)| *port).collect(),
                env: params.envs,
                command: params.command,
                labels: labels::container_labels(&params.labels, owner, request_id),
                gpu_count: self.config.gpu_per_container,
                binds: self.shared_bind(request_id).into_iter().collect(),
            })
            .await?;

        let endpoint = match (&self.config.node_port_ip, outcome.ports.is_empty()) {
            (Some(ip), false) => Some(
                services
                    .iter()
                    .zip(outcome.ports.iter())
                    .map(|((service, _), (external, _))| {
                        (service.clone(), format!("{}:{}", ip, external))
                    })
                    .collect(),
            ),
            _ => None,
        };

        Ok(CreateOutcome {
            container_id,
            endpoint,
        })
    }

    /// Handle `deleteContainer` for `requester`.
    pub async fn delete(
        &self,
        params: &DeleteContainerParams,
        requester: &Requester,
    ) -> Result<DeleteOutcome, WorkerError> {
        self.terminate(params.container_id.as_str(), requester, None)
            .await
    }

    /// Kill as `requester` and describe the result.
    pub async fn terminate(
        &self,
        container_id: &str,
        requester: &Requester,
        exit_code: Option<i64>,
    ) -> Result<DeleteOutcome, WorkerError> {
        let required = labels::required_kill_labels(requester);
        let create_request_id = self.kill(container_id, required.as_ref()).await?;

        Ok(DeleteOutcome {
            container_id: container_id.to_string(),
            status: "terminated".to_string(),
            terminated_at: Utc::now().timestamp_millis(),
            create_request_id,
            exit_code,
            logs: None,
        })
    }

    // =========================================================================
    // Shared directory
    // =========================================================================

    /// `None` without a shared path, or for ids that are not a single path component.
    fn shared_dir(&self, request_id: &str) -> Option<PathBuf> {
        let plain = !request_id.is_empty()
            && request_id != "."
            && request_id != ".."
            && !request_id.contains(['/', '\\']);
        if !plain {
            warn!(request_id, "request id is not usable as a shared directory name");
            return None;
        }
        self.config
            .shared_path
            .as_ref()
            .map(|shared| shared.join(request_id))
    }

    /// Bind mounting the request's shared directory into the container.
    pub fn shared_bind(&self, request_id: &str) -> Option<String> {
        self.shared_dir(request_id)
            .map(|dir| format!("{}:{}", dir.display(), CONTAINER_ROOT_PATH))
    }

    /// Log document left by the container of `request_id`.
    ///
    /// Returns `{}` when no shared path is configured, the file is missing,
    /// or it does not hold valid JSON.
    pub async fn read_logs(&self, request_id: &str) -> Value {
        let Some(path) = self.shared_dir(request_id).map(|dir| dir.join(LOG_FILE_NAME)) else {
            return json!({});
        };

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no container log file");
                return json!({});
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(logs) => logs,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "container log file is not valid JSON");
                json!({})
            }
        }
    }

    /// Attach the log document of the create request to a termination.
    pub async fn with_logs(&self, mut outcome: DeleteOutcome) -> DeleteOutcome {
        let logs = match &outcome.create_request_id {
            Some(request_id) => self.read_logs(request_id).await,
            None => json!({}),
        };
        outcome.logs = Some(logs);
        outcome
    }

    // =========================================================================
    // Recovery and observation
    // =========================================================================

    /// Rebuild records from managed containers already on the runtime.
    pub async fn recover(&self) -> Result<usize, WorkerError> {
        let names = self
            .runtime
            .list_containers(labels::MANAGED, labels::MANAGED_VALUE)
            .await?;

        let mut recovered = 0;
        for name in names {
            let _guard = self.locks.lock(&name).await;
            if self.records().contains_key(&name) {
                continue;
            }
            let Some(details) = self.runtime.inspect_container(&name).await? else {
                continue;
            };

            self.pool.claim(&details.host_ports, &details.gpu_ids);
            self.images.restore(&details.image).await;
            self.records().insert(
                name.clone(),
                ContainerRecord {
                    container_id: name.clone(),
                    image: crate::image::normalize_image(&details.image),
                    external_ports: details.host_ports.clone(),
                    gpu_ids: details.gpu_ids.clone(),
                    cpu_range: None,
                    ownership: Ownership::from_labels(&details.labels, labels::OWNER),
                    request_id: details.labels.get(labels::REQUEST_ID).cloned(),
                    started: true,
                },
            );
            debug!(container_id = %name, "recovered container");
            recovered += 1;
        }

        if recovered > 0 {
            info!(count = recovered, "recovered containers from runtime");
        }
        Ok(recovered)
    }

    /// Inspect every managed container on the runtime.
    pub async fn observe(&self) -> Result<Vec<ObservedContainer>, WorkerError> {
        let names = self
            .runtime
            .list_containers(labels::MANAGED, labels::MANAGED_VALUE)
            .await?;

        let mut observed = Vec::with_capacity(names.len());
        for name in names {
            if let Some(details) = self.runtime.inspect_container(&name).await? {
                observed.push(ObservedContainer {
                    container_id: name,
                    ownership: Ownership::from_labels(&details.labels, labels::OWNER),
                    request_id: details.labels.get(labels::REQUEST_ID).cloned(),
                    details,
                });
            }
        }
        Ok(observed)
    }

    /// Run and remove a GPU container to confirm the runtime supports GPUs.
    pub async fn check_gpu(&self) -> Result<(), WorkerError> {
        if self.pool.gpu_count() == 0 {
            return Ok(());
        }

        let checker = RunRequest {
            container_id: GPU_CHECK_NAME.to_string(),
            image: "ubuntu:18.04".to_string(),
            ports: Vec::new(),
            env: BTreeMap::new(),
            command: vec!["tail".to_string(), "-f".to_string()],
            labels: BTreeMap::new(),
            gpu_count: 1,
            binds: Vec::new(),
        };

        let result = match self.run_limited(checker, GPU_CHECK_LIMITS).await {
            Ok(_) => self.kill(GPU_CHECK_NAME, None).await.map(|_| ()),
            Err(e) => Err(e),
        };

        result.map_err(|e| {
            warn!(error = %e, "GPU check failed");
            WorkerError::NotSupported("GPU Not Supported".to_string())
        })
    }
}

fn record_labels(record: &ContainerRecord) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    if let Some(owner) = &record.ownership.owner {
        labels.insert(labels::OWNER.to_string(), owner.clone());
    }
    labels.insert(
        labels::MANAGED.to_string(),
        labels::MANAGED_VALUE.to_string(),
    );
    if let Some(request_id) = &record.request_id {
        labels.insert(labels::REQUEST_ID.to_string(), request_id.clone());
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::image::ImageCacheConfig;
    use crate::runtime::{seed_spec, MockRuntime};

    fn lifecycle(ports: &[u16], gpus: &[&str], slots: usize) -> (Arc<MockRuntime>, ContainerLifecycle) {
        let runtime = Arc::new(MockRuntime::new());
        let pool = Arc::new(ResourcePool::new(
            ports.iter().copied(),
            gpus.iter().map(|s| s.to_string()).collect(),
            slots,
        ));
        let images = Arc::new(ImageCache::new(
            ImageCacheConfig {
                max_images: slots + 2,
                registry: None,
            },
            runtime.clone(),
        ));
        let lifecycle = ContainerLifecycle::new(
            LifecycleConfig {
                vcpu: 2,
                memory_gb: 4,
                gpu_per_container: 0,
                node_port_ip: Some("203.0.113.7".to_string()),
                shared_path: None,
            },
            runtime.clone(),
            pool,
            images,
        );
        (runtime, lifecycle)
    }

    fn request(id: &str, ports: Vec<u16>) -> RunRequest {
        RunRequest {
            container_id: id.to_string(),
            image: "nginx".to_string(),
            ports,
            env: BTreeMap::from([("A".to_string(), "1".to_string())]),
            command: Vec::new(),
            labels: labels::container_labels(&BTreeMap::new(), "0xabc", "req-1"),
            gpu_count: 0,
            binds: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_run_creates_container() {
        let (runtime, lifecycle) = lifecycle(&[8000, 8001], &[], 2);

        let outcome = lifecycle.run(request("r1", vec![80])).await.unwrap();
        assert_eq!(outcome.ports, vec![(8000, 80)]);
        assert_eq!(outcome.cpu_range.to_string(), "0-1");

        let spec = runtime.spec_of("r1").unwrap();
        assert_eq!(spec.image, "nginx:latest");
        assert_eq!(spec.env, vec!["A=1"]);
        assert_eq!(spec.cpuset, "0-1");
        assert_eq!(spec.shm_size, SHM_SIZE_BYTES);
        assert!(lifecycle.record("r1").unwrap().started);
    }

    #[tokio::test]
    async fn test_second_container_gets_next_cpu_range() {
        let (_, lifecycle) = lifecycle(&[], &[], 2);
        lifecycle.run(request("r1", vec![])).await.unwrap();
        let outcome = lifecycle.run(request("r2", vec![])).await.unwrap();
        assert_eq!(outcome.cpu_range.to_string(), "2-3");
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (_, lifecycle) = lifecycle(&[], &[], 2);
        lifecycle.run(request("r1", vec![])).await.unwrap();
        let err = lifecycle.run(request("r1", vec![])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(lifecycle.pool().slots(), 1);
    }

    #[tokio::test]
    async fn test_slot_cap() {
        let (_, lifecycle) = lifecycle(&[], &[], 1);
        lifecycle.run(request("r1", vec![])).await.unwrap();
        let err = lifecycle.run(request("r2", vec![])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    }

    #[tokio::test]
    async fn test_gpu_shortage_releases_ports() {
        let (_, lifecycle) = lifecycle(&[8000], &["0"], 2);
        let mut req = request("r1", vec![80]);
        req.gpu_count = 2;

        let err = lifecycle.run(req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);

        let usage = lifecycle.pool().usage();
        assert!(usage.used_ports.is_empty());
        assert!(usage.used_gpus.is_empty());
        assert_eq!(usage.slots, 0);
        assert!(lifecycle.record("r1").is_none());
    }

    #[tokio::test]
    async fn test_pull_failure_rolls_back() {
        let (runtime, lifecycle) = lifecycle(&[8000], &["0"], 2);
        runtime.set_fail_pulls(true);
        let mut req = request("r1", vec![80]);
        req.gpu_count = 1;

        let err = lifecycle.run(req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ImagePullFailed);

        let usage = lifecycle.pool().usage();
        assert!(usage.used_ports.is_empty());
        assert!(usage.used_gpus.is_empty());
        assert_eq!(usage.slots, 0);
        assert!(lifecycle.images().snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_removes_container() {
        let (runtime, lifecycle) = lifecycle(&[8000], &[], 2);
        runtime.set_fail_starts(true);

        let err = lifecycle.run(request("r1", vec![80])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unexpected);
        assert!(runtime.container_names().is_empty());
        assert!(lifecycle.pool().usage().used_ports.is_empty());
        assert_eq!(lifecycle.images().ref_count("nginx").await, Some(0));
    }

    #[tokio::test]
    async fn test_kill_returns_request_id() {
        let (runtime, lifecycle) = lifecycle(&[8000], &[], 2);
        lifecycle.run(request("r1", vec![80])).await.unwrap();

        let request_id = lifecycle.kill("r1", None).await.unwrap();
        assert_eq!(request_id.as_deref(), Some("req-1"));
        assert!(runtime.container_names().is_empty());
        assert_eq!(lifecycle.container_count(), 0);
    }

    #[tokio::test]
    async fn test_kill_unknown() {
        let (_, lifecycle) = lifecycle(&[], &[], 2);
        let err = lifecycle.kill("r404", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotExist);
    }

    #[tokio::test]
    async fn test_create_builds_endpoint() {
        let (_, lifecycle) = lifecycle(&[8000, 8001], &[], 2);
        let params = CreateContainerParams {
            image_path: "nginx".to_string(),
            ports: BTreeMap::from([("api".to_string(), 8080), ("web".to_string(), 80)]),
            envs: BTreeMap::new(),
            command: Vec::new(),
            labels: BTreeMap::new(),
        };

        let outcome = lifecycle.create(params, "0xabc", "req-9").await.unwrap();
        let endpoint = outcome.endpoint.unwrap();
        assert_eq!(endpoint["api"], "203.0.113.7:8000");
        assert_eq!(endpoint["web"], "203.0.113.7:8001");

        let record = lifecycle.record(outcome.container_id.as_str()).unwrap();
        assert_eq!(record.request_id.as_deref(), Some("req-9"));
        assert_eq!(record.ownership.owner.as_deref(), Some("0xabc"));
    }

    #[tokio::test]
    async fn test_create_without_node_ip_refuses_ports() {
        let runtime = Arc::new(MockRuntime::new());
        let pool = Arc::new(ResourcePool::new([8000], Vec::new(), 1));
        let images = Arc::new(ImageCache::new(ImageCacheConfig::default(), runtime.clone()));
        let lifecycle = ContainerLifecycle::new(
            LifecycleConfig {
                vcpu: 1,
                memory_gb: 1,
                gpu_per_container: 0,
                node_port_ip: None,
                shared_path: None,
            },
            runtime,
            pool,
            images,
        );
        let params = CreateContainerParams {
            image_path: "nginx".to_string(),
            ports: BTreeMap::from([("web".to_string(), 80)]),
            envs: BTreeMap::new(),
            command: Vec::new(),
            labels: BTreeMap::new(),
        };

        let err = lifecycle.create(params, "0xabc", "req").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[tokio::test]
    async fn test_recover_claims_resources() {
        let (runtime, lifecycle) = lifecycle(&[8000, 8001], &["0", "1"], 2);
        let mut spec = seed_spec(
            "rold",
            "redis:7",
            labels::container_labels(&BTreeMap::new(), "0xabc", "req-old"),
        );
        spec.port_bindings.insert(8001, 6379);
        spec.gpus.device_ids = vec!["1".to_string()];
        runtime.add_running(spec);
        runtime.add_running(seed_spec("unmanaged", "busybox:latest", BTreeMap::new()));

        assert_eq!(lifecycle.recover().await.unwrap(), 1);

        let usage = lifecycle.pool().usage();
        assert_eq!(usage.used_ports.iter().copied().collect::<Vec<_>>(), vec![8001]);
        assert_eq!(usage.free_gpus, vec!["0".to_string()]);
        assert_eq!(lifecycle.images().ref_count("redis:7").await, Some(1));

        let request_id = lifecycle
            .kill("rold", labels::required_kill_labels(&Requester::user("0xabc")).as_ref())
            .await
            .unwrap();
        assert_eq!(request_id.as_deref(), Some("req-old"));
        assert_eq!(lifecycle.pool().usage().slots, 0);
    }

    #[tokio::test]
    async fn test_check_gpu_leaves_pool_clean() {
        let (runtime, lifecycle) = lifecycle(&[], &["0"], 1);
        lifecycle.check_gpu().await.unwrap();
        assert!(runtime.container_names().is_empty());
        assert_eq!(lifecycle.pool().usage().slots, 0);
        assert!(lifecycle.pool().usage().used_gpus.is_empty());
    }

    #[tokio::test]
    async fn test_check_gpu_failure_is_not_supported() {
        let (runtime, lifecycle) = lifecycle(&[], &["0"], 1);
        runtime.set_fail_starts(true);
        let err = lifecycle.check_gpu().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[tokio::test]
    async fn test_check_gpu_uses_minimal_limits() {
        let (runtime, lifecycle) = lifecycle(&[], &["0", "1"], 1);
        lifecycle.check_gpu().await.unwrap();

        let specs = runtime.created_specs();
        assert_eq!(specs.len(), 1);
        let spec = &specs[0];
        assert_eq!(spec.name, "connectGpuChecker");
        assert_eq!(spec.image, "ubuntu:18.04");
        assert_eq!(spec.command, vec!["tail", "-f"]);
        assert_eq!(spec.cpuset, "0-0");
        assert_eq!(spec.memory_bytes, GIB);
        assert_eq!(spec.gpus.device_ids.len(), 1);
    }

    fn sharing_lifecycle(shared: &std::path::Path) -> (Arc<MockRuntime>, ContainerLifecycle) {
        let runtime = Arc::new(MockRuntime::new());
        let pool = Arc::new(ResourcePool::new([8000], Vec::new(), 1));
        let images = Arc::new(ImageCache::new(ImageCacheConfig::default(), runtime.clone()));
        let lifecycle = ContainerLifecycle::new(
            LifecycleConfig {
                vcpu: 1,
                memory_gb: 1,
                gpu_per_container: 0,
                node_port_ip: None,
                shared_path: Some(shared.to_path_buf()),
            },
            runtime.clone(),
            pool,
            images,
        );
        (runtime, lifecycle)
    }

    #[tokio::test]
    async fn test_create_mounts_shared_directory() {
        let shared = tempfile::TempDir::new().unwrap();
        let (runtime, lifecycle) = sharing_lifecycle(shared.path());
        let params = CreateContainerParams {
            image_path: "trainer:2".to_string(),
            ports: BTreeMap::new(),
            envs: BTreeMap::new(),
            command: Vec::new(),
            labels: BTreeMap::new(),
        };

        let outcome = lifecycle.create(params, "0xabc", "req-7").await.unwrap();
        let spec = runtime.spec_of(outcome.container_id.as_str()).unwrap();
        assert_eq!(
            spec.binds,
            vec![format!(
                "{}:{}",
                shared.path().join("req-7").display(),
                CONTAINER_ROOT_PATH
            )]
        );
    }

    #[tokio::test]
    async fn test_create_without_shared_path_mounts_nothing() {
        let (runtime, lifecycle) = lifecycle(&[], &[], 1);
        let params = CreateContainerParams {
            image_path: "nginx".to_string(),
            ports: BTreeMap::new(),
            envs: BTreeMap::new(),
            command: Vec::new(),
            labels: BTreeMap::new(),
        };

        let outcome = lifecycle.create(params, "0xabc", "req-8").await.unwrap();
        assert!(runtime.spec_of(outcome.container_id.as_str()).unwrap().binds.is_empty());
    }

    #[tokio::test]
    async fn test_read_logs_falls_back_to_empty_object() {
        let shared = tempfile::TempDir::new().unwrap();
        let (_, lifecycle) = sharing_lifecycle(shared.path());

        assert_eq!(lifecycle.read_logs("missing").await, json!({}));

        let dir = shared.path().join("broken");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(LOG_FILE_NAME), "{truncated").unwrap();
        assert_eq!(lifecycle.read_logs("broken").await, json!({}));

        let dir = shared.path().join("done");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(LOG_FILE_NAME), r#"[{"step": 1}]"#).unwrap();
        assert_eq!(lifecycle.read_logs("done").await, json!([{"step": 1}]));

        std::fs::write(shared.path().join(LOG_FILE_NAME), r#"{"outside": true}"#).unwrap();
        assert_eq!(lifecycle.read_logs("..").await, json!({}));
        assert_eq!(lifecycle.read_logs("done/../..").await, json!({}));
        assert_eq!(lifecycle.shared_bind("a/b"), None);
    }

    #[tokio::test]
    async fn test_terminate_with_logs() {
        let shared = tempfile::TempDir::new().unwrap();
        let (_, lifecycle) = sharing_lifecycle(shared.path());
        let mut req = request("r1", vec![]);
        req.labels = labels::container_labels(&BTreeMap::new(), "0xabc", "req-r1");
        lifecycle.run(req).await.unwrap();

        let dir = shared.path().join("req-r1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(LOG_FILE_NAME), r#"{"result": "ok"}"#).unwrap();

        let outcome = lifecycle
            .terminate("r1", &Requester::user("0xabc"), None)
            .await
            .unwrap();
        assert_eq!(outcome.logs, None);

        let outcome = lifecycle.with_logs(outcome).await;
        assert_eq!(outcome.logs, Some(json!({"result": "ok"})));
        let data = serde_json::to_value(&outcome).unwrap();
        assert_eq!(data["logs"]["result"], "ok");
        assert_eq!(data["createRequestId"], "req-r1");
    }
}
