//! Request payloads and status report types.
//!
//! Field names follow the control plane's camelCase JSON.

use std::collections::BTreeMap;

use connect_id::{ContainerId, NamespaceId, StorageId, WorkspaceId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Requests
// =============================================================================

/// A decoded control-plane request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "requestType", content = "params", rename_all = "camelCase")]
pub enum WorkerRequest {
    CreateContainer(CreateContainerParams),
    DeleteContainer(DeleteContainerParams),
    Deploy(DeployParams),
    Redeploy(RedeployParams),
    Undeploy(UndeployParams),
    CreateNamespace(CreateNamespaceParams),
    DeleteNamespace(DeleteNamespaceParams),
    CreateStorage(CreateStorageParams),
    DeleteStorage(DeleteStorageParams),
    GetContainerLog(GetContainerLogParams),
}

impl WorkerRequest {
    /// Every request type name this worker can decode.
    pub const KINDS: &'static [&'static str] = &[
        "createContainer",
        "deleteContainer",
        "deploy",
        "redeploy",
        "undeploy",
        "createNamespace",
        "deleteNamespace",
        "createStorage",
        "deleteStorage",
        "getContainerLog",
    ];

    /// The wire name of this request.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerRequest::CreateContainer(_) => "createContainer",
            WorkerRequest::DeleteContainer(_) => "deleteContainer",
            WorkerRequest::Deploy(_) => "deploy",
            WorkerRequest::Redeploy(_) => "redeploy",
            WorkerRequest::Undeploy(_) => "undeploy",
            WorkerRequest::CreateNamespace(_) => "createNamespace",
            WorkerRequest::DeleteNamespace(_) => "deleteNamespace",
            WorkerRequest::CreateStorage(_) => "createStorage",
            WorkerRequest::DeleteStorage(_) => "deleteStorage",
            WorkerRequest::GetContainerLog(_) => "getContainerLog",
        }
    }

    /// Key of the existing object this request acts on.
    ///
    /// Requests sharing a key must be applied in arrival order. Requests that
    /// create a fresh object have no key.
    pub fn target_key(&self) -> Option<String> {
        match self {
            WorkerRequest::DeleteContainer(p) => Some(p.container_id.to_string()),
            WorkerRequest::Redeploy(p) => Some(p.container_id.to_string()),
            WorkerRequest::Undeploy(p) => Some(p.container_id.to_string()),
            WorkerRequest::GetContainerLog(p) => Some(p.container_id.to_string()),
            WorkerRequest::DeleteStorage(p) => Some(p.storage_id.to_string()),
            WorkerRequest::DeleteNamespace(p) => Some(p.namespace_id.to_string()),
            WorkerRequest::CreateContainer(_)
            | WorkerRequest::Deploy(_)
            | WorkerRequest::CreateNamespace(_)
            | WorkerRequest::CreateStorage(_) => None,
        }
    }

    /// Returns true for requests served by the local container runtime.
    pub fn is_local_runtime(&self) -> bool {
        matches!(
            self,
            WorkerRequest::CreateContainer(_) | WorkerRequest::DeleteContainer(_)
        )
    }
}

/// Run a container on the local runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateContainerParams {
    /// Image reference, e.g. `nginx:1.27`.
    pub image_path: String,

    /// Service name to internal container port.
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,

    /// Environment variables.
    #[serde(default)]
    pub envs: BTreeMap<String, String>,

    /// Command override.
    #[serde(default)]
    pub command: Vec<String>,

    /// Caller-supplied labels. System labels are applied on top.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Kill a container on the local runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteContainerParams {
    pub container_id: ContainerId,
}

/// Hardware request for a workspace, in millicores, MiB and GPU count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HwSpec {
    pub cpu: u64,
    pub memory: u64,
    #[serde(default)]
    pub gpu: u64,
}

/// A persistent volume claim mounted into a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageMount {
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

/// A secret mounted into a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretMount {
    pub mount_path: String,
}

/// Desired container shape for a Kubernetes workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub image_name: String,
    #[serde(default)]
    pub node_pool_name: Option<String>,
    pub hw_spec: HwSpec,
    #[serde(default)]
    pub port: Vec<u16>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub storage_spec: BTreeMap<StorageId, StorageMount>,
    #[serde(default)]
    pub secret_spec: BTreeMap<String, SecretMount>,
    #[serde(default)]
    pub replicas: Option<u32>,
}

/// Create a workspace (deployment, service, routes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployParams {
    pub namespace_id: NamespaceId,
    pub container_info: ContainerInfo,
    /// Lifetime in hours. Absent means no auto-sleep.
    #[serde(default)]
    pub max_duration: Option<f64>,
}

/// Patchable fields of an existing workspace.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeployOption {
    #[serde(default)]
    pub replicas: Option<u32>,
    #[serde(default)]
    pub image_name: Option<String>,
    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub storage_spec: Option<BTreeMap<StorageId, StorageMount>>,
}

/// Patch an existing workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeployParams {
    pub namespace_id: NamespaceId,
    pub container_id: WorkspaceId,
    #[serde(default)]
    pub option: RedeployOption,
}

/// Remove a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndeployParams {
    pub namespace_id: NamespaceId,
    pub container_id: WorkspaceId,
}

/// Create a namespace owned by the requester.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CreateNamespaceParams {}

/// Delete a namespace and everything in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteNamespaceParams {
    pub namespace_id: NamespaceId,
}

/// NFS export backing a storage claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsInfo {
    pub server: String,
    pub path: String,
}

/// Provision storage in a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStorageParams {
    pub namespace_id: NamespaceId,
    /// Capacity in GiB.
    pub capacity: u32,
    #[serde(default)]
    pub nfs_info: Option<NfsInfo>,
}

/// Remove storage from a namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteStorageParams {
    pub namespace_id: NamespaceId,
    pub storage_id: StorageId,
}

/// Read a workspace's container log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetContainerLogParams {
    pub namespace_id: NamespaceId,
    pub container_id: WorkspaceId,
    /// Only return lines newer than this epoch-ms timestamp.
    #[serde(default)]
    pub from_timestamp: Option<i64>,
}

// =============================================================================
// Worker Status (local runtime)
// =============================================================================

/// Status of one tracked container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub status: String,
    pub image_path: String,
    /// Log document the container left in its shared directory.
    #[serde(default)]
    pub logs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_status: Option<String>,
}

/// Periodic status for a local-runtime worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub worker_status: String,
    pub current_number_of_container: usize,
    #[serde(default)]
    pub container_info: BTreeMap<String, ContainerStatus>,
}

/// Advertised per-container capacity, sent once at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub vcpu: u32,
    pub gpu_count: u32,
    pub memory_gb: u32,
    pub max_number_of_container: usize,
    pub has_endpoint: bool,
}

/// Registration payload for a local-runtime worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRegistration {
    pub cluster_name: String,
    pub container_spec: ContainerSpec,
}

// =============================================================================
// Cluster Status (Kubernetes)
// =============================================================================

/// An amount of schedulable resources: millicores, MiB, GPU count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceAmount {
    pub cpu: u64,
    pub memory: u64,
    pub gpu: u64,
}

impl ResourceAmount {
    /// Component-wise subtraction clamped at zero.
    pub fn saturating_sub(self, other: ResourceAmount) -> ResourceAmount {
        ResourceAmount {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory: self.memory.saturating_sub(other.memory),
            gpu: self.gpu.saturating_sub(other.gpu),
        }
    }
}

impl std::ops::Add for ResourceAmount {
    type Output = ResourceAmount;

    fn add(self, rhs: ResourceAmount) -> ResourceAmount {
        ResourceAmount {
            cpu: self.cpu + rhs.cpu,
            memory: self.memory + rhs.memory,
            gpu: self.gpu + rhs.gpu,
        }
    }
}

impl std::iter::Sum for ResourceAmount {
    fn sum<I: Iterator<Item = ResourceAmount>>(iter: I) -> ResourceAmount {
        iter.fold(ResourceAmount::default(), |acc, x| acc + x)
    }
}

/// Capacity and what is still allocatable on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeResources {
    pub capacity: ResourceAmount,
    pub allocatable: ResourceAmount,
}

/// A group of nodes sharing hardware.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePool {
    pub gpu_type: String,
    pub os_image: String,
    pub nodes: BTreeMap<String, NodeResources>,
}

/// Node pools keyed by name. Always replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodePoolSnapshot(pub BTreeMap<String, NodePool>);

impl NodePoolSnapshot {
    /// Look up a pool by name.
    pub fn pool(&self, name: &str) -> Option<&NodePool> {
        self.0.get(name)
    }

    /// Number of pools.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no pool is known.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Periodic status for a Kubernetes worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub cluster_name: String,
    pub node_pool: NodePoolSnapshot,
}

// =============================================================================
// Pod Status
// =============================================================================

/// Normalized pod phase reported upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PodPhase {
    Pending,
    CreateContainer,
    Success,
    Succeeded,
    Failed,
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PodPhase::Pending => "pending",
            PodPhase::CreateContainer => "createContainer",
            PodPhase::Success => "success",
            PodPhase::Succeeded => "succeeded",
            PodPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a pod's containers are not ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Phase plus optional condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseStatus {
    pub phase: PodPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<PodCondition>,
}

/// Observed state of one pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    pub pod_name: String,
    pub namespace_id: String,
    pub status: PhaseStatus,
    pub image: String,
}

/// A pod phase change for one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatusReport {
    pub container_id: String,
    pub pod_id: String,
    pub pod_status: PodStatus,
}
