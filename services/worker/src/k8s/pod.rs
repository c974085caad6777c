//! Pod and node parsing, quantity conversion and capacity aggregation.

use std::collections::BTreeMap;

use connect_protocol::{
    NodePool, NodePoolSnapshot, NodeResources, PhaseStatus, PodCondition, PodPhase, PodStatus,
    ResourceAmount,
};
use serde_json::Value;

use super::{object_labels, object_name, object_namespace};
use crate::labels;

const GPU_RESOURCE: &str = "nvidia.com/gpu";
const MIB: f64 = 1024.0 * 1024.0;

// =============================================================================
// Phase
// =============================================================================

/// Map a raw pod phase to the phase reported upstream.
///
/// A pending pod whose first container is still being created is refined to
/// `createContainer`; `Running` becomes `success`; anything unrecognized is
/// `failed`.
pub fn normalize_phase(raw: &str, waiting_reason: Option<&str>) -> PodPhase {
    match raw {
        "Pending" if waiting_reason == Some("ContainerCreating") => PodPhase::CreateContainer,
        "Pending" => PodPhase::Pending,
        "Running" => PodPhase::Success,
        "Succeeded" => PodPhase::Succeeded,
        _ => PodPhase::Failed,
    }
}

// =============================================================================
// Quantities
// =============================================================================

/// CPU quantity in millicores (`500m`, `2`, `1.5`).
pub fn parse_cpu(quantity: &str) -> u64 {
    let quantity = quantity.trim();
    // (number, multiplier, divisor) into millicores
    let (number, multiplier, divisor) = if let Some(n) = quantity.strip_suffix('m') {
        (n, 1.0, 1.0)
    } else if let Some(n) = quantity.strip_suffix('u') {
        (n, 1.0, 1e3)
    } else if let Some(n) = quantity.strip_suffix('n') {
        (n, 1.0, 1e6)
    } else {
        (quantity, 1000.0, 1.0)
    };
    number
        .parse::<f64>()
        .map(|v| (v * multiplier / divisor).ceil().max(0.0) as u64)
        .unwrap_or(0)
}

/// Memory quantity in MiB (`512Mi`, `4Gi`, `1000000Ki`, `1G`, `268435456`).
pub fn parse_memory_mib(quantity: &str) -> u64 {
    const SUFFIXES: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", MIB),
        ("Gi", MIB * 1024.0),
        ("Ti", MIB * 1024.0 * 1024.0),
        ("Pi", MIB * 1024.0 * 1024.0 * 1024.0),
        ("k", 1e3),
        ("K", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
    ];

    let quantity = quantity.trim();
    let (number, scale) = SUFFIXES
        .iter()
        .find_map(|(suffix, scale)| quantity.strip_suffix(suffix).map(|n| (n, *scale)))
        .unwrap_or((quantity, 1.0));

    number
        .parse::<f64>()
        .map(|v| (v * scale / MIB).floor().max(0.0) as u64)
        .unwrap_or(0)
}

fn quantity_str(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a `{cpu, memory, nvidia.com/gpu}` resource map.
pub fn resource_amount(resources: &Value) -> ResourceAmount {
    ResourceAmount {
        cpu: quantity_str(&resources["cpu"])
            .map(|q| parse_cpu(&q))
            .unwrap_or(0),
        memory: quantity_str(&resources["memory"])
            .map(|q| parse_memory_mib(&q))
            .unwrap_or(0),
        gpu: quantity_str(&resources[GPU_RESOURCE])
            .and_then(|q| q.parse().ok())
            .unwrap_or(0),
    }
}

/// Resources a pod holds on its node.
///
/// CPU and memory use the limit when set and the request otherwise; GPUs are
/// only ever expressed as limits.
pub fn pod_limits(pod: &Value) -> ResourceAmount {
    pod["spec"]["containers"]
        .as_array()
        .map(|containers| {
            containers
                .iter()
                .map(|container| {
                    let limits = resource_amount(&container["resources"]["limits"]);
                    let requests = resource_amount(&container["resources"]["requests"]);
                    ResourceAmount {
                        cpu: if limits.cpu > 0 { limits.cpu } else { requests.cpu },
                        memory: if limits.memory > 0 {
                            limits.memory
                        } else {
                            requests.memory
                        },
                        gpu: limits.gpu,
                    }
                })
                .sum()
        })
        .unwrap_or_default()
}

// =============================================================================
// Pods
// =============================================================================

/// The parts of a pod the worker looks at.
#[derive(Debug, Clone, PartialEq)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub node_name: Option<String>,
    pub labels: BTreeMap<String, String>,
    /// Raw `status.phase`.
    pub raw_phase: String,
    pub phase: PodPhase,
    pub condition: Option<PodCondition>,
    pub image: String,
    pub limits: ResourceAmount,
}

impl PodInfo {
    /// Parse a pod object. Returns `None` for objects without a name.
    pub fn from_object(pod: &Value) -> Option<Self> {
        let name = object_name(pod)?.to_string();
        let waiting = &pod["status"]["containerStatuses"][0]["state"]["waiting"];
        let raw_phase = pod["status"]["phase"]
            .as_str()
            .unwrap_or("Unknown")
            .to_string();

        let condition = waiting.is_object().then(|| PodCondition {
            condition_type: "ContainersReady".to_string(),
            status: false,
            reason: waiting["reason"].as_str().map(str::to_string),
            message: waiting["message"].as_str().map(str::to_string),
        });

        Some(Self {
            phase: normalize_phase(&raw_phase, waiting["reason"].as_str()),
            name,
            namespace: object_namespace(pod).unwrap_or_default().to_string(),
            node_name: pod["spec"]["nodeName"].as_str().map(str::to_string),
            labels: object_labels(pod),
            raw_phase,
            condition,
            image: pod["spec"]["containers"][0]["image"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            limits: pod_limits(pod),
        })
    }

    /// Workspace or storage id from the `app` label.
    pub fn app(&self) -> Option<&str> {
        self.labels.get(labels::APP).map(String::as_str)
    }

    /// Returns true if this worker manages the pod.
    pub fn is_managed(&self) -> bool {
        self.labels.get(labels::K8S_MANAGED).map(String::as_str)
            == Some(labels::K8S_MANAGED_VALUE)
    }

    /// Returns true for storage helper objects.
    pub fn is_storage(&self) -> bool {
        self.labels.contains_key(labels::NFS)
    }

    /// Returns true once the pod no longer holds node resources.
    pub fn is_terminated(&self) -> bool {
        self.raw_phase == "Succeeded" || self.raw_phase == "Failed"
    }

    /// Status reported upstream.
    pub fn status(&self) -> PodStatus {
        PodStatus {
            pod_name: self.name.clone(),
            namespace_id: self.namespace.clone(),
            status: PhaseStatus {
                phase: self.phase,
                condition: self.condition.clone(),
            },
            image: self.image.clone(),
        }
    }
}

// =============================================================================
// Capacity
// =============================================================================

/// Build node-pool capacity from nodes and the pods placed on them.
///
/// Nodes without the node-pool label are ignored. Allocatable is the node's
/// reported allocatable minus the limits of every live pod on it, clamped at
/// zero.
pub fn compute_snapshot(nodes: &[Value], pods: &[PodInfo]) -> NodePoolSnapshot {
    let mut used: BTreeMap<&str, ResourceAmount> = BTreeMap::new();
    for pod in pods.iter().filter(|p| !p.is_terminated()) {
        if let Some(node) = &pod.node_name {
            let entry = used.entry(node.as_str()).or_default();
            *entry = *entry + pod.limits;
        }
    }

    let mut pools: BTreeMap<String, NodePool> = BTreeMap::new();
    for node in nodes {
        let node_labels = object_labels(node);
        let (Some(name), Some(pool_name)) = (object_name(node), node_labels.get(labels::NODE_POOL))
        else {
            continue;
        };

        let capacity = resource_amount(&node["status"]["allocatable"]);
        let allocatable =
            capacity.saturating_sub(used.get(name).copied().unwrap_or_default());

        let pool = pools.entry(pool_name.clone()).or_insert_with(|| NodePool {
            gpu_type: node_labels
                .get(labels::GPU_TYPE)
                .cloned()
                .unwrap_or_default(),
            os_image: node["status"]["nodeInfo"]["osImage"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            nodes: BTreeMap::new(),
        });
        pool.nodes.insert(
            name.to_string(),
            NodeResources {
                capacity,
                allocatable,
            },
        );
    }

    NodePoolSnapshot(pools)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("Pending", Some("ContainerCreating"), PodPhase::CreateContainer)]
    #[case("Pending", Some("ImagePullBackOff"), PodPhase::Pending)]
    #[case("Pending", None, PodPhase::Pending)]
    #[case("Running", None, PodPhase::Success)]
    #[case("Succeeded", None, PodPhase::Succeeded)]
    #[case("Failed", None, PodPhase::Failed)]
    #[case("Unknown", None, PodPhase::Failed)]
    fn test_normalize_phase(
        #[case] raw: &str,
        #[case] reason: Option<&str>,
        #[case] expected: PodPhase,
    ) {
        assert_eq!(normalize_phase(raw, reason), expected);
    }

    #[rstest]
    #[case("500m", 500)]
    #[case("2", 2000)]
    #[case("1.5", 1500)]
    #[case("250000u", 250)]
    #[case("bogus", 0)]
    fn test_parse_cpu(#[case] quantity: &str, #[case] millis: u64) {
        assert_eq!(parse_cpu(quantity), millis);
    }

    #[rstest]
    #[case("512Mi", 512)]
    #[case("4Gi", 4096)]
    #[case("1048576Ki", 1024)]
    #[case("1G", 953)]
    #[case("268435456", 256)]
    #[case("", 0)]
    fn test_parse_memory(#[case] quantity: &str, #[case] mib: u64) {
        assert_eq!(parse_memory_mib(quantity), mib);
    }

    fn pod(node: &str, phase: &str, cpu_limit: &str, cpu_request: &str, gpu: u64) -> Value {
        json!({
            "metadata": {"name": format!("{}-{}", node, cpu_limit), "namespace": "w1",
                         "labels": {"app": "w2", "ainConnect": "yes"}},
            "spec": {
                "nodeName": node,
                "containers": [{
                    "image": "nginx:1",
                    "resources": {
                        "limits": {"cpu": cpu_limit, "nvidia.com/gpu": gpu.to_string()},
                        "requests": {"cpu": cpu_request, "memory": "1Gi"}
                    }
                }]
            },
            "status": {"phase": phase}
        })
    }

    #[test]
    fn test_pod_limits_prefer_limit() {
        let limits = pod_limits(&pod("n1", "Running", "0", "250m", 1));
        assert_eq!(limits.cpu, 250);
        assert_eq!(limits.memory, 1024);
        assert_eq!(limits.gpu, 1);

        let limits = pod_limits(&pod("n1", "Running", "2", "250m", 0));
        assert_eq!(limits.cpu, 2000);
    }

    #[test]
    fn test_pod_info() {
        let mut object = pod("n1", "Pending", "1", "1", 0);
        object["status"]["containerStatuses"] = json!([
            {"state": {"waiting": {"reason": "ContainerCreating", "message": "pulling"}}}
        ]);

        let info = PodInfo::from_object(&object).unwrap();
        assert_eq!(info.phase, PodPhase::CreateContainer);
        assert_eq!(info.app(), Some("w2"));
        assert!(info.is_managed());
        assert!(!info.is_storage());

        let status = info.status();
        assert_eq!(status.image, "nginx:1");
        let condition = status.status.condition.unwrap();
        assert_eq!(condition.condition_type, "ContainersReady");
        assert_eq!(condition.reason.as_deref(), Some("ContainerCreating"));
    }

    fn node(name: &str, pool: Option<&str>, cpu: &str, memory: &str, gpu: &str) -> Value {
        let mut node_labels = json!({});
        if let Some(pool) = pool {
            node_labels[labels::NODE_POOL] = json!(pool);
            node_labels[labels::GPU_TYPE] = json!("a100");
        }
        json!({
            "metadata": {"name": name, "labels": node_labels},
            "status": {
                "allocatable": {"cpu": cpu, "memory": memory, "nvidia.com/gpu": gpu},
                "nodeInfo": {"osImage": "Ubuntu 22.04"}
            }
        })
    }

    #[test]
    fn test_compute_snapshot() {
        let nodes = vec![
            node("n1", Some("gpu-pool"), "4", "8Gi", "2"),
            node("n2", Some("gpu-pool"), "2", "4Gi", "0"),
            node("n3", None, "8", "8Gi", "0"),
        ];
        let pods: Vec<PodInfo> = [
            pod("n1", "Running", "1", "1", 1),
            pod("n1", "Succeeded", "2", "2", 1),
            pod("n2", "Running", "3", "3", 0),
        ]
        .iter()
        .filter_map(PodInfo::from_object)
        .collect();

        let snapshot = compute_snapshot(&nodes, &pods);
        assert_eq!(snapshot.len(), 1);

        let pool = snapshot.pool("gpu-pool").unwrap();
        assert_eq!(pool.gpu_type, "a100");
        assert_eq!(pool.os_image, "Ubuntu 22.04");

        let n1 = pool.nodes["n1"];
        assert_eq!(n1.capacity.cpu, 4000);
        assert_eq!(n1.allocatable.cpu, 3000);
        assert_eq!(n1.allocatable.memory, 8192 - 1024);
        assert_eq!(n1.allocatable.gpu, 1);

        let n2 = pool.nodes["n2"];
        assert_eq!(n2.allocatable.cpu, 0);
    }
}
