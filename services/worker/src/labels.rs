//! Ownership and classification labels.
//!
//! Backend objects carry plain string label maps. Inside the worker they are
//! read into [`Ownership`] once and checked against a [`Requester`]; label maps
//! are only built or parsed at the runtime/cluster boundary.

use std::collections::BTreeMap;

use crate::error::WorkerError;

// =============================================================================
// Local runtime labels
// =============================================================================

/// Address of the party that created the container.
pub const OWNER: &str = "connect.owner";

/// Marker set on every container this worker manages.
pub const MANAGED: &str = "connect.managed";

/// Value of [`MANAGED`].
pub const MANAGED_VALUE: &str = "container";

/// Control-plane request id that created the container.
pub const REQUEST_ID: &str = "connect.request-id";

// =============================================================================
// Kubernetes labels
// =============================================================================

/// Marker set on every workspace object this worker manages.
pub const K8S_MANAGED: &str = "ainConnect";

/// Value of [`K8S_MANAGED`].
pub const K8S_MANAGED_VALUE: &str = "yes";

/// Owner address on namespaces, workspaces and storage.
pub const K8S_OWNER: &str = "connectAddress";

/// Auto-sleep deadline in epoch milliseconds.
pub const SLEEP_TIME: &str = "sleepTime";

/// Workspace or storage id; also the pod selector.
pub const APP: &str = "app";

/// Present on storage objects.
pub const NFS: &str = "nfs";

/// Node label naming the node pool.
pub const NODE_POOL: &str = "Ainetwork.ai_nodepoolname";

/// Node label naming the GPU model.
pub const GPU_TYPE: &str = "Ainetwork.ai_gpu_type";

/// Label on the gateway namespace admitted by workspace network policies.
pub const GATEWAY_NAMESPACE_LABEL: &str = "worker";

/// Who is asking for a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requester {
    /// A control-plane user, identified by address.
    User(String),
    /// The worker itself (auto-sleep, exit reaping). Bypasses ownership checks.
    System,
}

impl Requester {
    /// Build a user requester.
    pub fn user(address: impl Into<String>) -> Self {
        Requester::User(address.into())
    }

    /// The requesting address, if any.
    pub fn address(&self) -> Option<&str> {
        match self {
            Requester::User(address) => Some(address),
            Requester::System => None,
        }
    }
}

/// Owner recorded on a backend object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ownership {
    pub owner: Option<String>,
}

impl Ownership {
    /// Ownership for an object created by `owner`.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
        }
    }

    /// Read ownership from a label map using the given owner key.
    pub fn from_labels(labels: &BTreeMap<String, String>, key: &str) -> Self {
        Self {
            owner: labels.get(key).cloned(),
        }
    }

    /// Check that `requester` may mutate this object.
    ///
    /// Objects without an owner label can only be mutated by the system.
    pub fn authorize(&self, requester: &Requester) -> Result<(), WorkerError> {
        match requester {
            Requester::System => Ok(()),
            Requester::User(address) => match &self.owner {
                Some(owner) if owner == address => Ok(()),
                _ => Err(WorkerError::unauthorized()),
            },
        }
    }
}

/// System labels for a local runtime container, merged over caller labels.
///
/// System keys always win so a caller cannot forge ownership.
pub fn container_labels(
    caller: &BTreeMap<String, String>,
    owner: &str,
    request_id: &str,
) -> BTreeMap<String, String> {
    let mut labels = caller.clone();
    labels.insert(OWNER.to_string(), owner.to_string());
    labels.insert(MANAGED.to_string(), MANAGED_VALUE.to_string());
    labels.insert(REQUEST_ID.to_string(), request_id.to_string());
    labels
}

/// Labels that must match the live container before a user kill.
pub fn required_kill_labels(requester: &Requester) -> Option<BTreeMap<String, String>> {
    requester.address().map(|address| {
        let mut required = BTreeMap::new();
        required.insert(OWNER.to_string(), address.to_string());
        required.insert(MANAGED.to_string(), MANAGED_VALUE.to_string());
        required
    })
}

/// Returns true if every required label is present with the same value.
pub fn labels_match(
    required: &BTreeMap<String, String>,
    live: &BTreeMap<String, String>,
) -> bool {
    required
        .iter()
        .all(|(key, value)| live.get(key).map(|v| v == value).unwrap_or(false))
}

/// Label selector string, e.g. `app=w123,ainConnect=yes`.
pub fn selector(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
