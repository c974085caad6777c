//! Kubernetes API access.
//!
//! The worker talks to the cluster through the [`ClusterApi`] trait, which
//! covers the handful of verbs the reconciler and the watcher need over raw
//! JSON objects. [`KubeClient`] speaks the REST API with `reqwest`;
//! [`MockCluster`] keeps objects in memory for tests.

mod client;
mod mock;
pub mod pod;
pub mod template;

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

pub use client::KubeClient;
pub use mock::MockCluster;

/// Annotation holding the last manifest this worker applied.
pub const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Errors from the Kubernetes API.
#[derive(Debug, Error)]
pub enum KubeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {status} ({reason}): {message}")]
    Api {
        status: u16,
        reason: String,
        message: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KubeError {
    /// Returns true if the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, KubeError::Api { status: 404, .. })
    }

    /// Returns true if a watch resource version has expired.
    pub fn is_gone(&self) -> bool {
        matches!(self, KubeError::Api { status: 410, .. })
    }
}

/// Object kinds the worker manages or reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Namespace,
    Deployment,
    Service,
    VirtualService,
    Gateway,
    Pod,
    Node,
    PersistentVolume,
    PersistentVolumeClaim,
    Secret,
    NetworkPolicy,
}

impl ResourceKind {
    /// `apiVersion` of the kind.
    pub fn api_version(self) -> &'static str {
        match self {
            ResourceKind::Deployment => "apps/v1",
            ResourceKind::VirtualService | ResourceKind::Gateway => "networking.istio.io/v1beta1",
            ResourceKind::NetworkPolicy => "networking.k8s.io/v1",
            _ => "v1",
        }
    }

    /// `kind` as written in manifests.
    pub fn kind(self) -> &'static str {
        match self {
            ResourceKind::Namespace => "Namespace",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::Service => "Service",
            ResourceKind::VirtualService => "VirtualService",
            ResourceKind::Gateway => "Gateway",
            ResourceKind::Pod => "Pod",
            ResourceKind::Node => "Node",
            ResourceKind::PersistentVolume => "PersistentVolume",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::Secret => "Secret",
            ResourceKind::NetworkPolicy => "NetworkPolicy",
        }
    }

    fn plural(self) -> &'static str {
        match self {
            ResourceKind::Namespace => "namespaces",
            ResourceKind::Deployment => "deployments",
            ResourceKind::Service => "services",
            ResourceKind::VirtualService => "virtualservices",
            ResourceKind::Gateway => "gateways",
            ResourceKind::Pod => "pods",
            ResourceKind::Node => "nodes",
            ResourceKind::PersistentVolume => "persistentvolumes",
            ResourceKind::PersistentVolumeClaim => "persistentvolumeclaims",
            ResourceKind::Secret => "secrets",
            ResourceKind::NetworkPolicy => "networkpolicies",
        }
    }

    /// Returns true if objects of this kind live in a namespace.
    pub fn namespaced(self) -> bool {
        !matches!(
            self,
            ResourceKind::Namespace | ResourceKind::Node | ResourceKind::PersistentVolume
        )
    }

    /// REST path for a collection or, with `name`, one object.
    ///
    /// A namespaced kind without a namespace addresses every namespace.
    pub fn path(self, namespace: Option<&str>, name: Option<&str>) -> String {
        let group = match self.api_version() {
            "v1" => "/api/v1".to_string(),
            other => format!("/apis/{}", other),
        };
        let mut path = match namespace {
            Some(ns) if self.namespaced() => {
                format!("{}/namespaces/{}/{}", group, ns, self.plural())
            }
            _ => format!("{}/{}", group, self.plural()),
        };
        if let Some(name) = name {
            path.push('/');
            path.push_str(name);
        }
        path
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

/// A patch body.
#[derive(Debug, Clone, PartialEq)]
pub enum Patch {
    /// RFC 7386 merge patch.
    Merge(Value),
    /// RFC 6902 JSON patch (an array of operations).
    Json(Value),
}

impl Patch {
    pub fn content_type(&self) -> &'static str {
        match self {
            Patch::Merge(_) => "application/merge-patch+json",
            Patch::Json(_) => "application/json-patch+json",
        }
    }

    pub fn body(&self) -> &Value {
        match self {
            Patch::Merge(body) | Patch::Json(body) => body,
        }
    }
}

/// Result of a list call.
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    /// Collection resource version, used to resume a watch.
    pub resource_version: Option<String>,
    pub items: Vec<Value>,
}

/// One event from a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    /// Progress marker carrying only a resource version.
    Bookmark(String),
    /// The server ended the watch with a status, e.g. 410 Gone.
    Error { code: u16, message: String },
}

impl WatchEvent {
    /// Parse one line of a watch response.
    pub fn from_line(line: &[u8]) -> Result<WatchEvent, KubeError> {
        #[derive(serde::Deserialize)]
        struct RawEvent {
            #[serde(rename = "type")]
            event_type: String,
            #[serde(default)]
            object: Value,
        }

        let raw: RawEvent = serde_json::from_slice(line)?;
        let event = match raw.event_type.as_str() {
            "ADDED" => WatchEvent::Added(raw.object),
            "MODIFIED" => WatchEvent::Modified(raw.object),
            "DELETED" => WatchEvent::Deleted(raw.object),
            "BOOKMARK" => WatchEvent::Bookmark(resource_version(&raw.object).unwrap_or_default()),
            _ => WatchEvent::Error {
                code: raw.object["code"].as_u64().unwrap_or(500) as u16,
                message: raw.object["message"].as_str().unwrap_or_default().to_string(),
            },
        };
        Ok(event)
    }

    /// The object carried by the event, if any.
    pub fn object(&self) -> Option<&Value> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => Some(o),
            WatchEvent::Bookmark(_) | WatchEvent::Error { .. } => None,
        }
    }
}

/// Stream of watch events.
pub type WatchStream = BoxStream<'static, Result<WatchEvent, KubeError>>;

/// Cluster API verbs used by the worker.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Read one object. Returns `None` if it does not exist.
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>, KubeError>;

    /// Create an object from a manifest.
    async fn create(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        object: &Value,
    ) -> Result<Value, KubeError>;

    /// Patch an existing object.
    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        patch: &Patch,
    ) -> Result<Value, KubeError>;

    /// Delete an object. Returns `false` if it did not exist.
    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool, KubeError>;

    /// Delete every object of `kind` in `namespace` matching `selector`.
    async fn delete_collection(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &str,
    ) -> Result<(), KubeError>;

    /// List objects, optionally filtered by namespace and label selector.
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<ObjectList, KubeError>;

    /// Watch every object of `kind`, resuming after `resource_version`.
    async fn watch(
        &self,
        kind: ResourceKind,
        resource_version: Option<&str>,
    ) -> Result<WatchStream, KubeError>;

    /// Read a pod's log with timestamps.
    async fn logs(
        &self,
        namespace: &str,
        pod: &str,
        since_seconds: Option<i64>,
    ) -> Result<String, KubeError>;
}

/// What [`apply`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Patched,
}

/// Create the object, or merge-patch it if it already exists.
///
/// The manifest is recorded in the last-applied annotation either way.
pub async fn apply(
    api: &dyn ClusterApi,
    kind: ResourceKind,
    namespace: Option<&str>,
    manifest: Value,
) -> Result<Applied, KubeError> {
    let manifest = template::with_last_applied(manifest);
    let name = object_name(&manifest)
        .ok_or_else(|| KubeError::Config(format!("{} manifest without a name", kind)))?
        .to_string();

    if api.get(kind, namespace, &name).await?.is_some() {
        api.patch(kind, namespace, &name, &Patch::Merge(manifest))
            .await?;
        Ok(Applied::Patched)
    } else {
        api.create(kind, namespace, &manifest).await?;
        Ok(Applied::Created)
    }
}

/// `metadata.name` of an object.
pub fn object_name(object: &Value) -> Option<&str> {
    object["metadata"]["name"].as_str()
}

/// `metadata.namespace` of an object.
pub fn object_namespace(object: &Value) -> Option<&str> {
    object["metadata"]["namespace"].as_str()
}

/// `metadata.resourceVersion` of an object.
pub fn resource_version(object: &Value) -> Option<String> {
    object["metadata"]["resourceVersion"]
        .as_str()
        .map(str::to_string)
}

/// `metadata.labels` of an object as a string map.
pub fn object_labels(object: &Value) -> BTreeMap<String, String> {
    object["metadata"]["labels"]
        .as_object()
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}
