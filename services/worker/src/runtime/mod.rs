//! Container runtime interface.
//!
//! The runtime interface abstracts the container engine:
//! - Creating, starting, inspecting and removing containers
//! - Checking, pulling and removing images
//!
//! [`DockerClient`] talks to the Docker engine over its unix socket;
//! [`MockRuntime`] is an in-memory engine for tests and development.

mod docker;
mod mock;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::RegistryAuth;

pub use docker::DockerClient;
pub use mock::{seed_spec, MockRuntime};

/// Errors from the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("request error: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
}

impl RuntimeError {
    /// Returns true if the engine reported the object missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::Api { status: 404, .. })
    }
}

/// GPU devices attached to a container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GpuRequest {
    pub device_ids: Vec<String>,
}

/// Everything needed to create one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSpec {
    /// Container name; doubles as the container id.
    pub name: String,

    /// Image reference, normalized with a tag.
    pub image: String,

    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,

    /// Command override. Empty keeps the image default.
    pub command: Vec<String>,

    pub labels: BTreeMap<String, String>,

    /// External host port to internal container port.
    pub port_bindings: BTreeMap<u16, u16>,

    pub gpus: GpuRequest,

    /// Pinned cores, e.g. `0-1`.
    pub cpuset: String,

    /// Memory limit in bytes.
    pub memory_bytes: u64,

    /// `/dev/shm` size in bytes.
    pub shm_size: u64,

    /// Host bind mounts.
    pub binds: Vec<String>,
}

/// Runtime-reported container state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerState {
    /// Engine status string, e.g. `running` or `exited`.
    pub status: String,
    pub running: bool,
    pub exit_code: Option<i64>,
    /// Health check status, if the image defines one.
    pub health: Option<String>,
}

impl ContainerState {
    /// Returns true once the container process has stopped.
    pub fn has_exited(&self) -> bool {
        !self.running && (self.status == "exited" || self.status == "dead")
    }
}

/// Live view of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub name: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub state: ContainerState,
    /// External host ports bound.
    pub host_ports: Vec<u16>,
    /// GPU devices attached.
    pub gpu_ids: Vec<String>,
}

/// Container engine interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container. It is not started.
    async fn create_container(&self, spec: &CreateSpec) -> Result<(), RuntimeError>;

    /// Start a created container.
    async fn start_container(&self, name: &str) -> Result<(), RuntimeError>;

    /// Inspect a container. Returns `None` if it does not exist.
    async fn inspect_container(&self, name: &str)
        -> Result<Option<ContainerDetails>, RuntimeError>;

    /// Force-remove a container. Missing containers are not an error.
    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError>;

    /// Names of all containers, running or not, carrying `key=value`.
    async fn list_containers(&self, key: &str, value: &str) -> Result<Vec<String>, RuntimeError>;

    /// Returns true if the image is present locally.
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    /// Pull an image, authenticating when credentials are given.
    async fn pull_image(&self, image: &str, auth: Option<&RegistryAuth>)
        -> Result<(), RuntimeError>;

    /// Remove a local image. Missing images are not an error.
    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_exited() {
        let state = ContainerState {
            status: "exited".into(),
            running: false,
            exit_code: Some(0),
            health: None,
        };
        assert!(state.has_exited());

        let running = ContainerState {
            status: "running".into(),
            running: true,
            ..Default::default()
        };
        assert!(!running.has_exited());

        let created = ContainerState {
            status: "created".into(),
            ..Default::default()
        };
        assert!(!created.has_exited());
    }

    #[test]
    fn test_not_found() {
        let err = RuntimeError::Api {
            status: 404,
            message: "No such container".into(),
        };
        assert!(err.is_not_found());
    }
}
