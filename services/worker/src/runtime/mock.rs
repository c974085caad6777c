//! In-memory container engine for tests and development.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::{ContainerDetails, ContainerRuntime, ContainerState, CreateSpec, RuntimeError};
use crate::config::RegistryAuth;

#[derive(Debug, Clone)]
struct MockContainer {
    spec: CreateSpec,
    state: ContainerState,
}

/// Mock runtime for testing and development.
#[derive(Default)]
pub struct MockRuntime {
    containers: Mutex<HashMap<String, MockContainer>>,
    images: Mutex<BTreeSet<String>>,
    pulls: Mutex<HashMap<String, u64>>,
    removed_images: Mutex<Vec<String>>,
    created: Mutex<Vec<CreateSpec>>,
    creates: AtomicU64,
    removes: AtomicU64,

    fail_pulls: AtomicBool,
    fail_creates: AtomicBool,
    fail_starts: AtomicBool,
    pull_delay: Mutex<Option<Duration>>,
}

fn not_found(what: &str, name: &str) -> RuntimeError {
    RuntimeError::Api {
        status: 404,
        message: format!("No such {}: {}", what, name),
    }
}

fn injected(what: &str) -> RuntimeError {
    RuntimeError::Api {
        status: 500,
        message: format!("mock runtime configured to fail {}", what),
    }
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock runtime that fails all starts.
    pub fn failing() -> Self {
        let runtime = Self::new();
        runtime.set_fail_starts(true);
        runtime
    }

    pub fn set_fail_pulls(&self, fail: bool) {
        self.fail_pulls.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    /// Make every pull take this long.
    pub fn set_pull_delay(&self, delay: Duration) {
        *self.pull_delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    /// Seed a local image.
    pub fn add_image(&self, image: &str) {
        self.images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(image.to_string());
    }

    /// Seed a running container, as if left over from a previous run.
    pub fn add_running(&self, spec: CreateSpec) {
        self.add_image(&spec.image);
        let state = ContainerState {
            status: "running".to_string(),
            running: true,
            exit_code: None,
            health: None,
        };
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(spec.name.clone(), MockContainer { spec, state });
    }

    /// Simulate the container process exiting.
    pub fn exit_container(&self, name: &str, code: i64) {
        if let Some(c) = self
            .containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(name)
        {
            c.state = ContainerState {
                status: "exited".to_string(),
                running: false,
                exit_code: Some(code),
                health: None,
            };
        }
    }

    /// Number of underlying pulls of `image`.
    pub fn pull_count(&self, image: &str) -> u64 {
        self.pulls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(image)
            .copied()
            .unwrap_or(0)
    }

    /// Images currently present.
    pub fn images(&self) -> BTreeSet<String> {
        self.images.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Images removed so far, in order.
    pub fn removed_images(&self) -> Vec<String> {
        self.removed_images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Names of existing containers.
    pub fn container_names(&self) -> BTreeSet<String> {
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Spec a container was created with.
    pub fn spec_of(&self, name: &str) -> Option<CreateSpec> {
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|c| c.spec.clone())
    }

    /// Every spec a container was created from, in order, removed ones included.
    pub fn created_specs(&self) -> Vec<CreateSpec> {
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn create_count(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn remove_count(&self) -> u64 {
        self.removes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_container(&self, spec: &CreateSpec) -> Result<(), RuntimeError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(injected("creates"));
        }

        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        if containers.contains_key(&spec.name) {
            return Err(RuntimeError::Api {
                status: 409,
                message: format!("Conflict. The container name {} is already in use", spec.name),
            });
        }

        info!(container = %spec.name, image = %spec.image, "[MOCK] creating container");
        containers.insert(
            spec.name.clone(),
            MockContainer {
                spec: spec.clone(),
                state: ContainerState {
                    status: "created".to_string(),
                    ..Default::default()
                },
            },
        );
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(spec.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(injected("starts"));
        }

        let mut containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        let container = containers
            .get_mut(name)
            .ok_or_else(|| not_found("container", name))?;
        container.state.status = "running".to_string();
        container.state.running = true;
        Ok(())
    }

    async fn inspect_container(
        &self,
        name: &str,
    ) -> Result<Option<ContainerDetails>, RuntimeError> {
        let containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        Ok(containers.get(name).map(|c| ContainerDetails {
            name: c.spec.name.clone(),
            image: c.spec.image.clone(),
            labels: c.spec.labels.clone(),
            state: c.state.clone(),
            host_ports: c.spec.port_bindings.keys().copied().collect(),
            gpu_ids: c.spec.gpus.device_ids.clone(),
        }))
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        let removed = self
            .containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        if removed.is_some() {
            self.removes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn list_containers(&self, key: &str, value: &str) -> Result<Vec<String>, RuntimeError> {
        let containers = self.containers.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = containers
            .values()
            .filter(|c| c.spec.labels.get(key).map(|v| v == value).unwrap_or(false))
            .map(|c| c.spec.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        Ok(self
            .images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(image))
    }

    async fn pull_image(
        &self,
        image: &str,
        _auth: Option<&RegistryAuth>,
    ) -> Result<(), RuntimeError> {
        let delay = *self.pull_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        *self
            .pulls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(image.to_string())
            .or_default() += 1;

        if self.fail_pulls.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api {
                status: 404,
                message: format!("manifest for {} not found", image),
            });
        }

        info!(image = image, "[MOCK] pulled image");
        self.add_image(image);
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(image);
        self.removed_images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(image.to_string());
        Ok(())
    }
}

/// Build a minimal create spec, for seeding tests.
pub fn seed_spec(name: &str, image: &str, labels: BTreeMap<String, String>) -> CreateSpec {
    CreateSpec {
        name: name.to_string(),
        image: image.to_string(),
        env: Vec::new(),
        command: Vec::new(),
        labels,
        port_bindings: BTreeMap::new(),
        gpus: Default::default(),
        cpuset: "0-0".to_string(),
        memory_bytes: 0,
        shm_size: 0,
        binds: Vec::new(),
    }
}
