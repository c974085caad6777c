//! Configuration for the worker.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::resources::parse_port_list;

/// Which backend this worker drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Local Docker engine.
    Docker,
    /// A Kubernetes cluster.
    Kubernetes,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(Backend::Docker),
            "kubernetes" | "k8s" => Ok(Backend::Kubernetes),
            other => bail!("unknown backend '{}'", other),
        }
    }
}

/// How strictly namespace ownership is checked on create-style requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OwnershipMode {
    /// Check the namespace owner before deploy and createStorage.
    #[default]
    Strict,
    /// Only check ownership of existing objects being changed.
    Lenient,
}

impl FromStr for OwnershipMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(OwnershipMode::Strict),
            "lenient" => Ok(OwnershipMode::Lenient),
            other => bail!("unknown ownership mode '{}'", other),
        }
    }
}

/// Private registry credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub server: String,
}

/// Local runtime settings.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Docker engine socket.
    pub socket_path: String,

    /// External ports containers may publish.
    pub allow_ports: Vec<u16>,

    /// GPU device ids available to containers.
    pub gpu_devices: Vec<String>,

    /// Maximum concurrently running containers.
    pub max_containers: usize,

    /// vCPUs pinned per container.
    pub vcpu: u32,

    /// Memory limit per container in GB.
    pub memory_gb: u32,

    /// GPUs attached per container.
    pub gpu_per_container: u32,

    /// Public address used to build container endpoints.
    pub node_port_ip: Option<String>,

    /// Host directory shared with containers. Each container gets
    /// `<shared_path>/<request id>` mounted and may leave a `log.json` there.
    pub shared_path: Option<String>,
}

impl DockerConfig {
    /// Distinct images kept before unreferenced ones are evicted.
    pub fn max_images(&self) -> usize {
        self.max_containers + 2
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: "/var/run/docker.sock".to_string(),
            allow_ports: Vec::new(),
            gpu_devices: Vec::new(),
            max_containers: 1,
            vcpu: 1,
            memory_gb: 4,
            gpu_per_container: 0,
            node_port_ip: None,
            shared_path: None,
        }
    }
}

/// Kubernetes settings.
#[derive(Debug, Clone)]
pub struct KubeConfig {
    /// API server URL.
    pub api_url: String,

    /// Service account token file.
    pub token_path: String,

    /// Cluster CA bundle.
    pub ca_path: String,

    /// Ingress gateway name. `None` selects NodePort services.
    pub gateway_name: Option<String>,

    /// Namespace holding the gateway.
    pub gateway_namespace: String,

    /// Storage class for non-NFS claims.
    pub storage_class: Option<String>,

    /// Namespace ownership strictness.
    pub ownership_mode: OwnershipMode,

    /// Public address used for NodePort endpoints.
    pub node_port_ip: Option<String>,
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            api_url: "https://kubernetes.default.svc".to_string(),
            token_path: "/var/run/secrets/kubernetes.io/serviceaccount/token".to_string(),
            ca_path: "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt".to_string(),
            gateway_name: Some("worker-gw".to_string()),
            gateway_namespace: "istio-system".to_string(),
            storage_class: None,
            ownership_mode: OwnershipMode::Strict,
            node_port_ip: None,
        }
    }
}

/// Loop timings.
#[derive(Debug, Clone)]
pub struct Intervals {
    /// Request queue poll.
    pub queue: Duration,
    /// Local status push and exit reaping.
    pub status: Duration,
    /// Node pool capacity recompute.
    pub capacity: Duration,
    /// Cluster health push.
    pub health: Duration,
    /// Watch supervisor check.
    pub watch_supervise: Duration,
    /// Watch restarts after this long without an event.
    pub watch_idle_timeout: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            queue: Duration::from_secs(5),
            status: Duration::from_secs(5),
            capacity: Duration::from_secs(30),
            health: Duration::from_secs(5),
            watch_supervise: Duration::from_secs(15),
            watch_idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name reported to the control plane.
    pub cluster_name: String,

    /// Control plane API URL.
    pub control_plane_url: String,

    /// Selected backend.
    pub backend: Backend,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Private registry credentials, if all three parts are set.
    pub registry: Option<RegistryAuth>,

    pub docker: DockerConfig,

    pub kube: KubeConfig,

    pub intervals: Intervals,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let cluster_name = env_or("CONNECT_CLUSTER_NAME", "connect-worker");

        let control_plane_url = env_or("CONNECT_CONTROL_PLANE_URL", "http://127.0.0.1:8080");

        let backend = env_or("CONNECT_BACKEND", "docker")
            .parse()
            .context("CONNECT_BACKEND")?;

        let log_level = env_or("CONNECT_LOG_LEVEL", "info");

        let registry = match (
            env_opt("CONNECT_REGISTRY_USERNAME"),
            env_opt("CONNECT_REGISTRY_PASSWORD"),
            env_opt("CONNECT_REGISTRY_SERVER"),
        ) {
            (Some(username), Some(password), Some(server)) => Some(RegistryAuth {
                username,
                password,
                server,
            }),
            _ => None,
        };

        let node_port_ip = env_opt("CONNECT_NODE_PORT_IP");

        let defaults = DockerConfig::default();
        let docker = DockerConfig {
            socket_path: env_or("CONNECT_DOCKER_SOCKET", &defaults.socket_path),
            allow_ports: parse_port_list(&env_or("CONNECT_CONTAINER_ALLOW_PORT", ""))
                .context("CONNECT_CONTAINER_ALLOW_PORT")?,
            gpu_devices: env_or("CONNECT_GPU_DEVICE_NUMBER", "")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            max_containers: env_parse("CONNECT_CONTAINER_MAX_CNT", defaults.max_containers)?,
            vcpu: env_parse("CONNECT_CONTAINER_VCPU", defaults.vcpu)?,
            memory_gb: env_parse("CONNECT_CONTAINER_MEMORY_GB", defaults.memory_gb)?,
            gpu_per_container: env_parse("CONNECT_CONTAINER_GPU_CNT", defaults.gpu_per_container)?,
            node_port_ip: node_port_ip.clone(),
            shared_path: env_opt("CONNECT_SHARED_PATH"),
        };

        let defaults = KubeConfig::default();
        let gateway_name = match std::env::var("CONNECT_GATEWAY_NAME") {
            Ok(name) if name.trim().is_empty() => None,
            Ok(name) => Some(name),
            Err(_) => defaults.gateway_name.clone(),
        };
        let kube = KubeConfig {
            api_url: env_or("CONNECT_K8S_API_URL", &defaults.api_url),
            token_path: env_or("CONNECT_K8S_TOKEN_PATH", &defaults.token_path),
            ca_path: env_or("CONNECT_K8S_CA_PATH", &defaults.ca_path),
            gateway_name,
            gateway_namespace: defaults.gateway_namespace,
            storage_class: env_opt("CONNECT_STORAGE_CLASS"),
            ownership_mode: env_or("CONNECT_OWNERSHIP_MODE", "strict")
                .parse()
                .context("CONNECT_OWNERSHIP_MODE")?,
            node_port_ip,
        };

        let defaults = Intervals::default();
        let intervals = Intervals {
            queue: env_secs("CONNECT_QUEUE_INTERVAL", defaults.queue)?,
            status: env_secs("CONNECT_STATUS_INTERVAL", defaults.status)?,
            capacity: env_secs("CONNECT_CAPACITY_INTERVAL", defaults.capacity)?,
            health: env_secs("CONNECT_HEALTH_INTERVAL", defaults.health)?,
            watch_supervise: env_secs(
                "CONNECT_WATCH_SUPERVISE_INTERVAL",
                defaults.watch_supervise,
            )?,
            watch_idle_timeout: env_secs("CONNECT_WATCH_IDLE_TIMEOUT", defaults.watch_idle_timeout)?,
        };

        Ok(Self {
            cluster_name,
            control_plane_url,
            backend,
            log_level,
            registry,
            docker,
            kube,
            intervals,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_opt(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has invalid value '{}'", key, raw)),
        None => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}
