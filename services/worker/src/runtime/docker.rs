//! Docker engine API client.
//!
//! Speaks the engine's HTTP API over its unix socket.
//!
//! Reference: https://docs.docker.com/engine/api/v1.43/

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use hyper::{Body, Client, Method, Request, Response, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::{ContainerDetails, ContainerRuntime, ContainerState, CreateSpec, RuntimeError};
use crate::config::RegistryAuth;
use crate::image::split_image;

/// Docker engine client for unix socket communication.
pub struct DockerClient {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl DockerClient {
    /// Create a client for the given socket path.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        let socket_path = socket_path.as_ref().to_string_lossy().to_string();
        let client = Client::unix();
        Self {
            socket_path,
            client,
        }
    }

    /// Check if the socket exists.
    pub fn socket_exists(&self) -> bool {
        Path::new(&self.socket_path).exists()
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        headers: &[(&str, String)],
    ) -> Result<Response<Body>, RuntimeError> {
        let uri = Uri::new(&self.socket_path, path);

        debug!(method = %method, path = path, "request to Docker API");

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }

        let request = match body {
            Some(bytes) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(bytes))?,
            None => builder.body(Body::empty())?,
        };

        Ok(self.client.request(request).await?)
    }

    /// Send a request and fail on any status outside `ok`.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        ok: &[StatusCode],
    ) -> Result<bytes::Bytes, RuntimeError> {
        let response = self.send(method, path, body, &[]).await?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;

        if status.is_success() || ok.contains(&status) {
            Ok(bytes)
        } else {
            Err(api_error(status, &bytes))
        }
    }
}

fn api_error(status: StatusCode, body: &[u8]) -> RuntimeError {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }

    let message = serde_json::from_slice::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).to_string());

    if status != StatusCode::NOT_FOUND {
        error!(status = %status, message = %message, "Docker API error");
    }

    RuntimeError::Api {
        status: status.as_u16(),
        message,
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateBody<'a> {
    image: &'a str,
    env: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    cmd: Option<&'a [String]>,
    labels: &'a BTreeMap<String, String>,
    exposed_ports: BTreeMap<String, Empty>,
    host_config: HostConfig,
}

#[derive(Serialize)]
struct Empty {}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    cpuset_cpus: String,
    memory: u64,
    port_bindings: BTreeMap<String, Vec<PortBinding>>,
    binds: Vec<String>,
    shm_size: u64,
    device_requests: Vec<DeviceRequest>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    #[serde(default)]
    host_port: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeviceRequest {
    #[serde(default)]
    driver: String,
    #[serde(default)]
    count: i64,
    #[serde(rename = "DeviceIDs", default)]
    device_ids: Option<Vec<String>>,
    #[serde(default)]
    capabilities: Option<Vec<Vec<String>>>,
    #[serde(default)]
    options: Option<BTreeMap<String, String>>,
}

impl<'a> CreateBody<'a> {
    fn from_spec(spec: &'a CreateSpec) -> Self {
        let mut exposed_ports = BTreeMap::new();
        let mut port_bindings = BTreeMap::new();
        for (external, internal) in &spec.port_bindings {
            let key = format!("{}/tcp", internal);
            exposed_ports.insert(key.clone(), Empty {});
            port_bindings.insert(
                key,
                vec![PortBinding {
                    host_port: external.to_string(),
                }],
            );
        }

        let device_requests = if spec.gpus.device_ids.is_empty() {
            Vec::new()
        } else {
            vec![DeviceRequest {
                driver: String::new(),
                count: 0,
                device_ids: Some(spec.gpus.device_ids.clone()),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                options: Some(BTreeMap::new()),
            }]
        };

        Self {
            image: &spec.image,
            env: &spec.env,
            cmd: (!spec.command.is_empty()).then_some(spec.command.as_slice()),
            labels: &spec.labels,
            exposed_ports,
            host_config: HostConfig {
                cpuset_cpus: spec.cpuset.clone(),
                memory: spec.memory_bytes,
                port_bindings,
                binds: spec.binds.clone(),
                shm_size: spec.shm_size,
                device_requests,
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectResponse {
    name: String,
    config: InspectConfig,
    state: InspectState,
    #[serde(default)]
    host_config: InspectHostConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    running: bool,
    #[serde(default)]
    exit_code: Option<i64>,
    #[serde(default)]
    health: Option<InspectHealth>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHealth {
    status: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct InspectHostConfig {
    #[serde(default)]
    port_bindings: Option<BTreeMap<String, Option<Vec<PortBinding>>>>,
    #[serde(default)]
    device_requests: Option<Vec<DeviceRequest>>,
}

impl From<InspectResponse> for ContainerDetails {
    fn from(raw: InspectResponse) -> Self {
        let host_ports = raw
            .host_config
            .port_bindings
            .unwrap_or_default()
            .into_values()
            .flatten()
            .flatten()
            .filter_map(|b| b.host_port.parse().ok())
            .collect();

        let gpu_ids = raw
            .host_config
            .device_requests
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|r| r.device_ids)
            .unwrap_or_default();

        ContainerDetails {
            name: raw.name.trim_start_matches('/').to_string(),
            image: raw.config.image,
            labels: raw.config.labels.unwrap_or_default(),
            state: ContainerState {
                status: raw.state.status,
                running: raw.state.running,
                exit_code: raw.state.exit_code,
                health: raw.state.health.map(|h| h.status),
            },
            host_ports,
            gpu_ids,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Serialize)]
struct AuthConfig<'a> {
    username: &'a str,
    password: &'a str,
    serveraddress: &'a str,
}

/// Encode registry credentials for the `X-Registry-Auth` header.
fn registry_auth_header(auth: &RegistryAuth) -> Result<String, RuntimeError> {
    let json = serde_json::to_vec(&AuthConfig {
        username: &auth.username,
        password: &auth.password,
        serveraddress: &auth.server,
    })?;
    Ok(base64::engine::general_purpose::URL_SAFE.encode(json))
}

/// First error reported in a pull progress stream, if any.
fn pull_stream_error(body: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct Progress {
        #[serde(default)]
        error: Option<String>,
    }

    body.split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_slice::<Progress>(line).ok())
        .find_map(|p| p.error)
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn create_container(&self, spec: &CreateSpec) -> Result<(), RuntimeError> {
        let body = serde_json::to_vec(&CreateBody::from_spec(spec))?;
        let path = format!("/containers/create?name={}", spec.name);
        self.call(Method::POST, &path, Some(body), &[]).await?;
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        let path = format!("/containers/{}/start", name);
        self.call(Method::POST, &path, None, &[StatusCode::NOT_MODIFIED])
            .await?;
        Ok(())
    }

    async fn inspect_container(
        &self,
        name: &str,
    ) -> Result<Option<ContainerDetails>, RuntimeError> {
        let path = format!("/containers/{}/json", name);
        match self.call(Method::GET, &path, None, &[]).await {
            Ok(bytes) => {
                let raw: InspectResponse = serde_json::from_slice(&bytes)?;
                Ok(Some(raw.into()))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        let path = format!("/containers/{}?force=true", name);
        match self.call(Method::DELETE, &path, None, &[]).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!(container = name, "container already removed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_containers(&self, key: &str, value: &str) -> Result<Vec<String>, RuntimeError> {
        let bytes = self
            .call(Method::GET, "/containers/json?all=true", None, &[])
            .await?;
        let entries: Vec<ListEntry> = serde_json::from_slice(&bytes)?;

        Ok(entries
            .into_iter()
            .filter(|e| {
                e.labels
                    .as_ref()
                    .and_then(|l| l.get(key))
                    .map(|v| v == value)
                    .unwrap_or(false)
            })
            .filter_map(|e| e.names.into_iter().next())
            .map(|n| n.trim_start_matches('/').to_string())
            .collect())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        let path = format!("/images/{}/json", image);
        match self.call(Method::GET, &path, None, &[]).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn pull_image(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<(), RuntimeError> {
        let (repo, tag) = split_image(image);
        let path = format!("/images/create?fromImage={}&tag={}", repo, tag);

        let mut headers = Vec::new();
        if let Some(auth) = auth {
            headers.push(("X-Registry-Auth", registry_auth_header(auth)?));
        }

        let response = self.send(Method::POST, &path, None, &headers).await?;
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await?;

        if !status.is_success() {
            return Err(api_error(status, &bytes));
        }

        // The engine answers 200 and reports failures inside the progress stream.
        if let Some(message) = pull_stream_error(&bytes) {
            return Err(RuntimeError::Api {
                status: status.as_u16(),
                message,
            });
        }

        debug!(image = image, "image pulled");
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        let path = format!("/images/{}", image);
        match self.call(Method::DELETE, &path, None, &[]).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::GpuRequest;
    use serde_json::json;

    fn spec() -> CreateSpec {
        let mut labels = BTreeMap::new();
        labels.insert("connect.owner".to_string(), "0xabc".to_string());
        let mut port_bindings = BTreeMap::new();
        port_bindings.insert(8000, 80);

        CreateSpec {
            name: "rabc".to_string(),
            image: "nginx:latest".to_string(),
            env: vec!["A=1".to_string()],
            command: vec![],
            labels,
            port_bindings,
            gpus: GpuRequest {
                device_ids: vec!["0".to_string(), "1".to_string()],
            },
            cpuset: "0-1".to_string(),
            memory_bytes: 1024,
            shm_size: 4_294_967_296,
            binds: vec![],
        }
    }

    #[test]
    fn test_create_body_shape() {
        let spec = spec();
        let value = serde_json::to_value(CreateBody::from_spec(&spec)).unwrap();

        assert_eq!(value["Image"], "nginx:latest");
        assert!(value.get("Cmd").is_none());
        assert_eq!(value["ExposedPorts"], json!({ "80/tcp": {} }));
        assert_eq!(
            value["HostConfig"]["PortBindings"],
            json!({ "80/tcp": [{ "HostPort": "8000" }] })
        );
        assert_eq!(value["HostConfig"]["CpusetCpus"], "0-1");
        assert_eq!(value["HostConfig"]["ShmSize"], 4_294_967_296u64);
        assert_eq!(
            value["HostConfig"]["DeviceRequests"],
            json!([{
                "Driver": "",
                "Count": 0,
                "DeviceIDs": ["0", "1"],
                "Capabilities": [["gpu"]],
                "Options": {}
            }])
        );
    }

    #[test]
    fn test_create_body_without_gpus() {
        let mut spec = spec();
        spec.gpus = GpuRequest::default();
        spec.command = vec!["sleep".into(), "1".into()];
        let value = serde_json::to_value(CreateBody::from_spec(&spec)).unwrap();
        assert_eq!(value["HostConfig"]["DeviceRequests"], json!([]));
        assert_eq!(value["Cmd"], json!(["sleep", "1"]));
    }

    #[test]
    fn test_inspect_conversion() {
        let raw: InspectResponse = serde_json::from_value(json!({
            "Name": "/rabc",
            "Config": { "Image": "nginx:latest", "Labels": { "a": "b" } },
            "State": {
                "Status": "exited",
                "Running": false,
                "ExitCode": 137,
                "Health": { "Status": "unhealthy" }
            },
            "HostConfig": {
                "PortBindings": { "80/tcp": [{ "HostIp": "", "HostPort": "8000" }] },
                "DeviceRequests": [{ "Driver": "", "Count": 0, "DeviceIDs": ["1"] }]
            }
        }))
        .unwrap();

        let details: ContainerDetails = raw.into();
        assert_eq!(details.name, "rabc");
        assert_eq!(details.host_ports, vec![8000]);
        assert_eq!(details.gpu_ids, vec!["1"]);
        assert_eq!(details.state.exit_code, Some(137));
        assert_eq!(details.state.health.as_deref(), Some("unhealthy"));
        assert!(details.state.has_exited());
    }

    #[test]
    fn test_pull_stream_error() {
        let body = b"{\"status\":\"Pulling from library/x\"}\n{\"error\":\"manifest unknown\"}\n";
        assert_eq!(pull_stream_error(body).as_deref(), Some("manifest unknown"));
        assert_eq!(pull_stream_error(b"{\"status\":\"Done\"}\n"), None);
    }

    #[test]
    fn test_registry_auth_header_is_base64_json() {
        let auth = RegistryAuth {
            username: "u".into(),
            password: "p".into(),
            server: "registry.example.com".into(),
        };
        let header = registry_auth_header(&auth).unwrap();
        let decoded = base64::engine::general_purpose::URL_SAFE
            .decode(header)
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["serveraddress"], "registry.example.com");
    }
}
