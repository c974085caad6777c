//! Manifest builders for workspace, namespace and storage objects.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use connect_id::StorageId;
use connect_protocol::{ContainerInfo, NfsInfo, RedeployOption, StorageMount};
use serde_json::{json, Map, Value};

use super::LAST_APPLIED_ANNOTATION;
use crate::config::RegistryAuth;
use crate::labels;

/// Name of the registry pull secret created in every namespace.
pub const DOCKER_SECRET_NAME: &str = "docker-secret";

/// Name of the namespace network policy.
pub const NETWORK_POLICY_NAME: &str = "worker";

const TEMPLATE_VERSION: &str = "3";

/// Record the manifest in its own last-applied annotation.
pub fn with_last_applied(mut manifest: Value) -> Value {
    if let Some(metadata) = manifest["metadata"].as_object_mut() {
        if let Some(Value::Object(annotations)) = metadata.get_mut("annotations") {
            annotations.remove(LAST_APPLIED_ANNOTATION);
            if annotations.is_empty() {
                metadata.remove("annotations");
            }
        }
    }
    let applied = manifest.to_string();
    manifest["metadata"]["annotations"][LAST_APPLIED_ANNOTATION] = Value::String(applied);
    manifest
}

fn string_map(map: &BTreeMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<Map<_, _>>(),
    )
}

fn env_list(env: &BTreeMap<String, String>) -> Value {
    Value::Array(
        env.iter()
            .map(|(name, value)| json!({"name": name, "value": value}))
            .collect(),
    )
}

fn storage_volume(id: &StorageId, mount: &StorageMount) -> Value {
    json!({
        "name": id.as_str(),
        "persistentVolumeClaim": {"claimName": id.as_str(), "readOnly": mount.read_only}
    })
}

fn storage_mount(id: &StorageId, mount: &StorageMount) -> Value {
    let mut volume_mount = json!({
        "name": id.as_str(),
        "mountPath": mount.mount_path,
        "readOnly": mount.read_only,
    });
    if let Some(sub_path) = &mount.sub_path {
        volume_mount["subPath"] = json!(sub_path);
    }
    volume_mount
}

// =============================================================================
// Namespace
// =============================================================================

/// Namespace owned by `owner`.
pub fn namespace(name: &str, owner: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {"name": name, "labels": {labels::K8S_OWNER: owner}}
    })
}

/// Image pull secret for a private registry.
pub fn docker_secret(namespace: &str, auth: &RegistryAuth) -> Value {
    let token = STANDARD.encode(format!("{}:{}", auth.username, auth.password));
    let config = json!({
        "auths": {
            auth.server.as_str(): {
                "username": auth.username,
                "password": auth.password,
                "server": auth.server,
                "auth": token,
            }
        }
    });

    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "kubernetes.io/dockerconfigjson",
        "metadata": {"name": DOCKER_SECRET_NAME, "namespace": namespace},
        "data": {".dockerconfigjson": STANDARD.encode(config.to_string())}
    })
}

/// Policy admitting workspace ingress only from the gateway namespace and
/// pods explicitly labelled for it.
pub fn network_policy(namespace: &str) -> Value {
    json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": {"name": NETWORK_POLICY_NAME, "namespace": namespace},
        "spec": {
            "podSelector": {"matchLabels": {labels::K8S_MANAGED: labels::K8S_MANAGED_VALUE}},
            "policyTypes": ["Ingress"],
            "ingress": [{
                "from": [
                    {"podSelector": {"matchLabels": {"block": "block"}}},
                    {"namespaceSelector": {"matchLabels": {labels::GATEWAY_NAMESPACE_LABEL: "yes"}}}
                ]
            }]
        }
    })
}

// =============================================================================
// Workspace
// =============================================================================

/// Inputs for a workspace deployment.
#[derive(Debug, Clone)]
pub struct WorkspaceManifest<'a> {
    pub id: &'a str,
    pub namespace: &'a str,
    pub owner: &'a str,
    pub info: &'a ContainerInfo,
    /// Auto-sleep deadline in epoch milliseconds.
    pub sleep_at: Option<i64>,
    pub pull_secret: Option<&'a str>,
}

impl WorkspaceManifest<'_> {
    /// Labels carried by the deployment and its pods.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::from([
            (labels::APP.to_string(), self.id.to_string()),
            (
                labels::K8S_MANAGED.to_string(),
                labels::K8S_MANAGED_VALUE.to_string(),
            ),
            (labels::K8S_OWNER.to_string(), self.owner.to_string()),
        ]);
        if let Some(at) = self.sleep_at {
            map.insert(labels::SLEEP_TIME.to_string(), at.to_string());
        }
        map
    }
}

/// Deployment running the workspace container.
pub fn deployment(manifest: &WorkspaceManifest<'_>) -> Value {
    let info = manifest.info;
    let object_labels = string_map(&manifest.labels());

    let mut resources = json!({
        "cpu": format!("{}m", info.hw_spec.cpu),
        "memory": format!("{}Mi", info.hw_spec.memory),
    });
    if info.hw_spec.gpu > 0 {
        resources["nvidia.com/gpu"] = json!(info.hw_spec.gpu.to_string());
    }

    let mut volumes: Vec<Value> = info
        .storage_spec
        .iter()
        .map(|(id, mount)| storage_volume(id, mount))
        .collect();
    let mut mounts: Vec<Value> = info
        .storage_spec
        .iter()
        .map(|(id, mount)| storage_mount(id, mount))
        .collect();
    for (secret, mount) in &info.secret_spec {
        volumes.push(json!({"name": secret, "secret": {"secretName": secret, "defaultMode": 256}}));
        mounts.push(json!({"name": secret, "mountPath": mount.mount_path, "readOnly": true}));
    }

    let ports: Vec<Value> = info
        .port
        .iter()
        .map(|port| json!({"containerPort": port}))
        .collect();

    let mut pod_spec = json!({
        "containers": [{
            "name": manifest.id,
            "image": info.image_name,
            "ports": ports,
            "env": env_list(&info.env),
            "resources": {"requests": resources.clone(), "limits": resources},
            "volumeMounts": mounts,
            "securityContext": {"privileged": false}
        }],
        "volumes": volumes
    });
    if let Some(pool) = &info.node_pool_name {
        pod_spec["nodeSelector"] = json!({labels::NODE_POOL: pool});
    }
    if let Some(secret) = manifest.pull_secret {
        pod_spec["imagePullSecrets"] = json!([{"name": secret}]);
    }

    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": manifest.id, "namespace": manifest.namespace, "labels": object_labels},
        "spec": {
            "replicas": info.replicas.unwrap_or(1),
            "selector": {"matchLabels": {labels::APP: manifest.id}},
            "template": {
                "metadata": {"labels": object_labels},
                "spec": pod_spec
            }
        }
    })
}

/// Service in front of the workspace pods.
///
/// With `node_port` the service is exposed on every node instead of behind
/// the gateway.
pub fn service(id: &str, namespace: &str, ports: &[u16], node_port: bool) -> Value {
    let ports: Vec<Value> = ports
        .iter()
        .map(|port| json!({"name": format!("port-{}", port), "port": port, "targetPort": port}))
        .collect();

    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": id,
            "namespace": namespace,
            "labels": {labels::APP: id, "templateVersion": TEMPLATE_VERSION}
        },
        "spec": {
            "type": if node_port { "NodePort" } else { "ClusterIP" },
            "selector": {labels::APP: id},
            "ports": ports
        }
    })
}

/// Gateway route name for one workspace port.
pub fn virtual_service_name(id: &str, port: u16) -> String {
    format!("{}{}", id, port)
}

/// Gateway route sending `host` to one workspace port.
pub fn virtual_service(id: &str, namespace: &str, port: u16, host: &str, gateway: &str) -> Value {
    json!({
        "apiVersion": "networking.istio.io/v1beta1",
        "kind": "VirtualService",
        "metadata": {
            "name": virtual_service_name(id, port),
            "namespace": namespace,
            "labels": {labels::APP: id, "templateVersion": TEMPLATE_VERSION}
        },
        "spec": {
            "hosts": [host],
            "gateways": [gateway],
            "http": [{
                "route": [{
                    "destination": {
                        "host": format!("{}.{}.svc.cluster.local", id, namespace),
                        "port": {"number": port}
                    }
                }]
            }]
        }
    })
}

/// JSON patch operations for a redeploy, in apply order.
///
/// Storage replaces every claim volume; other volumes on `current` (secrets)
/// are kept.
pub fn redeploy_patch(option: &RedeployOption, current: &Value) -> Vec<Value> {
    let mut ops = Vec::new();

    if let Some(replicas) = option.replicas {
        ops.push(json!({"op": "replace", "path": "/spec/replicas", "value": replicas}));
    }
    if let Some(image) = &option.image_name {
        ops.push(json!({
            "op": "replace",
            "path": "/spec/template/spec/containers/0/image",
            "value": image
        }));
    }
    if let Some(storage) = &option.storage_spec {
        let pod_spec = &current["spec"]["template"]["spec"];
        let kept_volumes: Vec<Value> = pod_spec["volumes"]
            .as_array()
            .map(|volumes| {
                volumes
                    .iter()
                    .filter(|v| v.get("persistentVolumeClaim").is_none())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let kept_names: Vec<&str> = kept_volumes
            .iter()
            .filter_map(|v| v["name"].as_str())
            .collect();
        let kept_mounts: Vec<Value> = pod_spec["containers"][0]["volumeMounts"]
            .as_array()
            .map(|mounts| {
                mounts
                    .iter()
                    .filter(|m| {
                        m["name"]
                            .as_str()
                            .map(|name| kept_names.contains(&name))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let volumes: Vec<Value> = storage
            .iter()
            .map(|(id, mount)| storage_volume(id, mount))
            .chain(kept_volumes.iter().cloned())
            .collect();
        let mounts: Vec<Value> = storage
            .iter()
            .map(|(id, mount)| storage_mount(id, mount))
            .chain(kept_mounts)
            .collect();

        ops.push(json!({"op": "add", "path": "/spec/template/spec/volumes", "value": volumes}));
        ops.push(json!({
            "op": "add",
            "path": "/spec/template/spec/containers/0/volumeMounts",
            "value": mounts
        }));
    }
    if let Some(env) = &option.env {
        ops.push(json!({
            "op": "add",
            "path": "/spec/template/spec/containers/0/env",
            "value": env_list(env)
        }));
    }

    ops
}

// =============================================================================
// Storage
// =============================================================================

/// NFS-backed volume for one storage id.
pub fn persistent_volume(id: &str, capacity_gib: u32, nfs: &NfsInfo) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "PersistentVolume",
        "metadata": {
            "name": id,
            "labels": {
                labels::K8S_MANAGED: labels::K8S_MANAGED_VALUE,
                labels::APP: id,
                labels::NFS: "true"
            }
        },
        "spec": {
            "capacity": {"storage": format!("{}Gi", capacity_gib)},
            "accessModes": ["ReadWriteMany"],
            "persistentVolumeReclaimPolicy": "Retain",
            "storageClassName": id,
            "nfs": {"server": nfs.server, "path": nfs.path}
        }
    })
}

/// Claim for one storage id.
pub fn persistent_volume_claim(
    id: &str,
    namespace: &str,
    owner: &str,
    capacity_gib: u32,
    storage_class: Option<&str>,
) -> Value {
    let mut claim = json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": id,
            "namespace": namespace,
            "labels": {
                labels::K8S_MANAGED: labels::K8S_MANAGED_VALUE,
                labels::K8S_OWNER: owner,
                labels::APP: id
            }
        },
        "spec": {
            "accessModes": ["ReadWriteMany"],
            "resources": {"requests": {"storage": format!("{}Gi", capacity_gib)}}
        }
    });
    if let Some(class) = storage_class.filter(|c| !c.is_empty()) {
        claim["spec"]["storageClassName"] = json!(class);
    }
    claim
}

#[cfg(test)]
mod tests {
    use super::*;
    use connect_protocol::{HwSpec, SecretMount};

    fn info() -> ContainerInfo {
        ContainerInfo {
            image_name: "jupyter/base:1".to_string(),
            node_pool_name: Some("gpu-pool".to_string()),
            hw_spec: HwSpec {
                cpu: 500,
                memory: 1024,
                gpu: 1,
            },
            port: vec![8888, 22],
            env: BTreeMap::from([("MODE".to_string(), "lab".to_string())]),
            storage_spec: BTreeMap::from([(
                StorageId::parse("w000000000000000000000001").unwrap(),
                StorageMount {
                    mount_path: "/data".to_string(),
                    read_only: false,
                    sub_path: None,
                },
            )]),
            secret_spec: BTreeMap::from([(
                "api-key".to_string(),
                SecretMount {
                    mount_path: "/secrets".to_string(),
                },
            )]),
            replicas: None,
        }
    }

    #[test]
    fn test_deployment_shape() {
        let info = info();
        let manifest = WorkspaceManifest {
            id: "w1",
            namespace: "ns1",
            owner: "0xabc",
            info: &info,
            sleep_at: Some(1_700_000_000_000),
            pull_secret: Some(DOCKER_SECRET_NAME),
        };
        let deployment = deployment(&manifest);

        let labels = &deployment["metadata"]["labels"];
        assert_eq!(labels["app"], "w1");
        assert_eq!(labels["ainConnect"], "yes");
        assert_eq!(labels["connectAddress"], "0xabc");
        assert_eq!(labels["sleepTime"], "1700000000000");

        let pod = &deployment["spec"]["template"]["spec"];
        assert_eq!(pod["nodeSelector"][labels::NODE_POOL], "gpu-pool");
        assert_eq!(pod["imagePullSecrets"][0]["name"], DOCKER_SECRET_NAME);

        let container = &pod["containers"][0];
        assert_eq!(container["resources"]["limits"]["cpu"], "500m");
        assert_eq!(container["resources"]["limits"]["memory"], "1024Mi");
        assert_eq!(container["resources"]["limits"]["nvidia.com/gpu"], "1");
        assert_eq!(container["volumeMounts"].as_array().unwrap().len(), 2);
        assert_eq!(pod["volumes"][1]["secret"]["secretName"], "api-key");
        assert_eq!(deployment["spec"]["replicas"], 1);
    }

    #[test]
    fn test_virtual_service() {
        let vs = virtual_service("w1", "ns1", 8888, "8888-w1.example.com", "worker-gw.istio-system");
        assert_eq!(vs["metadata"]["name"], "w18888");
        assert_eq!(vs["metadata"]["labels"]["app"], "w1");
        assert_eq!(
            vs["spec"]["http"][0]["route"][0]["destination"]["host"],
            "w1.ns1.svc.cluster.local"
        );
    }

    #[test]
    fn test_docker_secret_encodes_auth() {
        let secret = docker_secret(
            "ns1",
            &RegistryAuth {
                username: "u".to_string(),
                password: "p".to_string(),
                server: "registry.local".to_string(),
            },
        );
        let encoded = secret["data"][".dockerconfigjson"].as_str().unwrap();
        let decoded: Value = serde_json::from_slice(&STANDARD.decode(encoded).unwrap()).unwrap();
        assert_eq!(decoded["auths"]["registry.local"]["auth"], STANDARD.encode("u:p"));
    }

    #[test]
    fn test_last_applied_is_idempotent() {
        let once = with_last_applied(namespace("ns1", "0xabc"));
        let twice = with_last_applied(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_redeploy_patch_order_and_secrets_kept() {
        let info = info();
        let current = deployment(&WorkspaceManifest {
            id: "w1",
            namespace: "ns1",
            owner: "0xabc",
            info: &info,
            sleep_at: None,
            pull_secret: None,
        });
        let option = RedeployOption {
            replicas: Some(2),
            image_name: Some("jupyter/base:2".to_string()),
            env: Some(BTreeMap::new()),
            storage_spec: Some(BTreeMap::new()),
        };

        let ops = redeploy_patch(&option, &current);
        let paths: Vec<&str> = ops.iter().map(|op| op["path"].as_str().unwrap()).collect();
        assert_eq!(
            paths,
            vec![
                "/spec/replicas",
                "/spec/template/spec/containers/0/image",
                "/spec/template/spec/volumes",
                "/spec/template/spec/containers/0/volumeMounts",
                "/spec/template/spec/containers/0/env",
            ]
        );
        let volumes = ops[2]["value"].as_array().unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0]["name"], "api-key");
    }

    #[test]
    fn test_empty_redeploy_patch() {
        assert!(redeploy_patch(&RedeployOption::default(), &Value::Null).is_empty());
    }

    #[test]
    fn test_claim_storage_class() {
        let claim = persistent_volume_claim("w1", "ns1", "0xabc", 10, Some(""));
        assert!(claim["spec"].get("storageClassName").is_none());
        let claim = persistent_volume_claim("w1", "ns1", "0xabc", 10, Some("w1"));
        assert_eq!(claim["spec"]["storageClassName"], "w1");
        assert_eq!(claim["spec"]["resources"]["requests"]["storage"], "10Gi");
    }
}
