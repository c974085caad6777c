//! In-memory cluster for tests and development.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};

use super::{
    object_labels, object_name, ClusterApi, KubeError, ObjectList, Patch, ResourceKind,
    WatchEvent, WatchStream,
};

type Key = (ResourceKind, String, String);

/// Mock cluster storing objects by kind, namespace and name.
#[derive(Default)]
pub struct MockCluster {
    objects: Mutex<BTreeMap<Key, Value>>,
    /// Scripted feeds, one per `watch` call. Once drained, watches idle forever.
    watches: Mutex<VecDeque<Vec<Result<WatchEvent, KubeError>>>>,
    watch_calls: AtomicUsize,
    watch_versions: Mutex<Vec<Option<String>>>,
    fail_creates: Mutex<HashSet<ResourceKind>>,
    fail_patches: AtomicBool,
    fail_lists: AtomicBool,
    deletes: Mutex<Vec<(ResourceKind, String)>>,
    logs: Mutex<HashMap<String, String>>,
    log_requests: Mutex<Vec<(String, Option<i64>)>>,
    version: AtomicU64,
    node_ports: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn scope(kind: ResourceKind, namespace: Option<&str>) -> String {
    if kind.namespaced() {
        namespace.unwrap_or_default().to_string()
    } else {
        String::new()
    }
}

fn not_found(kind: ResourceKind, name: &str) -> KubeError {
    KubeError::Api {
        status: 404,
        reason: "NotFound".to_string(),
        message: format!("{} \"{}\" not found", kind, name),
    }
}

fn matches_selector(object: &Value, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let labels = object_labels(object);
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(|v| v == value).unwrap_or(false),
            None => labels.contains_key(term),
        })
}

/// RFC 7386 merge.
fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                } else {
                    merge(target.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Apply RFC 6902 `add`/`replace`/`remove` operations.
fn apply_json_patch(target: &mut Value, ops: &Value) -> Result<(), String> {
    let ops = ops.as_array().ok_or("patch is not an array")?;
    for op in ops {
        let path = op["path"].as_str().ok_or("operation without path")?;
        let (parent_path, last) = path.rsplit_once('/').ok_or("invalid path")?;
        let parent = target
            .pointer_mut(parent_path)
            .ok_or_else(|| format!("path {} does not exist", parent_path))?;

        match (op["op"].as_str(), parent) {
            (Some("add" | "replace"), Value::Object(map)) => {
                if op["op"] == "replace" && !map.contains_key(last) {
                    return Err(format!("path {} does not exist", path));
                }
                map.insert(last.to_string(), op["value"].clone());
            }
            (Some("add"), Value::Array(items)) if last == "-" => items.push(op["value"].clone()),
            (Some("add" | "replace"), Value::Array(items)) => {
                let index: usize = last.parse().map_err(|_| "invalid index")?;
                if index >= items.len() {
                    return Err(format!("index {} out of range", index));
                }
                items[index] = op["value"].clone();
            }
            (Some("remove"), Value::Object(map)) => {
                map.remove(last).ok_or_else(|| format!("path {} does not exist", path))?;
            }
            (other, _) => return Err(format!("unsupported operation {:?}", other)),
        }
    }
    Ok(())
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Store an object directly, bypassing failure injection.
    pub fn insert(&self, kind: ResourceKind, namespace: Option<&str>, mut object: Value) {
        let name = object_name(&object).unwrap_or_default().to_string();
        object["metadata"]["resourceVersion"] = json!(self.next_version());
        if kind.namespaced() {
            object["metadata"]["namespace"] = json!(namespace.unwrap_or_default());
        }
        lock(&self.objects).insert((kind, scope(kind, namespace), name), object);
    }

    /// Read a stored object.
    pub fn object(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> Option<Value> {
        lock(&self.objects)
            .get(&(kind, scope(kind, namespace), name.to_string()))
            .cloned()
    }

    /// Names of stored objects of `kind`, across namespaces.
    pub fn names(&self, kind: ResourceKind) -> Vec<String> {
        lock(&self.objects)
            .keys()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Total number of stored objects.
    pub fn object_count(&self) -> usize {
        lock(&self.objects).len()
    }

    /// Queue the events returned by the next `watch` call.
    pub fn push_watch(&self, events: Vec<Result<WatchEvent, KubeError>>) {
        lock(&self.watches).push_back(events);
    }

    /// Number of `watch` calls so far.
    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    /// Resource versions passed to `watch`, in call order.
    pub fn watch_versions(&self) -> Vec<Option<String>> {
        lock(&self.watch_versions).clone()
    }

    /// Make every create of `kind` fail.
    pub fn fail_creates(&self, kind: ResourceKind) {
        lock(&self.fail_creates).insert(kind);
    }

    pub fn set_fail_patches(&self, fail: bool) {
        self.fail_patches.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    /// Number of successful deletes of `kind`, including collection deletes.
    pub fn delete_count(&self, kind: ResourceKind) -> usize {
        lock(&self.deletes).iter().filter(|(k, _)| *k == kind).count()
    }

    /// Set the log returned for `pod`.
    pub fn set_log(&self, pod: &str, log: &str) {
        lock(&self.logs).insert(pod.to_string(), log.to_string());
    }

    /// `(pod, since_seconds)` of every log read.
    pub fn log_requests(&self) -> Vec<(String, Option<i64>)> {
        lock(&self.log_requests).clone()
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<Value>, KubeError> {
        Ok(self.object(kind, namespace, name))
    }

    async fn create(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        object: &Value,
    ) -> Result<Value, KubeError> {
        if lock(&self.fail_creates).contains(&kind) {
            return Err(KubeError::Api {
                status: 422,
                reason: "Invalid".to_string(),
                message: format!("{} rejected", kind),
            });
        }

        let name = object_name(object).unwrap_or_default().to_string();
        let key = (kind, scope(kind, namespace), name.clone());
        let mut object = object.clone();
        object["metadata"]["resourceVersion"] = json!(self.next_version());
        if kind.namespaced() {
            object["metadata"]["namespace"] = json!(namespace.unwrap_or_default());
        }
        if kind == ResourceKind::Service && object["spec"]["type"] == "NodePort" {
            if let Some(ports) = object["spec"]["ports"].as_array_mut() {
                for port in ports {
                    let node_port = 30000 + self.node_ports.fetch_add(1, Ordering::SeqCst);
                    port["nodePort"] = json!(node_port);
                }
            }
        }

        let mut objects = lock(&self.objects);
        if objects.contains_key(&key) {
            return Err(KubeError::Api {
                status: 409,
                reason: "AlreadyExists".to_string(),
                message: format!("{} \"{}\" already exists", kind, name),
            });
        }
        objects.insert(key, object.clone());
        Ok(object)
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        patch: &Patch,
    ) -> Result<Value, KubeError> {
        if self.fail_patches.load(Ordering::SeqCst) {
            return Err(KubeError::Api {
                status: 422,
                reason: "Invalid".to_string(),
                message: "patch rejected".to_string(),
            });
        }

        let mut objects = lock(&self.objects);
        let object = objects
            .get_mut(&(kind, scope(kind, namespace), name.to_string()))
            .ok_or_else(|| not_found(kind, name))?;

        let mut updated = object.clone();
        match patch {
            Patch::Merge(body) => merge(&mut updated, body),
            Patch::Json(ops) => {
                apply_json_patch(&mut updated, ops).map_err(|message| KubeError::Api {
                    status: 422,
                    reason: "Invalid".to_string(),
                    message,
                })?
            }
        }
        updated["metadata"]["resourceVersion"] = json!(self.next_version());
        *object = updated.clone();
        Ok(updated)
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<bool, KubeError> {
        let mut objects = lock(&self.objects);
        let removed = objects
            .remove(&(kind, scope(kind, namespace), name.to_string()))
            .is_some();
        if removed {
            if kind == ResourceKind::Namespace {
                objects.retain(|(k, ns, _), _| !(k.namespaced() && ns == name));
            }
            lock(&self.deletes).push((kind, name.to_string()));
        }
        Ok(removed)
    }

    async fn delete_collection(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &str,
    ) -> Result<(), KubeError> {
        let mut objects = lock(&self.objects);
        let doomed: Vec<Key> = objects
            .iter()
            .filter(|((k, ns, _), object)| {
                *k == kind && ns == namespace && matches_selector(object, Some(selector))
            })
            .map(|(key, _)| key.clone())
            .collect();
        let mut deletes = lock(&self.deletes);
        for key in doomed {
            deletes.push((kind, key.2.clone()));
            objects.remove(&key);
        }
        Ok(())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<ObjectList, KubeError> {
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(KubeError::Api {
                status: 503,
                reason: "ServiceUnavailable".to_string(),
                message: "list failed".to_string(),
            });
        }

        let items = lock(&self.objects)
            .iter()
            .filter(|((k, ns, _), object)| {
                *k == kind
                    && namespace.map(|want| !kind.namespaced() || ns == want).unwrap_or(true)
                    && matches_selector(object, selector)
            })
            .map(|(_, object)| object.clone())
            .collect();

        Ok(ObjectList {
            resource_version: Some(self.version.load(Ordering::SeqCst).to_string()),
            items,
        })
    }

    async fn watch(
        &self,
        _kind: ResourceKind,
        resource_version: Option<&str>,
    ) -> Result<WatchStream, KubeError> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.watch_versions).push(resource_version.map(str::to_string));

        match lock(&self.watches).pop_front() {
            Some(events) => Ok(futures_util::stream::iter(events).boxed()),
            None => Ok(futures_util::stream::pending().boxed()),
        }
    }

    async fn logs(
        &self,
        _namespace: &str,
        pod: &str,
        since_seconds: Option<i64>,
    ) -> Result<String, KubeError> {
        lock(&self.log_requests).push((pod.to_string(), since_seconds));
        lock(&self.logs)
            .get(pod)
            .cloned()
            .ok_or_else(|| not_found(ResourceKind::Pod, pod))
    }
}
