//! Integration tests for the Kubernetes backend.
//!
//! These tests push requests through the full path:
//! 1. RecordingControlPlane delivers request envelopes
//! 2. RequestQueue orders and dispatches them to WorkerCore
//! 3. WorkspaceReconciler applies them to MockCluster
//!
//! and check that ClusterStateWatcher converges reported status.

use std::sync::Arc;

use connect_worker::autosleep::{AutoSleepScheduler, SleepTarget, Teardown};
use connect_worker::client::RecordingControlPlane;
use connect_worker::config::{Intervals, KubeConfig};
use connect_worker::k8s::{template, MockCluster, ResourceKind};
use connect_worker::labels;
use connect_worker::queue::RequestQueue;
use connect_worker::watcher::ClusterStateWatcher;
use connect_worker::worker::WorkerCore;
use connect_worker::workspace::WorkspaceReconciler;
use connect_id::{NamespaceId, StorageId};
use connect_protocol::{RequestEnvelope, WorkerResponse};
use serde_json::{json, Value};

const OWNER: &str = "0xabc";

struct Harness {
    cluster: Arc<MockCluster>,
    control: Arc<RecordingControlPlane>,
    reconciler: Arc<WorkspaceReconciler>,
    queue: RequestQueue,
}

fn harness() -> Harness {
    let cluster = Arc::new(MockCluster::new());
    let control = Arc::new(RecordingControlPlane::new());
    let (sleeper, _expirations) = AutoSleepScheduler::new();
    let reconciler = Arc::new(WorkspaceReconciler::new(
        KubeConfig::default(),
        None,
        "c1",
        cluster.clone(),
        Arc::new(sleeper),
    ));
    reconciler.set_gateway_host(Some("*.example.com".to_string()));

    let core = Arc::new(WorkerCore::cluster(reconciler.clone()));
    let queue = RequestQueue::new(core, control.clone(), Intervals::default().queue);
    Harness {
        cluster,
        control,
        reconciler,
        queue,
    }
}

impl Harness {
    /// Deliver one request and wait for its response.
    async fn call(&self, id: &str, request_type: &str, params: Value, created_at: i64) -> WorkerResponse {
        self.control.push_request(RequestEnvelope {
            request_id: id.to_string(),
            request_type: request_type.to_string(),
            params,
            user_address: OWNER.to_string(),
            created_at,
        });
        self.queue.poll_once().await.unwrap();
        self.queue.wait_idle().await;
        let mut responses = self.control.responses_for(id);
        assert_eq!(responses.len(), 1, "expected one response for {}", id);
        responses.remove(0)
    }
}

fn data(response: WorkerResponse) -> Value {
    match response {
        WorkerResponse::Success { data } => data,
        other => panic!("expected success, got {:?}", other),
    }
}

fn deploy_params(namespace: &str, storage: Option<&str>) -> Value {
    let mut info = json!({
        "imageName": "nginx:1.27",
        "hwSpec": {"cpu": 500, "memory": 512, "gpu": 0},
        "port": [80]
    });
    if let Some(storage) = storage {
        info["storageSpec"] = json!({storage: {"mountPath": "/data"}});
    }
    json!({"namespaceId": namespace, "containerInfo": info})
}

#[tokio::test]
async fn test_deploy_with_unknown_storage_creates_nothing() {
    let h = harness();
    let namespace = data(h.call("r1", "createNamespace", json!({}), 1).await)["namespaceId"]
        .as_str()
        .unwrap()
        .to_string();
    let before = h.cluster.object_count();

    let missing = StorageId::new();
    let response = h
        .call("r2", "deploy", deploy_params(&namespace, Some(missing.as_str())), 2)
        .await;

    assert_eq!(
        response,
        WorkerResponse::failure("invalid StorageSpec Params.", 452)
    );
    assert_eq!(h.cluster.object_count(), before);
    assert!(h.cluster.names(ResourceKind::Deployment).is_empty());
}

#[tokio::test]
async fn test_workspace_lifecycle_through_queue() {
    let h = harness();
    let namespace = data(h.call("r1", "createNamespace", json!({}), 1).await)["namespaceId"]
        .as_str()
        .unwrap()
        .to_string();

    let storage = data(
        h.call(
            "r2",
            "createStorage",
            json!({"namespaceId": namespace, "capacity": 5}),
            2,
        )
        .await,
    )["storageId"]
        .as_str()
        .unwrap()
        .to_string();

    let deployed = data(
        h.call("r3", "deploy", deploy_params(&namespace, Some(&storage)), 3)
            .await,
    );
    let id = deployed["containerId"].as_str().unwrap().to_string();
    assert_eq!(deployed["clusterName"], "c1");
    assert_eq!(deployed["endpoint"]["80"], format!("80-{}.example.com", id));

    let log_request = json!({"namespaceId": namespace, "containerId": id});
    h.cluster.insert(
        ResourceKind::Pod,
        Some(&namespace),
        json!({
            "metadata": {"name": format!("{}-0", id), "labels": {labels::APP: id}},
            "status": {"phase": "Running"}
        }),
    );
    h.cluster.set_log(&format!("{}-0", id), "ready\n");
    let log = data(h.call("r4", "getContainerLog", log_request.clone(), 4).await);
    assert_eq!(log["log"], "ready\n");

    // Two undeploys of the same workspace in one batch run one after another.
    for (request_id, created_at) in [("r5", 5), ("r6", 6)] {
        h.control.push_request(RequestEnvelope {
            request_id: request_id.to_string(),
            request_type: "undeploy".to_string(),
            params: log_request.clone(),
            user_address: OWNER.to_string(),
            created_at,
        });
    }
    assert_eq!(h.queue.poll_once().await.unwrap(), 2);
    h.queue.wait_idle().await;

    assert!(h.control.responses_for("r5")[0].is_success());
    assert!(h.control.responses_for("r6")[0].is_success());
    assert_eq!(h.cluster.delete_count(ResourceKind::Deployment), 1);
    assert!(h.cluster.names(ResourceKind::Deployment).is_empty());
    assert!(h.cluster.names(ResourceKind::VirtualService).is_empty());
    assert!(h.reconciler.sleeper().is_empty());

    let response = h
        .call(
            "r7",
            "deleteStorage",
            json!({"namespaceId": namespace, "storageId": storage}),
            7,
        )
        .await;
    assert!(response.is_success());
    assert!(h.cluster.names(ResourceKind::PersistentVolumeClaim).is_empty());
}

#[tokio::test]
async fn test_foreign_namespace_is_refused() {
    let h = harness();
    let namespace = NamespaceId::new();
    h.cluster.insert(
        ResourceKind::Namespace,
        None,
        template::namespace(namespace.as_str(), "0xother"),
    );

    let response = h
        .call("r1", "deploy", deploy_params(namespace.as_str(), None), 1)
        .await;
    assert_eq!(
        response,
        WorkerResponse::failure("Unauthorized Address.", 401)
    );

    let response = h
        .call("r2", "deleteNamespace", json!({"namespaceId": namespace}), 2)
        .await;
    assert_eq!(
        response,
        WorkerResponse::failure("Unauthorized Address.", 401)
    );
    assert!(h
        .cluster
        .object(ResourceKind::Namespace, None, namespace.as_str())
        .is_some());
}

#[tokio::test]
async fn test_expiry_and_undeploy_delete_once() {
    let h = harness();
    let namespace = data(h.call("r1", "createNamespace", json!({}), 1).await)["namespaceId"]
        .as_str()
        .unwrap()
        .to_string();
    let deployed = data(h.call("r2", "deploy", deploy_params(&namespace, None), 2).await);
    let id = deployed["containerId"].as_str().unwrap().to_string();

    let target = SleepTarget {
        namespace: namespace.clone(),
        container_id: id.clone(),
    };
    let params = json!({"namespaceId": namespace, "containerId": id});
    h.control.push_request(RequestEnvelope {
        request_id: "r3".to_string(),
        request_type: "undeploy".to_string(),
        params,
        user_address: OWNER.to_string(),
        created_at: 3,
    });

    let teardown: Arc<dyn Teardown> = h.reconciler.clone();
    let (expired, polled) = tokio::join!(teardown.teardown(&target), h.queue.poll_once());
    expired.unwrap();
    polled.unwrap();
    h.queue.wait_idle().await;

    assert!(h.control.responses_for("r3")[0].is_success());
    assert_eq!(h.cluster.delete_count(ResourceKind::Deployment), 1);
}

#[tokio::test]
async fn test_resync_removes_stale_status() {
    let cluster = Arc::new(MockCluster::new());
    let control = Arc::new(RecordingControlPlane::new());
    let watcher = ClusterStateWatcher::new(
        "c1",
        Intervals::default(),
        cluster.clone(),
        control.clone(),
    );

    cluster.insert(
        ResourceKind::Pod,
        Some("ns1"),
        json!({
            "metadata": {
                "name": "ws-live-0",
                "labels": {labels::APP: "ws-live", labels::K8S_MANAGED: labels::K8S_MANAGED_VALUE}
            },
            "spec": {"nodeName": "node-1", "containers": [{"image": "nginx:1.27"}]},
            "status": {"phase": "Running"}
        }),
    );
    cluster.insert(
        ResourceKind::PersistentVolumeClaim,
        Some("ns1"),
        template::persistent_volume_claim("st-live", "ns1", OWNER, 5, None),
    );

    control.seed_pod("ws-gone", "ws-gone-0");
    control.seed_pod("ws-live", "ws-live-old");
    control.seed_storage("st-gone");
    control.seed_storage("st-live");

    let summary = watcher.resync().await.unwrap();
    assert_eq!(summary.stale_pods, 2);
    assert_eq!(summary.stale_storages, 1);
    assert_eq!(summary.reported, 1);

    let pods = control.pods();
    assert_eq!(pods.len(), 1);
    assert!(pods["ws-live"].contains("ws-live-0"));
    assert_eq!(
        control.storages().into_iter().collect::<Vec<_>>(),
        vec!["st-live".to_string()]
    );
}
