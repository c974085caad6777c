//! Integration tests for the local container runtime backend.
//!
//! These tests drive `ContainerLifecycle` and `ImageCache` over `MockRuntime`:
//! 1. Port accounting across runs and kills
//! 2. Ownership checks on kill
//! 3. Recovery of running containers after a restart
//! 4. Image pull de-duplication and eviction safety
//! 5. Full resource restoration after runs, failed runs and kills
//! 6. Container deletion answering the create request through the queue

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use connect_protocol::{RequestEnvelope, WorkerResponse};
use connect_worker::client::RecordingControlPlane;
use connect_worker::container::{ContainerLifecycle, LifecycleConfig, RunRequest};
use connect_worker::error::ErrorKind;
use connect_worker::image::{ImageCache, ImageCacheConfig};
use connect_worker::labels::{self, Requester};
use connect_worker::queue::RequestQueue;
use connect_worker::resources::ResourcePool;
use connect_worker::runtime::MockRuntime;
use connect_worker::worker::WorkerCore;
use proptest::prelude::*;
use rstest::rstest;
use serde_json::{json, Value};
use tempfile::TempDir;

const OWNER: &str = "0xabc";

fn lifecycle_over(runtime: Arc<MockRuntime>) -> ContainerLifecycle {
    let pool = Arc::new(ResourcePool::new(8000..=8002, Vec::new(), 3));
    let images = Arc::new(ImageCache::new(ImageCacheConfig::default(), runtime.clone()));
    let config = LifecycleConfig {
        vcpu: 1,
        memory_gb: 1,
        gpu_per_container: 0,
        node_port_ip: Some("10.0.0.1".to_string()),
        shared_path: None,
    };
    ContainerLifecycle::new(config, runtime, pool, images)
}

fn run_request(id: &str, ports: Vec<u16>) -> RunRequest {
    RunRequest {
        container_id: id.to_string(),
        image: "nginx:1.27".to_string(),
        ports,
        env: BTreeMap::new(),
        command: Vec::new(),
        labels: labels::container_labels(&BTreeMap::new(), OWNER, &format!("req-{}", id)),
        gpu_count: 0,
        binds: Vec::new(),
    }
}

fn external(ports: &[(u16, u16)]) -> Vec<u16> {
    ports.iter().map(|(external, _)| *external).collect()
}

#[tokio::test]
async fn test_ports_return_to_pool_after_kill() {
    let runtime = Arc::new(MockRuntime::new());
    let lifecycle = lifecycle_over(runtime);

    let first = lifecycle.run(run_request("c1", vec![80, 443])).await.unwrap();
    assert_eq!(external(&first.ports), vec![8000, 8001]);

    let second = lifecycle.run(run_request("c2", vec![80])).await.unwrap();
    assert_eq!(external(&second.ports), vec![8002]);

    let err = lifecycle.run(run_request("c3", vec![80])).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    assert!(lifecycle.record("c3").is_none());

    lifecycle.kill("c1", None).await.unwrap();

    let fourth = lifecycle.run(run_request("c4", vec![80, 443])).await.unwrap();
    assert_eq!(external(&fourth.ports), vec![8000, 8001]);
    assert_eq!(
        lifecycle.pool().usage().used_ports,
        BTreeSet::from([8000, 8001, 8002])
    );
}

#[tokio::test]
async fn test_kill_by_other_address_changes_nothing() {
    let runtime = Arc::new(MockRuntime::new());
    let lifecycle = lifecycle_over(runtime.clone());
    lifecycle.run(run_request("c1", vec![80])).await.unwrap();

    let err = lifecycle
        .terminate("c1", &Requester::user("0xother"), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);

    assert!(lifecycle.record("c1").is_some());
    assert!(runtime.container_names().contains("c1"));
    assert_eq!(lifecycle.pool().usage().used_ports, BTreeSet::from([8000]));

    let outcome = lifecycle
        .terminate("c1", &Requester::user(OWNER), None)
        .await
        .unwrap();
    assert_eq!(outcome.create_request_id.as_deref(), Some("req-c1"));
    assert!(lifecycle.pool().usage().used_ports.is_empty());
}

#[tokio::test]
async fn test_restart_recovers_running_containers() {
    let runtime = Arc::new(MockRuntime::new());
    {
        let before = lifecycle_over(runtime.clone());
        before.run(run_request("c1", vec![80, 443])).await.unwrap();
    }

    let after = lifecycle_over(runtime.clone());
    assert_eq!(after.recover().await.unwrap(), 1);
    assert_eq!(after.recover().await.unwrap(), 0);

    let record = after.record("c1").unwrap();
    assert_eq!(record.request_id.as_deref(), Some("req-c1"));
    assert_eq!(
        after.pool().usage().used_ports,
        BTreeSet::from([8000, 8001])
    );

    let next = after.run(run_request("c2", vec![80])).await.unwrap();
    assert_eq!(external(&next.ports), vec![8002]);
}

#[tokio::test]
async fn test_concurrent_pulls_share_one_download() {
    let runtime = Arc::new(MockRuntime::new());
    runtime.set_pull_delay(Duration::from_millis(20));
    let cache = Arc::new(ImageCache::new(ImageCacheConfig::default(), runtime.clone()));

    let pulls: Vec<_> = (0..5)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.acquire("nginx:1.27").await })
        })
        .collect();
    for pull in pulls {
        assert_eq!(pull.await.unwrap().unwrap(), "nginx:1.27");
    }

    assert_eq!(runtime.pull_count("nginx:1.27"), 1);
    assert_eq!(cache.ref_count("nginx:1.27").await, Some(5));
}

#[derive(Debug, Clone)]
enum CacheOp {
    Acquire(usize),
    Release(usize),
}

fn cache_op() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        (0..5usize).prop_map(CacheOp::Acquire),
        (0..5usize).prop_map(CacheOp::Release),
    ]
}

proptest! {
    #[test]
    fn prop_referenced_images_are_never_evicted(ops in prop::collection::vec(cache_op(), 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let runtime = Arc::new(MockRuntime::new());
            let cache = ImageCache::new(
                ImageCacheConfig { max_images: 2, registry: None },
                runtime.clone(),
            );
            let mut held = [0u32; 5];

            for op in ops {
                match op {
                    CacheOp::Acquire(i) => {
                        cache.acquire(&format!("img{}:1", i)).await.unwrap();
                        held[i] += 1;
                    }
                    CacheOp::Release(i) => {
                        if held[i] > 0 {
                            cache.release(&format!("img{}:1", i)).await;
                            held[i] -= 1;
                        }
                    }
                }

                let present = runtime.images();
                for (i, count) in held.iter().enumerate() {
                    if *count > 0 {
                        let image = format!("img{}:1", i);
                        prop_assert!(present.contains(&image), "{} evicted while referenced", image);
                        prop_assert_eq!(cache.ref_count(&image).await, Some(*count));
                    }
                }
            }
            Ok(())
        })?;
    }
}

fn gpu_lifecycle(runtime: Arc<MockRuntime>) -> ContainerLifecycle {
    let gpus = ["0", "1", "2", "3"].iter().map(|s| s.to_string()).collect();
    let pool = Arc::new(ResourcePool::new(8000..=8009, gpus, 4));
    let images = Arc::new(ImageCache::new(ImageCacheConfig::default(), runtime.clone()));
    let config = LifecycleConfig {
        vcpu: 2,
        memory_gb: 1,
        gpu_per_container: 1,
        node_port_ip: Some("10.0.0.1".to_string()),
        shared_path: None,
    };
    ContainerLifecycle::new(config, runtime, pool, images)
}

fn gpu_request(id: &str, image: &str, gpu_count: u32) -> RunRequest {
    RunRequest {
        image: image.to_string(),
        gpu_count,
        ..run_request(id, vec![80, 443])
    }
}

#[rstest]
#[case::one_container(1, 1, None)]
#[case::shared_gpus(3, 1, None)]
#[case::two_gpus_each(2, 2, Some(1))]
#[case::start_fails_midway(4, 1, Some(2))]
#[case::start_fails_first(3, 1, Some(0))]
#[tokio::test]
async fn test_run_and_kill_restore_resources(
    #[case] containers: usize,
    #[case] gpus_each: u32,
    #[case] fail_at: Option<usize>,
) {
    let images = ["nginx:1.27", "redis:7"];
    let runtime = Arc::new(MockRuntime::new());
    let lifecycle = gpu_lifecycle(runtime.clone());
    for image in images {
        lifecycle.images().acquire(image).await.unwrap();
        lifecycle.images().release(image).await;
    }

    let usage = lifecycle.pool().usage();
    let cached = lifecycle.images().snapshot().await;
    assert_eq!(cached, BTreeMap::from([("nginx:1.27".to_string(), 0), ("redis:7".to_string(), 0)]));

    let mut started = Vec::new();
    for i in 0..containers {
        let image = images[i % images.len()];

        if fail_at == Some(i) {
            let before = lifecycle.pool().usage();
            let refs = lifecycle.images().snapshot().await;
            runtime.set_fail_starts(true);

            let err = lifecycle
                .run(gpu_request(&format!("failed-{}", i), image, gpus_each))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Unexpected);
            assert_eq!(lifecycle.pool().usage(), before);
            assert_eq!(lifecycle.images().snapshot().await, refs);
            assert_eq!(lifecycle.container_count(), started.len());

            runtime.set_fail_starts(false);
        }

        let id = format!("c{}", i);
        let outcome = lifecycle.run(gpu_request(&id, image, gpus_each)).await.unwrap();
        assert_eq!(outcome.gpu_ids.len(), gpus_each as usize);
        started.push(id);
    }

    let busy = lifecycle.pool().usage();
    assert_eq!(busy.slots, containers);
    assert_eq!(busy.used_ports.len(), containers * 2);
    assert_eq!(busy.used_gpus.len(), containers * gpus_each as usize);

    for id in &started {
        lifecycle.kill(id, None).await.unwrap();
    }

    assert_eq!(lifecycle.pool().usage(), usage);
    assert_eq!(lifecycle.images().snapshot().await, cached);
    assert!(runtime.container_names().is_empty());
    assert_eq!(lifecycle.container_count(), 0);
}

fn queued(id: &str, request_type: &str, params: Value, created_at: i64) -> RequestEnvelope {
    RequestEnvelope {
        request_id: id.to_string(),
        request_type: request_type.to_string(),
        params,
        user_address: OWNER.to_string(),
        created_at,
    }
}

fn success_data(response: &WorkerResponse) -> &Value {
    match response {
        WorkerResponse::Success { data } => data,
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn test_delete_through_queue_answers_create_with_logs() {
    let shared = TempDir::new().unwrap();
    let runtime = Arc::new(MockRuntime::new());
    let pool = Arc::new(ResourcePool::new(8000..=8001, Vec::new(), 2));
    let images = Arc::new(ImageCache::new(ImageCacheConfig::default(), runtime.clone()));
    let lifecycle = Arc::new(ContainerLifecycle::new(
        LifecycleConfig {
            vcpu: 1,
            memory_gb: 1,
            gpu_per_container: 0,
            node_port_ip: Some("10.0.0.1".to_string()),
            shared_path: Some(shared.path().to_path_buf()),
        },
        runtime.clone(),
        pool,
        images,
    ));
    let control = Arc::new(RecordingControlPlane::new());
    let core = Arc::new(WorkerCore::local(lifecycle.clone(), control.clone()));
    let queue = RequestQueue::new(core, control.clone(), Duration::from_secs(5));

    control.push_request(queued(
        "create-1",
        "createContainer",
        json!({"imagePath": "trainer:3", "ports": {"web": 80}}),
        1,
    ));
    queue.poll_once().await.unwrap();
    queue.wait_idle().await;

    let created = control.responses_for("create-1");
    assert_eq!(created.len(), 1);
    let container_id = success_data(&created[0])["containerId"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(success_data(&created[0])["endpoint"]["web"], "10.0.0.1:8000");

    let spec = runtime.spec_of(&container_id).unwrap();
    assert_eq!(spec.binds.len(), 1);
    assert!(spec.binds[0].starts_with(&shared.path().join("create-1").display().to_string()));

    let dir = shared.path().join("create-1");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("log.json"), r#"{"accuracy": 0.9}"#).unwrap();

    control.push_request(queued(
        "delete-1",
        "deleteContainer",
        json!({"containerId": container_id}),
        2,
    ));
    queue.poll_once().await.unwrap();
    queue.wait_idle().await;

    let deleted = control.responses_for("delete-1");
    assert_eq!(deleted.len(), 1);
    assert_eq!(success_data(&deleted[0])["status"], "terminated");
    assert!(success_data(&deleted[0]).get("logs").is_none());

    let created = control.responses_for("create-1");
    assert_eq!(created.len(), 2);
    let ended = success_data(&created[1]);
    assert_eq!(ended["status"], "terminated");
    assert_eq!(ended["containerId"], container_id.as_str());
    assert_eq!(ended["logs"], json!({"accuracy": 0.9}));

    let order: Vec<String> = control.responses().into_iter().map(|(id, _, _)| id).collect();
    assert_eq!(order, vec!["create-1", "create-1", "delete-1"]);
    assert!(lifecycle.pool().usage().used_ports.is_empty());
}
