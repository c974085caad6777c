//! Connect worker
//!
//! Runs on a node and applies marketplace workload requests to the local
//! Docker engine or to a Kubernetes cluster.
//!
//! ## Architecture
//!
//! - **Request Queue**: Polls the control plane and dispatches requests
//! - **Status Loop** (docker): Reaps exited containers and reports status
//! - **Watcher** (kubernetes): Streams pod phases, recomputes capacity, pushes health
//! - **Auto-sleep**: Tears down workspaces whose lifetime has elapsed

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use connect_protocol::{ContainerSpec, WorkerRegistration};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use connect_worker::autosleep::{AutoSleepScheduler, Teardown};
use connect_worker::client::{ControlPlane, HttpControlPlane};
use connect_worker::config::{Backend, Config};
use connect_worker::container::{ContainerLifecycle, LifecycleConfig};
use connect_worker::heartbeat;
use connect_worker::image::{ImageCache, ImageCacheConfig};
use connect_worker::k8s::KubeClient;
use connect_worker::queue::RequestQueue;
use connect_worker::resources::ResourcePool;
use connect_worker::runtime::DockerClient;
use connect_worker::watcher::ClusterStateWatcher;
use connect_worker::worker::WorkerCore;
use connect_worker::workspace::WorkspaceReconciler;

/// How long in-flight requests may take to finish after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        cluster_name = %config.cluster_name,
        control_plane_url = %config.control_plane_url,
        backend = ?config.backend,
        "Starting connect worker"
    );

    let control: Arc<dyn ControlPlane> = Arc::new(HttpControlPlane::new(
        &config.control_plane_url,
        &config.cluster_name,
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let core = match config.backend {
        Backend::Docker => {
            let lifecycle = start_docker(&config, control.clone()).await?;

            tasks.push(tokio::spawn({
                let lifecycle = lifecycle.clone();
                let control = control.clone();
                let interval = config.intervals.status;
                let shutdown_rx = shutdown_rx.clone();
                async move {
                    if let Err(e) =
                        heartbeat::run_status_loop(lifecycle, control, interval, shutdown_rx).await
                    {
                        error!(error = %e, "Status loop error");
                    }
                }
            }));

            WorkerCore::local(lifecycle, control.clone())
        }
        Backend::Kubernetes => {
            let api = Arc::new(KubeClient::from_config(&config.kube)?);
            let (sleeper, expirations) = AutoSleepScheduler::new();
            let sleeper = Arc::new(sleeper);

            let reconciler = Arc::new(WorkspaceReconciler::new(
                config.kube.clone(),
                config.registry.clone(),
                config.cluster_name.clone(),
                api.clone(),
                sleeper.clone(),
            ));
            reconciler.init().await?;

            let restored = reconciler.restore_timers().await?;
            info!(
                scheduled = restored.scheduled,
                expired = restored.expired,
                "Restored auto-sleep timers"
            );

            let watcher = Arc::new(ClusterStateWatcher::new(
                config.cluster_name.clone(),
                config.intervals.clone(),
                api,
                control.clone(),
            ));

            let teardown: Arc<dyn Teardown> = reconciler.clone();
            tasks.push(tokio::spawn(
                sleeper.run_expiry_loop(expirations, teardown, shutdown_rx.clone()),
            ));
            tasks.push(tokio::spawn(watcher.clone().run_supervisor(shutdown_rx.clone())));
            tasks.push(tokio::spawn(watcher.clone().run_capacity_loop(shutdown_rx.clone())));
            tasks.push(tokio::spawn(watcher.run_health_loop(shutdown_rx.clone())));

            WorkerCore::cluster(reconciler)
        }
    };

    let queue = Arc::new(RequestQueue::new(
        Arc::new(core),
        control,
        config.intervals.queue,
    ));
    let queue_handle = tokio::spawn(queue.clone().run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = queue_handle => {
            if let Err(e) = result {
                error!(error = %e, "Request queue task panicked");
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for in-flight requests...");
    if tokio::time::timeout(DRAIN_TIMEOUT, queue.wait_idle()).await.is_err() {
        warn!("In-flight requests did not finish before the drain timeout");
    }
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task failed");
        }
    }

    info!("Connect worker shutdown complete");
    Ok(())
}

/// Build the local-runtime backend, recover prior state and register.
async fn start_docker(
    config: &Config,
    control: Arc<dyn ControlPlane>,
) -> Result<Arc<ContainerLifecycle>> {
    let docker = &config.docker;

    let runtime = Arc::new(DockerClient::new(&docker.socket_path));
    if !runtime.socket_exists() {
        warn!(socket_path = %docker.socket_path, "Docker socket not found");
    }

    let pool = Arc::new(ResourcePool::new(
        docker.allow_ports.iter().copied(),
        docker.gpu_devices.clone(),
        docker.max_containers,
    ));
    let images = Arc::new(ImageCache::new(
        ImageCacheConfig {
            max_images: docker.max_images(),
            registry: config.registry.clone(),
        },
        runtime.clone(),
    ));
    let lifecycle = Arc::new(ContainerLifecycle::new(
        LifecycleConfig::from(docker),
        runtime,
        pool,
        images,
    ));

    let recovered = lifecycle.recover().await?;
    info!(recovered, "Recovered containers");

    if !docker.gpu_devices.is_empty() {
        lifecycle.check_gpu().await?;
        info!(gpus = docker.gpu_devices.len(), "GPU check succeeded");
    }

    control
        .register(&WorkerRegistration {
            cluster_name: config.cluster_name.clone(),
            container_spec: ContainerSpec {
                vcpu: docker.vcpu,
                gpu_count: docker.gpu_per_container,
                memory_gb: docker.memory_gb,
                max_number_of_container: docker.max_containers,
                has_endpoint: docker.node_port_ip.is_some(),
            },
        })
        .await?;
    info!("Registered with control plane");

    Ok(lifecycle)
}
