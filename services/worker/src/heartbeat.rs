//! Status loop for the local-runtime worker.
//!
//! On every tick the worker:
//! - Reaps tracked containers whose process has exited
//! - Answers the create request of each reaped container
//! - Reports per-container status to the control plane

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use connect_protocol::{ContainerStatus, WorkerResponse, WorkerStatus};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::client::ControlPlane;
use crate::container::ContainerLifecycle;
use crate::labels::Requester;

/// Worker status string reported while the loop runs.
pub const WORKER_RUNNING: &str = "running";

/// What one status tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub reported: usize,
    pub reaped: usize,
}

/// Reap exited containers, then push worker status.
pub async fn report_once(
    lifecycle: &ContainerLifecycle,
    control: &dyn ControlPlane,
) -> Result<TickSummary> {
    let mut summary = TickSummary::default();
    let mut container_info = BTreeMap::new();

    for container in lifecycle.observe().await? {
        let state = &container.details.state;
        let tracked = lifecycle.record(&container.container_id).is_some();

        if tracked && state.has_exited() {
            info!(
                container_id = %container.container_id,
                exit_code = ?state.exit_code,
                "container exited, reaping"
            );
            match lifecycle
                .terminate(&container.container_id, &Requester::System, state.exit_code)
                .await
            {
                Ok(outcome) => {
                    summary.reaped += 1;
                    let outcome = lifecycle.with_logs(outcome).await;
                    if let (Some(request_id), Some(owner)) =
                        (&outcome.create_request_id, &container.ownership.owner)
                    {
                        let response = WorkerResponse::success(serde_json::to_value(&outcome)?);
                        control.send_response(request_id, owner, &response).await?;
                    }
                }
                Err(e) => {
                    warn!(container_id = %container.container_id, error = %e, "failed to reap container");
                }
            }
            continue;
        }

        let logs = match &container.request_id {
            Some(request_id) => lifecycle.read_logs(request_id).await,
            None => json!({}),
        };
        container_info.insert(
            container.container_id.clone(),
            ContainerStatus {
                status: state.status.clone(),
                image_path: container.details.image.clone(),
                logs,
                service_status: state.health.clone(),
            },
        );
    }

    summary.reported = container_info.len();
    let status = WorkerStatus {
        worker_status: WORKER_RUNNING.to_string(),
        current_number_of_container: lifecycle.container_count(),
        container_info,
    };
    control.update_status(&status).await?;
    Ok(summary)
}

/// Run the status loop until shutdown.
pub async fn run_status_loop(
    lifecycle: Arc<ContainerLifecycle>,
    control: Arc<dyn ControlPlane>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(interval_secs = interval.as_secs(), "Starting status loop");

    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {
                match report_once(&lifecycle, control.as_ref()).await {
                    Ok(summary) => {
                        consecutive_failures = 0;
                        debug!(
                            reported = summary.reported,
                            reaped = summary.reaped,
                            "Status reported"
                        );
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures <= 3 {
                            warn!(
                                error = %e,
                                consecutive_failures,
                                "Status report failed"
                            );
                        } else {
                            error!(
                                error = %e,
                                consecutive_failures,
                                "Status report failed repeatedly"
                            );
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Status loop shutting down");
                    break;
                }
            }
        }
    }

    Ok(())
}
