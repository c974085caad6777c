//! Request dispatch.
//!
//! [`WorkerCore`] decodes a request envelope once, routes it to the backend
//! this worker drives, and turns the outcome into a response.
//!
//! A `deleteContainer` also answers the request that created the container,
//! so the owner of a long-running create learns how it ended.

use std::sync::Arc;

use connect_protocol::{RequestEnvelope, WorkerRequest, WorkerResponse};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::client::ControlPlane;
use crate::container::{ContainerLifecycle, DeleteOutcome};
use crate::error::WorkerError;
use crate::labels::Requester;
use crate::workspace::WorkspaceReconciler;

/// The backend requests are applied to.
pub enum Engine {
    Local(Arc<ContainerLifecycle>),
    Cluster(Arc<WorkspaceReconciler>),
}

/// Routes decoded requests to the configured backend.
pub struct WorkerCore {
    engine: Engine,
    /// Used to answer create requests when their container is deleted.
    control: Option<Arc<dyn ControlPlane>>,
}

fn to_data<T: Serialize>(outcome: &T) -> Result<Value, WorkerError> {
    serde_json::to_value(outcome).map_err(|e| WorkerError::Unexpected(e.to_string()))
}

impl WorkerCore {
    /// A worker driving the local container runtime.
    pub fn local(lifecycle: Arc<ContainerLifecycle>, control: Arc<dyn ControlPlane>) -> Self {
        Self {
            engine: Engine::Local(lifecycle),
            control: Some(control),
        }
    }

    /// A worker driving a Kubernetes cluster.
    pub fn cluster(reconciler: Arc<WorkspaceReconciler>) -> Self {
        Self {
            engine: Engine::Cluster(reconciler),
            control: None,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Handle one request and build its response.
    pub async fn handle(&self, envelope: &RequestEnvelope) -> WorkerResponse {
        match self.dispatch(envelope).await {
            Ok(data) => {
                debug!(request_id = %envelope.request_id, request_type = %envelope.request_type, "request succeeded");
                WorkerResponse::success(data)
            }
            Err(e) => {
                warn!(
                    request_id = %envelope.request_id,
                    request_type = %envelope.request_type,
                    kind = %e.kind(),
                    error = %e,
                    "request failed"
                );
                e.to_response()
            }
        }
    }

    async fn dispatch(&self, envelope: &RequestEnvelope) -> Result<Value, WorkerError> {
        let request = envelope.decode()?;
        let address = envelope.user_address.as_str();
        let requester = Requester::user(address);

        match (&self.engine, request) {
            (Engine::Local(lifecycle), WorkerRequest::CreateContainer(params)) => {
                to_data(&lifecycle.create(params, address, &envelope.request_id).await?)
            }
            (Engine::Local(lifecycle), WorkerRequest::DeleteContainer(params)) => {
                let outcome = lifecycle.delete(&params, &requester).await?;
                self.answer_create(lifecycle, &outcome, address).await;
                to_data(&outcome)
            }
            (Engine::Cluster(reconciler), WorkerRequest::Deploy(params)) => {
                to_data(&reconciler.deploy(&params, address).await?)
            }
            (Engine::Cluster(reconciler), WorkerRequest::Redeploy(params)) => {
                reconciler.redeploy(&params, &requester).await?;
                Ok(json!({}))
            }
            (Engine::Cluster(reconciler), WorkerRequest::Undeploy(params)) => {
                reconciler.undeploy(&params, &requester).await?;
                Ok(json!({}))
            }
            (Engine::Cluster(reconciler), WorkerRequest::CreateNamespace(_)) => {
                to_data(&reconciler.create_namespace(address).await?)
            }
            (Engine::Cluster(reconciler), WorkerRequest::DeleteNamespace(params)) => {
                reconciler.delete_namespace(&params, &requester).await?;
                Ok(json!({}))
            }
            (Engine::Cluster(reconciler), WorkerRequest::CreateStorage(params)) => {
                to_data(&reconciler.create_storage(&params, address).await?)
            }
            (Engine::Cluster(reconciler), WorkerRequest::DeleteStorage(params)) => {
                reconciler.delete_storage(&params, &requester).await?;
                Ok(json!({}))
            }
            (Engine::Cluster(reconciler), WorkerRequest::GetContainerLog(params)) => {
                to_data(&reconciler.container_log(&params, &requester).await?)
            }
            (_, other) => Err(WorkerError::NotSupported(format!(
                "{} Not Supported",
                other.kind()
            ))),
        }
    }

    /// Send the termination, with the container's logs, to its create request.
    ///
    /// The delete itself has already happened, so a failed send is only logged.
    async fn answer_create(
        &self,
        lifecycle: &ContainerLifecycle,
        outcome: &DeleteOutcome,
        address: &str,
    ) {
        let (Some(control), Some(request_id)) = (&self.control, &outcome.create_request_id) else {
            return;
        };

        let report = lifecycle.with_logs(outcome.clone()).await;
        let data = match to_data(&report) {
            Ok(data) => data,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "failed to encode termination");
                return;
            }
        };
        if let Err(e) = control
            .send_response(request_id, address, &WorkerResponse::success(data))
            .await
        {
            warn!(
                request_id = %request_id,
                container_id = %outcome.container_id,
                error = %e,
                "failed to answer create request"
            );
        }
    }
}
