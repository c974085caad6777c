//! Control plane API client for the worker.
//!
//! Provides methods for communicating with the control plane:
//! - Registering the worker and fetching queued requests
//! - Answering requests
//! - Reporting worker, cluster and pod status

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use connect_protocol::{
    ClusterStatus, PodStatusReport, RequestEnvelope, WorkerRegistration, WorkerResponse,
    WorkerStatus,
};
use serde::Serialize;
use tracing::{debug, error};

/// Control plane operations used by the worker.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Announce a local-runtime worker and its container spec.
    async fn register(&self, registration: &WorkerRegistration) -> Result<()>;

    /// Requests waiting for this worker. Delivery is at-least-once.
    async fn fetch_requests(&self) -> Result<Vec<RequestEnvelope>>;

    /// Answer a request.
    async fn send_response(
        &self,
        request_id: &str,
        user_address: &str,
        response: &WorkerResponse,
    ) -> Result<()>;

    async fn update_status(&self, status: &WorkerStatus) -> Result<()>;

    async fn set_cluster_status(&self, status: &ClusterStatus) -> Result<()>;

    async fn set_pod_status(&self, report: &PodStatusReport) -> Result<()>;

    async fn delete_pod_status(&self, container_id: &str, pod_id: &str) -> Result<()>;

    async fn delete_storage_status(&self, storage_id: &str) -> Result<()>;

    /// Reported pods grouped by workspace id.
    async fn list_pod_status(&self) -> Result<BTreeMap<String, Vec<String>>>;

    /// Reported storage ids.
    async fn list_storage_status(&self) -> Result<Vec<String>>;
}

// =============================================================================
// HTTP
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResponseBody<'a> {
    user_address: &'a str,
    response: &'a WorkerResponse,
}

/// Control plane API client.
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: String,
    cluster_name: String,
}

impl HttpControlPlane {
    /// Create a new control plane client.
    pub fn new(base_url: &str, cluster_name: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cluster_name: cluster_name.to_string(),
        })
    }

    fn worker_url(&self, rest: &str) -> String {
        format!("{}/v1/workers/{}{}", self.base_url, self.cluster_name, rest)
    }

    fn cluster_url(&self, rest: &str) -> String {
        format!("{}/v1/clusters/{}{}", self.base_url, self.cluster_name, rest)
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, "Failed to {}", what);
        bail!("Failed to {}: {} - {}", what, status, body);
    }

    async fn put<T: Serialize + Sync + ?Sized>(&self, url: String, body: &T, what: &str) -> Result<()> {
        let response = self.client.put(&url).json(body).send().await?;
        Self::check(response, what).await?;
        Ok(())
    }

    async fn delete(&self, url: String, what: &str) -> Result<()> {
        let response = self.client.delete(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response, what).await?;
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn register(&self, registration: &WorkerRegistration) -> Result<()> {
        let url = format!("{}/v1/workers/register", self.base_url);
        debug!(url = %url, "Registering worker");
        let response = self.client.post(&url).json(registration).send().await?;
        Self::check(response, "register worker").await?;
        Ok(())
    }

    async fn fetch_requests(&self) -> Result<Vec<RequestEnvelope>> {
        let url = self.worker_url("/requests");
        let response = self.client.get(&url).send().await?;
        let requests: Vec<RequestEnvelope> =
            Self::check(response, "fetch requests").await?.json().await?;
        debug!(count = requests.len(), "Fetched requests");
        Ok(requests)
    }

    async fn send_response(
        &self,
        request_id: &str,
        user_address: &str,
        response: &WorkerResponse,
    ) -> Result<()> {
        let url = self.worker_url(&format!("/responses/{}", request_id));
        debug!(request_id, success = response.is_success(), "Sending response");
        let body = ResponseBody {
            user_address,
            response,
        };
        let response = self.client.post(&url).json(&body).send().await?;
        Self::check(response, "send response").await?;
        Ok(())
    }

    async fn update_status(&self, status: &WorkerStatus) -> Result<()> {
        self.put(self.worker_url("/status"), status, "update status")
            .await
    }

    async fn set_cluster_status(&self, status: &ClusterStatus) -> Result<()> {
        self.put(self.cluster_url("/status"), status, "set cluster status")
            .await
    }

    async fn set_pod_status(&self, report: &PodStatusReport) -> Result<()> {
        let url = self.cluster_url(&format!("/pods/{}/{}", report.container_id, report.pod_id));
        self.put(url, report, "set pod status").await
    }

    async fn delete_pod_status(&self, container_id: &str, pod_id: &str) -> Result<()> {
        let url = self.cluster_url(&format!("/pods/{}/{}", container_id, pod_id));
        self.delete(url, "delete pod status").await
    }

    async fn delete_storage_status(&self, storage_id: &str) -> Result<()> {
        let url = self.cluster_url(&format!("/storages/{}", storage_id));
        self.delete(url, "delete storage status").await
    }

    async fn list_pod_status(&self) -> Result<BTreeMap<String, Vec<String>>> {
        let response = self.client.get(self.cluster_url("/pods")).send().await?;
        Ok(Self::check(response, "list pod status").await?.json().await?)
    }

    async fn list_storage_status(&self) -> Result<Vec<String>> {
        let response = self.client.get(self.cluster_url("/storages")).send().await?;
        Ok(Self::check(response, "list storage status").await?.json().await?)
    }
}

// =============================================================================
// Recording
// =============================================================================

/// In-memory control plane that records everything sent to it.
///
/// Queued requests are re-delivered on every fetch until answered.
#[derive(Default)]
pub struct RecordingControlPlane {
    queue: Mutex<VecDeque<RequestEnvelope>>,
    registrations: Mutex<Vec<WorkerRegistration>>,
    responses: Mutex<Vec<(String, String, WorkerResponse)>>,
    statuses: Mutex<Vec<WorkerStatus>>,
    cluster_statuses: Mutex<Vec<ClusterStatus>>,
    pod_reports: Mutex<Vec<PodStatusReport>>,
    pods: Mutex<BTreeMap<String, BTreeSet<String>>>,
    storages: Mutex<BTreeSet<String>>,
    fail: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl RecordingControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("control plane unavailable");
        }
        Ok(())
    }

    /// Queue a request for delivery.
    pub fn push_request(&self, request: RequestEnvelope) {
        lock(&self.queue).push_back(request);
    }

    /// Seed a previously reported pod.
    pub fn seed_pod(&self, container_id: &str, pod_id: &str) {
        lock(&self.pods)
            .entry(container_id.to_string())
            .or_default()
            .insert(pod_id.to_string());
    }

    /// Seed a previously reported storage id.
    pub fn seed_storage(&self, storage_id: &str) {
        lock(&self.storages).insert(storage_id.to_string());
    }

    pub fn registrations(&self) -> Vec<WorkerRegistration> {
        lock(&self.registrations).clone()
    }

    /// `(request_id, user_address, response)` in send order.
    pub fn responses(&self) -> Vec<(String, String, WorkerResponse)> {
        lock(&self.responses).clone()
    }

    /// Responses sent for one request id.
    pub fn responses_for(&self, request_id: &str) -> Vec<WorkerResponse> {
        lock(&self.responses)
            .iter()
            .filter(|(id, _, _)| id == request_id)
            .map(|(_, _, response)| response.clone())
            .collect()
    }

    pub fn statuses(&self) -> Vec<WorkerStatus> {
        lock(&self.statuses).clone()
    }

    pub fn cluster_statuses(&self) -> Vec<ClusterStatus> {
        lock(&self.cluster_statuses).clone()
    }

    pub fn pod_reports(&self) -> Vec<PodStatusReport> {
        lock(&self.pod_reports).clone()
    }

    /// Currently reported pods by workspace id.
    pub fn pods(&self) -> BTreeMap<String, BTreeSet<String>> {
        lock(&self.pods).clone()
    }

    /// Currently reported storage ids.
    pub fn storages(&self) -> BTreeSet<String> {
        lock(&self.storages).clone()
    }
}

#[async_trait]
impl ControlPlane for RecordingControlPlane {
    async fn register(&self, registration: &WorkerRegistration) -> Result<()> {
        self.check()?;
        lock(&self.registrations).push(registration.clone());
        Ok(())
    }

    async fn fetch_requests(&self) -> Result<Vec<RequestEnvelope>> {
        self.check()?;
        Ok(lock(&self.queue).iter().cloned().collect())
    }

    async fn send_response(
        &self,
        request_id: &str,
        user_address: &str,
        response: &WorkerResponse,
    ) -> Result<()> {
        self.check()?;
        lock(&self.queue).retain(|r| r.request_id != request_id);
        lock(&self.responses).push((
            request_id.to_string(),
            user_address.to_string(),
            response.clone(),
        ));
        Ok(())
    }

    async fn update_status(&self, status: &WorkerStatus) -> Result<()> {
        self.check()?;
        lock(&self.statuses).push(status.clone());
        Ok(())
    }

    async fn set_cluster_status(&self, status: &ClusterStatus) -> Result<()> {
        self.check()?;
        lock(&self.cluster_statuses).push(status.clone());
        Ok(())
    }

    async fn set_pod_status(&self, report: &PodStatusReport) -> Result<()> {
        self.check()?;
        self.seed_pod(&report.container_id, &report.pod_id);
        lock(&self.pod_reports).push(report.clone());
        Ok(())
    }

    async fn delete_pod_status(&self, container_id: &str, pod_id: &str) -> Result<()> {
        self.check()?;
        let mut pods = lock(&self.pods);
        if let Some(set) = pods.get_mut(container_id) {
            set.remove(pod_id);
            if set.is_empty() {
                pods.remove(container_id);
            }
        }
        Ok(())
    }

    async fn delete_storage_status(&self, storage_id: &str) -> Result<()> {
        self.check()?;
        lock(&self.storages).remove(storage_id);
        Ok(())
    }

    async fn list_pod_status(&self) -> Result<BTreeMap<String, Vec<String>>> {
        self.check()?;
        Ok(lock(&self.pods)
            .iter()
            .map(|(id, pods)| (id.clone(), pods.iter().cloned().collect()))
            .collect())
    }

    async fn list_storage_status(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(lock(&self.storages).iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_fetch_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/workers/c1/requests"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "requestId": "req-1",
                "requestType": "createNamespace",
                "params": {},
                "userAddress": "0xabc",
                "createdAt": 1
            }])))
            .mount(&server)
            .await;

        let client = HttpControlPlane::new(&server.uri(), "c1").unwrap();
        let requests = client.fetch_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].request_id, "req-1");
    }

    #[tokio::test]
    async fn test_send_response_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/workers/c1/responses/req-1"))
            .and(body_json(json!({
                "userAddress": "0xabc",
                "response": {"errorMessage": "Unauthorized Address.", "statusCode": 401}
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpControlPlane::new(&server.uri(), "c1").unwrap();
        client
            .send_response(
                "req-1",
                "0xabc",
                &WorkerResponse::failure("Unauthorized Address.", 401),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_error_status_fails() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/workers/c1/status"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let client = HttpControlPlane::new(&server.uri(), "c1").unwrap();
        let err = client
            .update_status(&WorkerStatus {
                worker_status: "running".to_string(),
                current_number_of_container: 0,
                container_info: BTreeMap::new(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_delete_missing_pod_status_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/clusters/c1/pods/w1/p1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpControlPlane::new(&server.uri(), "c1").unwrap();
        client.delete_pod_status("w1", "p1").await.unwrap();
    }

    #[tokio::test]
    async fn test_recording_redelivers_until_answered() {
        let control = RecordingControlPlane::new();
        control.push_request(RequestEnvelope {
            request_id: "req-1".to_string(),
            request_type: "createNamespace".to_string(),
            params: json!({}),
            user_address: "0xabc".to_string(),
            created_at: 1,
        });

        assert_eq!(control.fetch_requests().await.unwrap().len(), 1);
        assert_eq!(control.fetch_requests().await.unwrap().len(), 1);

        control
            .send_response("req-1", "0xabc", &WorkerResponse::success(json!({})))
            .await
            .unwrap();
        assert!(control.fetch_requests().await.unwrap().is_empty());
        assert_eq!(control.responses_for("req-1").len(), 1);
    }
}
