//! Workspace reconciliation on Kubernetes.
//!
//! Renders workspace, namespace and storage manifests and applies them with
//! create-or-patch semantics. Mutations of an existing object are authorized
//! against its owner label first. A deploy that fails halfway deletes what it
//! created before returning the error.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::Utc;
use connect_id::{NamespaceId, StorageId, WorkspaceId};
use connect_protocol::{
    CreateStorageParams, DeleteNamespaceParams, DeleteStorageParams, DeployParams,
    GetContainerLogParams, RedeployParams, UndeployParams,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::autosleep::{AutoSleepScheduler, SleepTarget, Teardown};
use crate::config::{KubeConfig, OwnershipMode, RegistryAuth};
use crate::error::WorkerError;
use crate::k8s::template::{self, WorkspaceManifest};
use crate::k8s::{self, object_labels, Applied, ClusterApi, KubeError, Patch, ResourceKind};
use crate::keyed_lock::KeyedLocks;
use crate::labels::{self, Ownership, Requester};

const HOUR_MS: f64 = 3_600_000.0;

/// Response data for `deploy`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployOutcome {
    pub container_id: WorkspaceId,
    /// Port to reachable address.
    pub endpoint: BTreeMap<String, String>,
    pub cluster_name: String,
}

/// Response data for `createNamespace`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceOutcome {
    pub namespace_id: NamespaceId,
}

/// Response data for `createStorage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageOutcome {
    pub storage_id: StorageId,
}

/// Response data for `getContainerLog`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogOutcome {
    pub log: String,
}

/// What [`WorkspaceReconciler::restore_timers`] found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub scheduled: usize,
    pub expired: usize,
}

/// Applies workspace, namespace and storage requests to the cluster.
pub struct WorkspaceReconciler {
    config: KubeConfig,
    registry: Option<RegistryAuth>,
    cluster_name: String,
    api: Arc<dyn ClusterApi>,
    sleeper: Arc<AutoSleepScheduler>,
    /// First gateway host, e.g. `*.example.com`. `None` selects NodePort.
    gateway_host: ArcSwapOption<String>,
    locks: KeyedLocks,
}

/// Map a cluster error on a mutation: rejections become `Failed`.
fn rejected(err: KubeError, what: &str) -> WorkerError {
    match err {
        KubeError::Api { message, .. } => WorkerError::Failed(format!("{}: {}", what, message)),
        other => WorkerError::Cluster(other),
    }
}

impl WorkspaceReconciler {
    pub fn new(
        config: KubeConfig,
        registry: Option<RegistryAuth>,
        cluster_name: impl Into<String>,
        api: Arc<dyn ClusterApi>,
        sleeper: Arc<AutoSleepScheduler>,
    ) -> Self {
        Self {
            config,
            registry,
            cluster_name: cluster_name.into(),
            api,
            sleeper,
            gateway_host: ArcSwapOption::empty(),
            locks: KeyedLocks::new(),
        }
    }

    pub fn api(&self) -> &Arc<dyn ClusterApi> {
        &self.api
    }

    pub fn sleeper(&self) -> &AutoSleepScheduler {
        &self.sleeper
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Gateway host used for endpoints, if discovered.
    pub fn gateway_host(&self) -> Option<String> {
        self.gateway_host.load_full().map(|h| h.as_ref().clone())
    }

    pub fn set_gateway_host(&self, host: Option<String>) {
        self.gateway_host.store(host.map(Arc::new));
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Label the gateway namespace and discover the gateway host.
    ///
    /// A missing gateway leaves workspaces on NodePort services.
    pub async fn init(&self) -> Result<(), WorkerError> {
        let Some(gateway) = &self.config.gateway_name else {
            info!("no gateway configured, workspaces use NodePort services");
            return Ok(());
        };
        let namespace = &self.config.gateway_namespace;

        let label = Patch::Merge(json!({
            "metadata": {"labels": {labels::GATEWAY_NAMESPACE_LABEL: labels::K8S_MANAGED_VALUE}}
        }));
        match self
            .api
            .patch(ResourceKind::Namespace, None, namespace, &label)
            .await
        {
            Ok(_) => debug!(namespace = %namespace, "labelled gateway namespace"),
            Err(e) if e.is_not_found() => {
                warn!(namespace = %namespace, "gateway namespace not found")
            }
            Err(e) => return Err(e.into()),
        }

        let host = self
            .api
            .get(ResourceKind::Gateway, Some(namespace), gateway)
            .await?
            .and_then(|gw| gw["spec"]["servers"][0]["hosts"][0].as_str().map(str::to_string));

        match &host {
            Some(host) => info!(gateway = %gateway, host = %host, "discovered gateway host"),
            None => warn!(gateway = %gateway, "gateway has no host, using NodePort services"),
        }
        self.set_gateway_host(host);
        Ok(())
    }

    /// Re-arm auto-sleep timers from deployment labels.
    ///
    /// Deployments already past their deadline are torn down immediately.
    pub async fn restore_timers(&self) -> Result<RestoreSummary, WorkerError> {
        let selector = labels::selector(&[(labels::K8S_MANAGED, labels::K8S_MANAGED_VALUE)]);
        let deployments = self
            .api
            .list(ResourceKind::Deployment, None, Some(&selector))
            .await?;

        let now = Utc::now().timestamp_millis();
        let mut summary = RestoreSummary::default();
        for deployment in &deployments.items {
            let object_labels = object_labels(deployment);
            let Some(expires_at) = object_labels
                .get(labels::SLEEP_TIME)
                .and_then(|v| v.parse::<i64>().ok())
            else {
                continue;
            };
            let (Some(id), Some(namespace)) = (
                k8s::object_name(deployment),
                k8s::object_namespace(deployment),
            ) else {
                continue;
            };
            let target = SleepTarget {
                container_id: id.to_string(),
                namespace: namespace.to_string(),
            };

            if expires_at <= now {
                info!(container_id = %id, "workspace expired while offline, tearing down");
                if let Err(e) = self.remove(&target.namespace, &target.container_id, &Requester::System).await {
                    warn!(container_id = %id, error = %e, "failed to tear down expired workspace");
                }
                summary.expired += 1;
            } else {
                self.sleeper.schedule(target, expires_at);
                summary.scheduled += 1;
            }
        }
        info!(
            scheduled = summary.scheduled,
            expired = summary.expired,
            "restored auto-sleep timers"
        );
        Ok(summary)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn owner_of(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<(Value, Ownership)>, WorkerError> {
        Ok(self.api.get(kind, namespace, name).await?.map(|object| {
            let ownership = Ownership::from_labels(&object_labels(&object), labels::K8S_OWNER);
            (object, ownership)
        }))
    }

    /// Namespace owner check, only in strict mode.
    async fn check_namespace(&self, namespace: &str, requester: &Requester) -> Result<(), WorkerError> {
        if self.config.ownership_mode == OwnershipMode::Lenient {
            return Ok(());
        }
        match self.owner_of(ResourceKind::Namespace, None, namespace).await? {
            Some((_, ownership)) => ownership.authorize(requester),
            None => Err(WorkerError::NotExist("Namespace Not Exist".to_string())),
        }
    }

    async fn exists(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<bool, WorkerError> {
        Ok(self.api.get(kind, Some(namespace), name).await?.is_some())
    }

    /// Every referenced claim and secret must already exist.
    async fn validate_mounts<'a>(
        &self,
        namespace: &str,
        storages: impl Iterator<Item = &'a StorageId>,
        secrets: impl Iterator<Item = &'a String>,
    ) -> Result<(), WorkerError> {
        for storage in storages {
            if !self
                .exists(ResourceKind::PersistentVolumeClaim, namespace, storage.as_str())
                .await?
            {
                debug!(storage_id = %storage, "referenced storage missing");
                return Err(WorkerError::InvalidParams("invalid StorageSpec Params.".to_string()));
            }
        }
        for secret in secrets {
            if !self.exists(ResourceKind::Secret, namespace, secret).await? {
                debug!(secret = %secret, "referenced secret missing");
                return Err(WorkerError::InvalidParams("invalid SecretSpec params".to_string()));
            }
        }
        Ok(())
    }

    /// Best-effort delete of objects created by a failed request, newest first.
    async fn roll_back(&self, namespace: &str, created: &[(ResourceKind, String)]) {
        for (kind, name) in created.iter().rev() {
            let scope = kind.namespaced().then_some(namespace);
            match self.api.delete(*kind, scope, name).await {
                Ok(_) => debug!(kind = %kind, name = %name, "rolled back"),
                Err(e) => warn!(kind = %kind, name = %name, error = %e, "rollback delete failed"),
            }
        }
    }

    async fn apply_tracked(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        manifest: Value,
        created: &mut Vec<(ResourceKind, String)>,
    ) -> Result<(), WorkerError> {
        let name = k8s::object_name(&manifest).unwrap_or_default().to_string();
        match k8s::apply(self.api.as_ref(), kind, namespace, manifest).await {
            Ok(Applied::Created) => {
                created.push((kind, name));
                Ok(())
            }
            Ok(Applied::Patched) => Ok(()),
            Err(e) => Err(rejected(e, &format!("Failed To Apply {}", kind))),
        }
    }

    // =========================================================================
    // Workspaces
    // =========================================================================

    /// Handle `deploy` for `owner`.
    #[instrument(skip(self, params), fields(namespace = %params.namespace_id))]
    pub async fn deploy(&self, params: &DeployParams, owner: &str) -> Result<DeployOutcome, WorkerError> {
        let namespace = params.namespace_id.as_str();
        let info = &params.container_info;

        self.check_namespace(namespace, &Requester::user(owner)).await?;
        self.validate_mounts(namespace, info.storage_spec.keys(), info.secret_spec.keys())
            .await?;

        let id = WorkspaceId::new();
        let sleep_at = params
            .max_duration
            .filter(|hours| *hours > 0.0)
            .map(|hours| Utc::now().timestamp_millis() + (hours * HOUR_MS) as i64);

        let mut created = Vec::new();
        match self.deploy_objects(&id, namespace, owner, params, sleep_at, &mut created).await {
            Ok(endpoint) => {
                if let Some(expires_at) = sleep_at {
                    self.sleeper.schedule(
                        SleepTarget {
                            container_id: id.to_string(),
                            namespace: namespace.to_string(),
                        },
                        expires_at,
                    );
                }
                info!(container_id = %id, image = %info.image_name, "deployed workspace");
                Ok(DeployOutcome {
                    container_id: id,
                    endpoint,
                    cluster_name: self.cluster_name.clone(),
                })
            }
            Err(e) => {
                warn!(container_id = %id, error = %e, "deploy failed, rolling back");
                self.roll_back(namespace, &created).await;
                Err(e)
            }
        }
    }

    async fn deploy_objects(
        &self,
        id: &WorkspaceId,
        namespace: &str,
        owner: &str,
        params: &DeployParams,
        sleep_at: Option<i64>,
        created: &mut Vec<(ResourceKind, String)>,
    ) -> Result<BTreeMap<String, String>, WorkerError> {
        let info = &params.container_info;
        let manifest = WorkspaceManifest {
            id: id.as_str(),
            namespace,
            owner,
            info,
            sleep_at,
            pull_secret: self.registry.as_ref().map(|_| template::DOCKER_SECRET_NAME),
        };
        self.apply_tracked(
            ResourceKind::Deployment,
            Some(namespace),
            template::deployment(&manifest),
            created,
        )
        .await?;

        let mut endpoint = BTreeMap::new();
        if info.port.is_empty() {
            return Ok(endpoint);
        }

        let gateway = self.config.gateway_name.as_ref().zip(self.gateway_host());
        let node_port = gateway.is_none();
        self.apply_tracked(
            ResourceKind::Service,
            Some(namespace),
            template::service(id.as_str(), namespace, &info.port, node_port),
            created,
        )
        .await?;

        match gateway {
            Some((gateway_name, host)) => {
                let gateway_ref = format!("{}.{}", gateway_name, self.config.gateway_namespace);
                for port in &info.port {
                    let sub_endpoint = format!("{}-{}", port, host.replace('*', id.as_str()));
                    self.apply_tracked(
                        ResourceKind::VirtualService,
                        Some(namespace),
                        template::virtual_service(id.as_str(), namespace, *port, &sub_endpoint, &gateway_ref),
                        created,
                    )
                    .await?;
                    endpoint.insert(port.to_string(), sub_endpoint);
                }
            }
            None => {
                let service = self
                    .api
                    .get(ResourceKind::Service, Some(namespace), id.as_str())
                    .await?
                    .unwrap_or(Value::Null);
                let ip = self.config.node_port_ip.as_deref();
                for port in service["spec"]["ports"].as_array().into_iter().flatten() {
                    let (Some(target), Some(node_port)) =
                        (port["port"].as_u64(), port["nodePort"].as_u64())
                    else {
                        continue;
                    };
                    let address = match ip {
                        Some(ip) => format!("{}:{}", ip, node_port),
                        None => node_port.to_string(),
                    };
                    endpoint.insert(target.to_string(), address);
                }
            }
        }
        Ok(endpoint)
    }

    /// Handle `undeploy` for `requester`.
    #[instrument(skip(self, params), fields(container_id = %params.container_id))]
    pub async fn undeploy(&self, params: &UndeployParams, requester: &Requester) -> Result<(), WorkerError> {
        self.remove(params.namespace_id.as_str(), params.container_id.as_str(), requester)
            .await
    }

    /// Delete a workspace's routes, service and deployment.
    ///
    /// The deployment carries the owner label and goes last, so a retry after a
    /// partial failure can still authorize. A missing deployment is a no-op.
    async fn remove(&self, namespace: &str, id: &str, requester: &Requester) -> Result<(), WorkerError> {
        let _guard = self.locks.lock(id).await;

        let Some((_, ownership)) = self
            .owner_of(ResourceKind::Deployment, Some(namespace), id)
            .await?
        else {
            debug!(container_id = %id, "workspace already removed");
            self.sleeper.cancel(id);
            return Ok(());
        };
        ownership.authorize(requester)?;
        self.sleeper.cancel(id);

        let selector = labels::selector(&[(labels::APP, id)]);
        self.api
            .delete_collection(ResourceKind::VirtualService, namespace, &selector)
            .await?;
        self.api
            .delete(ResourceKind::Service, Some(namespace), id)
            .await?;
        self.api
            .delete(ResourceKind::Deployment, Some(namespace), id)
            .await?;

        info!(container_id = %id, namespace, "removed workspace");
        Ok(())
    }

    /// Handle `redeploy` for `requester`.
    #[instrument(skip(self, params), fields(container_id = %params.container_id))]
    pub async fn redeploy(&self, params: &RedeployParams, requester: &Requester) -> Result<(), WorkerError> {
        let namespace = params.namespace_id.as_str();
        let id = params.container_id.as_str();
        let _guard = self.locks.lock(id).await;

        let Some((current, ownership)) = self
            .owner_of(ResourceKind::Deployment, Some(namespace), id)
            .await?
        else {
            return Err(WorkerError::NotExist("Container Not Exist".to_string()));
        };
        ownership.authorize(requester)?;

        if let Some(storage) = &params.option.storage_spec {
            self.validate_mounts(namespace, storage.keys(), std::iter::empty())
                .await?;
        }

        let ops = template::redeploy_patch(&params.option, &current);
        if ops.is_empty() {
            debug!(container_id = %id, "nothing to redeploy");
            return Ok(());
        }

        self.api
            .patch(
                ResourceKind::Deployment,
                Some(namespace),
                id,
                &Patch::Json(Value::Array(ops)),
            )
            .await
            .map_err(|e| {
                warn!(container_id = %id, error = %e, "redeploy patch rejected");
                WorkerError::Failed("Failed To Patch.".to_string())
            })?;

        info!(container_id = %id, "redeployed workspace");
        Ok(())
    }

    /// Handle `getContainerLog` for `requester`.
    pub async fn container_log(
        &self,
        params: &GetContainerLogParams,
        requester: &Requester,
    ) -> Result<LogOutcome, WorkerError> {
        let namespace = params.namespace_id.as_str();
        let id = params.container_id.as_str();

        let Some((_, ownership)) = self
            .owner_of(ResourceKind::Deployment, Some(namespace), id)
            .await?
        else {
            return Err(WorkerError::NotExist("Container Not Exist".to_string()));
        };
        ownership.authorize(requester)?;

        let since_seconds = params.from_timestamp.map(|from| {
            let elapsed_ms = (Utc::now().timestamp_millis() - from).max(0);
            (elapsed_ms as f64 / 1000.0).round() as i64
        });

        let selector = labels::selector(&[(labels::APP, id)]);
        let pods = self
            .api
            .list(ResourceKind::Pod, Some(namespace), Some(&selector))
            .await?;
        let Some(pod) = pods.items.first().and_then(k8s::object_name) else {
            return Err(WorkerError::NotExist("Pod Not Exist".to_string()));
        };

        let log = self.api.logs(namespace, pod, since_seconds).await?;
        Ok(LogOutcome { log })
    }

    // =========================================================================
    // Namespaces
    // =========================================================================

    /// Handle `createNamespace` for `owner`.
    #[instrument(skip(self))]
    pub async fn create_namespace(&self, owner: &str) -> Result<NamespaceOutcome, WorkerError> {
        let id = NamespaceId::new();
        let namespace = id.as_str();
        let mut created = Vec::new();

        let result = async {
            self.apply_tracked(
                ResourceKind::Namespace,
                None,
                template::namespace(namespace, owner),
                &mut created,
            )
            .await?;
            if let Some(auth) = &self.registry {
                self.apply_tracked(
                    ResourceKind::Secret,
                    Some(namespace),
                    template::docker_secret(namespace, auth),
                    &mut created,
                )
                .await?;
            }
            self.apply_tracked(
                ResourceKind::NetworkPolicy,
                Some(namespace),
                template::network_policy(namespace),
                &mut created,
            )
            .await
        }
        .await;

        match result {
            Ok(()) => {
                info!(namespace_id = %id, "created namespace");
                Ok(NamespaceOutcome { namespace_id: id })
            }
            Err(e) => {
                self.roll_back(namespace, &created).await;
                Err(e)
            }
        }
    }

    /// Handle `deleteNamespace` for `requester`.
    pub async fn delete_namespace(
        &self,
        params: &DeleteNamespaceParams,
        requester: &Requester,
    ) -> Result<(), WorkerError> {
        let namespace = params.namespace_id.as_str();
        let _guard = self.locks.lock(namespace).await;

        let Some((_, ownership)) = self.owner_of(ResourceKind::Namespace, None, namespace).await? else {
            return Err(WorkerError::NotExist("Namespace Not Exist".to_string()));
        };
        ownership.authorize(requester)?;

        self.api
            .delete(ResourceKind::Namespace, None, namespace)
            .await
            .map_err(|e| rejected(e, "Failed To Delete Namespace"))?;
        info!(namespace_id = %namespace, "deleted namespace");
        Ok(())
    }

    // =========================================================================
    // Storage
    // =========================================================================

    /// Handle `createStorage` for `owner`.
    #[instrument(skip(self, params), fields(namespace = %params.namespace_id))]
    pub async fn create_storage(
        &self,
        params: &CreateStorageParams,
        owner: &str,
    ) -> Result<StorageOutcome, WorkerError> {
        let namespace = params.namespace_id.as_str();
        self.check_namespace(namespace, &Requester::user(owner)).await?;

        let id = StorageId::new();
        let mut created = Vec::new();

        let result = async {
            let class = match &params.nfs_info {
                Some(nfs) => {
                    self.apply_tracked(
                        ResourceKind::PersistentVolume,
                        None,
                        template::persistent_volume(id.as_str(), params.capacity, nfs),
                        &mut created,
                    )
                    .await?;
                    Some(id.as_str())
                }
                None => self.config.storage_class.as_deref(),
            };
            self.apply_tracked(
                ResourceKind::PersistentVolumeClaim,
                Some(namespace),
                template::persistent_volume_claim(id.as_str(), namespace, owner, params.capacity, class),
                &mut created,
            )
            .await
        }
        .await;

        match result {
            Ok(()) => {
                info!(storage_id = %id, nfs = params.nfs_info.is_some(), "created storage");
                Ok(StorageOutcome { storage_id: id })
            }
            Err(e) => {
                self.roll_back(namespace, &created).await;
                Err(e)
            }
        }
    }

    /// Handle `deleteStorage` for `requester`. A missing volume is tolerated.
    pub async fn delete_storage(
        &self,
        params: &DeleteStorageParams,
        requester: &Requester,
    ) -> Result<(), WorkerError> {
        let namespace = params.namespace_id.as_str();
        let id = params.storage_id.as_str();
        let _guard = self.locks.lock(id).await;

        let Some((_, ownership)) = self
            .owner_of(ResourceKind::PersistentVolumeClaim, Some(namespace), id)
            .await?
        else {
            return Err(WorkerError::NotExist("Storage Not Exist".to_string()));
        };
        ownership.authorize(requester)?;

        self.api
            .delete(ResourceKind::PersistentVolumeClaim, Some(namespace), id)
            .await
            .map_err(|e| rejected(e, "Failed To Delete Storage"))?;
        if !self.api.delete(ResourceKind::PersistentVolume, None, id).await? {
            debug!(storage_id = %id, "no persistent volume to delete");
        }

        info!(storage_id = %id, "deleted storage");
        Ok(())
    }
}

#[async_trait]
impl Teardown for WorkspaceReconciler {
    async fn teardown(&self, target: &SleepTarget) -> Result<(), WorkerError> {
        self.remove(&target.namespace, &target.container_id, &Requester::System)
            .await
    }
}
