//! Orchestration-target interfaces.
//!
//! The controller only talks to the cluster through these two traits; the
//! `kubectl`/`helm` implementation lives in `kube_cli`, the in-memory one in
//! `memory_backend`.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::cluster::{NamespaceSpec, ObservedNamespace, ReleaseInfo, WorkloadStatus};
use crate::models::environment::{LimitRangeDefaults, ResourceQuota};

#[async_trait]
pub trait ClusterBackend: Send + Sync {
    async fn get_namespace(&self, name: &str) -> Result<Option<ObservedNamespace>>;

    /// All namespaces carrying the managed-by label.
    async fn list_managed_namespaces(&self) -> Result<Vec<ObservedNamespace>>;

    async fn create_namespace(&self, spec: &NamespaceSpec) -> Result<()>;

    /// Declaratively apply the ResourceQuota and LimitRange objects.
    async fn apply_quota(
        &self,
        namespace: &str,
        quota: &ResourceQuota,
        limits: &LimitRangeDefaults,
    ) -> Result<()>;

    /// Overwrite labels and annotations. Empty annotation values remove the key.
    async fn label_namespace(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Request deletion; deletion cascades to every object in the namespace.
    async fn delete_namespace(&self, name: &str) -> Result<()>;
}

/// Parameters of an upgrade-or-install.
#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    pub namespace: String,
    pub release: String,
    pub chart_ref: String,
    pub values: BTreeMap<String, String>,
}

#[async_trait]
pub trait ReleaseBackend: Send + Sync {
    async fn release_status(&self, namespace: &str, release: &str) -> Result<Option<ReleaseInfo>>;

    /// Upgrade-or-install; returns the new revision. A failure may leave
    /// the release half applied, and the caller rolls back or uninstalls.
    async fn upgrade_install(&self, request: &ReleaseRequest) -> Result<u32>;

    /// Roll back to `revision`, or to the previous one when `None`.
    async fn rollback(&self, namespace: &str, release: &str, revision: Option<u32>) -> Result<()>;

    async fn uninstall(&self, namespace: &str, release: &str) -> Result<()>;

    async fn workload_status(&self, namespace: &str) -> Result<WorkloadStatus>;
}
