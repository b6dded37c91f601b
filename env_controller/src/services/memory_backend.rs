//! In-memory backends for dry runs and tests.
//!
//! Every mutating call is appended to a log so tests can assert on what the
//! controller did to the "cluster".

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{ControllerError, Result};
use crate::models::cluster::{
    NamespacePhase, NamespaceSpec, ObservedNamespace, ReleaseInfo, ReleaseStatus, WorkloadStatus,
};
use crate::models::environment::{LimitRangeDefaults, ResourceQuota};
use crate::models::status::StatusMessage;
use crate::services::cluster_service::{ClusterBackend, ReleaseBackend, ReleaseRequest};
use crate::services::github_service::{Notifier, PullRequestSource};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Scripted failure for the next call of an operation.
#[derive(Debug, Clone)]
struct Fault {
    transient: bool,
    message: String,
}

impl Fault {
    fn into_error(self) -> ControllerError {
        if self.transient {
            ControllerError::TransientInfra(self.message)
        } else {
            ControllerError::Infra(self.message)
        }
    }
}

#[derive(Default)]
struct Faults(Mutex<BTreeMap<String, VecDeque<Fault>>>);

impl Faults {
    fn push(&self, op: &str, transient: bool, message: &str) {
        lock(&self.0).entry(op.to_string()).or_default().push_back(Fault {
            transient,
            message: message.to_string(),
        });
    }

    fn take(&self, op: &str) -> Result<()> {
        match lock(&self.0).get_mut(op).and_then(VecDeque::pop_front) {
            Some(fault) => Err(fault.into_error()),
            None => Ok(()),
        }
    }
}

pub struct MemoryCluster {
    namespaces: Mutex<BTreeMap<String, ObservedNamespace>>,
    mutations: Mutex<Vec<String>>,
    faults: Faults,
    /// When false, deleted namespaces stay Terminating until
    /// [`MemoryCluster::finish_termination`] is called.
    instant_delete: Mutex<bool>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self {
            namespaces: Mutex::new(BTreeMap::new()),
            mutations: Mutex::new(Vec::new()),
            faults: Faults::default(),
            instant_delete: Mutex::new(true),
        }
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_instant_delete(&self, instant: bool) {
        *lock(&self.instant_delete) = instant;
    }

    /// Fail the next call of `op` (a trait method name).
    pub fn fail_next(&self, op: &str, transient: bool, message: &str) {
        self.faults.push(op, transient, message);
    }

    /// Place a namespace directly, bypassing the controller.
    pub fn insert_namespace(&self, ns: ObservedNamespace) {
        lock(&self.namespaces).insert(ns.name.clone(), ns);
    }

    pub fn finish_termination(&self, name: &str) {
        lock(&self.namespaces).remove(name);
    }

    pub fn namespace(&self, name: &str) -> Option<ObservedNamespace> {
        lock(&self.namespaces).get(name).cloned()
    }

    pub fn namespace_names(&self) -> Vec<String> {
        lock(&self.namespaces).keys().cloned().collect()
    }

    pub fn mutations(&self) -> Vec<String> {
        lock(&self.mutations).clone()
    }

    pub fn count_mutations(&self, prefix: &str) -> usize {
        lock(&self.mutations)
            .iter()
            .filter(|m| m.starts_with(prefix))
            .count()
    }

    fn record(&self, entry: String) {
        tracing::debug!(mutation = %entry, "Memory cluster mutation");
        lock(&self.mutations).push(entry);
    }
}

#[async_trait]
impl ClusterBackend for MemoryCluster {
    async fn get_namespace(&self, name: &str) -> Result<Option<ObservedNamespace>> {
        self.faults.take("get_namespace")?;
        Ok(self.namespace(name))
    }

    async fn list_managed_namespaces(&self) -> Result<Vec<ObservedNamespace>> {
        self.faults.take("list_managed_namespaces")?;
        Ok(lock(&self.namespaces)
            .values()
            .filter(|ns| ns.claims_managed())
            .cloned()
            .collect())
    }

    async fn create_namespace(&self, spec: &NamespaceSpec) -> Result<()> {
        self.faults.take("create_namespace")?;
        let mut namespaces = lock(&self.namespaces);
        if namespaces.contains_key(&spec.name) {
            return Ok(());
        }
        namespaces.insert(
            spec.name.clone(),
            ObservedNamespace {
                name: spec.name.clone(),
                phase: NamespacePhase::Active,
                labels: spec.labels.clone(),
                annotations: spec.annotations.clone(),
                created_at: Some(Utc::now()),
                quota_applied: false,
            },
        );
        drop(namespaces);
        self.record(format!("create_namespace {}", spec.name));
        Ok(())
    }

    async fn apply_quota(
        &self,
        namespace: &str,
        _quota: &ResourceQuota,
        _limits: &LimitRangeDefaults,
    ) -> Result<()> {
        self.faults.take("apply_quota")?;
        match lock(&self.namespaces).get_mut(namespace) {
            Some(ns) => ns.quota_applied = true,
            None => {
                return Err(ControllerError::Infra(format!(
                    "namespaces \"{namespace}\" not found"
                )))
            }
        }
        self.record(format!("apply_quota {namespace}"));
        Ok(())
    }

    async fn label_namespace(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.faults.take("label_namespace")?;
        match lock(&self.namespaces).get_mut(namespace) {
            Some(ns) => {
                ns.labels.extend(labels.clone());
                for (k, v) in annotations {
                    if v.is_empty() {
                        ns.annotations.remove(k);
                    } else {
                        ns.annotations.insert(k.clone(), v.clone());
                    }
                }
            }
            None => {
                return Err(ControllerError::Infra(format!(
                    "namespaces \"{namespace}\" not found"
                )))
            }
        }
        self.record(format!("label_namespace {namespace}"));
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.faults.take("delete_namespace")?;
        let instant = *lock(&self.instant_delete);
        let mut namespaces = lock(&self.namespaces);
        if instant {
            namespaces.remove(name);
        } else if let Some(ns) = namespaces.get_mut(name) {
            ns.phase = NamespacePhase::Terminating;
        }
        drop(namespaces);
        self.record(format!("delete_namespace {name}"));
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredRelease {
    info: ReleaseInfo,
}

/// Scripted readiness of a deployed image.
#[derive(Debug, Clone)]
struct Unready {
    image_fragment: String,
    pod_status: String,
}

#[derive(Default)]
pub struct MemoryReleases {
    releases: Mutex<BTreeMap<(String, String), StoredRelease>>,
    unready: Mutex<Vec<Unready>>,
    upgrade_delay: Mutex<Option<Duration>>,
    mutations: Mutex<Vec<String>>,
    faults: Faults,
}

impl MemoryReleases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, op: &str, transient: bool, message: &str) {
        self.faults.push(op, transient, message);
    }

    /// Workloads of images containing `image_fragment` never become ready.
    pub fn never_ready(&self, image_fragment: &str, pod_status: &str) {
        lock(&self.unready).push(Unready {
            image_fragment: image_fragment.to_string(),
            pod_status: pod_status.to_string(),
        });
    }

    /// Upgrades take `delay` before they land.
    pub fn set_upgrade_delay(&self, delay: Duration) {
        *lock(&self.upgrade_delay) = Some(delay);
    }

    /// Leave a release in a non-terminal state, as an interrupted deploy would.
    pub fn set_stuck(&self, namespace: &str, release: &str, status: ReleaseStatus) {
        let mut releases = lock(&self.releases);
        let entry = releases
            .entry((namespace.to_string(), release.to_string()))
            .or_insert_with(|| StoredRelease {
                info: ReleaseInfo {
                    name: release.to_string(),
                    namespace: namespace.to_string(),
                    revision: 0,
                    status: ReleaseStatus::Deployed,
                    image_ref: None,
                    last_deployed_revision: None,
                },
            });
        entry.info.revision += 1;
        entry.info.status = status;
    }

    pub fn release(&self, namespace: &str, release: &str) -> Option<ReleaseInfo> {
        lock(&self.releases)
            .get(&(namespace.to_string(), release.to_string()))
            .map(|r| r.info.clone())
    }

    pub fn mutations(&self) -> Vec<String> {
        lock(&self.mutations).clone()
    }

    pub fn count_mutations(&self, prefix: &str) -> usize {
        lock(&self.mutations)
            .iter()
            .filter(|m| m.starts_with(prefix))
            .count()
    }

    fn record(&self, entry: String) {
        tracing::debug!(mutation = %entry, "Memory release mutation");
        lock(&self.mutations).push(entry);
    }
}

fn image_of(values: &BTreeMap<String, String>) -> Option<String> {
    match (values.get("image.repository"), values.get("image.tag")) {
        (Some(repo), Some(tag)) => Some(format!("{repo}:{tag}")),
        _ => None,
    }
}

#[async_trait]
impl ReleaseBackend for MemoryReleases {
    async fn release_status(&self, namespace: &str, release: &str) -> Result<Option<ReleaseInfo>> {
        self.faults.take("release_status")?;
        Ok(self.release(namespace, release))
    }

    async fn upgrade_install(&self, request: &ReleaseRequest) -> Result<u32> {
        self.faults.take("upgrade_install")?;
        let delay = *lock(&self.upgrade_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut releases = lock(&self.releases);
        let key = (request.namespace.clone(), request.release.clone());
        let entry = releases.entry(key).or_insert_with(|| StoredRelease {
            info: ReleaseInfo {
                name: request.release.clone(),
                namespace: request.namespace.clone(),
                revision: 0,
                status: ReleaseStatus::Deployed,
                image_ref: None,
                last_deployed_revision: None,
            },
        });
        if entry.info.status.is_stuck() {
            return Err(ControllerError::Infra(
                "another operation (install/upgrade/rollback) is in progress".to_string(),
            ));
        }
        entry.info.revision += 1;
        entry.info.status = ReleaseStatus::Deployed;
        entry.info.image_ref = image_of(&request.values);
        entry.info.last_deployed_revision = Some(entry.info.revision);
        let revision = entry.info.revision;
        drop(releases);
        self.record(format!(
            "upgrade_install {} {}",
            request.namespace,
            image_of(&request.values).unwrap_or_default()
        ));
        Ok(revision)
    }

    async fn rollback(&self, namespace: &str, release: &str, revision: Option<u32>) -> Result<()> {
        self.faults.take("rollback")?;
        if let Some(stored) = lock(&self.releases).get_mut(&(namespace.to_string(), release.to_string())) {
            stored.info.revision += 1;
            stored.info.status = ReleaseStatus::Deployed;
            if let Some(rev) = revision {
                stored.info.last_deployed_revision = Some(rev);
            }
        }
        self.record(format!("rollback {namespace} {}", revision.map_or("previous".to_string(), |r| r.to_string())));
        Ok(())
    }

    async fn uninstall(&self, namespace: &str, release: &str) -> Result<()> {
        self.faults.take("uninstall")?;
        lock(&self.releases).remove(&(namespace.to_string(), release.to_string()));
        self.record(format!("uninstall {namespace}"));
        Ok(())
    }

    async fn workload_status(&self, namespace: &str) -> Result<WorkloadStatus> {
        self.faults.take("workload_status")?;
        let image = lock(&self.releases)
            .iter()
            .find(|((ns, _), _)| ns == namespace)
            .and_then(|(_, r)| r.info.image_ref.clone());
        let Some(image) = image else {
            return Ok(WorkloadStatus::default());
        };
        let unready = lock(&self.unready)
            .iter()
            .find(|u| image.contains(&u.image_fragment))
            .cloned();
        Ok(match unready {
            Some(u) => WorkloadStatus {
                desired_replicas: 1,
                ready_replicas: 0,
                last_pod_status: Some(u.pod_status),
            },
            None => WorkloadStatus {
                desired_replicas: 1,
                ready_replicas: 1,
                last_pod_status: None,
            },
        })
    }
}

/// Notifier that keeps the latest message per key, as the GitHub one does
/// with its single in-place comment.
#[derive(Default)]
pub struct RecordingNotifier {
    comments: Mutex<BTreeMap<String, StatusMessage>>,
    history: Mutex<Vec<StatusMessage>>,
    fail: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *lock(&self.fail) = failing;
    }

    pub fn latest(&self, marker_key: &str) -> Option<StatusMessage> {
        lock(&self.comments).get(marker_key).cloned()
    }

    /// Number of distinct comments (one per environment key).
    pub fn comment_count(&self) -> usize {
        lock(&self.comments).len()
    }

    pub fn history(&self) -> Vec<StatusMessage> {
        lock(&self.history).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn upsert_status(&self, message: &StatusMessage) -> Result<()> {
        if *lock(&self.fail) {
            return Err(ControllerError::GitHub("502 Bad Gateway".to_string()));
        }
        lock(&self.comments).insert(message.env_id.to_string(), message.clone());
        lock(&self.history).push(message.clone());
        Ok(())
    }
}

/// Fixed set of open pull requests; `None` simulates an unreachable API.
#[derive(Default)]
pub struct StaticPullRequests {
    open: Mutex<Option<BTreeSet<u64>>>,
}

impl StaticPullRequests {
    pub fn new(open: impl IntoIterator<Item = u64>) -> Self {
        Self {
            open: Mutex::new(Some(open.into_iter().collect())),
        }
    }

    pub fn set(&self, open: Option<BTreeSet<u64>>) {
        *lock(&self.open) = open;
    }
}

#[async_trait]
impl PullRequestSource for StaticPullRequests {
    async fn list_open_pull_requests(&self) -> Result<BTreeSet<u64>> {
        lock(&self.open)
            .clone()
            .ok_or_else(|| ControllerError::TransientInfra("pull request listing unavailable".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> NamespaceSpec {
        NamespaceSpec {
            name: name.to_string(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_and_recorded_once() {
        let cluster = MemoryCluster::new();
        cluster.create_namespace(&spec("a-pr-1")).await.unwrap();
        cluster.create_namespace(&spec("a-pr-1")).await.unwrap();
        assert_eq!(cluster.count_mutations("create_namespace"), 1);
        assert!(!cluster.namespace("a-pr-1").unwrap().quota_applied);
    }

    #[tokio::test]
    async fn delayed_deletion_keeps_namespace_terminating() {
        let cluster = MemoryCluster::new();
        cluster.set_instant_delete(false);
        cluster.create_namespace(&spec("a-pr-1")).await.unwrap();
        cluster.delete_namespace("a-pr-1").await.unwrap();
        assert!(cluster.namespace("a-pr-1").unwrap().is_terminating());
        cluster.finish_termination("a-pr-1");
        assert!(cluster.get_namespace("a-pr-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn faults_fire_once() {
        let cluster = MemoryCluster::new();
        cluster.fail_next("create_namespace", true, "etcdserver: leader changed");
        let err = cluster.create_namespace(&spec("a-pr-1")).await.unwrap_err();
        assert!(err.is_transient());
        cluster.create_namespace(&spec("a-pr-1")).await.unwrap();
    }

    #[tokio::test]
    async fn stuck_release_blocks_upgrade() {
        let releases = MemoryReleases::new();
        releases.set_stuck("ns", "app", ReleaseStatus::PendingUpgrade);
        let request = ReleaseRequest {
            namespace: "ns".to_string(),
            release: "app".to_string(),
            chart_ref: "./chart".to_string(),
            values: BTreeMap::new(),
        };
        assert!(releases.upgrade_install(&request).await.is_err());
        releases.rollback("ns", "app", None).await.unwrap();
        assert_eq!(releases.upgrade_install(&request).await.unwrap(), 3);
    }
}
