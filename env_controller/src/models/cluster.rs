//! Observed cluster state as seen by a reconciliation step.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::environment::{
    EnvId, Environment, MANAGED_BY_LABEL, MANAGED_BY_VALUE, OWNER_ANNOTATION, PROJECT_LABEL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamespacePhase {
    Active,
    Terminating,
}

/// A namespace as returned by the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedNamespace {
    pub name: String,
    pub phase: NamespacePhase,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    /// Whether our ResourceQuota object exists in the namespace.
    pub quota_applied: bool,
}

impl ObservedNamespace {
    /// Ownership requires the managed-by label, the project label, the
    /// immutable owner annotation, and the deterministic name, all agreeing
    /// on `id`.
    pub fn is_owned_by(&self, id: &EnvId) -> bool {
        self.name == id.namespace_name()
            && self.labels.get(MANAGED_BY_LABEL).map(String::as_str) == Some(MANAGED_BY_VALUE)
            && self.labels.get(PROJECT_LABEL) == Some(&id.project_id)
            && self.annotations.get(OWNER_ANNOTATION) == Some(&id.to_string())
    }

    /// Carries the managed-by label, regardless of the other markers.
    pub fn claims_managed(&self) -> bool {
        self.labels.get(MANAGED_BY_LABEL).map(String::as_str) == Some(MANAGED_BY_VALUE)
    }

    pub fn is_terminating(&self) -> bool {
        self.phase == NamespacePhase::Terminating
    }
}

/// Desired namespace, created once per environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl NamespaceSpec {
    pub fn for_environment(env: &Environment) -> Self {
        Self {
            name: env.namespace_name.clone(),
            labels: env.projected_labels(),
            annotations: env.creation_annotations(),
        }
    }
}

/// Input of `reconcile` besides the intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterState {
    /// Authoritative record, if one exists.
    pub environment: Option<Environment>,
    /// The environment's namespace, if present in the cluster.
    pub namespace: Option<ObservedNamespace>,
    pub observed_at: DateTime<Utc>,
}

impl ClusterState {
    pub fn namespace_owned_by(&self, id: &EnvId) -> bool {
        self.namespace.as_ref().is_some_and(|ns| ns.is_owned_by(id))
    }

    /// Namespace is present, owned, not terminating, and has its quota.
    pub fn namespace_ready(&self, id: &EnvId) -> bool {
        self.namespace
            .as_ref()
            .is_some_and(|ns| ns.is_owned_by(id) && !ns.is_terminating() && ns.quota_applied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    Deployed,
    Failed,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
    Uninstalling,
    Superseded,
    Unknown(String),
}

impl ReleaseStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "deployed" => ReleaseStatus::Deployed,
            "failed" => ReleaseStatus::Failed,
            "pending-install" => ReleaseStatus::PendingInstall,
            "pending-upgrade" => ReleaseStatus::PendingUpgrade,
            "pending-rollback" => ReleaseStatus::PendingRollback,
            "uninstalling" => ReleaseStatus::Uninstalling,
            "superseded" => ReleaseStatus::Superseded,
            other => ReleaseStatus::Unknown(other.to_string()),
        }
    }

    /// A release in one of these states blocks further upgrades.
    pub fn is_stuck(&self) -> bool {
        matches!(
            self,
            ReleaseStatus::PendingInstall
                | ReleaseStatus::PendingUpgrade
                | ReleaseStatus::PendingRollback
                | ReleaseStatus::Uninstalling
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            ReleaseStatus::Deployed => "deployed",
            ReleaseStatus::Failed => "failed",
            ReleaseStatus::PendingInstall => "pending-install",
            ReleaseStatus::PendingUpgrade => "pending-upgrade",
            ReleaseStatus::PendingRollback => "pending-rollback",
            ReleaseStatus::Uninstalling => "uninstalling",
            ReleaseStatus::Superseded => "superseded",
            ReleaseStatus::Unknown(s) => s,
        }
    }
}

/// Current chart release of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub name: String,
    pub namespace: String,
    pub revision: u32,
    pub status: ReleaseStatus,
    /// Image reference from the release values, when set.
    pub image_ref: Option<String>,
    /// Latest revision that reached `deployed`, if any.
    pub last_deployed_revision: Option<u32>,
}

/// Aggregate readiness of the workloads in a namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub desired_replicas: u32,
    pub ready_replicas: u32,
    /// Human-readable summary of the least healthy pod.
    pub last_pod_status: Option<String>,
}

impl WorkloadStatus {
    pub fn all_ready(&self) -> bool {
        self.desired_replicas > 0 && self.ready_replicas >= self.desired_replicas
    }
}
