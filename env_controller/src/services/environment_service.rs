//! Environment store: the authoritative record per key.
//!
//! Only the key's worker writes a record. Everyone else (API handlers, the
//! scheduler, the sweeper) reads snapshots.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::config::ControllerConfig;
use crate::error::Result;
use crate::models::cluster::{ObservedNamespace, ReleaseStatus};
use crate::models::environment::{
    DeploymentRecord, EnvId, Environment, EnvironmentState, HealthStatus, Preservation,
    PRESERVE_EXPIRES_ANNOTATION, PRESERVE_EXTENSIONS_ANNOTATION,
    PRESERVE_REQUESTED_ANNOTATION, PROJECT_LABEL,
};
use crate::services::cluster_service::{ClusterBackend, ReleaseBackend};
use crate::services::preservation_service::PreservationManager;
use crate::services::reconciler::recover_from_namespace;

#[derive(Default)]
pub struct EnvironmentStore {
    records: RwLock<BTreeMap<EnvId, Environment>>,
}

impl EnvironmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &EnvId) -> Option<Environment> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Commit a record. Returns the previous state, if any.
    pub fn put(&self, env: Environment) -> Option<EnvironmentState> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(env.id.clone(), env).map(|prev| prev.state)
    }

    pub fn list(&self) -> Vec<Environment> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Records that still claim cluster resources.
    pub fn live(&self) -> Vec<Environment> {
        self.list()
            .into_iter()
            .filter(|env| env.state != EnvironmentState::Destroyed)
            .collect()
    }

    pub fn find_by_pr(&self, pr_number: u64) -> Option<Environment> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .find(|env| env.id.pr_number == pr_number)
            .cloned()
    }
}

/// Preservation projected onto the namespace, if all three annotations parse.
pub fn preservation_from_annotations(ns: &ObservedNamespace) -> Option<Preservation> {
    let parse = |key: &str| {
        ns.annotations
            .get(key)
            .filter(|v| !v.is_empty())
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    };
    Some(Preservation {
        requested_at: parse(PRESERVE_REQUESTED_ANNOTATION)?,
        expires_at: parse(PRESERVE_EXPIRES_ANNOTATION)?,
        extension_count: ns
            .annotations
            .get(PRESERVE_EXTENSIONS_ANNOTATION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
    })
}

/// Rebuild the store from the managed namespaces of the configured project.
///
/// Preservations found in annotations are re-registered with the manager.
/// Namespaces lacking full ownership markers are left alone.
pub async fn rebuild_from_cluster(
    store: &EnvironmentStore,
    cluster: &dyn ClusterBackend,
    releases: &dyn ReleaseBackend,
    preservation: &PreservationManager,
    config: &ControllerConfig,
    now: DateTime<Utc>,
) -> Result<usize> {
    let project_id = config.project_id.as_str();
    let namespaces = cluster.list_managed_namespaces().await?;
    let mut restored = 0;

    for ns in namespaces {
        if ns.labels.get(PROJECT_LABEL).map(String::as_str) != Some(project_id) {
            continue;
        }
        let Some(id) = EnvId::from_namespace_name(&ns.name) else {
            continue;
        };
        if !ns.is_owned_by(&id) {
            tracing::warn!(namespace = %ns.name, "Skipping namespace without ownership markers");
            crate::metrics::ownership_mismatch();
            continue;
        }

        let mut env = recover_from_namespace(&id, &ns, &config.quota, now);
        env.state = if ns.is_terminating() {
            EnvironmentState::Closing
        } else {
            match releases.release_status(&ns.name, &config.release_name).await {
                Ok(Some(release)) => {
                    let deployed = matches!(release.status, ReleaseStatus::Deployed);
                    env.deployment = Some(DeploymentRecord {
                        image_ref: release.image_ref.clone().unwrap_or_default(),
                        commit_sha: env.labels.commit_sha.clone(),
                        health_status: if deployed {
                            HealthStatus::Unknown
                        } else {
                            HealthStatus::Unhealthy(release.status.as_str().to_string())
                        },
                        last_deployed_at: now,
                        release_revision: Some(release.revision),
                    });
                    if deployed {
                        EnvironmentState::Active
                    } else {
                        EnvironmentState::Failed
                    }
                }
                Ok(None) => EnvironmentState::Pending,
                Err(e) => {
                    tracing::warn!(namespace = %ns.name, "Release status unavailable: {e}");
                    EnvironmentState::Pending
                }
            }
        };

        if env.state == EnvironmentState::Active {
            if let Some(p) = preservation_from_annotations(&ns) {
                let held = preservation.restore(&id, p, now);
                env.state = EnvironmentState::Preserved;
                env.preservation = Some(held);
            }
        }

        tracing::info!(env = %id, state = %env.state, "Restored environment");
        store.put(env);
        restored += 1;
    }
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cluster::NamespacePhase;
    use crate::models::environment::{ResourceQuota, CREATED_AT_ANNOTATION, OWNER_ANNOTATION};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn put_reports_previous_state() {
        let store = EnvironmentStore::new();
        let id = EnvId::new("k8s-ee", 7).unwrap();
        let env = Environment::new(id.clone(), "abc1234", "main", ResourceQuota::default(), t0());
        assert_eq!(store.put(env.clone()), None);
        let active = env.transition(EnvironmentState::Active, t0());
        assert_eq!(store.put(active), Some(EnvironmentState::Pending));
        assert_eq!(store.get(&id).unwrap().state, EnvironmentState::Active);
        assert_eq!(store.find_by_pr(7).unwrap().id, id);
        assert!(store.find_by_pr(8).is_none());
    }

    #[test]
    fn parses_preservation_annotations() {
        let mut ns = ObservedNamespace {
            name: "k8s-ee-pr-1".to_string(),
            phase: NamespacePhase::Active,
            labels: BTreeMap::new(),
            annotations: BTreeMap::from([
                (OWNER_ANNOTATION.to_string(), "k8s-ee#1".to_string()),
                (CREATED_AT_ANNOTATION.to_string(), t0().to_rfc3339()),
                (PRESERVE_REQUESTED_ANNOTATION.to_string(), t0().to_rfc3339()),
                (
                    PRESERVE_EXPIRES_ANNOTATION.to_string(),
                    (t0() + chrono::Duration::hours(48)).to_rfc3339(),
                ),
                (PRESERVE_EXTENSIONS_ANNOTATION.to_string(), "2".to_string()),
            ]),
            created_at: Some(t0()),
            quota_applied: true,
        };
        let p = preservation_from_annotations(&ns).unwrap();
        assert_eq!(p.expires_at, t0() + chrono::Duration::hours(48));
        assert_eq!(p.extension_count, 2);

        ns.annotations
            .insert(PRESERVE_EXPIRES_ANNOTATION.to_string(), String::new());
        assert!(preservation_from_annotations(&ns).is_none());
    }
}
