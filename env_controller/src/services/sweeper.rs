//! Orphan sweeper.
//!
//! Finds environments whose pull request is no longer open and that were
//! never torn down (a missed close webhook, a crash mid-teardown). Only
//! namespaces carrying the full set of ownership markers are considered;
//! other projects' namespaces are never touched.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};

use crate::config::ControllerConfig;
use crate::models::cluster::ObservedNamespace;
use crate::models::environment::{EnvId, Environment, EnvironmentState, PROJECT_LABEL};

pub struct OrphanSweeper {
    project_id: String,
    grace: Duration,
}

impl OrphanSweeper {
    pub fn new(project_id: &str, grace: Duration) -> Self {
        Self {
            project_id: project_id.to_string(),
            grace,
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(&config.project_id, config.orphan_grace)
    }

    /// Environments to close: owned namespaces and live records whose id is
    /// not in `open`, older than the grace window.
    pub fn sweep(
        &self,
        open: &BTreeSet<EnvId>,
        namespaces: &[ObservedNamespace],
        records: &[Environment],
        now: DateTime<Utc>,
    ) -> Vec<EnvId> {
        let mut orphans = BTreeSet::new();
        let records: BTreeMap<&EnvId, &Environment> = records.iter().map(|e| (&e.id, e)).collect();

        for ns in namespaces {
            if ns.labels.get(PROJECT_LABEL) != Some(&self.project_id) {
                continue;
            }
            let owned = EnvId::from_namespace_name(&ns.name).filter(|id| ns.is_owned_by(id));
            let Some(id) = owned else {
                tracing::warn!(
                    namespace = %ns.name,
                    "Namespace lacks ownership markers, skipping"
                );
                crate::metrics::ownership_mismatch();
                continue;
            };
            if open.contains(&id) {
                continue;
            }
            let created = ns
                .created_at
                .or_else(|| records.get(&id).map(|e| e.created_at));
            if created.is_some_and(|t| now - t < self.grace) {
                tracing::debug!(env = %id, "Within grace window, not sweeping");
                continue;
            }
            orphans.insert(id);
        }

        let present: BTreeSet<&str> = namespaces.iter().map(|ns| ns.name.as_str()).collect();
        for (id, env) in records {
            if env.state == EnvironmentState::Destroyed
                || id.project_id != self.project_id
                || open.contains(id)
                || present.contains(env.namespace_name.as_str())
            {
                continue;
            }
            if now - env.created_at < self.grace {
                continue;
            }
            orphans.insert(id.clone());
        }

        for id in &orphans {
            tracing::info!(env = %id, "Orphaned environment scheduled for removal");
            crate::metrics::orphan_removed();
        }
        orphans.into_iter().collect()
    }

    /// Closing records whose namespace has disappeared. Their teardown
    /// outlived its wait and nothing else will confirm it.
    pub fn stalled_teardowns(&self, namespaces: &[ObservedNamespace], records: &[Environment]) -> Vec<EnvId> {
        let present: BTreeSet<&str> = namespaces.iter().map(|ns| ns.name.as_str()).collect();
        records
            .iter()
            .filter(|env| {
                env.state == EnvironmentState::Closing
                    && env.id.project_id == self.project_id
                    && !present.contains(env.namespace_name.as_str())
            })
            .map(|env| env.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cluster::NamespacePhase;
    use crate::models::environment::ResourceQuota;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn env(project: &str, pr: u64, created: DateTime<Utc>) -> Environment {
        Environment::new(
            EnvId::new(project, pr).unwrap(),
            "abc1234",
            "main",
            ResourceQuota::default(),
            created,
        )
    }

    fn namespace_of(env: &Environment) -> ObservedNamespace {
        ObservedNamespace {
            name: env.namespace_name.clone(),
            phase: NamespacePhase::Active,
            labels: env.projected_labels(),
            annotations: env.creation_annotations(),
            created_at: Some(env.created_at),
            quota_applied: true,
        }
    }

    fn sweeper() -> OrphanSweeper {
        OrphanSweeper::new("k8s-ee", Duration::minutes(30))
    }

    #[test]
    fn closed_pull_requests_are_orphans() {
        let old = t0() - Duration::hours(2);
        let open_env = env("k8s-ee", 1, old);
        let closed_env = env("k8s-ee", 2, old);
        let namespaces = vec![namespace_of(&open_env), namespace_of(&closed_env)];
        let orphans = sweeper().sweep(&BTreeSet::from([open_env.id.clone()]), &namespaces, &[], t0());
        assert_eq!(orphans, vec![closed_env.id]);
    }

    #[test]
    fn open_pull_request_of_another_project_does_not_protect() {
        let old = t0() - Duration::hours(2);
        let ours = env("k8s-ee", 2, old);
        let theirs = EnvId::new("shop", 2).unwrap();
        let orphans = sweeper().sweep(
            &BTreeSet::from([theirs]),
            &[namespace_of(&ours)],
            &[ours.clone()],
            t0(),
        );
        assert_eq!(orphans, vec![ours.id]);
    }

    #[test]
    fn closing_records_without_namespace_are_stalled() {
        let old = t0() - Duration::hours(2);
        let mut stalled = env("k8s-ee", 3, old);
        stalled.state = EnvironmentState::Closing;
        let mut terminating = env("k8s-ee", 4, old);
        terminating.state = EnvironmentState::Closing;
        let mut foreign = env("shop", 3, old);
        foreign.state = EnvironmentState::Closing;
        let active = env("k8s-ee", 5, old);

        let found = sweeper().stalled_teardowns(
            &[namespace_of(&terminating)],
            &[stalled.clone(), terminating, foreign, active],
        );
        assert_eq!(found, vec![stalled.id]);
    }

    #[test]
    fn grace_window_protects_young_namespaces() {
        let young = env("k8s-ee", 2, t0() - Duration::minutes(10));
        let orphans = sweeper().sweep(&BTreeSet::new(), &[namespace_of(&young)], &[], t0());
        assert!(orphans.is_empty());
    }

    #[test]
    fn foreign_and_unmarked_namespaces_are_never_swept() {
        let old = t0() - Duration::hours(2);
        let other_project = env("shop", 2, old);
        let mut unmarked = namespace_of(&env("k8s-ee", 3, old));
        unmarked.annotations.clear();
        let mut renamed = namespace_of(&env("k8s-ee", 4, old));
        renamed.name = "k8s-ee-pr-5".to_string();

        let namespaces = vec![namespace_of(&other_project), unmarked, renamed];
        let orphans = sweeper().sweep(&BTreeSet::new(), &namespaces, &[], t0());
        assert!(orphans.is_empty());
    }

    #[test]
    fn records_without_namespace_are_included() {
        let old = t0() - Duration::hours(2);
        let lost = env("k8s-ee", 9, old);
        let mut gone = env("k8s-ee", 10, old);
        gone.state = EnvironmentState::Destroyed;
        let orphans = sweeper().sweep(&BTreeSet::new(), &[], &[lost.clone(), gone], t0());
        assert_eq!(orphans, vec![lost.id]);
    }
}
