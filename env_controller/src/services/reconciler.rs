//! Environment reconciler: the state machine.
//!
//! `reconcile` is a pure function of the intent and the observed state: it
//! never performs I/O and keeps no memory between calls. The returned
//! actions are derived from what is observed, so replaying an intent against
//! the same observation yields the same result, and replaying it after the
//! actions were applied issues no further cluster mutation.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::ControllerConfig;
use crate::events::environment::{CloseReason, EnvironmentIntent, IntentKind};
use crate::models::cluster::{ClusterState, NamespaceSpec, ObservedNamespace};
use crate::models::environment::{
    short_sha, validate_commit_sha, DeploymentRecord, EnvId, Environment, EnvironmentState,
    HealthStatus, LimitRangeDefaults, ResourceQuota, BRANCH_LABEL, COMMIT_LABEL,
};
use crate::models::status::StatusMessage;

/// Chart deployment requested for an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployRequest {
    pub env_id: EnvId,
    pub namespace: String,
    pub release: String,
    pub image_ref: String,
    pub commit_sha: String,
    pub values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    CreateNamespace(NamespaceSpec),
    ApplyQuota {
        namespace: String,
        quota: ResourceQuota,
        limits: LimitRangeDefaults,
    },
    AwaitNamespaceReady {
        namespace: String,
    },
    Deploy(DeployRequest),
    /// Admission gate: runs before the step's record is committed.
    RequestPreservation,
    ReleasePreservation,
    ProjectLabels {
        namespace: String,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
    },
    DeleteNamespace {
        namespace: String,
    },
    AwaitTeardown {
        namespace: String,
    },
    Notify(StatusMessage),
}

impl Action {
    pub fn is_gate(&self) -> bool {
        matches!(self, Action::RequestPreservation)
    }

    /// Whether executing the action changes cluster objects.
    pub fn mutates_cluster(&self) -> bool {
        matches!(
            self,
            Action::CreateNamespace(_)
                | Action::ApplyQuota { .. }
                | Action::Deploy(_)
                | Action::ProjectLabels { .. }
                | Action::DeleteNamespace { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Action::CreateNamespace(_) => "create_namespace",
            Action::ApplyQuota { .. } => "apply_quota",
            Action::AwaitNamespaceReady { .. } => "await_namespace_ready",
            Action::Deploy(_) => "deploy",
            Action::RequestPreservation => "request_preservation",
            Action::ReleasePreservation => "release_preservation",
            Action::ProjectLabels { .. } => "project_labels",
            Action::DeleteNamespace { .. } => "delete_namespace",
            Action::AwaitTeardown { .. } => "await_teardown",
            Action::Notify(_) => "notify",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    NoOp,
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Record to commit; `None` leaves the store untouched.
    pub environment: Option<Environment>,
    pub actions: Vec<Action>,
    pub outcome: Outcome,
}

impl ReconcileResult {
    fn noop() -> Self {
        Self {
            environment: None,
            actions: Vec::new(),
            outcome: Outcome::NoOp,
        }
    }

    fn applied(environment: Option<Environment>, actions: Vec<Action>) -> Self {
        Self {
            environment,
            actions,
            outcome: Outcome::Applied,
        }
    }

    fn rejected(reason: impl Into<String>, actions: Vec<Action>) -> Self {
        Self {
            environment: None,
            actions,
            outcome: Outcome::Rejected(reason.into()),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.outcome == Outcome::NoOp
    }

    pub fn mutating_actions(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter().filter(|a| a.mutates_cluster())
    }
}

/// Fixed inputs of the state machine.
#[derive(Debug, Clone)]
pub struct Reconciler {
    quota: ResourceQuota,
    limits: LimitRangeDefaults,
    image_repository: String,
    release_name: String,
    preview_domain_suffix: String,
}

impl Reconciler {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            quota: config.quota.clone(),
            limits: config.limit_range.clone(),
            image_repository: config.image_repository.clone(),
            release_name: config.release_name.clone(),
            preview_domain_suffix: config.preview_domain_suffix.clone(),
        }
    }

    pub fn image_ref(&self, commit_sha: &str) -> String {
        format!("{}:sha-{}", self.image_repository, short_sha(commit_sha))
    }

    pub fn preview_url(&self, namespace: &str) -> String {
        format!("https://{}.{}", namespace, self.preview_domain_suffix)
    }

    pub fn reconcile(&self, intent: &EnvironmentIntent, observed: &ClusterState) -> ReconcileResult {
        let current = observed
            .environment
            .as_ref()
            .filter(|env| env.state != EnvironmentState::Destroyed);

        let Some(env) = current else {
            return self.from_absent(intent, observed);
        };

        match (&env.state, &intent.kind) {
            // Explicit teardown wins over everything, preservation included.
            (_, IntentKind::Close { reason }) => self.close(env, *reason, observed),

            (EnvironmentState::Pending, IntentKind::NamespaceReady) => self.deploy(env, observed),
            (EnvironmentState::Pending, IntentKind::ProvisionFailed { reason }) => {
                let mut next = env.transition(EnvironmentState::Failed, observed.observed_at);
                next.last_error = Some(reason.clone());
                let notify = self.notify(&next, format!("failed: {reason}"), None);
                ReconcileResult::applied(Some(next), vec![notify])
            }
            (
                EnvironmentState::Pending,
                IntentKind::Open { commit_sha, branch } | IntentKind::Synchronize { commit_sha, branch },
            ) => match validate_commit_sha(commit_sha) {
                Err(e) => self.reject_for(env, e.to_string()),
                Ok(()) => {
                    let next = with_commit(env, commit_sha, branch, observed);
                    self.provision_or_deploy(next, observed)
                }
            },

            (EnvironmentState::Deploying, IntentKind::DeploySucceeded { commit_sha, image_ref, release_revision, health, deployed_at }) => {
                if *commit_sha != env.labels.commit_sha {
                    return ReconcileResult::noop();
                }
                let mut next = env.transition(EnvironmentState::Active, observed.observed_at);
                next.deployment = Some(DeploymentRecord {
                    image_ref: image_ref.clone(),
                    commit_sha: commit_sha.clone(),
                    health_status: health.clone(),
                    last_deployed_at: *deployed_at,
                    release_revision: *release_revision,
                });
                next.last_error = None;
                let actions = vec![
                    self.project(&next),
                    self.notify(&next, "active", None),
                ];
                ReconcileResult::applied(Some(next), actions)
            }
            (EnvironmentState::Deploying, IntentKind::DeployFailed { commit_sha, reason, last_pod_status }) => {
                if *commit_sha != env.labels.commit_sha {
                    return ReconcileResult::noop();
                }
                let mut next = env.transition(EnvironmentState::Failed, observed.observed_at);
                let detail = match last_pod_status {
                    Some(pod) => format!("{reason} (last pod status: {pod})"),
                    None => reason.clone(),
                };
                if let Some(deployment) = next.deployment.as_mut() {
                    deployment.health_status = HealthStatus::Unhealthy(detail.clone());
                }
                next.last_error = Some(detail.clone());
                let notify = self.notify(&next, format!("failed: {detail}"), None);
                ReconcileResult::applied(Some(next), vec![notify])
            }
            (
                EnvironmentState::Deploying | EnvironmentState::Active,
                IntentKind::Open { commit_sha, branch } | IntentKind::Synchronize { commit_sha, branch },
            ) => {
                if let Err(e) = validate_commit_sha(commit_sha) {
                    return self.reject_for(env, e.to_string());
                }
                if env.state == EnvironmentState::Active && !observed.namespace_owned_by(&env.id) {
                    // Namespace vanished underneath an active environment.
                    let next = with_commit(env, commit_sha, branch, observed)
                        .transition(EnvironmentState::Pending, observed.observed_at);
                    return self.provision_or_deploy(next, observed);
                }
                if *commit_sha == env.labels.commit_sha {
                    return ReconcileResult::noop();
                }
                let next = with_commit(env, commit_sha, branch, observed);
                self.deploy(&next, observed)
            }

            (EnvironmentState::Active, IntentKind::Preserve { .. }) => {
                let next = env.transition(EnvironmentState::PreserveRequested, observed.observed_at);
                ReconcileResult::applied(Some(next), vec![Action::RequestPreservation])
            }
            (EnvironmentState::Active, IntentKind::PreserveDenied { reason }) => {
                let notify = self.notify(env, "active", Some(format!("denied: {reason}")));
                ReconcileResult::applied(None, vec![notify])
            }

            (
                EnvironmentState::PreserveRequested | EnvironmentState::Preserved,
                IntentKind::PreserveAdmitted { preservation },
            ) => {
                let mut next = env.transition(EnvironmentState::Preserved, observed.observed_at);
                next.preservation = Some(preservation.clone());
                let actions = vec![self.project(&next), self.notify(&next, "active", None)];
                ReconcileResult::applied(Some(next), actions)
            }
            (EnvironmentState::PreserveRequested, IntentKind::PreserveDenied { reason }) => {
                let mut next = env.transition(EnvironmentState::Active, observed.observed_at);
                next.preservation = None;
                let notify = self.notify(&next, "active", Some(format!("denied: {reason}")));
                ReconcileResult::applied(Some(next), vec![notify])
            }

            // Extension: the manager resets the existing preservation.
            (EnvironmentState::Preserved, IntentKind::Preserve { .. }) => {
                ReconcileResult::applied(None, vec![Action::RequestPreservation])
            }
            (EnvironmentState::Preserved, IntentKind::ExpiryWarning { expires_at }) => {
                let current = env.preservation.as_ref().map(|p| p.expires_at);
                if current != Some(*expires_at) {
                    return ReconcileResult::noop();
                }
                let notify = self.notify(
                    env,
                    "active",
                    Some(format!(
                        "expires at {} (less than an hour left, comment `/preserve` to extend)",
                        expires_at.format("%Y-%m-%d %H:%M UTC")
                    )),
                );
                ReconcileResult::applied(None, vec![notify])
            }
            (EnvironmentState::Preserved, IntentKind::PreserveExpired) => {
                let expired = env
                    .preservation
                    .as_ref()
                    .is_some_and(|p| p.expires_at <= observed.observed_at);
                if !expired {
                    return ReconcileResult::noop();
                }
                let next = env.transition(EnvironmentState::Expiring, observed.observed_at);
                let actions = vec![
                    Action::ReleasePreservation,
                    self.notify(
                        &next,
                        "active",
                        Some("expired, environment scheduled for teardown".to_string()),
                    ),
                ];
                ReconcileResult::applied(Some(next), actions)
            }

            (
                EnvironmentState::Failed,
                IntentKind::Open { commit_sha, branch } | IntentKind::Synchronize { commit_sha, branch },
            ) => {
                if let Err(e) = validate_commit_sha(commit_sha) {
                    return self.reject_for(env, e.to_string());
                }
                let retry = matches!(intent.kind, IntentKind::Open { .. })
                    || *commit_sha != env.labels.commit_sha;
                if !retry {
                    return ReconcileResult::noop();
                }
                let next = with_commit(env, commit_sha, branch, observed);
                self.provision_or_deploy(next, observed)
            }

            (EnvironmentState::Closing, IntentKind::TeardownConfirmed) => {
                if env.reopen_requested {
                    return self.reprovision(env, observed);
                }
                let mut next = env.transition(EnvironmentState::Destroyed, observed.observed_at);
                next.preservation = None;
                let notify = self.notify(&next, "destroyed", None);
                ReconcileResult::applied(Some(next), vec![notify])
            }
            (
                EnvironmentState::Closing,
                IntentKind::Open { commit_sha, branch } | IntentKind::Synchronize { commit_sha, branch },
            ) => {
                if let Err(e) = validate_commit_sha(commit_sha) {
                    return self.reject_for(env, e.to_string());
                }
                let mut next = with_commit(env, commit_sha, branch, observed);
                next.reopen_requested = true;
                match &observed.namespace {
                    None => self.reprovision(&next, observed),
                    Some(ns) if ns.is_owned_by(&env.id) => {
                        // Keep waiting on the old namespace, then provision anew.
                        let mut actions = Vec::new();
                        if !ns.is_terminating() {
                            actions.push(Action::DeleteNamespace {
                                namespace: ns.name.clone(),
                            });
                        }
                        actions.push(Action::AwaitTeardown {
                            namespace: ns.name.clone(),
                        });
                        actions.push(self.notify(&next, "waiting for previous teardown", None));
                        ReconcileResult::applied(Some(next), actions)
                    }
                    Some(ns) => {
                        let reason = format!("namespace {} exists without ownership markers", ns.name);
                        tracing::warn!(env = %env.id, namespace = %ns.name, "{reason}");
                        self.reject_for(env, reason)
                    }
                }
            }
            (EnvironmentState::Closing, IntentKind::TeardownFailed { reason }) => {
                let mut next = env.clone();
                next.last_error = Some(reason.clone());
                next.updated_at = observed.observed_at;
                ReconcileResult::applied(Some(next), Vec::new())
            }

            (
                EnvironmentState::Pending | EnvironmentState::Deploying | EnvironmentState::Failed,
                IntentKind::Preserve { .. },
            ) => self.reject_for(
                env,
                format!("cannot preserve an environment in state {}", env.state),
            ),

            _ => ReconcileResult::noop(),
        }
    }

    fn from_absent(&self, intent: &EnvironmentIntent, observed: &ClusterState) -> ReconcileResult {
        let id = &intent.env_id;
        let now = observed.observed_at;
        match &intent.kind {
            IntentKind::Open { commit_sha, branch } | IntentKind::Synchronize { commit_sha, branch } => {
                let env = Environment::new(id.clone(), commit_sha, branch, self.quota.clone(), now);
                if let Err(e) = validate_commit_sha(commit_sha) {
                    return self.reject_for(&env, e.to_string());
                }
                if branch.trim().is_empty() {
                    return self.reject_for(&env, "branch name is empty".to_string());
                }
                if let Some(ns) = &observed.namespace {
                    if !ns.is_terminating() && !ns.is_owned_by(id) {
                        let reason = format!(
                            "namespace {} exists without ownership markers",
                            ns.name
                        );
                        tracing::warn!(env = %id, namespace = %ns.name, "{reason}");
                        let notify = self.notify(&env, format!("rejected: {reason}"), None);
                        return ReconcileResult::rejected(reason, vec![notify]);
                    }
                }
                self.provision_or_deploy(env, observed)
            }
            IntentKind::Close { reason } => match &observed.namespace {
                Some(ns) if ns.is_owned_by(id) => {
                    let env = recover_from_namespace(id, ns, &self.quota, now);
                    self.close(&env, *reason, observed)
                }
                _ => ReconcileResult::noop(),
            },
            IntentKind::Preserve { .. } => {
                ReconcileResult::rejected("no environment exists for this pull request", Vec::new())
            }
            _ => ReconcileResult::noop(),
        }
    }

    /// Create whatever part of the namespace is missing, or deploy straight
    /// away when it is already in place.
    fn provision_or_deploy(&self, env: Environment, observed: &ClusterState) -> ReconcileResult {
        if observed.namespace_ready(&env.id) {
            return self.deploy(&env, observed);
        }
        let next = env.transition(EnvironmentState::Pending, observed.observed_at);
        let mut actions = Vec::new();
        match &observed.namespace {
            Some(ns) if ns.is_terminating() => {
                actions.push(Action::AwaitTeardown {
                    namespace: ns.name.clone(),
                });
                actions.push(Action::CreateNamespace(NamespaceSpec::for_environment(&next)));
                actions.push(self.apply_quota(&next));
            }
            Some(ns) => {
                if !ns.quota_applied {
                    actions.push(self.apply_quota(&next));
                }
            }
            None => {
                actions.push(Action::CreateNamespace(NamespaceSpec::for_environment(&next)));
                actions.push(self.apply_quota(&next));
            }
        }
        actions.push(Action::AwaitNamespaceReady {
            namespace: next.namespace_name.clone(),
        });
        actions.push(self.notify(&next, "provisioning namespace", None));
        ReconcileResult::applied(Some(next), actions)
    }

    /// Start over for a pull request that reopened during teardown.
    fn reprovision(&self, env: &Environment, observed: &ClusterState) -> ReconcileResult {
        let mut next = env.transition(EnvironmentState::Pending, observed.observed_at);
        next.reopen_requested = false;
        next.deployment = None;
        next.preservation = None;
        next.last_error = None;
        tracing::info!(env = %env.id, commit = %short_sha(&next.labels.commit_sha), "Reprovisioning reopened environment");
        self.provision_or_deploy(next, observed)
    }

    fn deploy(&self, env: &Environment, observed: &ClusterState) -> ReconcileResult {
        let next = env.transition(EnvironmentState::Deploying, observed.observed_at);
        let request = self.deploy_request(&next);
        let notify = self.notify(
            &next,
            format!("deploying `{}`", short_sha(&next.labels.commit_sha)),
            None,
        );
        ReconcileResult::applied(Some(next), vec![Action::Deploy(request), notify])
    }

    fn close(&self, env: &Environment, reason: CloseReason, observed: &ClusterState) -> ReconcileResult {
        let now = observed.observed_at;
        let mut actions = Vec::new();
        let mut next = env.transition(EnvironmentState::Closing, now);
        next.reopen_requested = false;

        if env.state.holds_preservation() {
            actions.push(Action::ReleasePreservation);
        }
        if env.state != EnvironmentState::Expiring {
            next.preservation = None;
        }

        match &observed.namespace {
            Some(ns) if ns.is_owned_by(&env.id) => {
                if !ns.is_terminating() {
                    actions.push(Action::DeleteNamespace {
                        namespace: ns.name.clone(),
                    });
                }
                actions.push(Action::AwaitTeardown {
                    namespace: ns.name.clone(),
                });
            }
            Some(ns) => {
                tracing::warn!(
                    env = %env.id,
                    namespace = %ns.name,
                    "Namespace lacks ownership markers, leaving it for manual review"
                );
                next.state = EnvironmentState::Destroyed;
                next.last_error = Some(format!(
                    "namespace {} lacks ownership markers and was not deleted",
                    ns.name
                ));
            }
            None => {
                next.state = EnvironmentState::Destroyed;
            }
        }

        if next.state != env.state {
            let status = match (next.state, reason) {
                (EnvironmentState::Destroyed, _) => "destroyed".to_string(),
                (_, CloseReason::PullRequestClosed { merged: true }) => {
                    "tearing down (pull request merged)".to_string()
                }
                (_, CloseReason::PullRequestClosed { merged: false }) => {
                    "tearing down (pull request closed)".to_string()
                }
                (_, CloseReason::PreservationExpired) => {
                    "tearing down (preservation expired)".to_string()
                }
                (_, CloseReason::Orphaned) => "tearing down (orphaned)".to_string(),
            };
            actions.push(self.notify(&next, status, None));
        }
        ReconcileResult::applied(Some(next), actions)
    }

    fn reject_for(&self, env: &Environment, reason: String) -> ReconcileResult {
        let notify = self.notify(env, env.state.as_str(), Some(format!("request rejected: {reason}")));
        ReconcileResult::rejected(reason, vec![notify])
    }

    fn apply_quota(&self, env: &Environment) -> Action {
        Action::ApplyQuota {
            namespace: env.namespace_name.clone(),
            quota: env.quota.clone(),
            limits: self.limits.clone(),
        }
    }

    fn project(&self, env: &Environment) -> Action {
        Action::ProjectLabels {
            namespace: env.namespace_name.clone(),
            labels: env.projected_labels(),
            annotations: env.projected_annotations(),
        }
    }

    fn deploy_request(&self, env: &Environment) -> DeployRequest {
        let image_ref = self.image_ref(&env.labels.commit_sha);
        let tag = format!("sha-{}", short_sha(&env.labels.commit_sha));
        let host = format!("{}.{}", env.namespace_name, self.preview_domain_suffix);
        let values = BTreeMap::from([
            ("image.repository".to_string(), self.image_repository.clone()),
            ("image.tag".to_string(), tag),
            ("ingress.host".to_string(), host),
            ("prNumber".to_string(), env.id.pr_number.to_string()),
        ]);
        DeployRequest {
            env_id: env.id.clone(),
            namespace: env.namespace_name.clone(),
            release: self.release_name.clone(),
            image_ref,
            commit_sha: env.labels.commit_sha.clone(),
            values,
        }
    }

    fn notify(&self, env: &Environment, deploy_status: impl Into<String>, preserve_status: Option<String>) -> Action {
        let preserve_status = preserve_status.unwrap_or_else(|| match &env.preservation {
            Some(p) if env.state == EnvironmentState::Preserved => format!(
                "preserved until {} (extensions: {})",
                p.expires_at.format("%Y-%m-%d %H:%M UTC"),
                p.extension_count
            ),
            _ => "not preserved".to_string(),
        });
        Action::Notify(StatusMessage {
            env_id: env.id.clone(),
            preview_url: self.preview_url(&env.namespace_name),
            commit_sha: env.labels.commit_sha.clone(),
            branch_name: env.labels.branch_name.clone(),
            deploy_status: deploy_status.into(),
            preserve_status,
        })
    }
}

fn with_commit(env: &Environment, commit_sha: &str, branch: &str, observed: &ClusterState) -> Environment {
    let mut next = env.clone();
    next.labels.commit_sha = commit_sha.to_string();
    if !branch.trim().is_empty() {
        next.labels.branch_name = branch.to_string();
    }
    next.updated_at = observed.observed_at;
    next
}

/// Rebuild a minimal record for a namespace whose record was lost.
pub fn recover_from_namespace(
    id: &EnvId,
    ns: &ObservedNamespace,
    quota: &ResourceQuota,
    now: chrono::DateTime<chrono::Utc>,
) -> Environment {
    let commit = ns.labels.get(COMMIT_LABEL).cloned().unwrap_or_default();
    let branch = ns.labels.get(BRANCH_LABEL).cloned().unwrap_or_default();
    let created = ns.created_at.unwrap_or(now);
    let mut env = Environment::new(id.clone(), &commit, &branch, quota.clone(), created);
    env.updated_at = now;
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cluster::NamespacePhase;
    use crate::models::environment::Preservation;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    const SHA_A: &str = "abc1234aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const SHA_B: &str = "def5678bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(&ControllerConfig::default())
    }

    fn key() -> EnvId {
        EnvId::new("k8s-ee", 42).unwrap()
    }

    fn intent(kind: IntentKind) -> EnvironmentIntent {
        EnvironmentIntent::new(key(), kind)
    }

    fn open(sha: &str) -> IntentKind {
        IntentKind::Open {
            commit_sha: sha.to_string(),
            branch: "feature/login".to_string(),
        }
    }

    fn sync(sha: &str) -> IntentKind {
        IntentKind::Synchronize {
            commit_sha: sha.to_string(),
            branch: "feature/login".to_string(),
        }
    }

    fn owned_namespace(env: &Environment, quota_applied: bool) -> ObservedNamespace {
        ObservedNamespace {
            name: env.namespace_name.clone(),
            phase: NamespacePhase::Active,
            labels: env.projected_labels(),
            annotations: env.creation_annotations(),
            created_at: Some(env.created_at),
            quota_applied,
        }
    }

    fn env_in(state: EnvironmentState) -> Environment {
        let mut env = Environment::new(key(), SHA_A, "feature/login", ResourceQuota::default(), t0());
        env.state = state;
        env
    }

    fn observed(env: Option<Environment>, ns: Option<ObservedNamespace>) -> ClusterState {
        ClusterState {
            environment: env,
            namespace: ns,
            observed_at: t0(),
        }
    }

    fn with_ns(env: Environment) -> ClusterState {
        let ns = owned_namespace(&env, true);
        observed(Some(env), Some(ns))
    }

    #[test]
    fn open_on_absent_creates_namespace_and_quota() {
        let result = reconciler().reconcile(&intent(open(SHA_A)), &observed(None, None));
        let env = result.environment.as_ref().unwrap();
        assert_eq!(env.state, EnvironmentState::Pending);
        assert_eq!(env.namespace_name, "k8s-ee-pr-42");
        let names: Vec<_> = result.actions.iter().map(Action::name).collect();
        assert_eq!(
            names,
            ["create_namespace", "apply_quota", "await_namespace_ready", "notify"]
        );
        match &result.actions[1] {
            Action::ApplyQuota { quota, .. } => {
                assert_eq!(quota.cpu_limit, "1");
                assert_eq!(quota.memory_limit, "2Gi");
                assert_eq!(quota.storage_limit, "5Gi");
                assert_eq!(quota.max_pods, 10);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn reconcile_is_idempotent() {
        let r = reconciler();
        let i = intent(open(SHA_A));
        let state = observed(None, None);
        assert_eq!(r.reconcile(&i, &state), r.reconcile(&i, &state));
    }

    #[test]
    fn replay_after_apply_issues_no_mutation() {
        let r = reconciler();
        let i = intent(open(SHA_A));
        let first = r.reconcile(&i, &observed(None, None));
        let env = first.environment.unwrap();
        // Namespace and quota now exist; a duplicate delivery must not recreate them.
        let after = observed(Some(env.clone()), Some(owned_namespace(&env, true)));
        let replay = r.reconcile(&i, &after);
        assert!(replay
            .mutating_actions()
            .all(|a| !matches!(a, Action::CreateNamespace(_) | Action::ApplyQuota { .. })));

        let active = with_ns(env_in(EnvironmentState::Active));
        assert!(r.reconcile(&intent(sync(SHA_A)), &active).is_noop());
        assert!(r.reconcile(&intent(open(SHA_A)), &active).is_noop());
    }

    #[test]
    fn namespace_ready_starts_deploy_with_sha_tag() {
        let env = env_in(EnvironmentState::Pending);
        let result = reconciler().reconcile(&intent(IntentKind::NamespaceReady), &with_ns(env));
        assert_eq!(result.environment.unwrap().state, EnvironmentState::Deploying);
        match &result.actions[0] {
            Action::Deploy(req) => {
                assert_eq!(req.image_ref, "ghcr.io/k8s-ee/app:sha-abc1234");
                assert_eq!(req.values["ingress.host"], "k8s-ee-pr-42.k8s-ee.example.dev");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn deploy_success_activates_and_notifies_preview_url() {
        let env = env_in(EnvironmentState::Deploying);
        let kind = IntentKind::DeploySucceeded {
            commit_sha: SHA_A.to_string(),
            image_ref: "ghcr.io/k8s-ee/app:sha-abc1234".to_string(),
            release_revision: Some(1),
            health: HealthStatus::Healthy,
            deployed_at: t0(),
        };
        let result = reconciler().reconcile(&intent(kind), &with_ns(env));
        let next = result.environment.unwrap();
        assert_eq!(next.state, EnvironmentState::Active);
        assert_eq!(next.deployment.unwrap().release_revision, Some(1));
        let notify = result
            .actions
            .iter()
            .find_map(|a| match a {
                Action::Notify(m) => Some(m),
                _ => None,
            })
            .unwrap();
        assert!(notify.render_markdown().contains("k8s-ee-pr-42.k8s-ee.example.dev"));
    }

    #[test]
    fn stale_deploy_outcomes_are_ignored() {
        let mut env = env_in(EnvironmentState::Deploying);
        env.labels.commit_sha = SHA_B.to_string();
        let stale = IntentKind::DeploySucceeded {
            commit_sha: SHA_A.to_string(),
            image_ref: "x".to_string(),
            release_revision: None,
            health: HealthStatus::Healthy,
            deployed_at: t0(),
        };
        assert!(reconciler().reconcile(&intent(stale), &with_ns(env.clone())).is_noop());
        let failed = IntentKind::DeployFailed {
            commit_sha: SHA_A.to_string(),
            reason: "timeout".to_string(),
            last_pod_status: None,
        };
        assert!(reconciler().reconcile(&intent(failed), &with_ns(env)).is_noop());
    }

    #[test]
    fn synchronize_while_deploying_supersedes_target() {
        let env = env_in(EnvironmentState::Deploying);
        let result = reconciler().reconcile(&intent(sync(SHA_B)), &with_ns(env));
        let next = result.environment.unwrap();
        assert_eq!(next.state, EnvironmentState::Deploying);
        assert_eq!(next.labels.commit_sha, SHA_B);
        assert!(matches!(&result.actions[0], Action::Deploy(req) if req.commit_sha == SHA_B));
    }

    #[test]
    fn preserve_on_active_is_gated() {
        let result = reconciler().reconcile(
            &intent(IntentKind::Preserve {
                requested_by: "octocat".to_string(),
            }),
            &with_ns(env_in(EnvironmentState::Active)),
        );
        assert_eq!(
            result.environment.unwrap().state,
            EnvironmentState::PreserveRequested
        );
        assert_eq!(result.actions, vec![Action::RequestPreservation]);
        assert!(result.actions[0].is_gate());
    }

    #[test]
    fn denied_preserve_keeps_active_without_namespace_change() {
        let result = reconciler().reconcile(
            &intent(IntentKind::PreserveDenied {
                reason: "quota exceeded".to_string(),
            }),
            &with_ns(env_in(EnvironmentState::Active)),
        );
        assert!(result.environment.is_none());
        assert_eq!(result.mutating_actions().count(), 0);
        match &result.actions[0] {
            Action::Notify(m) => assert_eq!(m.preserve_status, "denied: quota exceeded"),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn expiry_only_after_expires_at() {
        let mut env = env_in(EnvironmentState::Preserved);
        env.preservation = Some(Preservation {
            requested_at: t0() - Duration::hours(47),
            expires_at: t0() + Duration::hours(1),
            extension_count: 0,
        });
        let r = reconciler();
        assert!(r
            .reconcile(&intent(IntentKind::PreserveExpired), &with_ns(env.clone()))
            .is_noop());

        env.preservation.as_mut().unwrap().expires_at = t0();
        let result = r.reconcile(&intent(IntentKind::PreserveExpired), &with_ns(env));
        assert_eq!(result.environment.unwrap().state, EnvironmentState::Expiring);
        assert_eq!(result.actions[0], Action::ReleasePreservation);
    }

    #[test]
    fn close_on_preserved_bypasses_preservation() {
        let mut env = env_in(EnvironmentState::Preserved);
        env.preservation = Some(Preservation {
            requested_at: t0(),
            expires_at: t0() + Duration::hours(48),
            extension_count: 0,
        });
        let result = reconciler().reconcile(
            &intent(IntentKind::Close {
                reason: CloseReason::PullRequestClosed { merged: true },
            }),
            &with_ns(env),
        );
        let next = result.environment.unwrap();
        assert_eq!(next.state, EnvironmentState::Closing);
        assert!(next.preservation.is_none());
        let names: Vec<_> = result.actions.iter().map(Action::name).collect();
        assert_eq!(
            names,
            ["release_preservation", "delete_namespace", "await_teardown", "notify"]
        );
    }

    #[test]
    fn close_without_namespace_destroys_directly() {
        let result = reconciler().reconcile(
            &intent(IntentKind::Close {
                reason: CloseReason::PullRequestClosed { merged: false },
            }),
            &observed(Some(env_in(EnvironmentState::Failed)), None),
        );
        assert_eq!(result.environment.unwrap().state, EnvironmentState::Destroyed);
    }

    #[test]
    fn close_while_terminating_does_not_delete_twice() {
        let env = env_in(EnvironmentState::Closing);
        let mut ns = owned_namespace(&env, true);
        ns.phase = NamespacePhase::Terminating;
        let result = reconciler().reconcile(
            &intent(IntentKind::Close {
                reason: CloseReason::Orphaned,
            }),
            &observed(Some(env), Some(ns)),
        );
        assert_eq!(result.mutating_actions().count(), 0);
        assert_eq!(result.actions.len(), 1);
    }

    #[test]
    fn unowned_namespace_is_never_adopted() {
        let env = env_in(EnvironmentState::Pending);
        let mut ns = owned_namespace(&env, true);
        ns.annotations.clear();
        let result = reconciler().reconcile(&intent(open(SHA_A)), &observed(None, Some(ns.clone())));
        assert!(matches!(result.outcome, Outcome::Rejected(_)));
        assert_eq!(result.mutating_actions().count(), 0);

        let close = reconciler().reconcile(
            &intent(IntentKind::Close {
                reason: CloseReason::Orphaned,
            }),
            &observed(None, Some(ns)),
        );
        assert!(close.is_noop());
    }

    #[test]
    fn invalid_commit_is_rejected() {
        let result = reconciler().reconcile(&intent(open("not-a-sha")), &observed(None, None));
        assert!(matches!(result.outcome, Outcome::Rejected(_)));
        assert!(result.environment.is_none());
        assert_eq!(result.mutating_actions().count(), 0);
        assert!(matches!(&result.actions[..], [Action::Notify(m)] if m.preserve_status.contains("invalid commit sha")));
    }

    #[test]
    fn multibyte_commit_is_rejected_without_panicking() {
        for sha in ["ééééééé", "abc€def0123", "0123456\u{1F600}"] {
            let result = reconciler().reconcile(&intent(open(sha)), &observed(None, None));
            assert!(matches!(result.outcome, Outcome::Rejected(_)), "{sha}");
            assert!(result.environment.is_none());
            assert!(matches!(&result.actions[..], [Action::Notify(m)] if m.render_markdown().contains(short_sha(&m.commit_sha))));
        }
    }

    #[test]
    fn closing_ignores_preserve_and_finishes_on_teardown() {
        let env = env_in(EnvironmentState::Closing);
        let r = reconciler();
        assert!(r
            .reconcile(
                &intent(IntentKind::Preserve {
                    requested_by: "x".to_string()
                }),
                &with_ns(env.clone())
            )
            .is_noop());
        let done = r.reconcile(&intent(IntentKind::TeardownConfirmed), &observed(Some(env), None));
        assert_eq!(done.environment.unwrap().state, EnvironmentState::Destroyed);
    }

    #[test]
    fn reopen_during_teardown_waits_then_reprovisions() {
        let env = env_in(EnvironmentState::Closing);
        let mut ns = owned_namespace(&env, true);
        ns.phase = NamespacePhase::Terminating;
        let r = reconciler();

        let waiting = r.reconcile(&intent(sync(SHA_B)), &observed(Some(env), Some(ns)));
        let next = waiting.environment.clone().unwrap();
        assert_eq!(next.state, EnvironmentState::Closing);
        assert!(next.reopen_requested);
        assert_eq!(next.labels.commit_sha, SHA_B);
        assert!(matches!(&waiting.actions[0], Action::AwaitTeardown { namespace } if namespace == "k8s-ee-pr-42"));
        assert!(!waiting.actions.iter().any(|a| matches!(a, Action::DeleteNamespace { .. })));

        let result = r.reconcile(&intent(IntentKind::TeardownConfirmed), &observed(Some(next), None));
        let env = result.environment.as_ref().unwrap();
        assert_eq!(env.state, EnvironmentState::Pending);
        assert!(!env.reopen_requested);
        assert!(env.deployment.is_none());
        assert!(matches!(&result.actions[0], Action::CreateNamespace(_)));
    }

    #[test]
    fn reopen_after_namespace_is_gone_provisions_immediately() {
        let mut env = env_in(EnvironmentState::Closing);
        env.last_error = Some("namespace still terminating".to_string());
        let result = reconciler().reconcile(&intent(open(SHA_B)), &observed(Some(env), None));
        let next = result.environment.as_ref().unwrap();
        assert_eq!(next.state, EnvironmentState::Pending);
        assert_eq!(next.labels.commit_sha, SHA_B);
        assert!(next.last_error.is_none());
        assert!(matches!(&result.actions[0], Action::CreateNamespace(_)));
    }

    #[test]
    fn close_cancels_a_pending_reopen() {
        let mut env = env_in(EnvironmentState::Closing);
        env.reopen_requested = true;
        let mut ns = owned_namespace(&env, true);
        ns.phase = NamespacePhase::Terminating;
        let result = reconciler().reconcile(
            &intent(IntentKind::Close {
                reason: CloseReason::PullRequestClosed { merged: false },
            }),
            &observed(Some(env), Some(ns)),
        );
        assert!(!result.environment.unwrap().reopen_requested);
    }
}
