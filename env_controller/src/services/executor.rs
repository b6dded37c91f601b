//! Action executor: carries out the reconciler's actions against the
//! backends and turns their outcomes into follow-up intents.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ControllerConfig, RetryPolicy, Timeouts};
use crate::error::{ControllerError, Result};
use crate::events::environment::IntentKind;
use crate::models::cluster::ObservedNamespace;
use crate::models::environment::{EnvId, Environment, EnvironmentState};
use crate::services::cluster_service::ClusterBackend;
use crate::services::deploy_service::DeploymentOrchestrator;
use crate::services::error_service::retry_transient;
use crate::services::github_service::Notifier;
use crate::services::preservation_service::{Admission, PreservationManager};
use crate::services::reconciler::{Action, DeployRequest};

/// What the worker does after an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Run the next action of the step.
    Continue,
    /// End the step and reconcile this intent next.
    FollowUp(IntentKind),
    /// A superseding intent cancelled the step; drop the rest silently.
    Abandon,
}

pub struct ActionExecutor {
    cluster: Arc<dyn ClusterBackend>,
    orchestrator: DeploymentOrchestrator,
    preservation: Arc<PreservationManager>,
    notifier: Arc<dyn Notifier>,
    timeouts: Timeouts,
    retry: RetryPolicy,
}

impl ActionExecutor {
    pub fn new(
        cluster: Arc<dyn ClusterBackend>,
        orchestrator: DeploymentOrchestrator,
        preservation: Arc<PreservationManager>,
        notifier: Arc<dyn Notifier>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            cluster,
            orchestrator,
            preservation,
            notifier,
            timeouts: config.timeouts.clone(),
            retry: config.retry.clone(),
        }
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterBackend> {
        &self.cluster
    }

    /// Admission gate for a preserve request.
    pub fn admit(&self, env_id: &EnvId) -> IntentKind {
        match self.preservation.request_preserve(env_id, Utc::now()) {
            Admission::Admitted(preservation) => IntentKind::PreserveAdmitted { preservation },
            Admission::Denied(reason) => IntentKind::PreserveDenied { reason },
        }
    }

    /// Execute one non-gate action. `env` is the record as committed by the
    /// step, or the prior record when the step committed nothing.
    pub async fn execute(
        &self,
        env_id: &EnvId,
        env: Option<&Environment>,
        action: &Action,
        cancel: &CancellationToken,
    ) -> Effect {
        tracing::debug!(env = %env_id, action = action.name(), "Executing action");
        match action {
            Action::CreateNamespace(spec) => {
                match retry_transient(&self.retry, "create_namespace", || {
                    self.cluster.create_namespace(spec)
                })
                .await
                {
                    Ok(()) => {
                        tracing::info!(env = %env_id, namespace = %spec.name, "Namespace created");
                        Effect::Continue
                    }
                    Err(e) => provision_failed(env_id, "namespace creation failed", e),
                }
            }
            Action::ApplyQuota {
                namespace,
                quota,
                limits,
            } => {
                match retry_transient(&self.retry, "apply_quota", || {
                    self.cluster.apply_quota(namespace, quota, limits)
                })
                .await
                {
                    Ok(()) => Effect::Continue,
                    Err(e) => provision_failed(env_id, "quota policy could not be applied", e),
                }
            }
            Action::AwaitNamespaceReady { namespace } => {
                self.await_namespace_ready(env_id, namespace, cancel).await
            }
            Action::Deploy(request) => self.deploy(request, cancel).await,
            // Gates run before the record is committed.
            Action::RequestPreservation => Effect::Continue,
            Action::ReleasePreservation => {
                self.preservation.release(env_id);
                Effect::Continue
            }
            Action::ProjectLabels {
                namespace,
                labels,
                annotations,
            } => {
                // The record stays authoritative; a stale projection is
                // rewritten on the next change.
                if let Err(e) = retry_transient(&self.retry, "label_namespace", || {
                    self.cluster.label_namespace(namespace, labels, annotations)
                })
                .await
                {
                    tracing::warn!(env = %env_id, namespace, "Label projection failed: {e}");
                }
                Effect::Continue
            }
            Action::DeleteNamespace { namespace } => {
                match retry_transient(&self.retry, "delete_namespace", || {
                    self.cluster.delete_namespace(namespace)
                })
                .await
                {
                    Ok(()) => {
                        tracing::info!(env = %env_id, namespace, "Namespace deletion requested");
                        Effect::Continue
                    }
                    Err(e) => {
                        tracing::error!(env = %env_id, namespace, "Namespace deletion failed: {e}");
                        crate::metrics::error_recorded(e.category());
                        Effect::FollowUp(IntentKind::TeardownFailed {
                            reason: e.to_string(),
                        })
                    }
                }
            }
            Action::AwaitTeardown { namespace } => {
                let closing = env.is_some_and(|e| e.state == EnvironmentState::Closing);
                self.await_teardown(env_id, namespace, closing, cancel).await
            }
            Action::Notify(message) => {
                if let Err(e) = retry_transient(&self.retry, "notify", || {
                    self.notifier.upsert_status(message)
                })
                .await
                {
                    tracing::warn!(env = %env_id, "Status notification failed: {e}");
                }
                Effect::Continue
            }
        }
    }

    async fn deploy(&self, request: &DeployRequest, cancel: &CancellationToken) -> Effect {
        let env_id = &request.env_id;
        match self.orchestrator.deploy(request, cancel).await {
            Ok(result) if result.success => Effect::FollowUp(IntentKind::DeploySucceeded {
                commit_sha: request.commit_sha.clone(),
                image_ref: request.image_ref.clone(),
                release_revision: result.release_revision,
                health: result.health_status,
                deployed_at: Utc::now(),
            }),
            Ok(result) => Effect::FollowUp(IntentKind::DeployFailed {
                commit_sha: request.commit_sha.clone(),
                reason: result
                    .diagnostics
                    .unwrap_or_else(|| "deployment failed".to_string()),
                last_pod_status: result.last_pod_status,
            }),
            Err(ControllerError::Cancelled) => {
                tracing::info!(env = %env_id, commit = %request.commit_sha, "Deploy superseded");
                Effect::Abandon
            }
            Err(e) => {
                tracing::error!(env = %env_id, "Deploy failed: {e}");
                crate::metrics::error_recorded(e.category());
                Effect::FollowUp(IntentKind::DeployFailed {
                    commit_sha: request.commit_sha.clone(),
                    reason: e.to_string(),
                    last_pod_status: None,
                })
            }
        }
    }

    async fn await_namespace_ready(
        &self,
        env_id: &EnvId,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Effect {
        let budget = self.timeouts.namespace_ready;
        let outcome = self
            .poll_namespace(namespace, budget, cancel, |ns| match ns {
                Some(ns) if ns.is_owned_by(env_id) && !ns.is_terminating() && ns.quota_applied => {
                    Some(Ok(()))
                }
                Some(ns) if !ns.is_terminating() && !ns.is_owned_by(env_id) => {
                    Some(Err(ControllerError::OwnershipMismatch(ns.name.clone())))
                }
                _ => None,
            })
            .await;
        match outcome {
            Ok(()) => Effect::FollowUp(IntentKind::NamespaceReady),
            Err(ControllerError::Cancelled) => Effect::Abandon,
            Err(e) => provision_failed(env_id, "namespace not ready", e),
        }
    }

    async fn await_teardown(
        &self,
        env_id: &EnvId,
        namespace: &str,
        closing: bool,
        cancel: &CancellationToken,
    ) -> Effect {
        let budget = self.timeouts.teardown;
        let outcome = self
            .poll_namespace(namespace, budget, cancel, |ns| ns.is_none().then_some(Ok(())))
            .await;
        match (outcome, closing) {
            (Ok(()), true) => {
                tracing::info!(env = %env_id, namespace, "Teardown confirmed");
                Effect::FollowUp(IntentKind::TeardownConfirmed)
            }
            // A previous incarnation finished terminating; provisioning continues.
            (Ok(()), false) => Effect::Continue,
            (Err(ControllerError::Cancelled), _) => Effect::Abandon,
            (Err(e), true) => {
                tracing::warn!(env = %env_id, namespace, "Teardown incomplete: {e}");
                crate::metrics::error_recorded(e.category());
                Effect::FollowUp(IntentKind::TeardownFailed {
                    reason: e.to_string(),
                })
            }
            (Err(e), false) => provision_failed(env_id, "previous namespace still terminating", e),
        }
    }

    /// Poll the namespace until `check` yields a verdict, the budget is
    /// spent, or `cancel` fires.
    async fn poll_namespace<F>(
        &self,
        namespace: &str,
        budget: Duration,
        cancel: &CancellationToken,
        check: F,
    ) -> Result<()>
    where
        F: Fn(Option<&ObservedNamespace>) -> Option<Result<()>>,
    {
        let deadline = Instant::now() + budget;
        loop {
            match self.cluster.get_namespace(namespace).await {
                Ok(ns) => {
                    if let Some(verdict) = check(ns.as_ref()) {
                        return verdict;
                    }
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(namespace, "Namespace probe failed: {e}");
                }
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Err(ControllerError::Timeout {
                    operation: format!("waiting on namespace {namespace}"),
                    secs: budget.as_secs(),
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ControllerError::Cancelled),
                _ = tokio::time::sleep(self.timeouts.readiness_poll) => {}
            }
        }
    }
}

fn provision_failed(env_id: &EnvId, context: &str, e: ControllerError) -> Effect {
    tracing::error!(env = %env_id, "{context}: {e}");
    crate::metrics::error_recorded(e.category());
    Effect::FollowUp(IntentKind::ProvisionFailed {
        reason: format!("{context}: {e}"),
    })
}
