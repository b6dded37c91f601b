//! One reconciliation step per intent, run by the key's worker.
//!
//! A step observes the key's record and namespace, asks the reconciler for
//! a decision, runs admission gates, commits the record, and executes the
//! remaining actions. A follow-up intent produced by an action is handled
//! before the worker takes the next queued intent.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::RetryPolicy;
use crate::events::environment::{EnvironmentIntent, IntentKind};
use crate::models::cluster::ClusterState;
use crate::models::environment::EnvironmentState;
use crate::services::environment_service::EnvironmentStore;
use crate::services::error_service::retry_transient;
use crate::services::executor::{ActionExecutor, Effect};
use crate::services::reconciler::{Action, Outcome, Reconciler};

/// What a running step is working towards; read by the dispatcher to decide
/// whether a new intent supersedes it.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub cancel: CancellationToken,
    /// Commit the step is provisioning or deploying.
    pub target_commit: Option<String>,
    /// Set once the committed record is Pending or Deploying.
    pub supersedable: bool,
}

pub type InFlightSlot = Arc<Mutex<Option<InFlight>>>;

pub struct Controller {
    store: Arc<EnvironmentStore>,
    reconciler: Reconciler,
    executor: ActionExecutor,
    retry: RetryPolicy,
}

impl Controller {
    pub fn new(
        store: Arc<EnvironmentStore>,
        reconciler: Reconciler,
        executor: ActionExecutor,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            reconciler,
            executor,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<EnvironmentStore> {
        &self.store
    }

    /// Process an intent and every follow-up it produces.
    pub async fn process(&self, intent: EnvironmentIntent, cancel: &CancellationToken, slot: &InFlightSlot) {
        let mut next = Some(intent);
        while let Some(intent) = next.take() {
            next = self.step(&intent, cancel, slot).await;
        }
    }

    async fn step(
        &self,
        intent: &EnvironmentIntent,
        cancel: &CancellationToken,
        slot: &InFlightSlot,
    ) -> Option<EnvironmentIntent> {
        let span = tracing::info_span!(
            "step",
            env = %intent.env_id,
            intent = intent.kind.name(),
            delivery = %intent.delivery
        );
        self.run_step(intent, cancel, slot).instrument(span).await
    }

    async fn run_step(
        &self,
        intent: &EnvironmentIntent,
        cancel: &CancellationToken,
        slot: &InFlightSlot,
    ) -> Option<EnvironmentIntent> {
        let env_id = &intent.env_id;
        let kind = intent.kind.name();
        let namespace_name = env_id.namespace_name();
        let cluster = self.executor.cluster();
        let namespace = match retry_transient(&self.retry, "get_namespace", || {
            cluster.get_namespace(&namespace_name)
        })
        .await
        {
            Ok(ns) => ns,
            Err(e) => {
                tracing::error!("Observation failed, dropping intent: {e}");
                crate::metrics::intent_processed(kind, "error");
                return None;
            }
        };
        let prior = self.store.get(env_id);
        let observed = ClusterState {
            environment: prior.clone(),
            namespace,
            observed_at: Utc::now(),
        };

        let result = self.reconciler.reconcile(intent, &observed);
        match &result.outcome {
            Outcome::Applied => crate::metrics::intent_processed(kind, "applied"),
            Outcome::NoOp => {
                tracing::debug!("No change");
                crate::metrics::intent_processed(kind, "noop");
            }
            Outcome::Rejected(reason) => {
                tracing::info!(reason = %reason, "Intent rejected");
                crate::metrics::intent_processed(kind, "rejected");
            }
        }

        // Gates decide before anything is committed.
        let mut commit = result.environment;
        let mut follow_up = None;
        if result.actions.iter().any(Action::is_gate) {
            let decision = self.executor.admit(env_id);
            if let IntentKind::PreserveDenied { reason } = &decision {
                tracing::info!(reason = %reason, "Preservation denied");
                commit = None;
            }
            follow_up = Some(decision);
        }

        if let Some(env) = &commit {
            let previous = self.store.put(env.clone());
            if previous != Some(env.state) {
                tracing::info!(
                    from = previous.map(|s| s.as_str()).unwrap_or("absent"),
                    to = env.state.as_str(),
                    commit = %env.labels.commit_sha,
                    "State transition"
                );
                crate::metrics::state_transition(env.state.as_str());
            }
            update_slot(slot, |f| {
                f.target_commit = Some(env.labels.commit_sha.clone());
                f.supersedable = matches!(
                    env.state,
                    EnvironmentState::Pending | EnvironmentState::Deploying
                );
            });
        }

        if follow_up.is_some() {
            // Only the gate's decision matters; the step has nothing else to do.
            return follow_up.map(|k| follow(intent, k));
        }

        let current = commit.or(prior);
        // Notifications describe the committed record, so they go out before
        // the step's long-running work.
        let (notify, work): (Vec<_>, Vec<_>) = result
            .actions
            .iter()
            .filter(|a| !a.is_gate())
            .partition(|a| matches!(a, Action::Notify(_)));

        for action in notify.into_iter().chain(work) {
            match self.executor.execute(env_id, current.as_ref(), action, cancel).await {
                Effect::Continue => {}
                Effect::FollowUp(kind) => return Some(follow(intent, kind)),
                Effect::Abandon => {
                    tracing::info!(action = action.name(), "Step abandoned");
                    return None;
                }
            }
        }
        None
    }
}

fn follow(intent: &EnvironmentIntent, kind: IntentKind) -> EnvironmentIntent {
    EnvironmentIntent::new(intent.env_id.clone(), kind).with_delivery(intent.delivery)
}

fn update_slot(slot: &InFlightSlot, f: impl FnOnce(&mut InFlight)) {
    if let Some(in_flight) = slot.lock().unwrap_or_else(|e| e.into_inner()).as_mut() {
        f(in_flight);
    }
}
