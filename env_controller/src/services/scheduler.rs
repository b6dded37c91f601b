//! Periodic tasks: preservation expiry and the orphan sweep.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::events::environment::{CloseReason, EnvironmentIntent, IntentKind};
use crate::models::environment::{EnvId, EnvironmentState};
use crate::services::cluster_service::ClusterBackend;
use crate::services::dispatcher::Dispatcher;
use crate::services::environment_service::EnvironmentStore;
use crate::services::github_service::PullRequestSource;
use crate::services::preservation_service::PreservationManager;
use crate::services::sweeper::OrphanSweeper;

pub struct Scheduler {
    dispatcher: Dispatcher,
    store: Arc<EnvironmentStore>,
    preservation: Arc<PreservationManager>,
    cluster: Arc<dyn ClusterBackend>,
    pull_requests: Arc<dyn PullRequestSource>,
    sweeper: OrphanSweeper,
    config: ControllerConfig,
}

impl Scheduler {
    pub fn new(
        dispatcher: Dispatcher,
        store: Arc<EnvironmentStore>,
        preservation: Arc<PreservationManager>,
        cluster: Arc<dyn ClusterBackend>,
        pull_requests: Arc<dyn PullRequestSource>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            dispatcher,
            store,
            preservation,
            cluster,
            pull_requests,
            sweeper: OrphanSweeper::from_config(config),
            config: config.clone(),
        }
    }

    /// One preservation pass: warnings, expiries, and teardown of
    /// environments whose post-expiry grace has run out.
    pub fn preservation_tick(&self, now: DateTime<Utc>) {
        let outcome = self.preservation.tick(now);

        for (env_id, expires_at) in outcome.warnings {
            tracing::info!(env = %env_id, %expires_at, "Preservation expiring soon");
            self.dispatcher
                .submit(EnvironmentIntent::new(env_id, IntentKind::ExpiryWarning { expires_at }));
        }

        for env_id in outcome.expired {
            let holds = self
                .store
                .get(&env_id)
                .is_some_and(|e| e.state.holds_preservation());
            if holds {
                tracing::info!(env = %env_id, "Preservation expired");
                self.dispatcher
                    .submit(EnvironmentIntent::new(env_id, IntentKind::PreserveExpired));
            } else {
                // The record moved on without releasing its slot.
                self.preservation.release(&env_id);
            }
        }

        for env in self.store.list() {
            if env.state == EnvironmentState::Expiring
                && env.updated_at + self.config.expiry_teardown_grace <= now
            {
                self.dispatcher.submit(EnvironmentIntent::new(
                    env.id,
                    IntentKind::Close {
                        reason: CloseReason::PreservationExpired,
                    },
                ));
            }
        }
    }

    /// One sweep pass. Skipped when the open pull requests cannot be listed,
    /// since an empty list would make every environment look orphaned.
    ///
    /// Also confirms teardowns whose namespace vanished after their wait ran
    /// out, so a pull request reopened meanwhile is provisioned again.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> usize {
        let open = match self.pull_requests.list_open_pull_requests().await {
            Ok(open) => open,
            Err(e) => {
                tracing::warn!("Skipping orphan sweep, open pull requests unavailable: {e}");
                return 0;
            }
        };
        let namespaces = match self.cluster.list_managed_namespaces().await {
            Ok(ns) => ns,
            Err(e) => {
                tracing::warn!("Skipping orphan sweep, namespaces unavailable: {e}");
                return 0;
            }
        };

        let open: BTreeSet<EnvId> = open
            .into_iter()
            .filter_map(|pr| EnvId::new(&self.config.project_id, pr).ok())
            .collect();
        let records = self.store.list();
        let orphans = self.sweeper.sweep(&open, &namespaces, &records, now);
        let count = orphans.len();

        for env_id in self.sweeper.stalled_teardowns(&namespaces, &records) {
            if orphans.contains(&env_id) {
                continue;
            }
            tracing::info!(env = %env_id, "Confirming stalled teardown");
            self.dispatcher
                .submit(EnvironmentIntent::new(env_id, IntentKind::TeardownConfirmed));
        }

        for env_id in orphans {
            self.dispatcher.submit(EnvironmentIntent::new(
                env_id,
                IntentKind::Close {
                    reason: CloseReason::Orphaned,
                },
            ));
        }
        if count > 0 {
            tracing::info!(count, "Orphan sweep enqueued teardowns");
        }
        count
    }

    /// Run both loops until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut preserve_tick = tokio::time::interval(self.config.preserve_tick_interval);
        preserve_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep_tick = tokio::time::interval(self.config.sweep_interval);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            preserve_every_secs = self.config.preserve_tick_interval.as_secs(),
            sweep_every_secs = self.config.sweep_interval.as_secs(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = preserve_tick.tick() => self.preservation_tick(Utc::now()),
                _ = sweep_tick.tick() => {
                    self.sweep_once(Utc::now()).await;
                }
            }
        }
        tracing::info!("Scheduler stopped");
    }
}
