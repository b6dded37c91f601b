//! Intent dispatcher: one worker task per environment key.
//!
//! Intents for a key are queued FIFO and processed one at a time; different
//! keys proceed in parallel. Workers are spawned on demand and exit after an
//! idle period. A worker only removes itself while holding the dispatcher
//! lock and after confirming its queue is empty, and `submit` enqueues under
//! the same lock, so no intent is ever dropped by a reaped worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::events::environment::EnvironmentIntent;
use crate::models::environment::EnvId;
use crate::services::worker::{Controller, InFlight, InFlightSlot};

struct WorkerHandle {
    tx: mpsc::UnboundedSender<EnvironmentIntent>,
    in_flight: InFlightSlot,
    generation: u64,
}

struct Inner {
    controller: Arc<Controller>,
    workers: Mutex<HashMap<EnvId, WorkerHandle>>,
    idle_timeout: Duration,
    generations: AtomicU64,
    /// Intents submitted but not yet fully processed.
    pending: watch::Sender<usize>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(controller: Arc<Controller>, idle_timeout: Duration) -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                controller,
                workers: Mutex::new(HashMap::new()),
                idle_timeout,
                generations: AtomicU64::new(0),
                pending,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.inner.controller
    }

    /// Route an intent to its key's worker, superseding in-flight work when
    /// the intent makes it obsolete.
    pub fn submit(&self, intent: EnvironmentIntent) {
        if self.inner.shutdown.is_cancelled() {
            tracing::warn!(env = %intent.env_id, intent = intent.kind.name(), "Dispatcher stopped, dropping intent");
            return;
        }
        let mut workers = self.inner.lock_workers();
        self.inner.pending.send_modify(|n| *n += 1);

        if let Some(handle) = workers.get(&intent.env_id) {
            supersede(&handle.in_flight, &intent);
            match handle.tx.send(intent) {
                Ok(()) => return,
                Err(mpsc::error::SendError(intent)) => {
                    // Worker exited without reaping (panic); replace it.
                    workers.remove(&intent.env_id);
                    self.spawn_worker(&mut workers, intent);
                }
            }
        } else {
            self.spawn_worker(&mut workers, intent);
        }
    }

    fn spawn_worker(&self, workers: &mut HashMap<EnvId, WorkerHandle>, intent: EnvironmentIntent) {
        let env_id = intent.env_id.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let in_flight: InFlightSlot = Arc::new(Mutex::new(None));
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        // The receiver is alive, so the send cannot fail.
        let _ = tx.send(intent);
        workers.insert(
            env_id.clone(),
            WorkerHandle {
                tx,
                in_flight: in_flight.clone(),
                generation,
            },
        );
        tracing::debug!(env = %env_id, generation, "Worker spawned");
        tokio::spawn(run_worker(self.inner.clone(), env_id, rx, in_flight, generation));
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.inner.lock_workers().len()
    }

    /// Wait until every submitted intent, follow-ups included, is processed.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.pending.subscribe();
        // The sender lives in `inner`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Stop accepting intents and cancel in-flight steps.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut workers = self.inner.lock_workers();
        for handle in workers.values() {
            if let Some(f) = lock_slot(&handle.in_flight).as_ref() {
                f.cancel.cancel();
            }
        }
        // Dropping the senders lets idle workers exit.
        workers.clear();
    }
}

impl Inner {
    fn lock_workers(&self) -> MutexGuard<'_, HashMap<EnvId, WorkerHandle>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn done(&self) {
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}

fn lock_slot(slot: &InFlightSlot) -> MutexGuard<'_, Option<InFlight>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// A close intent, or a deploy of another commit, cancels a step that is
/// provisioning or deploying.
fn supersede(slot: &InFlightSlot, intent: &EnvironmentIntent) {
    let guard = lock_slot(slot);
    let Some(in_flight) = guard.as_ref() else {
        return;
    };
    if !in_flight.supersedable {
        return;
    }
    let obsolete = intent.kind.is_close()
        || intent
            .kind
            .target_commit()
            .is_some_and(|c| Some(c) != in_flight.target_commit.as_deref());
    if obsolete {
        tracing::info!(
            env = %intent.env_id,
            intent = intent.kind.name(),
            superseded = ?in_flight.target_commit,
            "Superseding in-flight step"
        );
        in_flight.cancel.cancel();
    }
}

async fn run_worker(
    inner: Arc<Inner>,
    env_id: EnvId,
    mut rx: mpsc::UnboundedReceiver<EnvironmentIntent>,
    in_flight: InFlightSlot,
    generation: u64,
) {
    loop {
        let intent = match tokio::time::timeout(inner.idle_timeout, rx.recv()).await {
            Ok(Some(intent)) => intent,
            Ok(None) => break,
            Err(_) => {
                let mut workers = inner.lock_workers();
                match rx.try_recv() {
                    Ok(intent) => intent,
                    Err(_) => {
                        if workers.get(&env_id).is_some_and(|h| h.generation == generation) {
                            workers.remove(&env_id);
                        }
                        tracing::debug!(env = %env_id, generation, "Idle worker reaped");
                        break;
                    }
                }
            }
        };

        let cancel = inner.shutdown.child_token();
        *lock_slot(&in_flight) = Some(InFlight {
            cancel: cancel.clone(),
            target_commit: intent.kind.target_commit().map(str::to_string),
            supersedable: false,
        });

        inner.controller.process(intent, &cancel, &in_flight).await;

        *lock_slot(&in_flight) = None;
        inner.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::events::environment::IntentKind;
    use crate::services::deploy_service::DeploymentOrchestrator;
    use crate::services::environment_service::EnvironmentStore;
    use crate::services::executor::ActionExecutor;
    use crate::services::memory_backend::{MemoryCluster, MemoryReleases, RecordingNotifier};
    use crate::services::preservation_service::PreservationManager;
    use crate::services::reconciler::Reconciler;
    use crate::models::environment::EnvironmentState;

    fn dispatcher(idle: Duration) -> (Dispatcher, Arc<EnvironmentStore>) {
        let mut config = ControllerConfig::default();
        config.timeouts.readiness_poll = Duration::from_millis(10);
        let store = Arc::new(EnvironmentStore::new());
        let executor = ActionExecutor::new(
            Arc::new(MemoryCluster::new()),
            DeploymentOrchestrator::new(Arc::new(MemoryReleases::new()), &config),
            Arc::new(PreservationManager::from_config(&config)),
            Arc::new(RecordingNotifier::new()),
            &config,
        );
        let controller = Arc::new(Controller::new(
            store.clone(),
            Reconciler::new(&config),
            executor,
            config.retry.clone(),
        ));
        (Dispatcher::new(controller, idle), store)
    }

    fn open(pr: u64) -> EnvironmentIntent {
        EnvironmentIntent::new(
            EnvId::new("k8s-ee", pr).unwrap(),
            IntentKind::Open {
                commit_sha: "abc1234".to_string(),
                branch: "main".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn keys_are_processed_independently() {
        let (d, store) = dispatcher(Duration::from_secs(60));
        for pr in 1..=5 {
            d.submit(open(pr));
        }
        d.wait_idle().await;
        assert_eq!(store.list().len(), 5);
        assert!(store.list().iter().all(|e| e.state == EnvironmentState::Active));
        assert_eq!(d.worker_count(), 5);
    }

    #[tokio::test]
    async fn idle_workers_are_reaped_and_respawned() {
        let (d, store) = dispatcher(Duration::from_millis(20));
        d.submit(open(1));
        d.wait_idle().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(d.worker_count(), 0);

        d.submit(EnvironmentIntent::new(
            EnvId::new("k8s-ee", 1).unwrap(),
            IntentKind::Close {
                reason: crate::events::environment::CloseReason::PullRequestClosed { merged: true },
            },
        ));
        d.wait_idle().await;
        let id = EnvId::new("k8s-ee", 1).unwrap();
        assert_eq!(store.get(&id).unwrap().state, EnvironmentState::Destroyed);
    }

    #[test]
    fn supersede_rules() {
        let slot: InFlightSlot = Arc::new(Mutex::new(Some(InFlight {
            cancel: CancellationToken::new(),
            target_commit: Some("abc1234".to_string()),
            supersedable: true,
        })));
        let token = lock_slot(&slot).as_ref().unwrap().cancel.clone();

        supersede(&slot, &open(1));
        assert!(!token.is_cancelled(), "same commit must not cancel");

        let sync = EnvironmentIntent::new(
            EnvId::new("k8s-ee", 1).unwrap(),
            IntentKind::Synchronize {
                commit_sha: "def5678".to_string(),
                branch: "main".to_string(),
            },
        );
        lock_slot(&slot).as_mut().unwrap().supersedable = false;
        supersede(&slot, &sync);
        assert!(!token.is_cancelled(), "teardown and steady states are not cancelled");

        lock_slot(&slot).as_mut().unwrap().supersedable = true;
        supersede(&slot, &sync);
        assert!(token.is_cancelled());
    }
}
