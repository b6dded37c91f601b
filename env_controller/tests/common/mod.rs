#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use k8s_ee_controller::config::ControllerConfig;
use k8s_ee_controller::events::environment::{CloseReason, EnvironmentIntent, IntentKind};
use k8s_ee_controller::models::environment::{EnvId, Environment, EnvironmentState};
use k8s_ee_controller::services::deploy_service::DeploymentOrchestrator;
use k8s_ee_controller::services::dispatcher::Dispatcher;
use k8s_ee_controller::services::environment_service::EnvironmentStore;
use k8s_ee_controller::services::executor::ActionExecutor;
use k8s_ee_controller::services::memory_backend::{
    MemoryCluster, MemoryReleases, RecordingNotifier, StaticPullRequests,
};
use k8s_ee_controller::services::preservation_service::PreservationManager;
use k8s_ee_controller::services::reconciler::Reconciler;
use k8s_ee_controller::services::scheduler::Scheduler;
use k8s_ee_controller::services::worker::Controller;

pub const SHA_A: &str = "1111111aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const SHA_B: &str = "2222222bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
pub const SHA_C: &str = "3333333ccccccccccccccccccccccccccccccccc";

pub struct Harness {
    pub config: ControllerConfig,
    pub cluster: Arc<MemoryCluster>,
    pub releases: Arc<MemoryReleases>,
    pub notifier: Arc<RecordingNotifier>,
    pub pull_requests: Arc<StaticPullRequests>,
    pub store: Arc<EnvironmentStore>,
    pub preservation: Arc<PreservationManager>,
    pub dispatcher: Dispatcher,
    pub scheduler: Scheduler,
}

pub fn test_config() -> ControllerConfig {
    let mut config = ControllerConfig {
        github_repo: "acme/shop".to_string(),
        ..ControllerConfig::default()
    };
    config.timeouts.readiness_poll = Duration::from_millis(10);
    config.timeouts.namespace_ready = Duration::from_secs(2);
    config.timeouts.deploy = Duration::from_secs(30);
    config.timeouts.teardown = Duration::from_secs(2);
    config.retry.base_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(20);
    config
}

impl Harness {
    pub fn new() -> Self {
        Self::with(test_config(), chrono::Duration::hours(48))
    }

    /// Harness over fresh backends with a custom preservation length.
    pub fn with(config: ControllerConfig, preserve_for: chrono::Duration) -> Self {
        Self::over(
            config,
            preserve_for,
            Arc::new(MemoryCluster::new()),
            Arc::new(MemoryReleases::new()),
        )
    }

    /// Harness over existing backends, as after a controller restart.
    pub fn over(
        config: ControllerConfig,
        preserve_for: chrono::Duration,
        cluster: Arc<MemoryCluster>,
        releases: Arc<MemoryReleases>,
    ) -> Self {
        let notifier = Arc::new(RecordingNotifier::new());
        let pull_requests = Arc::new(StaticPullRequests::new([]));
        let store = Arc::new(EnvironmentStore::new());
        let preservation = Arc::new(PreservationManager::new(
            config.max_preserved_environments,
            preserve_for,
            config.preserve_warning_lead(),
        ));
        let executor = ActionExecutor::new(
            cluster.clone(),
            DeploymentOrchestrator::new(releases.clone(), &config),
            preservation.clone(),
            notifier.clone(),
            &config,
        );
        let controller = Arc::new(Controller::new(
            store.clone(),
            Reconciler::new(&config),
            executor,
            config.retry.clone(),
        ));
        let dispatcher = Dispatcher::new(controller, Duration::from_secs(60));
        let scheduler = Scheduler::new(
            dispatcher.clone(),
            store.clone(),
            preservation.clone(),
            cluster.clone(),
            pull_requests.clone(),
            &config,
        );
        Self {
            config,
            cluster,
            releases,
            notifier,
            pull_requests,
            store,
            preservation,
            dispatcher,
            scheduler,
        }
    }

    pub fn id(&self, pr: u64) -> EnvId {
        EnvId::new(&self.config.project_id, pr).unwrap()
    }

    pub fn env(&self, pr: u64) -> Environment {
        self.store
            .get(&self.id(pr))
            .unwrap_or_else(|| panic!("no record for PR #{pr}"))
    }

    pub fn submit(&self, pr: u64, kind: IntentKind) {
        self.dispatcher.submit(EnvironmentIntent::new(self.id(pr), kind));
    }

    pub async fn run(&self, pr: u64, kind: IntentKind) {
        self.submit(pr, kind);
        self.dispatcher.wait_idle().await;
    }

    pub async fn open(&self, pr: u64, sha: &str) {
        self.run(pr, open(sha)).await;
    }

    pub async fn preserve(&self, pr: u64) {
        self.run(
            pr,
            IntentKind::Preserve {
                requested_by: "octocat".to_string(),
            },
        )
        .await;
    }

    pub async fn close(&self, pr: u64) {
        self.run(
            pr,
            IntentKind::Close {
                reason: CloseReason::PullRequestClosed { merged: true },
            },
        )
        .await;
    }

    /// Poll until the record reaches `state`.
    pub async fn wait_for_state(&self, pr: u64, state: EnvironmentState) {
        let id = self.id(pr);
        for _ in 0..500 {
            if self.store.get(&id).is_some_and(|e| e.state == state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("PR #{pr} never reached {state}");
    }
}

pub fn open(sha: &str) -> IntentKind {
    IntentKind::Open {
        commit_sha: sha.to_string(),
        branch: "feature/login".to_string(),
    }
}

pub fn synchronize(sha: &str) -> IntentKind {
    IntentKind::Synchronize {
        commit_sha: sha.to_string(),
        branch: "feature/login".to_string(),
    }
}
