//! k8s-ee controller server.
//!
//! Receives GitHub webhooks, drives per-PR environments through their
//! lifecycle, and runs the preservation and orphan-sweep schedules.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;

use k8s_ee_controller::config::ControllerConfig;
use k8s_ee_controller::metrics;
use k8s_ee_controller::routes::{self, AppState};
use k8s_ee_controller::services::cluster_service::{ClusterBackend, ReleaseBackend};
use k8s_ee_controller::services::deploy_service::DeploymentOrchestrator;
use k8s_ee_controller::services::dispatcher::Dispatcher;
use k8s_ee_controller::services::environment_service::{rebuild_from_cluster, EnvironmentStore};
use k8s_ee_controller::services::executor::ActionExecutor;
use k8s_ee_controller::services::github_service::GitHubClient;
use k8s_ee_controller::services::kube_cli::KubeCli;
use k8s_ee_controller::services::memory_backend::{MemoryCluster, MemoryReleases};
use k8s_ee_controller::services::preservation_service::PreservationManager;
use k8s_ee_controller::services::reconciler::Reconciler;
use k8s_ee_controller::services::scheduler::Scheduler;
use k8s_ee_controller::services::worker::Controller;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    /// kubectl and helm against the configured context
    Kube,
    /// In-process cluster, for local runs without a cluster
    Memory,
}

#[derive(Parser)]
#[command(name = "k8s-ee-controller", about = "Per-PR Kubernetes environment controller")]
struct Cli {
    /// Server port
    #[arg(short, long, env = "K8SEE_PORT", default_value = "8080")]
    port: u16,

    /// Cluster backend
    #[arg(long, env = "K8SEE_BACKEND", value_enum, default_value = "kube")]
    backend: Backend,

    /// Log output format (text or json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    log_format: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    if cli.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    tracing::info!("Starting k8s-ee controller...");

    let config = ControllerConfig::from_env();
    config.validate()?;

    // Install the recorder before anything records
    metrics::init_metrics();

    let cluster: Arc<dyn ClusterBackend>;
    let releases: Arc<dyn ReleaseBackend>;
    match cli.backend {
        Backend::Kube => {
            let kube = Arc::new(KubeCli::new(
                config.kube_context.clone(),
                config.timeouts.command,
            ));
            cluster = kube.clone();
            releases = kube;
        }
        Backend::Memory => {
            tracing::warn!("Using in-memory cluster backend, nothing will be deployed");
            cluster = Arc::new(MemoryCluster::new());
            releases = Arc::new(MemoryReleases::new());
        }
    }

    let github = Arc::new(GitHubClient::from_config(&config));
    let store = Arc::new(EnvironmentStore::new());
    let preservation = Arc::new(PreservationManager::from_config(&config));

    // Recover state from the cluster before accepting webhooks
    match rebuild_from_cluster(
        &store,
        cluster.as_ref(),
        releases.as_ref(),
        &preservation,
        &config,
        Utc::now(),
    )
    .await
    {
        Ok(count) => tracing::info!(count, "Recovered environments from cluster"),
        Err(e) => tracing::warn!("Could not recover environments from cluster: {e}"),
    }

    let executor = ActionExecutor::new(
        cluster.clone(),
        DeploymentOrchestrator::new(releases, &config),
        preservation.clone(),
        github.clone(),
        &config,
    );
    let controller = Arc::new(Controller::new(
        store.clone(),
        Reconciler::new(&config),
        executor,
        config.retry.clone(),
    ));
    let dispatcher = Dispatcher::new(controller, config.worker_idle_timeout);

    // Periodic preservation expiry and orphan sweeps
    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(Scheduler::new(
        dispatcher.clone(),
        store.clone(),
        preservation.clone(),
        cluster,
        github,
        &config,
    ));
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.child_token()));

    let state = AppState {
        config: Arc::new(config),
        store,
        preservation,
        dispatcher: dispatcher.clone(),
    };
    let app = routes::router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!("k8s-ee controller listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Stopping scheduler and workers...");
    shutdown.cancel();
    dispatcher.shutdown();
    if let Err(e) = scheduler_task.await {
        tracing::warn!("Scheduler task ended abnormally: {e}");
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
