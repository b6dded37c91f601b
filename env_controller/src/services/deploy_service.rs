//! Deployment orchestrator.
//!
//! Drives one chart release to a healthy state: remediates releases left
//! stuck by an interrupted deploy, performs the upgrade-install, polls
//! workload readiness, and rolls back on failure.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ControllerConfig, RetryPolicy, Timeouts};
use crate::error::{ControllerError, Result};
use crate::models::cluster::WorkloadStatus;
use crate::models::environment::HealthStatus;
use crate::services::cluster_service::{ReleaseBackend, ReleaseRequest};
use crate::services::error_service::retry_transient;
use crate::services::reconciler::DeployRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployResult {
    pub success: bool,
    pub health_status: HealthStatus,
    pub release_revision: Option<u32>,
    pub diagnostics: Option<String>,
    /// Least healthy pod when readiness was not reached.
    pub last_pod_status: Option<String>,
    /// Whether the release was already serving this image.
    pub unchanged: bool,
}

pub struct DeploymentOrchestrator {
    releases: Arc<dyn ReleaseBackend>,
    chart_ref: String,
    timeouts: Timeouts,
    retry: RetryPolicy,
}

impl DeploymentOrchestrator {
    pub fn new(releases: Arc<dyn ReleaseBackend>, config: &ControllerConfig) -> Self {
        Self {
            releases,
            chart_ref: config.chart_ref.clone(),
            timeouts: config.timeouts.clone(),
            retry: config.retry.clone(),
        }
    }

    /// Deploy `request`, returning once workloads are ready, the deploy
    /// budget runs out, or `cancel` fires.
    ///
    /// Cancellation returns [`ControllerError::Cancelled`]. It is observed
    /// before and after the upgrade-install and during the readiness wait,
    /// never while helm is running.
    pub async fn deploy(&self, request: &DeployRequest, cancel: &CancellationToken) -> Result<DeployResult> {
        let started = Instant::now();
        let ns = request.namespace.as_str();
        let release = request.release.as_str();

        let current = retry_transient(&self.retry, "release_status", || {
            self.releases.release_status(ns, release)
        })
        .await?;

        let previous_revision = match &current {
            Some(info) if info.status.is_stuck() => {
                tracing::warn!(
                    namespace = ns,
                    release,
                    status = info.status.as_str(),
                    "Remediating stuck release"
                );
                self.remediate(ns, release, info.last_deployed_revision).await?;
                info.last_deployed_revision
            }
            Some(info) => {
                if info.image_ref.as_deref() == Some(request.image_ref.as_str()) {
                    let workloads = self.releases.workload_status(ns).await?;
                    if workloads.all_ready() {
                        tracing::info!(namespace = ns, image = %request.image_ref, "Release already serving image");
                        return Ok(DeployResult {
                            success: true,
                            health_status: HealthStatus::Healthy,
                            release_revision: Some(info.revision),
                            diagnostics: None,
                            last_pod_status: None,
                            unchanged: true,
                        });
                    }
                }
                info.last_deployed_revision
            }
            None => None,
        };

        if cancel.is_cancelled() {
            return Err(ControllerError::Cancelled);
        }

        let release_request = ReleaseRequest {
            namespace: request.namespace.clone(),
            release: request.release.clone(),
            chart_ref: self.chart_ref.clone(),
            values: request.values.clone(),
        };
        tracing::info!(namespace = ns, image = %request.image_ref, "Upgrading release");
        // An in-flight upgrade runs to completion; dropping it mid-call would
        // kill the helm process and leave the release pending.
        let upgrade = retry_transient(&self.retry, "upgrade_install", || {
            self.releases.upgrade_install(&release_request)
        })
        .await;
        let revision = match upgrade {
            Ok(rev) => rev,
            Err(e) => {
                tracing::error!(namespace = ns, "Upgrade failed: {e}");
                self.rollback_after_failure(ns, release, previous_revision).await;
                crate::metrics::deploy_duration(started.elapsed().as_millis() as u64, false);
                return Ok(DeployResult {
                    success: false,
                    health_status: HealthStatus::Unhealthy(e.to_string()),
                    release_revision: None,
                    diagnostics: Some(e.to_string()),
                    last_pod_status: None,
                    unchanged: false,
                });
            }
        };
        if cancel.is_cancelled() {
            tracing::info!(namespace = ns, revision, "Deploy superseded after upgrade");
            return Err(ControllerError::Cancelled);
        }

        match self.await_ready(ns, started, cancel).await? {
            Ok(()) => {
                let elapsed = started.elapsed();
                crate::metrics::deploy_duration(elapsed.as_millis() as u64, true);
                tracing::info!(
                    namespace = ns,
                    revision,
                    duration_ms = elapsed.as_millis() as u64,
                    "Release healthy"
                );
                Ok(DeployResult {
                    success: true,
                    health_status: HealthStatus::Healthy,
                    release_revision: Some(revision),
                    diagnostics: None,
                    last_pod_status: None,
                    unchanged: false,
                })
            }
            Err(last) => {
                let diagnostics = format!(
                    "workloads not ready after {}s ({}/{} replicas ready)",
                    self.timeouts.deploy.as_secs(),
                    last.ready_replicas,
                    last.desired_replicas
                );
                tracing::warn!(namespace = ns, last_pod = ?last.last_pod_status, "{diagnostics}");
                self.rollback_after_failure(ns, release, previous_revision).await;
                crate::metrics::deploy_duration(started.elapsed().as_millis() as u64, false);
                Ok(DeployResult {
                    success: false,
                    health_status: HealthStatus::Unhealthy(diagnostics.clone()),
                    release_revision: Some(revision),
                    diagnostics: Some(diagnostics),
                    last_pod_status: last.last_pod_status,
                    unchanged: false,
                })
            }
        }
    }

    /// Roll a stuck release back to its last good revision, or remove it
    /// when it never deployed.
    async fn remediate(&self, ns: &str, release: &str, last_good: Option<u32>) -> Result<()> {
        let result = match last_good {
            Some(rev) => self.releases.rollback(ns, release, Some(rev)).await,
            None => self.releases.uninstall(ns, release).await,
        };
        result.map_err(|e| {
            tracing::error!(namespace = ns, release, "Stuck release remediation failed: {e}");
            ControllerError::StuckRelease {
                namespace: ns.to_string(),
                release: release.to_string(),
                status: e.to_string(),
            }
        })
    }

    /// Return the release to its previous revision, or uninstall it when the
    /// failed deploy was the first install.
    async fn rollback_after_failure(&self, ns: &str, release: &str, previous: Option<u32>) {
        match previous {
            Some(rev) => match self.releases.rollback(ns, release, Some(rev)).await {
                Ok(()) => tracing::info!(namespace = ns, revision = rev, "Rolled back to previous revision"),
                Err(e) => tracing::error!(namespace = ns, revision = rev, "Rollback failed: {e}"),
            },
            None => match self.releases.uninstall(ns, release).await {
                Ok(()) => tracing::info!(namespace = ns, release, "Removed failed first install"),
                Err(e) => tracing::error!(namespace = ns, release, "Uninstall after failed install failed: {e}"),
            },
        }
    }

    /// Poll readiness until ready (`Ok(Ok)`), the deploy budget is spent
    /// (`Ok(Err(last status))`), or cancellation (`Err(Cancelled)`).
    async fn await_ready(
        &self,
        ns: &str,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<(), WorkloadStatus>> {
        let deadline = started + self.timeouts.deploy;
        let mut last = WorkloadStatus::default();
        loop {
            match self.releases.workload_status(ns).await {
                Ok(status) if status.all_ready() => return Ok(Ok(())),
                Ok(status) => last = status,
                Err(e) if e.is_transient() => {
                    tracing::debug!(namespace = ns, "Readiness probe failed: {e}");
                }
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                return Ok(Err(last));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ControllerError::Cancelled),
                _ = tokio::time::sleep(self.timeouts.readiness_poll) => {}
            }
        }
    }
}
