//! Environment intents: the only input of the reconciler.
//!
//! External intents come from webhooks; internal ones are follow-ups
//! produced by executing reconcile actions, or enqueued by the periodic
//! preservation and sweep tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::environment::{EnvId, HealthStatus, Preservation};

/// Why an environment is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    PullRequestClosed { merged: bool },
    PreservationExpired,
    Orphaned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IntentKind {
    /// PR opened or reopened.
    Open { commit_sha: String, branch: String },
    /// New commits pushed to the PR head.
    Synchronize { commit_sha: String, branch: String },
    Close { reason: CloseReason },
    /// `/preserve` comment.
    Preserve { requested_by: String },

    NamespaceReady,
    ProvisionFailed { reason: String },
    DeploySucceeded {
        commit_sha: String,
        image_ref: String,
        release_revision: Option<u32>,
        health: HealthStatus,
        deployed_at: DateTime<Utc>,
    },
    DeployFailed {
        commit_sha: String,
        reason: String,
        last_pod_status: Option<String>,
    },
    PreserveAdmitted { preservation: Preservation },
    PreserveDenied { reason: String },
    ExpiryWarning { expires_at: DateTime<Utc> },
    PreserveExpired,
    TeardownConfirmed,
    TeardownFailed { reason: String },
}

impl IntentKind {
    pub fn name(&self) -> &'static str {
        match self {
            IntentKind::Open { .. } => "open",
            IntentKind::Synchronize { .. } => "synchronize",
            IntentKind::Close { .. } => "close",
            IntentKind::Preserve { .. } => "preserve",
            IntentKind::NamespaceReady => "namespace_ready",
            IntentKind::ProvisionFailed { .. } => "provision_failed",
            IntentKind::DeploySucceeded { .. } => "deploy_succeeded",
            IntentKind::DeployFailed { .. } => "deploy_failed",
            IntentKind::PreserveAdmitted { .. } => "preserve_admitted",
            IntentKind::PreserveDenied { .. } => "preserve_denied",
            IntentKind::ExpiryWarning { .. } => "expiry_warning",
            IntentKind::PreserveExpired => "preserve_expired",
            IntentKind::TeardownConfirmed => "teardown_confirmed",
            IntentKind::TeardownFailed { .. } => "teardown_failed",
        }
    }

    /// Commit an open/synchronize intent asks to deploy.
    pub fn target_commit(&self) -> Option<&str> {
        match self {
            IntentKind::Open { commit_sha, .. } | IntentKind::Synchronize { commit_sha, .. } => {
                Some(commit_sha)
            }
            _ => None,
        }
    }

    pub fn is_close(&self) -> bool {
        matches!(self, IntentKind::Close { .. })
    }
}

/// An intent addressed to one environment key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentIntent {
    pub env_id: EnvId,
    pub kind: IntentKind,
    /// Correlation id (the webhook delivery id, or a fresh one).
    pub delivery: Uuid,
}

impl EnvironmentIntent {
    pub fn new(env_id: EnvId, kind: IntentKind) -> Self {
        Self {
            env_id,
            kind,
            delivery: Uuid::new_v4(),
        }
    }

    pub fn with_delivery(mut self, delivery: Uuid) -> Self {
        self.delivery = delivery;
        self
    }
}
