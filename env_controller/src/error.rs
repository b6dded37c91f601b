//! Controller error taxonomy.

use thiserror::Error;

/// Errors surfaced by backends, the orchestrator, and intent validation.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// API timeouts, rate limits, dropped connections. Retried with backoff.
    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    /// Permanent infrastructure failure (bad manifest, RBAC denial, ...).
    #[error("infrastructure error: {0}")]
    Infra(String),

    /// Malformed intent or invalid identifiers. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Preserve admission denied. A normal outcome, not a failure.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// A previous deploy left the release in a non-terminal state.
    #[error("release {release} in {namespace} is stuck in {status}")]
    StuckRelease {
        namespace: String,
        release: String,
        status: String,
    },

    /// A namespace matched the naming pattern but lacks our ownership markers.
    #[error("namespace {0} lacks expected ownership markers")]
    OwnershipMismatch(String),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    /// A superseding intent abandoned the in-flight operation.
    #[error("operation superseded by a newer intent")]
    Cancelled,

    #[error("GitHub API error: {0}")]
    GitHub(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ControllerError {
    /// Whether the retry helper should attempt the operation again.
    pub fn is_transient(&self) -> bool {
        matches!(self, ControllerError::TransientInfra(_))
    }

    /// Short label used for metrics and logs.
    pub fn category(&self) -> &'static str {
        match self {
            ControllerError::TransientInfra(_) => "transient",
            ControllerError::Infra(_) => "infra",
            ControllerError::Validation(_) => "validation",
            ControllerError::QuotaExceeded(_) => "quota",
            ControllerError::StuckRelease { .. } => "stuck_release",
            ControllerError::OwnershipMismatch(_) => "ownership",
            ControllerError::Timeout { .. } => "timeout",
            ControllerError::Cancelled => "cancelled",
            ControllerError::GitHub(_) => "github",
            ControllerError::Io(_) => "io",
            ControllerError::Json(_) => "json",
        }
    }
}

impl From<reqwest::Error> for ControllerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            ControllerError::TransientInfra(e.to_string())
        } else {
            ControllerError::GitHub(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;
