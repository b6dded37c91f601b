//! Environment record: one per (project, pull request).
//!
//! The record is authoritative. Namespace labels and annotations are a
//! projection of it (see [`Environment::projected_labels`]) and are only read
//! back when rebuilding the store at startup.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ControllerError;

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "k8s-ee";
pub const PROJECT_LABEL: &str = "k8s-ee.io/project-id";
pub const PR_LABEL: &str = "k8s-ee.io/pr-number";
pub const COMMIT_LABEL: &str = "k8s-ee.io/commit-sha";
pub const BRANCH_LABEL: &str = "k8s-ee.io/branch";

/// Written once at creation, never updated.
pub const OWNER_ANNOTATION: &str = "k8s-ee.io/owner";
pub const CREATED_AT_ANNOTATION: &str = "k8s-ee.io/created-at";
pub const PRESERVE_REQUESTED_ANNOTATION: &str = "k8s-ee.io/preserve-requested-at";
pub const PRESERVE_EXPIRES_ANNOTATION: &str = "k8s-ee.io/preserve-expires-at";
pub const PRESERVE_EXTENSIONS_ANNOTATION: &str = "k8s-ee.io/preserve-extensions";

const MAX_NAMESPACE_LEN: usize = 63;
const MAX_LABEL_VALUE_LEN: usize = 63;
/// Digits of `u64::MAX`.
const MAX_PR_DIGITS: usize = 20;
const PR_INFIX: &str = "-pr-";

/// Identity of an environment: project plus pull request number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnvId {
    pub project_id: String,
    pub pr_number: u64,
}

impl EnvId {
    /// Build a validated key.
    pub fn new(project_id: &str, pr_number: u64) -> Result<Self, ControllerError> {
        validate_project_id(project_id)?;
        if pr_number == 0 {
            return Err(ControllerError::Validation(
                "PR number must be positive".to_string(),
            ));
        }
        Ok(Self {
            project_id: project_id.to_string(),
            pr_number,
        })
    }

    /// `{projectId}-pr-{prNumber}`.
    pub fn namespace_name(&self) -> String {
        format!("{}{}{}", self.project_id, PR_INFIX, self.pr_number)
    }

    /// Inverse of [`EnvId::namespace_name`]. Returns `None` for names this
    /// controller could not have produced.
    pub fn from_namespace_name(name: &str) -> Option<Self> {
        let idx = name.rfind(PR_INFIX)?;
        let (project, rest) = name.split_at(idx);
        let digits = &rest[PR_INFIX.len()..];
        if digits.is_empty() || digits.starts_with('0') || !digits.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        let pr_number = digits.parse().ok()?;
        EnvId::new(project, pr_number).ok()
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.project_id, self.pr_number)
    }
}

/// A project id must be a DNS label short enough that every namespace
/// derived from it fits in 63 characters.
pub fn validate_project_id(project_id: &str) -> Result<(), ControllerError> {
    let max_len = MAX_NAMESPACE_LEN - PR_INFIX.len() - MAX_PR_DIGITS;
    if project_id.is_empty() || project_id.len() > max_len {
        return Err(ControllerError::Validation(format!(
            "project id must be 1..={max_len} characters, got {:?}",
            project_id
        )));
    }
    let bytes = project_id.as_bytes();
    let valid_chars = bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-');
    if !valid_chars || !bytes[0].is_ascii_lowercase() || bytes[bytes.len() - 1] == b'-' {
        return Err(ControllerError::Validation(format!(
            "project id {:?} must be lowercase alphanumeric with inner hyphens",
            project_id
        )));
    }
    Ok(())
}

/// Commit SHAs are 7..=40 lowercase hex characters.
pub fn validate_commit_sha(sha: &str) -> Result<(), ControllerError> {
    let ok = (7..=40).contains(&sha.len())
        && sha.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if ok {
        Ok(())
    } else {
        Err(ControllerError::Validation(format!(
            "invalid commit sha {:?}",
            sha
        )))
    }
}

/// First seven characters of `sha`, cut on a character boundary.
pub fn short_sha(sha: &str) -> &str {
    match sha.char_indices().nth(7) {
        Some((end, _)) => &sha[..end],
        None => sha,
    }
}

/// Coerce an arbitrary string into a valid label value.
pub fn sanitize_label_value(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .take(MAX_LABEL_VALUE_LEN)
        .collect();
    mapped
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    Pending,
    Deploying,
    Active,
    PreserveRequested,
    Preserved,
    Expiring,
    Closing,
    Destroyed,
    Failed,
}

impl EnvironmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentState::Pending => "pending",
            EnvironmentState::Deploying => "deploying",
            EnvironmentState::Active => "active",
            EnvironmentState::PreserveRequested => "preserve_requested",
            EnvironmentState::Preserved => "preserved",
            EnvironmentState::Expiring => "expiring",
            EnvironmentState::Closing => "closing",
            EnvironmentState::Destroyed => "destroyed",
            EnvironmentState::Failed => "failed",
        }
    }

    /// States that occupy a preservation slot.
    pub fn holds_preservation(&self) -> bool {
        matches!(
            self,
            EnvironmentState::PreserveRequested | EnvironmentState::Preserved
        )
    }
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and provenance labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentLabels {
    pub project_id: String,
    pub pr_number: u64,
    /// Desired commit: the newest commit seen for this PR.
    pub commit_sha: String,
    pub branch_name: String,
    pub managed_by: String,
}

/// Fixed per-environment resource policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub cpu_limit: String,
    pub memory_limit: String,
    pub storage_limit: String,
    pub max_pods: u32,
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self {
            cpu_limit: "1".to_string(),
            memory_limit: "2Gi".to_string(),
            storage_limit: "5Gi".to_string(),
            max_pods: 10,
        }
    }
}

/// Default container requests/limits applied through a LimitRange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRangeDefaults {
    pub default_cpu: String,
    pub default_memory: String,
    pub request_cpu: String,
    pub request_memory: String,
}

impl Default for LimitRangeDefaults {
    fn default() -> Self {
        Self {
            default_cpu: "500m".to_string(),
            default_memory: "512Mi".to_string(),
            request_cpu: "100m".to_string(),
            request_memory: "128Mi".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy(String),
}

/// Last known deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub image_ref: String,
    pub commit_sha: String,
    pub health_status: HealthStatus,
    pub last_deployed_at: DateTime<Utc>,
    pub release_revision: Option<u32>,
}

/// Time-bounded exception from teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preservation {
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub extension_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub id: EnvId,
    pub namespace_name: String,
    pub state: EnvironmentState,
    pub labels: EnvironmentLabels,
    pub quota: ResourceQuota,
    pub deployment: Option<DeploymentRecord>,
    pub preservation: Option<Preservation>,
    pub last_error: Option<String>,
    /// The pull request reopened while teardown was still running; the
    /// environment is provisioned again once the namespace is gone.
    #[serde(default)]
    pub reopen_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Environment {
    pub fn new(
        id: EnvId,
        commit_sha: &str,
        branch_name: &str,
        quota: ResourceQuota,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            namespace_name: id.namespace_name(),
            labels: EnvironmentLabels {
                project_id: id.project_id.clone(),
                pr_number: id.pr_number,
                commit_sha: commit_sha.to_string(),
                branch_name: branch_name.to_string(),
                managed_by: MANAGED_BY_VALUE.to_string(),
            },
            id,
            state: EnvironmentState::Pending,
            quota,
            deployment: None,
            preservation: None,
            last_error: None,
            reopen_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Copy with a new state and timestamp.
    pub fn transition(&self, state: EnvironmentState, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.state = state;
        next.updated_at = now;
        next
    }

    /// Labels written to the namespace.
    pub fn projected_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), self.labels.managed_by.clone()),
            (PROJECT_LABEL.to_string(), self.labels.project_id.clone()),
            (PR_LABEL.to_string(), self.labels.pr_number.to_string()),
            (
                COMMIT_LABEL.to_string(),
                sanitize_label_value(&self.labels.commit_sha),
            ),
            (
                BRANCH_LABEL.to_string(),
                sanitize_label_value(&self.labels.branch_name),
            ),
        ])
    }

    /// Mutable annotations. An empty value removes the annotation.
    pub fn projected_annotations(&self) -> BTreeMap<String, String> {
        let (requested, expires, extensions) = match &self.preservation {
            Some(p) => (
                p.requested_at.to_rfc3339(),
                p.expires_at.to_rfc3339(),
                p.extension_count.to_string(),
            ),
            None => (String::new(), String::new(), String::new()),
        };
        BTreeMap::from([
            (PRESERVE_REQUESTED_ANNOTATION.to_string(), requested),
            (PRESERVE_EXPIRES_ANNOTATION.to_string(), expires),
            (PRESERVE_EXTENSIONS_ANNOTATION.to_string(), extensions),
        ])
    }

    /// Annotations written once when the namespace is created.
    pub fn creation_annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (OWNER_ANNOTATION.to_string(), self.id.to_string()),
            (CREATED_AT_ANNOTATION.to_string(), self.created_at.to_rfc3339()),
        ])
    }
}
