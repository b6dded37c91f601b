//! REST API for environments and preservations.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ControllerConfig;
use crate::models::environment::{DeploymentRecord, Environment, Preservation};
use crate::services::environment_service::EnvironmentStore;
use crate::services::preservation_service::{PreservationManager, SlotView};

/// JSON response for an environment.
#[derive(Debug, Serialize)]
pub struct EnvironmentJson {
    pub id: String,
    pub project_id: String,
    pub pr_number: u64,
    pub namespace: String,
    pub state: &'static str,
    pub commit_sha: String,
    pub branch: String,
    pub preview_url: String,
    pub deployment: Option<DeploymentRecord>,
    pub preservation: Option<Preservation>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EnvironmentJson {
    fn from_env(env: Environment, config: &ControllerConfig) -> Self {
        Self {
            id: env.id.to_string(),
            preview_url: config.preview_url(&env.namespace_name),
            project_id: env.id.project_id,
            pr_number: env.id.pr_number,
            namespace: env.namespace_name,
            state: env.state.as_str(),
            commit_sha: env.labels.commit_sha,
            branch: env.labels.branch_name,
            deployment: env.deployment,
            preservation: env.preservation,
            last_error: env.last_error,
            created_at: env.created_at,
            updated_at: env.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PreservationsJson {
    pub held: usize,
    pub max: usize,
    pub slots: Vec<SlotView>,
}

#[derive(Debug, Serialize)]
pub struct HealthJson {
    pub status: &'static str,
    pub environments: usize,
    pub preserved: usize,
    pub workers: usize,
}

/// All environments, most recently updated first.
pub fn list_environments(store: &EnvironmentStore, config: &ControllerConfig) -> Vec<EnvironmentJson> {
    let mut envs = store.list();
    envs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    envs.into_iter()
        .map(|e| EnvironmentJson::from_env(e, config))
        .collect()
}

pub fn get_environment(
    store: &EnvironmentStore,
    config: &ControllerConfig,
    pr_number: u64,
) -> Option<EnvironmentJson> {
    store
        .find_by_pr(pr_number)
        .map(|e| EnvironmentJson::from_env(e, config))
}

pub fn list_preservations(
    preservation: &PreservationManager,
    config: &ControllerConfig,
) -> PreservationsJson {
    let slots = preservation.snapshot();
    PreservationsJson {
        held: slots.len(),
        max: config.max_preserved_environments,
        slots,
    }
}
