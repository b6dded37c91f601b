//! Status message posted to the pull request.

use serde::{Deserialize, Serialize};

use super::environment::{short_sha, EnvId};

/// The single, in-place-updated message per environment key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub env_id: EnvId,
    pub preview_url: String,
    pub commit_sha: String,
    pub branch_name: String,
    pub deploy_status: String,
    pub preserve_status: String,
}

impl StatusMessage {
    /// Hidden marker used to find the message again.
    pub fn marker(env_id: &EnvId) -> String {
        format!("<!-- k8s-ee:status:{} -->", env_id)
    }

    pub fn render_markdown(&self) -> String {
        format!(
            "{marker}\n### Preview environment\n\n\
             | | |\n|---|---|\n\
             | **URL** | {url} |\n\
             | **Commit** | `{sha}` |\n\
             | **Branch** | `{branch}` |\n\
             | **Deploy** | {deploy} |\n\
             | **Preserve** | {preserve} |\n\n\
             _Comment `/preserve` to keep this environment for a limited time._\n",
            marker = Self::marker(&self.env_id),
            url = self.preview_url,
            sha = short_sha(&self.commit_sha),
            branch = self.branch_name,
            deploy = self.deploy_status,
            preserve = self.preserve_status,
        )
    }
}
