//! GitHub integration: webhook signatures and PR status comments.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::Sha256;

use crate::config::ControllerConfig;
use crate::error::{ControllerError, Result};
use crate::models::environment::EnvId;
use crate::models::status::StatusMessage;

type HmacSha256 = Hmac<Sha256>;

const PAGE_SIZE: usize = 100;

/// Validate a GitHub webhook signature (X-Hub-Signature-256).
pub fn validate_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        tracing::warn!("Webhook secret not configured, skipping validation");
        return true;
    }

    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let sig_bytes = match hex::decode(sig) {
        Ok(b) => b,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(payload);

    mac.verify_slice(&sig_bytes).is_ok()
}

/// Delivers the per-environment status message.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Create the environment's status message, or update it in place.
    async fn upsert_status(&self, message: &StatusMessage) -> Result<()>;
}

/// Source of truth for which pull requests are still open.
#[async_trait]
pub trait PullRequestSource: Send + Sync {
    async fn list_open_pull_requests(&self) -> Result<BTreeSet<u64>>;
}

#[derive(Debug, Deserialize)]
struct Comment {
    id: u64,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    number: u64,
}

pub struct GitHubClient {
    http: reqwest::Client,
    api_url: String,
    repo: String,
    token: String,
    comment_ids: Mutex<BTreeMap<EnvId, u64>>,
}

impl GitHubClient {
    pub fn new(api_url: &str, repo: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            repo: repo.to_string(),
            token: token.to_string(),
            comment_ids: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(&config.github_api_url, &config.github_repo, &config.github_token)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_url, path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "k8s-ee-controller")
    }

    fn cached_comment(&self, id: &EnvId) -> Option<u64> {
        self.comment_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .copied()
    }

    fn cache_comment(&self, id: &EnvId, comment_id: Option<u64>) {
        let mut ids = self.comment_ids.lock().unwrap_or_else(|e| e.into_inner());
        match comment_id {
            Some(c) => ids.insert(id.clone(), c),
            None => ids.remove(id),
        };
    }

    /// Page through the PR's comments looking for our marker.
    async fn find_comment(&self, env_id: &EnvId) -> Result<Option<u64>> {
        let marker = StatusMessage::marker(env_id);
        let path = format!("/repos/{}/issues/{}/comments", self.repo, env_id.pr_number);
        for page in 1.. {
            let resp = self
                .request(reqwest::Method::GET, &path)
                .query(&[("per_page", PAGE_SIZE.to_string()), ("page", page.to_string())])
                .send()
                .await?;
            let comments: Vec<Comment> = check(resp).await?.json().await?;
            if let Some(c) = comments.iter().find(|c| c.body.contains(&marker)) {
                return Ok(Some(c.id));
            }
            if comments.len() < PAGE_SIZE {
                break;
            }
        }
        Ok(None)
    }

    async fn create_comment(&self, env_id: &EnvId, body: &str) -> Result<u64> {
        let path = format!("/repos/{}/issues/{}/comments", self.repo, env_id.pr_number);
        let resp = self
            .request(reqwest::Method::POST, &path)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?;
        let comment: Comment = check(resp).await?.json().await?;
        Ok(comment.id)
    }

    /// Returns `false` when the comment no longer exists.
    async fn update_comment(&self, comment_id: u64, body: &str) -> Result<bool> {
        let path = format!("/repos/{}/issues/comments/{}", self.repo, comment_id);
        let resp = self
            .request(reqwest::Method::PATCH, &path)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(resp).await?;
        Ok(true)
    }
}

/// Map a non-success response to an error; 429 and 5xx are transient.
async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let message = format!("{status}: {}", crate::services::error_service::normalize(&text));
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(ControllerError::TransientInfra(message))
    } else {
        Err(ControllerError::GitHub(message))
    }
}

#[async_trait]
impl Notifier for GitHubClient {
    async fn upsert_status(&self, message: &StatusMessage) -> Result<()> {
        if self.token.is_empty() {
            tracing::debug!("GitHub token not set, skipping status comment");
            return Ok(());
        }
        let env_id = &message.env_id;
        let body = message.render_markdown();

        let existing = match self.cached_comment(env_id) {
            Some(id) => Some(id),
            None => self.find_comment(env_id).await?,
        };
        if let Some(comment_id) = existing {
            if self.update_comment(comment_id, &body).await? {
                self.cache_comment(env_id, Some(comment_id));
                return Ok(());
            }
            tracing::info!(env = %env_id, comment_id, "Status comment was deleted, posting a new one");
            self.cache_comment(env_id, None);
        }

        let comment_id = self.create_comment(env_id, &body).await?;
        self.cache_comment(env_id, Some(comment_id));
        tracing::debug!(env = %env_id, comment_id, "Status comment created");
        Ok(())
    }
}

#[async_trait]
impl PullRequestSource for GitHubClient {
    async fn list_open_pull_requests(&self) -> Result<BTreeSet<u64>> {
        if self.token.is_empty() || self.repo.is_empty() {
            return Err(ControllerError::GitHub(
                "GitHub token or repository not configured".to_string(),
            ));
        }
        let path = format!("/repos/{}/pulls", self.repo);
        let mut open = BTreeSet::new();
        for page in 1.. {
            let resp = self
                .request(reqwest::Method::GET, &path)
                .query(&[
                    ("state", "open".to_string()),
                    ("per_page", PAGE_SIZE.to_string()),
                    ("page", page.to_string()),
                ])
                .send()
                .await?;
            let prs: Vec<PullRequest> = check(resp).await?.json().await?;
            let count = prs.len();
            open.extend(prs.into_iter().map(|pr| pr.number));
            if count < PAGE_SIZE {
                break;
            }
        }
        Ok(open)
    }
}
