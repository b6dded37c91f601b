//! Webhook ingestion: maps GitHub events to environment intents.

use serde_json::Value;
use uuid::Uuid;

use crate::config::ControllerConfig;
use crate::error::{ControllerError, Result};
use crate::events::environment::{CloseReason, EnvironmentIntent, IntentKind};
use crate::models::environment::EnvId;

const PRESERVE_COMMAND: &str = "/preserve";

/// Result of ingesting one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    Intent(EnvironmentIntent),
    Ignored(String),
}

/// Translate a webhook payload into at most one intent.
///
/// `delivery` is the `X-GitHub-Delivery` header; a fresh id is used when it
/// is absent or not a UUID.
pub fn ingest(
    config: &ControllerConfig,
    event_type: &str,
    delivery: Option<&str>,
    payload: &Value,
) -> Result<Ingested> {
    if event_type == "ping" {
        tracing::info!("Received GitHub ping webhook");
        return Ok(Ingested::Ignored("ping".to_string()));
    }

    let repo = payload["repository"]["full_name"].as_str().unwrap_or_default();
    if !config.github_repo.is_empty() && !repo.eq_ignore_ascii_case(&config.github_repo) {
        tracing::debug!(repo, "Ignoring event from unconfigured repository");
        return Ok(Ingested::Ignored(format!("repository {repo} is not configured")));
    }

    let kind = match event_type {
        "pull_request" => pull_request_intent(payload)?,
        "issue_comment" => comment_intent(payload),
        other => {
            tracing::debug!("Ignoring webhook event: {}", other);
            None
        }
    };
    let Some((pr_number, kind)) = kind else {
        return Ok(Ingested::Ignored(format!("{event_type} event carries no intent")));
    };

    let env_id = EnvId::new(&config.project_id, pr_number)?;
    let delivery = delivery
        .and_then(|d| Uuid::parse_str(d).ok())
        .unwrap_or_else(Uuid::new_v4);
    tracing::info!(env = %env_id, intent = kind.name(), %delivery, "Intent ingested");
    Ok(Ingested::Intent(
        EnvironmentIntent::new(env_id, kind).with_delivery(delivery),
    ))
}

fn pr_number(value: &Value) -> Result<u64> {
    value
        .as_u64()
        .filter(|n| *n > 0)
        .ok_or_else(|| ControllerError::Validation("missing or invalid pull request number".to_string()))
}

fn pull_request_intent(payload: &Value) -> Result<Option<(u64, IntentKind)>> {
    let action = payload["action"].as_str().unwrap_or_default();
    let pr = &payload["pull_request"];
    let number = pr_number(if payload["number"].is_null() {
        &pr["number"]
    } else {
        &payload["number"]
    })?;
    let commit_sha = pr["head"]["sha"].as_str().unwrap_or_default().to_string();
    let branch = pr["head"]["ref"].as_str().unwrap_or_default().to_string();

    let kind = match action {
        "opened" | "reopened" => IntentKind::Open { commit_sha, branch },
        "synchronize" => IntentKind::Synchronize { commit_sha, branch },
        "closed" => IntentKind::Close {
            reason: CloseReason::PullRequestClosed {
                merged: pr["merged"].as_bool().unwrap_or(false),
            },
        },
        _ => return Ok(None),
    };
    Ok(Some((number, kind)))
}

/// `/preserve` must be the first line of a new comment on a pull request.
fn comment_intent(payload: &Value) -> Option<(u64, IntentKind)> {
    if payload["action"].as_str() != Some("created") {
        return None;
    }
    let issue = &payload["issue"];
    if issue["pull_request"].is_null() {
        return None;
    }
    let body = payload["comment"]["body"].as_str().unwrap_or_default();
    let first_line = body.lines().next().unwrap_or_default().trim();
    if first_line != PRESERVE_COMMAND {
        return None;
    }
    let number = issue["number"].as_u64().filter(|n| *n > 0)?;
    let requested_by = payload["comment"]["user"]["login"]
        .as_str()
        .unwrap_or("unknown")
        .to_string();
    Some((number, IntentKind::Preserve { requested_by }))
}
