//! GitHub webhook handler.

use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use serde::Serialize;

use super::AppState;
use crate::services::github_service;
use crate::services::ingest_service::{ingest, Ingested};

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WebhookResponse {
    fn rejected(status: StatusCode, reason: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(Self {
                accepted: false,
                intent: None,
                reason: Some(reason.into()),
            }),
        )
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Handle an incoming GitHub webhook payload.
///
/// Intents are queued and the response returns immediately; the work runs
/// on the key's worker.
pub fn handle_webhook(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> (StatusCode, Json<WebhookResponse>) {
    // Validate signature
    let signature = header(headers, "x-hub-signature-256").unwrap_or("");
    if !github_service::validate_signature(&state.config.github_webhook_secret, body, signature) {
        tracing::warn!("Webhook signature validation failed");
        return WebhookResponse::rejected(StatusCode::UNAUTHORIZED, "invalid signature");
    }

    let event_type = header(headers, "x-github-event").unwrap_or("unknown");
    let delivery = header(headers, "x-github-delivery");

    let payload: serde_json::Value = match serde_json::from_slice(body) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(event = event_type, "Malformed webhook payload: {e}");
            return WebhookResponse::rejected(StatusCode::BAD_REQUEST, "malformed JSON payload");
        }
    };

    match ingest(&state.config, event_type, delivery, &payload) {
        Ok(Ingested::Intent(intent)) => {
            let name = intent.kind.name();
            state.dispatcher.submit(intent);
            (
                StatusCode::ACCEPTED,
                Json(WebhookResponse {
                    accepted: true,
                    intent: Some(name),
                    reason: None,
                }),
            )
        }
        Ok(Ingested::Ignored(reason)) => (
            StatusCode::OK,
            Json(WebhookResponse {
                accepted: false,
                intent: None,
                reason: Some(reason),
            }),
        ),
        Err(e) => {
            tracing::warn!(event = event_type, delivery, "Rejected webhook: {e}");
            crate::metrics::error_recorded(e.category());
            WebhookResponse::rejected(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        }
    }
}
