//! Controller HTTP routes.

pub mod api;
pub mod webhook;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::ControllerConfig;
use crate::services::dispatcher::Dispatcher;
use crate::services::environment_service::EnvironmentStore;
use crate::services::preservation_service::PreservationManager;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ControllerConfig>,
    pub store: Arc<EnvironmentStore>,
    pub preservation: Arc<PreservationManager>,
    pub dispatcher: Dispatcher,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Webhook
        .route("/webhook/github", post(webhook_handler))
        // Environment API
        .route("/api/environments", get(list_environments))
        .route("/api/environments/{pr}", get(get_environment))
        .route("/api/preservations", get(list_preservations))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Webhook ──

async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<webhook::WebhookResponse>) {
    crate::metrics::webhook_received(
        headers
            .get("x-github-event")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown"),
    );

    webhook::handle_webhook(&state, &headers, &body)
}

// ── Environment API ──

async fn list_environments(State(state): State<AppState>) -> Json<Vec<api::EnvironmentJson>> {
    Json(api::list_environments(&state.store, &state.config))
}

async fn get_environment(
    State(state): State<AppState>,
    Path(pr): Path<u64>,
) -> Result<Json<api::EnvironmentJson>, StatusCode> {
    api::get_environment(&state.store, &state.config, pr)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn list_preservations(State(state): State<AppState>) -> Json<api::PreservationsJson> {
    Json(api::list_preservations(&state.preservation, &state.config))
}

async fn health(State(state): State<AppState>) -> Json<api::HealthJson> {
    Json(api::HealthJson {
        status: "ok",
        environments: state.store.live().len(),
        preserved: state.preservation.held(),
        workers: state.dispatcher.worker_count(),
    })
}
