//! Prometheus metrics for controller observability.

use metrics::{counter, gauge, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a webhook received event.
pub fn webhook_received(event_type: &str) {
    counter!("k8see_webhooks_received_total", "event" => event_type.to_string()).increment(1);
}

/// Record a processed intent and what the reconciler made of it.
pub fn intent_processed(kind: &str, outcome: &str) {
    counter!(
        "k8see_intents_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an environment state transition.
pub fn state_transition(state: &str) {
    counter!("k8see_state_transitions_total", "state" => state.to_string()).increment(1);
}

/// Record deploy duration.
pub fn deploy_duration(duration_ms: u64, success: bool) {
    histogram!("k8see_deploy_duration_ms", "success" => success.to_string())
        .record(duration_ms as f64);
}

/// Record a preserve admission decision.
pub fn preserve_decision(decision: &str) {
    counter!("k8see_preserve_decisions_total", "decision" => decision.to_string()).increment(1);
}

/// Set current preserved environment count.
pub fn preserved_environments(count: usize) {
    gauge!("k8see_preserved_environments").set(count as f64);
}

/// Record an orphan scheduled for removal.
pub fn orphan_removed() {
    counter!("k8see_orphans_removed_total").increment(1);
}

/// Record a namespace skipped for lacking ownership markers.
pub fn ownership_mismatch() {
    counter!("k8see_ownership_mismatches_total").increment(1);
}

/// Record an error occurrence.
pub fn error_recorded(category: &str) {
    counter!("k8see_errors_total", "category" => category.to_string()).increment(1);
}
