//! Failure classification and bounded retry of transient errors.

use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::config::RetryPolicy;
use crate::error::ControllerError;

static TRANSIENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(timed? ?out|deadline exceeded|connection (refused|reset)|i/o timeout|tls handshake|too many requests|\b429\b|rate limit|etcdserver: (leader changed|request timed out)|the object has been modified|service unavailable|\b503\b|\beof\b)",
    )
    .expect("transient pattern is valid")
});

static WHITESPACE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// Collapse CLI/API error output into a single bounded line.
pub fn normalize(text: &str) -> String {
    let line = WHITESPACE_REGEX.replace_all(text.trim(), " ");
    if line.len() > 500 {
        let mut end = 500;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &line[..end])
    } else {
        line.into_owned()
    }
}

/// Classify failure text from kubectl, helm, or an API response.
pub fn classify_failure(context: &str, text: &str) -> ControllerError {
    let message = format!("{context}: {}", normalize(text));
    if TRANSIENT_REGEX.is_match(text) {
        ControllerError::TransientInfra(message)
    } else {
        ControllerError::Infra(message)
    }
}

/// Delay before attempt `attempt` (1-based) is retried.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    policy.base_delay.saturating_mul(factor).min(policy.max_delay)
}

/// Run `op`, retrying transient failures with exponential backoff.
///
/// Non-transient errors return immediately; after `max_attempts` the last
/// transient error is returned to the caller for escalation.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, ControllerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ControllerError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = backoff_delay(policy, attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, retrying: {e}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                crate::metrics::error_recorded(e.category());
                return Err(e);
            }
        }
    }
}
