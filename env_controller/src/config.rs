//! Controller configuration: loaded from environment variables.

use std::time::Duration;

use crate::error::ControllerError;
use crate::models::environment::{validate_project_id, LimitRangeDefaults, ResourceQuota};

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Project identifier; prefix of every namespace this controller owns.
    pub project_id: String,
    /// `owner/name` of the repository whose PRs we serve.
    pub github_repo: String,
    /// GitHub webhook secret for HMAC validation.
    pub github_webhook_secret: String,
    /// GitHub token for comments and PR listing.
    pub github_token: String,
    /// GitHub REST base URL.
    pub github_api_url: String,
    /// Preview hosts are `{namespace}.{preview_domain_suffix}`.
    pub preview_domain_suffix: String,
    /// Image repository; tags are `sha-{short commit}`.
    pub image_repository: String,
    /// Helm chart reference (path, repo/chart, or oci:// URL).
    pub chart_ref: String,
    /// Helm release name inside each environment namespace.
    pub release_name: String,
    /// Optional kubectl/helm context.
    pub kube_context: Option<String>,
    pub max_preserved_environments: usize,
    pub preserve_duration_hours: i64,
    /// Lead time of the one-shot expiry warning.
    pub preserve_warning_minutes: i64,
    pub quota: ResourceQuota,
    pub limit_range: LimitRangeDefaults,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
    /// Interval of the preservation expiry tick.
    pub preserve_tick_interval: Duration,
    /// Interval of the orphan sweep.
    pub sweep_interval: Duration,
    /// Namespaces younger than this are never considered orphans.
    pub orphan_grace: chrono::Duration,
    /// Delay between preservation expiry and teardown.
    pub expiry_teardown_grace: chrono::Duration,
    /// Per-key workers exit after this long without intents.
    pub worker_idle_timeout: Duration,
}

/// Bounded wait budgets of the suspension points.
#[derive(Clone, Debug)]
pub struct Timeouts {
    pub namespace_ready: Duration,
    pub deploy: Duration,
    pub teardown: Duration,
    /// Timeout of a single kubectl/helm invocation.
    pub command: Duration,
    pub readiness_poll: Duration,
}

/// Exponential backoff for transient infrastructure errors.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            namespace_ready: Duration::from_secs(120),
            deploy: Duration::from_secs(600),
            teardown: Duration::from_secs(300),
            command: Duration::from_secs(60),
            readiness_poll: Duration::from_secs(5),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            project_id: "k8s-ee".to_string(),
            github_repo: String::new(),
            github_webhook_secret: String::new(),
            github_token: String::new(),
            github_api_url: "https://api.github.com".to_string(),
            preview_domain_suffix: "k8s-ee.example.dev".to_string(),
            image_repository: "ghcr.io/k8s-ee/app".to_string(),
            chart_ref: "./charts/app".to_string(),
            release_name: "app".to_string(),
            kube_context: None,
            max_preserved_environments: 3,
            preserve_duration_hours: 48,
            preserve_warning_minutes: 60,
            quota: ResourceQuota::default(),
            limit_range: LimitRangeDefaults::default(),
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            preserve_tick_interval: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(3600),
            orphan_grace: chrono::Duration::minutes(30),
            expiry_teardown_grace: chrono::Duration::zero(),
            worker_idle_timeout: Duration::from_secs(600),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).ok().filter(|s| !s.is_empty()).unwrap_or(default)
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let github_webhook_secret = std::env::var("K8SEE_WEBHOOK_SECRET").unwrap_or_default();
        let github_token = std::env::var("K8SEE_GITHUB_TOKEN").unwrap_or_default();

        let quota = ResourceQuota {
            cpu_limit: env_string("K8SEE_QUOTA_CPU", defaults.quota.cpu_limit),
            memory_limit: env_string("K8SEE_QUOTA_MEMORY", defaults.quota.memory_limit),
            storage_limit: env_string("K8SEE_QUOTA_STORAGE", defaults.quota.storage_limit),
            max_pods: env_parse("K8SEE_QUOTA_PODS", defaults.quota.max_pods),
        };

        let timeouts = Timeouts {
            namespace_ready: Duration::from_secs(env_parse("K8SEE_NAMESPACE_TIMEOUT_SECS", 120)),
            deploy: Duration::from_secs(env_parse("K8SEE_DEPLOY_TIMEOUT_SECS", 600)),
            teardown: Duration::from_secs(env_parse("K8SEE_TEARDOWN_TIMEOUT_SECS", 300)),
            command: Duration::from_secs(env_parse("K8SEE_COMMAND_TIMEOUT_SECS", 60)),
            readiness_poll: Duration::from_secs(env_parse("K8SEE_READINESS_POLL_SECS", 5)),
        };

        let retry = RetryPolicy {
            max_attempts: env_parse("K8SEE_RETRY_ATTEMPTS", 3),
            base_delay: Duration::from_secs(env_parse("K8SEE_RETRY_BASE_DELAY_SECS", 2)),
            max_delay: Duration::from_secs(env_parse("K8SEE_RETRY_MAX_DELAY_SECS", 30)),
        };

        let kube_context = std::env::var("K8SEE_KUBE_CONTEXT")
            .ok()
            .filter(|s| !s.is_empty());

        if github_webhook_secret.is_empty() {
            tracing::warn!("K8SEE_WEBHOOK_SECRET not set -- webhook signature validation disabled");
        }
        if github_token.is_empty() {
            tracing::warn!("K8SEE_GITHUB_TOKEN not set -- PR comments and orphan sweeps disabled");
        }

        Self {
            project_id: env_string("K8SEE_PROJECT_ID", defaults.project_id),
            github_repo: std::env::var("K8SEE_GITHUB_REPO").unwrap_or_default(),
            github_webhook_secret,
            github_token,
            github_api_url: env_string("K8SEE_GITHUB_API_URL", defaults.github_api_url),
            preview_domain_suffix: env_string(
                "K8SEE_PREVIEW_DOMAIN_SUFFIX",
                defaults.preview_domain_suffix,
            ),
            image_repository: env_string("K8SEE_IMAGE_REPOSITORY", defaults.image_repository),
            chart_ref: env_string("K8SEE_CHART_REF", defaults.chart_ref),
            release_name: env_string("K8SEE_RELEASE_NAME", defaults.release_name),
            kube_context,
            max_preserved_environments: env_parse("K8SEE_MAX_PRESERVED", 3),
            preserve_duration_hours: env_parse("K8SEE_PRESERVE_HOURS", 48),
            preserve_warning_minutes: env_parse("K8SEE_PRESERVE_WARNING_MIN", 60),
            quota,
            limit_range: defaults.limit_range,
            timeouts,
            retry,
            preserve_tick_interval: Duration::from_secs(env_parse("K8SEE_PRESERVE_TICK_SECS", 300)),
            sweep_interval: Duration::from_secs(env_parse("K8SEE_SWEEP_INTERVAL_SECS", 3600)),
            orphan_grace: chrono::Duration::minutes(env_parse("K8SEE_ORPHAN_GRACE_MINUTES", 30)),
            expiry_teardown_grace: chrono::Duration::minutes(env_parse(
                "K8SEE_EXPIRY_TEARDOWN_GRACE_MINUTES",
                0,
            )),
            worker_idle_timeout: Duration::from_secs(env_parse("K8SEE_WORKER_IDLE_SECS", 600)),
        }
    }

    pub fn validate(&self) -> Result<(), ControllerError> {
        validate_project_id(&self.project_id)?;
        if self.max_preserved_environments == 0 {
            return Err(ControllerError::Validation(
                "K8SEE_MAX_PRESERVED must be at least 1".to_string(),
            ));
        }
        if self.preserve_duration_hours <= 0 {
            return Err(ControllerError::Validation(
                "K8SEE_PRESERVE_HOURS must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn preserve_duration(&self) -> chrono::Duration {
        chrono::Duration::hours(self.preserve_duration_hours)
    }

    pub fn preserve_warning_lead(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.preserve_warning_minutes)
    }

    pub fn preview_url(&self, namespace: &str) -> String {
        format!("https://{}.{}", namespace, self.preview_domain_suffix)
    }
}
