//! k8s-ee controller: per-pull-request Kubernetes environments.
//!
//! GitHub webhooks become intents; each environment key has a worker that
//! reconciles intents against observed cluster state, provisions an isolated
//! namespace, deploys the commit, and tears it down when the pull request
//! closes. A bounded number of environments may be preserved past close.

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod models;
pub mod routes;
pub mod services;
