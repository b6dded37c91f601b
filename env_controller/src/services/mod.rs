//! Controller services.

pub mod cluster_service;
pub mod deploy_service;
pub mod dispatcher;
pub mod environment_service;
pub mod error_service;
pub mod executor;
pub mod github_service;
pub mod ingest_service;
pub mod kube_cli;
pub mod memory_backend;
pub mod preservation_service;
pub mod reconciler;
pub mod scheduler;
pub mod sweeper;
pub mod worker;
