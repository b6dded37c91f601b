mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use common::{open, synchronize, Harness, SHA_A, SHA_B, SHA_C};
use k8s_ee_controller::events::environment::{CloseReason, IntentKind};
use k8s_ee_controller::models::environment::{EnvironmentState, HealthStatus};

#[tokio::test]
async fn opened_pull_request_gets_an_active_environment() {
    let h = Harness::new();
    h.open(42, SHA_A).await;

    let env = h.env(42);
    assert_eq!(env.state, EnvironmentState::Active);
    assert_eq!(env.namespace_name, "k8s-ee-pr-42");
    let deployment = env.deployment.expect("deployment recorded");
    assert_eq!(deployment.commit_sha, SHA_A);
    assert_eq!(deployment.health_status, HealthStatus::Healthy);

    let ns = h.cluster.namespace("k8s-ee-pr-42").expect("namespace created");
    assert!(ns.quota_applied);
    assert!(ns.is_owned_by(&h.id(42)));
    assert_eq!(h.cluster.count_mutations("create_namespace"), 1);
    assert_eq!(h.releases.count_mutations("upgrade_install k8s-ee-pr-42"), 1);

    let comment = h.notifier.latest("k8s-ee#42").expect("status comment");
    assert_eq!(comment.deploy_status, "active");
    assert_eq!(comment.preview_url, "https://k8s-ee-pr-42.k8s-ee.example.dev");
    assert_eq!(h.notifier.comment_count(), 1);
}

#[tokio::test]
async fn redelivered_open_is_a_noop() {
    let h = Harness::new();
    h.open(42, SHA_A).await;
    let before = h.cluster.mutations().len() + h.releases.mutations().len();

    h.open(42, SHA_A).await;

    assert_eq!(h.env(42).state, EnvironmentState::Active);
    assert_eq!(h.cluster.mutations().len() + h.releases.mutations().len(), before);
}

#[tokio::test]
async fn multibyte_commit_is_rejected_and_the_worker_survives() {
    let h = Harness::new();
    h.open(42, "ééééééé").await;

    assert!(h.store.get(&h.id(42)).is_none());
    assert_eq!(h.cluster.count_mutations("create_namespace"), 0);
    let comment = h.notifier.latest("k8s-ee#42").expect("rejection posted");
    assert!(comment.preserve_status.contains("invalid commit sha"));

    h.open(42, SHA_A).await;
    assert_eq!(h.env(42).state, EnvironmentState::Active);
}

#[tokio::test]
async fn synchronize_redeploys_into_the_same_namespace() {
    let h = Harness::new();
    h.open(42, SHA_A).await;
    h.run(42, synchronize(SHA_B)).await;

    let env = h.env(42);
    assert_eq!(env.state, EnvironmentState::Active);
    assert_eq!(env.labels.commit_sha, SHA_B);
    assert_eq!(h.cluster.count_mutations("create_namespace"), 1);
    assert_eq!(h.releases.count_mutations("upgrade_install"), 2);
}

#[tokio::test]
async fn failed_deploy_reports_pod_status_and_rolls_back() {
    let mut config = common::test_config();
    config.timeouts.deploy = Duration::from_millis(200);
    let h = Harness::with(config, chrono::Duration::hours(48));
    h.releases.never_ready("sha-1111111", "ImagePullBackOff");

    h.open(42, SHA_B).await;
    h.run(42, synchronize(SHA_A)).await;

    let env = h.env(42);
    assert_eq!(env.state, EnvironmentState::Failed);
    let error = env.last_error.expect("failure recorded");
    assert!(error.contains("ImagePullBackOff"), "{error}");
    assert_eq!(h.releases.count_mutations("rollback k8s-ee-pr-42"), 1);
    let comment = h.notifier.latest("k8s-ee#42").unwrap();
    assert!(comment.deploy_status.starts_with("failed"));

    // A new commit retries from Failed.
    h.run(42, synchronize(SHA_C)).await;
    let env = h.env(42);
    assert_eq!(env.state, EnvironmentState::Active);
    assert_eq!(env.labels.commit_sha, SHA_C);
}

#[tokio::test]
async fn failed_first_install_is_uninstalled() {
    let mut config = common::test_config();
    config.timeouts.deploy = Duration::from_millis(200);
    let h = Harness::with(config, chrono::Duration::hours(48));
    h.releases.never_ready("sha-1111111", "CrashLoopBackOff");

    h.open(42, SHA_A).await;

    assert_eq!(h.env(42).state, EnvironmentState::Failed);
    assert_eq!(h.releases.count_mutations("rollback"), 0);
    assert_eq!(h.releases.count_mutations("uninstall k8s-ee-pr-42"), 1);
    assert!(h.releases.release("k8s-ee-pr-42", "app").is_none());

    // The next commit installs from scratch.
    h.run(42, synchronize(SHA_B)).await;
    assert_eq!(h.env(42).state, EnvironmentState::Active);
    assert!(h.releases.release("k8s-ee-pr-42", "app").is_some());
}

#[tokio::test]
async fn newer_commit_supersedes_a_deploy_in_flight() {
    let h = Harness::new();
    h.releases.never_ready("sha-1111111", "ContainerCreating");

    h.submit(42, open(SHA_A));
    h.wait_for_state(42, EnvironmentState::Deploying).await;
    h.run(42, synchronize(SHA_B)).await;

    let env = h.env(42);
    assert_eq!(env.state, EnvironmentState::Active);
    assert_eq!(env.deployment.unwrap().commit_sha, SHA_B);
    // The abandoned deploy never reported a result.
    assert!(h
        .notifier
        .history()
        .iter()
        .all(|m| !m.deploy_status.starts_with("failed")));
}

#[tokio::test]
async fn close_tears_down_everything() {
    let h = Harness::new();
    h.open(42, SHA_A).await;
    h.close(42).await;

    assert_eq!(h.env(42).state, EnvironmentState::Destroyed);
    assert!(h.cluster.namespace("k8s-ee-pr-42").is_none());
    assert_eq!(h.cluster.count_mutations("delete_namespace k8s-ee-pr-42"), 1);
    assert_eq!(h.notifier.latest("k8s-ee#42").unwrap().deploy_status, "destroyed");

    // Closing again is harmless.
    h.close(42).await;
    assert_eq!(h.cluster.count_mutations("delete_namespace"), 1);
}

#[tokio::test]
async fn close_waits_for_namespace_termination() {
    let h = Harness::new();
    h.cluster.set_instant_delete(false);
    h.open(42, SHA_A).await;

    h.submit(
        42,
        IntentKind::Close {
            reason: CloseReason::PullRequestClosed { merged: false },
        },
    );
    h.wait_for_state(42, EnvironmentState::Closing).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.env(42).state, EnvironmentState::Closing);

    h.cluster.finish_termination("k8s-ee-pr-42");
    h.dispatcher.wait_idle().await;
    assert_eq!(h.env(42).state, EnvironmentState::Destroyed);
}

#[tokio::test]
async fn reopen_after_stalled_teardown_provisions_again() {
    let h = Harness::new();
    h.cluster.set_instant_delete(false);
    h.open(42, SHA_A).await;
    h.close(42).await;

    // Termination outlived the teardown wait.
    let env = h.env(42);
    assert_eq!(env.state, EnvironmentState::Closing);
    assert!(env.last_error.is_some());

    h.cluster.finish_termination("k8s-ee-pr-42");
    h.open(42, SHA_B).await;

    let env = h.env(42);
    assert_eq!(env.state, EnvironmentState::Active);
    assert_eq!(env.labels.commit_sha, SHA_B);
    assert!(!env.reopen_requested);
    assert!(h.cluster.namespace("k8s-ee-pr-42").is_some());
    assert_eq!(h.cluster.count_mutations("create_namespace"), 2);
}

#[tokio::test]
async fn reopen_during_stalled_teardown_is_finished_by_the_sweep() {
    let h = Harness::new();
    h.cluster.set_instant_delete(false);
    h.open(42, SHA_A).await;
    h.close(42).await;

    // Reopened while the old namespace is still terminating.
    h.open(42, SHA_B).await;
    let env = h.env(42);
    assert_eq!(env.state, EnvironmentState::Closing);
    assert!(env.reopen_requested);

    h.cluster.finish_termination("k8s-ee-pr-42");
    h.pull_requests.set(Some(BTreeSet::from([42])));
    h.scheduler.sweep_once(chrono::Utc::now()).await;
    h.dispatcher.wait_idle().await;

    let env = h.env(42);
    assert_eq!(env.state, EnvironmentState::Active);
    assert_eq!(env.labels.commit_sha, SHA_B);
}

#[tokio::test]
async fn reopen_after_close_provisions_again() {
    let h = Harness::new();
    h.open(42, SHA_A).await;
    h.close(42).await;
    h.open(42, SHA_B).await;

    let env = h.env(42);
    assert_eq!(env.state, EnvironmentState::Active);
    assert_eq!(env.labels.commit_sha, SHA_B);
    assert_eq!(h.cluster.count_mutations("create_namespace"), 2);
}

#[tokio::test]
async fn unowned_namespace_blocks_provisioning() {
    let h = Harness::new();
    h.open(7, SHA_A).await;
    let mut squatter = h.cluster.namespace("k8s-ee-pr-7").unwrap();
    h.close(7).await;

    squatter.annotations.clear();
    h.cluster.insert_namespace(squatter);
    h.open(7, SHA_B).await;

    assert_eq!(h.env(7).state, EnvironmentState::Destroyed);
    assert_eq!(h.cluster.count_mutations("create_namespace"), 1);
    let comment = h.notifier.latest("k8s-ee#7").unwrap();
    assert!(comment.deploy_status.contains("ownership"), "{}", comment.deploy_status);
}

#[tokio::test]
async fn transient_create_failure_is_retried() {
    let h = Harness::new();
    h.cluster.fail_next("create_namespace", true, "connection refused");
    h.open(42, SHA_A).await;
    assert_eq!(h.env(42).state, EnvironmentState::Active);
}

#[tokio::test]
async fn notifier_outage_does_not_block_the_lifecycle() {
    let h = Harness::new();
    h.notifier.set_failing(true);
    h.open(42, SHA_A).await;
    assert_eq!(h.env(42).state, EnvironmentState::Active);
    assert_eq!(h.notifier.comment_count(), 0);
}

#[tokio::test]
async fn pull_requests_proceed_in_parallel() {
    let h = Harness::new();
    h.releases.never_ready("sha-1111111", "ContainerCreating");

    h.submit(1, open(SHA_A));
    h.wait_for_state(1, EnvironmentState::Deploying).await;
    h.submit(2, open(SHA_B));
    h.wait_for_state(2, EnvironmentState::Active).await;

    // PR 2 finished while PR 1 is still waiting on its workloads.
    assert_eq!(h.env(2).state, EnvironmentState::Active);
    assert_eq!(h.env(1).state, EnvironmentState::Deploying);
    h.dispatcher.shutdown();
}
