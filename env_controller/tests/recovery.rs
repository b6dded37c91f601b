mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{Harness, SHA_A};
use k8s_ee_controller::models::cluster::{NamespacePhase, ObservedNamespace};
use k8s_ee_controller::models::environment::{
    EnvironmentState, MANAGED_BY_LABEL, MANAGED_BY_VALUE, PRESERVE_EXPIRES_ANNOTATION,
};
use k8s_ee_controller::services::environment_service::rebuild_from_cluster;

#[tokio::test]
async fn orphaned_environment_is_swept() {
    let h = Harness::new();
    h.open(7, SHA_A).await;
    h.open(8, SHA_A).await;
    h.pull_requests.set(Some(BTreeSet::from([8])));

    // Inside the grace window nothing is touched.
    assert_eq!(h.scheduler.sweep_once(Utc::now()).await, 0);

    let count = h.scheduler.sweep_once(Utc::now() + Duration::hours(1)).await;
    h.dispatcher.wait_idle().await;

    assert_eq!(count, 1);
    assert_eq!(h.env(7).state, EnvironmentState::Destroyed);
    assert!(h.cluster.namespace("k8s-ee-pr-7").is_none());
    assert_eq!(h.env(8).state, EnvironmentState::Active);
}

#[tokio::test]
async fn sweep_is_skipped_when_pull_requests_are_unavailable() {
    let h = Harness::new();
    h.open(7, SHA_A).await;
    h.pull_requests.set(None);

    let count = h.scheduler.sweep_once(Utc::now() + Duration::hours(1)).await;
    h.dispatcher.wait_idle().await;

    assert_eq!(count, 0);
    assert_eq!(h.env(7).state, EnvironmentState::Active);
}

#[tokio::test]
async fn sweep_never_touches_foreign_namespaces() {
    let h = Harness::new();
    let created = Some(Utc::now() - Duration::days(2));
    h.cluster.insert_namespace(ObservedNamespace {
        name: "k8s-ee-pr-11".to_string(),
        phase: NamespacePhase::Active,
        labels: [(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())].into(),
        annotations: Default::default(),
        created_at: created,
        quota_applied: true,
    });
    h.cluster.insert_namespace(ObservedNamespace {
        name: "billing".to_string(),
        phase: NamespacePhase::Active,
        labels: Default::default(),
        annotations: Default::default(),
        created_at: created,
        quota_applied: false,
    });

    let count = h.scheduler.sweep_once(Utc::now()).await;
    h.dispatcher.wait_idle().await;

    assert_eq!(count, 0);
    assert_eq!(h.cluster.count_mutations("delete_namespace"), 0);
}

#[tokio::test]
async fn stalled_teardown_is_finished_by_the_sweep() {
    let h = Harness::new();
    h.cluster.set_instant_delete(false);
    h.open(7, SHA_A).await;
    h.close(7).await;

    // Termination outlived the teardown timeout.
    let env = h.env(7);
    assert_eq!(env.state, EnvironmentState::Closing);
    assert!(env.last_error.is_some());

    h.cluster.finish_termination("k8s-ee-pr-7");
    h.scheduler.sweep_once(Utc::now() + Duration::hours(1)).await;
    h.dispatcher.wait_idle().await;

    assert_eq!(h.env(7).state, EnvironmentState::Destroyed);
}

#[tokio::test]
async fn restart_rebuilds_records_and_preservations() {
    let before = Harness::new();
    before.open(1, SHA_A).await;
    before.open(2, SHA_A).await;
    before.preserve(2).await;
    before.dispatcher.shutdown();

    let after = Harness::over(
        common::test_config(),
        Duration::hours(48),
        Arc::clone(&before.cluster),
        Arc::clone(&before.releases),
    );
    let restored = rebuild_from_cluster(
        &after.store,
        after.cluster.as_ref(),
        after.releases.as_ref(),
        &after.preservation,
        &after.config,
        Utc::now(),
    )
    .await
    .unwrap();

    assert_eq!(restored, 2);
    assert_eq!(after.env(1).state, EnvironmentState::Active);
    assert_eq!(after.env(1).labels.commit_sha, SHA_A);
    let preserved = after.env(2);
    assert_eq!(preserved.state, EnvironmentState::Preserved);
    assert_eq!(
        preserved.preservation.map(|p| p.expires_at.timestamp()),
        before.env(2).preservation.map(|p| p.expires_at.timestamp())
    );
    assert_eq!(after.preservation.held(), 1);

    // The rebuilt record drives teardown like any other.
    after.close(2).await;
    assert_eq!(after.env(2).state, EnvironmentState::Destroyed);
    assert_eq!(after.preservation.held(), 0);
}

#[tokio::test]
async fn restored_preservation_is_clamped_in_the_record() {
    let preserve_for = Duration::milliseconds(100);
    let before = Harness::with(common::test_config(), preserve_for);
    before.open(3, SHA_A).await;
    before.preserve(3).await;
    before.dispatcher.shutdown();

    // Someone pushed the expiry far out by hand.
    let mut ns = before.cluster.namespace("k8s-ee-pr-3").unwrap();
    ns.annotations.insert(
        PRESERVE_EXPIRES_ANNOTATION.to_string(),
        (Utc::now() + Duration::hours(500)).to_rfc3339(),
    );
    before.cluster.insert_namespace(ns);

    let after = Harness::over(
        common::test_config(),
        preserve_for,
        Arc::clone(&before.cluster),
        Arc::clone(&before.releases),
    );
    rebuild_from_cluster(
        &after.store,
        after.cluster.as_ref(),
        after.releases.as_ref(),
        &after.preservation,
        &after.config,
        Utc::now(),
    )
    .await
    .unwrap();

    let record = after.env(3).preservation.expect("preservation restored");
    let held = after.preservation.snapshot()[0].preservation.clone();
    assert_eq!(record, held);
    assert!(record.expires_at <= record.requested_at + preserve_for);

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    after.scheduler.preservation_tick(Utc::now());
    after.dispatcher.wait_idle().await;

    assert_eq!(after.env(3).state, EnvironmentState::Expiring);
    assert_eq!(after.preservation.held(), 0);
}
