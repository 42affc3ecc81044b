//! SQLite storage integration tests.
//!
//! Run with: cargo test --test storage_sqlite --features sqlite
//!
//! Each test uses its own database file in a temporary directory.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use provisioner::apperrors::{ErrComponent, ErrReason};
use provisioner::config::StorageConfig;
use provisioner::interfaces::{OperationStore, OperationUpdate, SessionFactory};
use provisioner::model::{
    Cluster, ErrorRecord, InfraConfig, Operation, OperationKind, OperationStage, OperationStatus,
};
use provisioner::storage::{init_storage, DbError};

struct Harness {
    _dir: TempDir,
    store: Arc<dyn OperationStore>,
    sessions: Arc<dyn SessionFactory>,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        path: dir.path().join("provisioner.db").display().to_string(),
        max_connections: 4,
        busy_timeout_ms: 200,
    };
    let (store, sessions) = init_storage(&config).await.unwrap();
    Harness {
        _dir: dir,
        store,
        sessions,
    }
}

/// Whole seconds, so values survive the stored timestamp precision.
fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn cluster(id: &str) -> Cluster {
    Cluster {
        id: id.to_string(),
        tenant: "tenant-1".to_string(),
        infra_config: InfraConfig {
            name: format!("shoot-{id}"),
            provider: "azure".to_string(),
            parameters: serde_json::json!({ "region": "westeurope", "nodes": 3 }),
        },
        active_operation_id: None,
        deleted: false,
        created_at: at(0),
    }
}

fn operation(id: &str, cluster_id: &str, next_attempt_at: DateTime<Utc>) -> Operation {
    Operation {
        id: id.to_string(),
        cluster_id: cluster_id.to_string(),
        kind: OperationKind::Deprovision,
        stage: OperationStage::WAIT_FOR_CLUSTER_DELETION,
        status: OperationStatus::InProgress,
        last_transition_at: at(0),
        next_attempt_at,
        deadline_at: at(86_400),
        failure_count: 0,
        stage_attempts: 0,
        last_error: None,
    }
}

async fn seed(h: &Harness, cluster_id: &str, operation_id: &str, next_attempt_at: DateTime<Utc>) {
    h.store.create_cluster(&cluster(cluster_id)).await.unwrap();
    h.store
        .create_operation(&operation(operation_id, cluster_id, next_attempt_at))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cluster_and_operation_round_trip() {
    let h = harness().await;
    seed(&h, "c1", "op-1", at(10)).await;

    let stored_cluster = h.store.get_cluster("c1").await.unwrap();
    let stored_operation = h.store.get_operation("op-1").await.unwrap().unwrap();

    assert_eq!(stored_cluster.infra_config, cluster("c1").infra_config);
    assert_eq!(stored_cluster.active_operation_id.as_deref(), Some("op-1"));
    assert!(!stored_cluster.deleted);
    assert_eq!(stored_operation, operation("op-1", "c1", at(10)));
}

#[tokio::test]
async fn test_missing_rows() {
    let h = harness().await;

    assert!(h.store.get_operation("nope").await.unwrap().is_none());
    assert!(matches!(
        h.store.get_cluster("nope").await,
        Err(DbError::NotFound(_))
    ));
    assert!(matches!(
        h.store.create_operation(&operation("op-1", "nope", at(0))).await,
        Err(DbError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_session_commit_marks_cluster_deleted() {
    let h = harness().await;
    h.store.create_cluster(&cluster("c1")).await.unwrap();

    let mut session = h.sessions.new_session_within_transaction().await.unwrap();
    session.mark_cluster_as_deleted("c1").await.unwrap();
    session.commit().await.unwrap();
    session.rollback_unless_committed().await;

    assert!(h.store.get_cluster("c1").await.unwrap().deleted);
}

#[tokio::test]
async fn test_session_rollback_discards_writes() {
    let h = harness().await;
    h.store.create_cluster(&cluster("c1")).await.unwrap();

    let mut session = h.sessions.new_session_within_transaction().await.unwrap();
    session.mark_cluster_as_deleted("c1").await.unwrap();
    session.rollback_unless_committed().await;

    assert!(!h.store.get_cluster("c1").await.unwrap().deleted);
}

#[tokio::test]
async fn test_dropped_session_rolls_back() {
    let h = harness().await;
    h.store.create_cluster(&cluster("c1")).await.unwrap();

    {
        let mut session = h.sessions.new_session_within_transaction().await.unwrap();
        session.mark_cluster_as_deleted("c1").await.unwrap();
    }

    assert!(!h.store.get_cluster("c1").await.unwrap().deleted);
}

#[tokio::test]
async fn test_open_session_does_not_block_other_writers() {
    let h = harness().await;
    seed(&h, "c1", "op-1", at(0)).await;
    h.store.create_cluster(&cluster("c2")).await.unwrap();

    let mut session = h.sessions.new_session_within_transaction().await.unwrap();
    session.mark_cluster_as_deleted("c1").await.unwrap();

    // Longer than the busy timeout, as when a stage waits on the registry.
    tokio::time::sleep(std::time::Duration::from_millis(400)).await;

    let mut other = h.sessions.new_session_within_transaction().await.unwrap();
    other.mark_cluster_as_deleted("c2").await.unwrap();
    other.commit().await.unwrap();
    assert!(h
        .store
        .claim_operation("op-1", "worker-a", at(1), at(61))
        .await
        .unwrap());

    session.commit().await.unwrap();

    assert!(h.store.get_cluster("c1").await.unwrap().deleted);
    assert!(h.store.get_cluster("c2").await.unwrap().deleted);
}

#[tokio::test]
async fn test_committed_session_cannot_commit_again() {
    let h = harness().await;
    h.store.create_cluster(&cluster("c1")).await.unwrap();

    let mut session = h.sessions.new_session_within_transaction().await.unwrap();
    session.mark_cluster_as_deleted("c1").await.unwrap();
    session.commit().await.unwrap();

    assert!(matches!(session.commit().await, Err(DbError::Internal(_))));
    assert!(session.mark_cluster_as_deleted("c1").await.is_err());
}

#[tokio::test]
async fn test_mark_unknown_cluster_is_not_found() {
    let h = harness().await;

    let mut session = h.sessions.new_session_within_transaction().await.unwrap();
    let err = session.mark_cluster_as_deleted("nope").await.unwrap_err();
    session.rollback_unless_committed().await;

    assert!(matches!(err, DbError::NotFound(_)));
    assert_eq!(err.reason(), ErrReason::DbNotFound);
}

#[tokio::test]
async fn test_due_listing_is_ordered_and_limited() {
    let h = harness().await;
    seed(&h, "c1", "op-late", at(30)).await;
    seed(&h, "c2", "op-early", at(10)).await;
    seed(&h, "c3", "op-mid", at(20)).await;
    seed(&h, "c4", "op-future", at(500)).await;

    let due = h.store.list_due_operations(at(100), 10).await.unwrap();
    assert_eq!(due, vec!["op-early", "op-mid", "op-late"]);

    let limited = h.store.list_due_operations(at(100), 2).await.unwrap();
    assert_eq!(limited, vec!["op-early", "op-mid"]);
}

#[tokio::test]
async fn test_claim_is_exclusive_until_lease_expires() {
    let h = harness().await;
    seed(&h, "c1", "op-1", at(0)).await;

    assert!(h
        .store
        .claim_operation("op-1", "worker-a", at(1), at(61))
        .await
        .unwrap());
    assert!(!h
        .store
        .claim_operation("op-1", "worker-b", at(2), at(62))
        .await
        .unwrap());
    assert!(h.store.list_due_operations(at(2), 10).await.unwrap().is_empty());

    // Expired lease is up for grabs again.
    assert!(h
        .store
        .claim_operation("op-1", "worker-b", at(70), at(130))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_concurrent_claims_have_one_winner() {
    let h = harness().await;
    seed(&h, "c1", "op-1", at(0)).await;

    let claims = (0..8).map(|i| {
        let store = h.store.clone();
        tokio::spawn(async move {
            store
                .claim_operation("op-1", &format!("worker-{i}"), at(1), at(61))
                .await
                .unwrap()
        })
    });
    let results = futures::future::join_all(claims).await;

    let winners = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_claim_skips_operations_not_due() {
    let h = harness().await;
    seed(&h, "c1", "op-1", at(100)).await;

    assert!(!h
        .store
        .claim_operation("op-1", "worker-a", at(1), at(61))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_persist_requires_lease() {
    let h = harness().await;
    seed(&h, "c1", "op-1", at(0)).await;
    h.store
        .claim_operation("op-1", "worker-a", at(1), at(61))
        .await
        .unwrap();

    let update = OperationUpdate::Advanced {
        stage: OperationStage::FINISHED,
        last_transition_at: at(2),
        next_attempt_at: at(2),
        terminal: true,
    };
    assert!(!h
        .store
        .persist_outcome("op-1", "worker-b", update.clone())
        .await
        .unwrap());
    assert_eq!(
        h.store.get_operation("op-1").await.unwrap().unwrap().status,
        OperationStatus::InProgress
    );

    assert!(h.store.persist_outcome("op-1", "worker-a", update).await.unwrap());
}

#[tokio::test]
async fn test_terminal_outcome_finishes_operation() {
    let h = harness().await;
    seed(&h, "c1", "op-1", at(0)).await;
    h.store
        .claim_operation("op-1", "worker-a", at(1), at(61))
        .await
        .unwrap();

    let persisted = h
        .store
        .persist_outcome(
            "op-1",
            "worker-a",
            OperationUpdate::Advanced {
                stage: OperationStage::FINISHED,
                last_transition_at: at(2),
                next_attempt_at: at(2),
                terminal: true,
            },
        )
        .await
        .unwrap();

    let op = h.store.get_operation("op-1").await.unwrap().unwrap();
    assert!(persisted);
    assert_eq!(op.stage, OperationStage::FINISHED);
    assert_eq!(op.status, OperationStatus::Succeeded);
    assert_eq!(op.last_transition_at, at(2));
    assert!(h.store.get_cluster("c1").await.unwrap().active_operation_id.is_none());
    assert!(h.store.list_due_operations(at(100), 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_retrying_outcome_records_error_and_releases_lease() {
    let h = harness().await;
    seed(&h, "c1", "op-1", at(0)).await;
    h.store
        .claim_operation("op-1", "worker-a", at(1), at(61))
        .await
        .unwrap();

    let error = ErrorRecord {
        message: "error checking cluster exists in registry, timeout".to_string(),
        component: ErrComponent::RegistryClient,
        reason: ErrReason::Internal,
    };
    h.store
        .persist_outcome(
            "op-1",
            "worker-a",
            OperationUpdate::Retrying {
                next_attempt_at: at(5),
                failure_count: 1,
                stage_attempts: 1,
                error: error.clone(),
            },
        )
        .await
        .unwrap();

    let op = h.store.get_operation("op-1").await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::InProgress);
    assert_eq!(op.failure_count, 1);
    assert_eq!(op.stage_attempts, 1);
    assert_eq!(op.next_attempt_at, at(5));
    assert_eq!(op.last_error, Some(error));

    // Lease released: claimable by anyone once due.
    assert!(h
        .store
        .claim_operation("op-1", "worker-b", at(5), at(65))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_advance_resets_stage_attempts() {
    let h = harness().await;
    seed(&h, "c1", "op-1", at(0)).await;
    h.store
        .claim_operation("op-1", "worker-a", at(1), at(61))
        .await
        .unwrap();
    h.store
        .persist_outcome(
            "op-1",
            "worker-a",
            OperationUpdate::Retrying {
                next_attempt_at: at(5),
                failure_count: 3,
                stage_attempts: 3,
                error: ErrorRecord {
                    message: "timeout".to_string(),
                    component: ErrComponent::RegistryClient,
                    reason: ErrReason::Internal,
                },
            },
        )
        .await
        .unwrap();
    h.store
        .claim_operation("op-1", "worker-a", at(6), at(66))
        .await
        .unwrap();

    h.store
        .persist_outcome(
            "op-1",
            "worker-a",
            OperationUpdate::Advanced {
                stage: OperationStage::new("CleanupRegistry"),
                last_transition_at: at(7),
                next_attempt_at: at(7),
                terminal: false,
            },
        )
        .await
        .unwrap();

    let op = h.store.get_operation("op-1").await.unwrap().unwrap();
    assert_eq!(op.stage_attempts, 0);
    assert_eq!(op.failure_count, 3);
}

#[tokio::test]
async fn test_failed_operation_rejects_further_outcomes() {
    let h = harness().await;
    seed(&h, "c1", "op-1", at(0)).await;
    let failed = OperationUpdate::Failed {
        failure_count: 1,
        error: ErrorRecord {
            message: "invalid input".to_string(),
            component: ErrComponent::RegistryClient,
            reason: ErrReason::InvalidData,
        },
    };
    h.store
        .claim_operation("op-1", "worker-a", at(1), at(61))
        .await
        .unwrap();
    assert!(h
        .store
        .persist_outcome("op-1", "worker-a", failed.clone())
        .await
        .unwrap());

    assert!(!h
        .store
        .persist_outcome("op-1", "worker-a", failed)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_failed_outcome_keeps_cluster_link() {
    let h = harness().await;
    seed(&h, "c1", "op-1", at(0)).await;
    h.store
        .claim_operation("op-1", "worker-a", at(1), at(61))
        .await
        .unwrap();

    h.store
        .persist_outcome(
            "op-1",
            "worker-a",
            OperationUpdate::Failed {
                failure_count: 4,
                error: ErrorRecord {
                    message: "invalid input".to_string(),
                    component: ErrComponent::RegistryClient,
                    reason: ErrReason::InvalidData,
                },
            },
        )
        .await
        .unwrap();

    let op = h.store.get_operation("op-1").await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.failure_count, 4);
    assert_eq!(
        h.store.get_cluster("c1").await.unwrap().active_operation_id.as_deref(),
        Some("op-1")
    );
    assert!(!h
        .store
        .claim_operation("op-1", "worker-b", at(100), at(160))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_release_claim_only_by_owner() {
    let h = harness().await;
    seed(&h, "c1", "op-1", at(0)).await;
    h.store
        .claim_operation("op-1", "worker-a", at(1), at(61))
        .await
        .unwrap();

    h.store.release_claim("op-1", "worker-b").await.unwrap();
    assert!(!h
        .store
        .claim_operation("op-1", "worker-b", at(2), at(62))
        .await
        .unwrap());

    h.store.release_claim("op-1", "worker-a").await.unwrap();
    assert!(h
        .store
        .claim_operation("op-1", "worker-b", at(3), at(63))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_lease_window_uses_wall_clock_order() {
    let h = harness().await;
    seed(&h, "c1", "op-1", at(0)).await;
    let now = at(1);
    h.store
        .claim_operation("op-1", "worker-a", now, now + Duration::seconds(30))
        .await
        .unwrap();

    assert!(h
        .store
        .list_due_operations(now + Duration::seconds(29), 10)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        h.store
            .list_due_operations(now + Duration::seconds(31), 10)
            .await
            .unwrap(),
        vec!["op-1"]
    );
}
