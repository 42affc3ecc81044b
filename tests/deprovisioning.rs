//! End-to-end deprovisioning runs against a SQLite store.
//!
//! Run with: cargo test --test deprovisioning --features sqlite
//!
//! The provider and the registry are replaced with in-process fakes; storage,
//! pipeline, engine and the wait-for-deletion stage are the real ones.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::watch;

use provisioner::apperrors::{AppError, ErrCode, ErrComponent, ErrReason};
use provisioner::config::StorageConfig;
use provisioner::infra::{InfraClient, InfraError, InfraResource};
use provisioner::interfaces::{OperationStore, RegistryClient};
use provisioner::model::{
    Cluster, InfraConfig, Operation, OperationKind, OperationStage, OperationStatus,
};
use provisioner::operations::{
    EngineConfig, OperationExecutor, ProcessOutcome, RetryPolicy, StagePipeline,
};
use provisioner::registry::types::{
    ClusterInput, OneTimeToken, RegisteredCluster, StatusCondition,
};
use provisioner::stages::deprovisioning::{WaitForClusterDeletionStep, POLL_DELAY};
use provisioner::storage::init_storage;

/// Provider fake: names in `present` still exist, everything else is gone.
#[derive(Default)]
struct Provider {
    present: Mutex<HashSet<String>>,
}

impl Provider {
    fn keep(&self, name: &str) {
        self.present.lock().unwrap().insert(name.to_string());
    }
}

#[async_trait]
impl InfraClient for Provider {
    async fn get(&self, name: &str) -> Result<InfraResource, InfraError> {
        if self.present.lock().unwrap().contains(name) {
            Ok(InfraResource {
                name: name.to_string(),
                deletion_requested: true,
                ..Default::default()
            })
        } else {
            Err(InfraError::NotFound(name.to_string()))
        }
    }
}

/// Registry fake holding registered cluster ids, with scripted failures.
#[derive(Default)]
struct Registry {
    registered: Mutex<HashSet<String>>,
    exists_failures: Mutex<VecDeque<AppError>>,
    delete_failures: Mutex<VecDeque<AppError>>,
    exists_latency: Mutex<Duration>,
    deletes: AtomicUsize,
}

impl Registry {
    fn register(&self, id: &str) {
        self.registered.lock().unwrap().insert(id.to_string());
    }

    fn is_registered(&self, id: &str) -> bool {
        self.registered.lock().unwrap().contains(id)
    }

    fn fail_exists(&self, err: AppError) {
        self.exists_failures.lock().unwrap().push_back(err);
    }

    fn fail_delete(&self, err: AppError) {
        self.delete_failures.lock().unwrap().push_back(err);
    }

    fn slow_exists(&self, latency: Duration) {
        *self.exists_latency.lock().unwrap() = latency;
    }

    fn unsupported() -> AppError {
        AppError::internal("not supported by the test registry")
    }
}

#[async_trait]
impl RegistryClient for Registry {
    async fn create_cluster(
        &self,
        _input: Option<&ClusterInput>,
        _tenant: &str,
    ) -> Result<String, AppError> {
        Err(Self::unsupported())
    }

    async fn get_cluster(&self, _id: &str, _tenant: &str) -> Result<RegisteredCluster, AppError> {
        Err(Self::unsupported())
    }

    async fn update_cluster(
        &self,
        _id: &str,
        _input: Option<&ClusterInput>,
        _tenant: &str,
    ) -> Result<(), AppError> {
        Err(Self::unsupported())
    }

    async fn delete_cluster(&self, id: &str, _tenant: &str) -> Result<(), AppError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.delete_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.registered.lock().unwrap().remove(id);
        Ok(())
    }

    async fn set_status_condition(
        &self,
        _id: &str,
        _condition: StatusCondition,
        _tenant: &str,
    ) -> Result<(), AppError> {
        Err(Self::unsupported())
    }

    async fn get_connection_token(
        &self,
        _id: &str,
        _tenant: &str,
    ) -> Result<OneTimeToken, AppError> {
        Err(Self::unsupported())
    }

    async fn cluster_exists(&self, id: &str, _tenant: &str) -> Result<bool, AppError> {
        let latency = *self.exists_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = self.exists_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.is_registered(id))
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<dyn OperationStore>,
    provider: Arc<Provider>,
    registry: Arc<Registry>,
    executor: Arc<OperationExecutor>,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let (store, sessions) = init_storage(&StorageConfig {
        path: dir.path().join("provisioner.db").display().to_string(),
        max_connections: 4,
        busy_timeout_ms: 250,
    })
    .await
    .unwrap();

    let provider = Arc::new(Provider::default());
    let registry = Arc::new(Registry::default());
    let step = WaitForClusterDeletionStep::new(
        provider.clone(),
        sessions,
        registry.clone(),
        OperationStage::FINISHED,
        Duration::from_secs(5),
    );
    let pipeline = StagePipeline::builder()
        .kind(OperationKind::Deprovision)
        .stage(Arc::new(step))
        .terminal(OperationStage::FINISHED)
        .build()
        .unwrap();

    let executor = OperationExecutor::new(
        store.clone(),
        Arc::new(pipeline),
        EngineConfig {
            worker_count: 2,
            batch_size: 10,
            poll_interval: Duration::from_millis(20),
            lease_ttl: Duration::from_secs(30),
            retry: RetryPolicy::Fixed(Duration::from_secs(60)),
        },
    )
    .unwrap();

    Harness {
        _dir: dir,
        store,
        provider,
        registry,
        executor: Arc::new(executor),
    }
}

impl Harness {
    /// Seed a cluster with a due deprovisioning operation `op-<id>`.
    async fn seed(&self, cluster_id: &str, deadline: chrono::Duration) -> String {
        let now = Utc::now();
        let cluster = Cluster {
            id: cluster_id.to_string(),
            tenant: "tenant-1".to_string(),
            infra_config: InfraConfig {
                name: format!("shoot-{cluster_id}"),
                provider: "aws".to_string(),
                parameters: serde_json::json!({ "region": "eu-central-1" }),
            },
            active_operation_id: None,
            deleted: false,
            created_at: now,
        };
        let operation = Operation {
            id: format!("op-{cluster_id}"),
            cluster_id: cluster_id.to_string(),
            kind: OperationKind::Deprovision,
            stage: OperationStage::WAIT_FOR_CLUSTER_DELETION,
            status: OperationStatus::InProgress,
            last_transition_at: now,
            next_attempt_at: now - chrono::Duration::seconds(1),
            deadline_at: now + deadline,
            failure_count: 0,
            stage_attempts: 0,
            last_error: None,
        };
        self.store.create_cluster(&cluster).await.unwrap();
        self.store.create_operation(&operation).await.unwrap();
        operation.id
    }

    async fn operation(&self, id: &str) -> Operation {
        self.store.get_operation(id).await.unwrap().unwrap()
    }

    async fn cluster(&self, id: &str) -> Cluster {
        self.store.get_cluster(id).await.unwrap()
    }
}

#[tokio::test]
async fn test_waits_while_provider_still_has_cluster() {
    let h = harness().await;
    let op_id = h.seed("c1", chrono::Duration::hours(1)).await;
    h.provider.keep("shoot-c1");
    h.registry.register("c1");
    let before = Utc::now();

    let outcome = h.executor.process(&op_id).await.unwrap();

    let op = h.operation(&op_id).await;
    assert_eq!(outcome, ProcessOutcome::Requeued);
    assert_eq!(op.stage, OperationStage::WAIT_FOR_CLUSTER_DELETION);
    assert_eq!(op.status, OperationStatus::InProgress);
    let poll_delay = chrono::Duration::from_std(POLL_DELAY).unwrap();
    assert!(op.next_attempt_at >= before + poll_delay - chrono::Duration::seconds(1));
    assert!(!h.cluster("c1").await.deleted);
    assert!(h.registry.is_registered("c1"));
    assert_eq!(h.executor.process(&op_id).await.unwrap(), ProcessOutcome::NotClaimed);
}

#[tokio::test]
async fn test_finishes_once_provider_drops_cluster() {
    let h = harness().await;
    let op_id = h.seed("c1", chrono::Duration::hours(1)).await;
    h.registry.register("c1");

    let outcome = h.executor.process(&op_id).await.unwrap();

    let op = h.operation(&op_id).await;
    let cluster = h.cluster("c1").await;
    assert_eq!(outcome, ProcessOutcome::Finished);
    assert_eq!(op.stage, OperationStage::FINISHED);
    assert_eq!(op.status, OperationStatus::Succeeded);
    assert!(cluster.deleted);
    assert!(cluster.active_operation_id.is_none());
    assert!(!h.registry.is_registered("c1"));
}

#[tokio::test]
async fn test_registry_failure_rolls_back_and_retries() {
    let h = harness().await;
    let op_id = h.seed("c1", chrono::Duration::hours(1)).await;
    h.registry.register("c1");
    h.registry.fail_exists(
        AppError::internal("connection reset").with_component(ErrComponent::RegistryTransport),
    );

    let outcome = h.executor.process(&op_id).await.unwrap();

    let op = h.operation(&op_id).await;
    let error = op.last_error.clone().unwrap();
    assert_eq!(outcome, ProcessOutcome::Retrying);
    assert_eq!(op.status, OperationStatus::InProgress);
    assert_eq!(op.failure_count, 1);
    assert_eq!(
        error.message,
        "error checking cluster exists in registry, connection reset"
    );
    assert_eq!(error.component, ErrComponent::RegistryTransport);
    assert!(op.next_attempt_at > Utc::now() + chrono::Duration::seconds(30));
    // The deletion mark was rolled back with the failed transaction.
    assert!(!h.cluster("c1").await.deleted);
    assert!(h.registry.is_registered("c1"));
}

#[tokio::test]
async fn test_bad_request_fails_operation() {
    let h = harness().await;
    let op_id = h.seed("c1", chrono::Duration::hours(1)).await;
    h.registry.register("c1");
    h.registry.fail_delete(
        AppError::bad_request("invalid input")
            .with_component(ErrComponent::RegistryClient)
            .with_reason(ErrReason::InvalidData),
    );

    let outcome = h.executor.process(&op_id).await.unwrap();

    let op = h.operation(&op_id).await;
    let error = op.last_error.unwrap();
    assert_eq!(outcome, ProcessOutcome::Failed);
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(error.reason, ErrReason::InvalidData);
    assert_eq!(
        error.message,
        "error deleting cluster from registry, invalid input"
    );
    assert!(!h.cluster("c1").await.deleted);
    assert_eq!(h.registry.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_recoverable_failure_after_deadline_fails_operation() {
    let h = harness().await;
    let op_id = h.seed("c1", chrono::Duration::seconds(-1)).await;
    h.registry.fail_exists(
        AppError::bad_gateway("insufficient scopes")
            .with_component(ErrComponent::RegistryClient)
            .with_reason(ErrReason::InsufficientScopes),
    );
    assert!(ErrCode::BadGateway.is_recoverable());

    let outcome = h.executor.process(&op_id).await.unwrap();

    let op = h.operation(&op_id).await;
    let error = op.last_error.unwrap();
    assert_eq!(outcome, ProcessOutcome::Failed);
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(error.reason, ErrReason::InsufficientScopes);
    assert_eq!(
        error.message,
        "operation deadline exceeded, error checking cluster exists in registry, insufficient scopes"
    );
}

#[tokio::test]
async fn test_provider_never_finishing_fails_at_deadline() {
    let h = harness().await;
    let op_id = h.seed("c1", chrono::Duration::seconds(-1)).await;
    h.provider.keep("shoot-c1");

    let outcome = h.executor.process(&op_id).await.unwrap();

    let op = h.operation(&op_id).await;
    let error = op.last_error.unwrap();
    assert_eq!(outcome, ProcessOutcome::Failed);
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(error.component, ErrComponent::Internal);
    assert_eq!(
        error.message,
        "operation deadline exceeded, stage WaitForClusterDeletion did not complete"
    );
    assert!(!h.cluster("c1").await.deleted);
}

#[tokio::test]
async fn test_slow_registry_does_not_block_other_clusters() {
    let h = harness().await;
    let first = h.seed("c1", chrono::Duration::hours(1)).await;
    let second = h.seed("c2", chrono::Duration::hours(1)).await;
    h.registry.register("c1");
    h.registry.register("c2");
    // Several times the busy timeout of the harness database.
    h.registry.slow_exists(Duration::from_secs(1));

    let (a, b) = tokio::join!(h.executor.process(&first), h.executor.process(&second));

    assert_eq!(a.unwrap(), ProcessOutcome::Finished);
    assert_eq!(b.unwrap(), ProcessOutcome::Finished);
    assert!(h.cluster("c1").await.deleted);
    assert!(h.cluster("c2").await.deleted);
    assert!(!h.registry.is_registered("c1"));
    assert!(!h.registry.is_registered("c2"));
}

#[tokio::test]
async fn test_removed_operation_is_not_processed() {
    let h = harness().await;

    assert_eq!(
        h.executor.process("op-unknown").await.unwrap(),
        ProcessOutcome::NotClaimed
    );
}

#[tokio::test]
async fn test_run_drives_operations_until_shutdown() {
    let h = harness().await;
    let first = h.seed("c1", chrono::Duration::hours(1)).await;
    let second = h.seed("c2", chrono::Duration::hours(1)).await;
    h.registry.register("c1");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let executor = h.executor.clone();
    let handle = tokio::spawn(async move { executor.run(shutdown_rx).await });

    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let a = h.operation(&first).await.status;
            let b = h.operation(&second).await.status;
            if a == OperationStatus::Succeeded && b == OperationStatus::Succeeded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    assert!(finished.is_ok(), "operations did not finish");
    assert!(h.cluster("c1").await.deleted);
    assert!(h.cluster("c2").await.deleted);
    assert!(!h.registry.is_registered("c1"));
}
