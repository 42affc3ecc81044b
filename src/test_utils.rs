//! Test utilities and fake collaborators.
//!
//! Fixtures and scripted implementations of the capability traits for tests
//! that should not reach a real provider, registry or database.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::apperrors::AppError;
use crate::interfaces::{InfraClient, InfraError, InfraResource, RegistryClient};
use crate::model::{
    Cluster, InfraConfig, Operation, OperationKind, OperationStage, OperationStatus, StageResult,
};
use crate::operations::{Stage, StageError};
use crate::registry::types::{ClusterInput, OneTimeToken, RegisteredCluster, StatusCondition};

pub const TEST_TENANT: &str = "tenant-1";

/// A live cluster owned by [`TEST_TENANT`].
pub fn cluster_fixture(id: &str) -> Cluster {
    Cluster {
        id: id.to_string(),
        tenant: TEST_TENANT.to_string(),
        infra_config: InfraConfig {
            name: format!("shoot-{id}"),
            provider: "gcp".to_string(),
            parameters: serde_json::json!({ "region": "europe-west1" }),
        },
        active_operation_id: None,
        deleted: false,
        created_at: Utc::now(),
    }
}

/// An in-progress deprovisioning waiting for cluster deletion.
pub fn operation_fixture(id: &str, cluster_id: &str, next_attempt_at: DateTime<Utc>) -> Operation {
    Operation {
        id: id.to_string(),
        cluster_id: cluster_id.to_string(),
        kind: OperationKind::Deprovision,
        stage: OperationStage::WAIT_FOR_CLUSTER_DELETION,
        status: OperationStatus::InProgress,
        last_transition_at: next_attempt_at,
        next_attempt_at,
        deadline_at: next_attempt_at + chrono::Duration::days(1),
        failure_count: 0,
        stage_attempts: 0,
        last_error: None,
    }
}

/// Stage that replays queued results.
///
/// With nothing queued it advances to [`OperationStage::FINISHED`].
pub struct ScriptedStage {
    name: OperationStage,
    time_limit: Duration,
    latency: Duration,
    results: RwLock<VecDeque<Result<StageResult, StageError>>>,
    calls: AtomicUsize,
}

impl ScriptedStage {
    pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(10);

    pub fn new(name: OperationStage) -> Self {
        Self {
            name,
            time_limit: Self::DEFAULT_TIME_LIMIT,
            latency: Duration::ZERO,
            results: RwLock::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = time_limit;
        self
    }

    /// Sleep this long inside every `run`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn push(&self, result: Result<StageResult, StageError>) {
        self.results.write().await.push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> OperationStage {
        self.name.clone()
    }

    fn time_limit(&self) -> Duration {
        self.time_limit
    }

    async fn run(
        &self,
        _cluster: &Cluster,
        _operation: &Operation,
    ) -> Result<StageResult, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.results
            .write()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(StageResult::advance(OperationStage::FINISHED)))
    }
}

/// Infrastructure provider fake. Answers `NotFound` once its script runs out.
#[derive(Default)]
pub struct FakeInfraClient {
    results: RwLock<VecDeque<Result<InfraResource, InfraError>>>,
    calls: AtomicUsize,
}

impl FakeInfraClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, result: Result<InfraResource, InfraError>) {
        self.results.write().await.push_back(result);
    }

    /// Report the resource as still present.
    pub async fn push_present(&self, name: &str) {
        self.push(Ok(InfraResource {
            name: name.to_string(),
            deletion_requested: true,
            ..Default::default()
        }))
        .await;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InfraClient for FakeInfraClient {
    async fn get(&self, name: &str) -> Result<InfraResource, InfraError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.results
            .write()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(InfraError::NotFound(name.to_string())))
    }
}

/// Registry fake scripting `cluster_exists` and `delete_cluster`.
///
/// Unscripted existence checks answer `false`; unscripted deletes succeed.
/// The remaining operations are not used by stages and always fail.
#[derive(Default)]
pub struct FakeRegistryClient {
    exists_results: RwLock<VecDeque<Result<bool, AppError>>>,
    delete_results: RwLock<VecDeque<Result<(), AppError>>>,
    exists_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl FakeRegistryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_exists(&self, result: Result<bool, AppError>) {
        self.exists_results.write().await.push_back(result);
    }

    pub async fn push_delete(&self, result: Result<(), AppError>) {
        self.delete_results.write().await.push_back(result);
    }

    pub fn exists_calls(&self) -> usize {
        self.exists_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn unscripted(operation: &str) -> AppError {
        AppError::internal(format!("{operation} is not scripted"))
    }
}

#[async_trait]
impl RegistryClient for FakeRegistryClient {
    async fn create_cluster(
        &self,
        _input: Option<&ClusterInput>,
        _tenant: &str,
    ) -> Result<String, AppError> {
        Err(Self::unscripted("create_cluster"))
    }

    async fn get_cluster(&self, _id: &str, _tenant: &str) -> Result<RegisteredCluster, AppError> {
        Err(Self::unscripted("get_cluster"))
    }

    async fn update_cluster(
        &self,
        _id: &str,
        _input: Option<&ClusterInput>,
        _tenant: &str,
    ) -> Result<(), AppError> {
        Err(Self::unscripted("update_cluster"))
    }

    async fn delete_cluster(&self, _id: &str, _tenant: &str) -> Result<(), AppError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.delete_results
            .write()
            .await
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn set_status_condition(
        &self,
        _id: &str,
        _condition: StatusCondition,
        _tenant: &str,
    ) -> Result<(), AppError> {
        Err(Self::unscripted("set_status_condition"))
    }

    async fn get_connection_token(
        &self,
        _id: &str,
        _tenant: &str,
    ) -> Result<OneTimeToken, AppError> {
        Err(Self::unscripted("get_connection_token"))
    }

    async fn cluster_exists(&self, _id: &str, _tenant: &str) -> Result<bool, AppError> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        self.exists_results
            .write()
            .await
            .pop_front()
            .unwrap_or(Ok(false))
    }
}
