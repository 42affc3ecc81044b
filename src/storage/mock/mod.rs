//! Mock storage implementations for testing.
//!
//! [`MockStore`] implements both [`SessionFactory`] and [`OperationStore`] in
//! memory. Writes made through a session are staged and only applied on
//! commit, so rollback behaviour can be asserted the same way as on SQLite.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::interfaces::persistence::{
    DbError, OperationStore, OperationUpdate, Result, SessionFactory,
    WriteSessionWithinTransaction,
};
use crate::model::{Cluster, Operation, OperationStatus};

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Counters {
    sessions: AtomicUsize,
    marks: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

#[derive(Default)]
struct State {
    clusters: RwLock<HashMap<String, Cluster>>,
    operations: RwLock<HashMap<String, Operation>>,
    leases: RwLock<HashMap<String, Lease>>,
    fail_on_begin: RwLock<bool>,
    fail_on_mark: RwLock<bool>,
    fail_on_commit: RwLock<bool>,
    counters: Counters,
}

/// In-memory store with fault injection and call counters.
#[derive(Clone, Default)]
pub struct MockStore {
    state: Arc<State>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_begin(&self, fail: bool) {
        *self.state.fail_on_begin.write().await = fail;
    }

    pub async fn set_fail_on_mark(&self, fail: bool) {
        *self.state.fail_on_mark.write().await = fail;
    }

    pub async fn set_fail_on_commit(&self, fail: bool) {
        *self.state.fail_on_commit.write().await = fail;
    }

    pub fn session_count(&self) -> usize {
        self.state.counters.sessions.load(Ordering::SeqCst)
    }

    pub fn mark_count(&self) -> usize {
        self.state.counters.marks.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.state.counters.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.state.counters.rollbacks.load(Ordering::SeqCst)
    }

    pub async fn cluster(&self, cluster_id: &str) -> Option<Cluster> {
        self.state.clusters.read().await.get(cluster_id).cloned()
    }

    pub async fn operation(&self, operation_id: &str) -> Option<Operation> {
        self.state.operations.read().await.get(operation_id).cloned()
    }

    /// Simulate external cancellation.
    pub async fn remove_operation(&self, operation_id: &str) {
        self.state.operations.write().await.remove(operation_id);
        self.state.leases.write().await.remove(operation_id);
    }

    pub async fn lease_owner(&self, operation_id: &str) -> Option<String> {
        self.state
            .leases
            .read()
            .await
            .get(operation_id)
            .map(|l| l.owner.clone())
    }
}

#[async_trait]
impl SessionFactory for MockStore {
    async fn new_session_within_transaction(
        &self,
    ) -> Result<Box<dyn WriteSessionWithinTransaction>> {
        self.state.counters.sessions.fetch_add(1, Ordering::SeqCst);
        if *self.state.fail_on_begin.read().await {
            return Err(DbError::Internal("some error".to_string()));
        }
        Ok(Box::new(MockSession {
            state: self.state.clone(),
            staged_deletions: Vec::new(),
            open: true,
        }))
    }
}

/// Session over [`MockStore`]; staged writes land on commit.
pub struct MockSession {
    state: Arc<State>,
    staged_deletions: Vec<String>,
    open: bool,
}

#[async_trait]
impl WriteSessionWithinTransaction for MockSession {
    async fn mark_cluster_as_deleted(&mut self, cluster_id: &str) -> Result<()> {
        self.state.counters.marks.fetch_add(1, Ordering::SeqCst);
        if *self.state.fail_on_mark.read().await {
            return Err(DbError::Internal("some error".to_string()));
        }
        if !self.state.clusters.read().await.contains_key(cluster_id) {
            return Err(DbError::NotFound(format!("cluster {cluster_id} not found")));
        }
        self.staged_deletions.push(cluster_id.to_string());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.state.counters.commits.fetch_add(1, Ordering::SeqCst);
        if !self.open {
            return Err(DbError::Internal("transaction already finished".to_string()));
        }
        if *self.state.fail_on_commit.read().await {
            return Err(DbError::Internal("some error".to_string()));
        }

        let mut clusters = self.state.clusters.write().await;
        for id in self.staged_deletions.drain(..) {
            if let Some(cluster) = clusters.get_mut(&id) {
                cluster.deleted = true;
            }
        }
        self.open = false;
        Ok(())
    }

    async fn rollback_unless_committed(&mut self) {
        if self.open {
            self.state.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
            self.staged_deletions.clear();
            self.open = false;
        }
    }
}

#[async_trait]
impl OperationStore for MockStore {
    async fn create_cluster(&self, cluster: &Cluster) -> Result<()> {
        self.state
            .clusters
            .write()
            .await
            .insert(cluster.id.clone(), cluster.clone());
        Ok(())
    }

    async fn create_operation(&self, operation: &Operation) -> Result<()> {
        let mut clusters = self.state.clusters.write().await;
        let cluster = clusters
            .get_mut(&operation.cluster_id)
            .ok_or_else(|| DbError::NotFound(format!("cluster {} not found", operation.cluster_id)))?;
        cluster.active_operation_id = Some(operation.id.clone());
        self.state
            .operations
            .write()
            .await
            .insert(operation.id.clone(), operation.clone());
        Ok(())
    }

    async fn list_due_operations(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        let operations = self.state.operations.read().await;
        let leases = self.state.leases.read().await;

        let mut due: Vec<&Operation> = operations
            .values()
            .filter(|op| op.status == OperationStatus::InProgress && op.next_attempt_at <= now)
            .filter(|op| leases.get(&op.id).map_or(true, |l| l.expires_at < now))
            .collect();
        due.sort_by_key(|op| op.next_attempt_at);

        Ok(due.into_iter().take(limit).map(|op| op.id.clone()).collect())
    }

    async fn claim_operation(
        &self,
        operation_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let operations = self.state.operations.read().await;
        let mut leases = self.state.leases.write().await;

        let dispatchable = operations.get(operation_id).is_some_and(|op| {
            op.status == OperationStatus::InProgress && op.next_attempt_at <= now
        });
        let free = leases
            .get(operation_id)
            .map_or(true, |l| l.expires_at < now);
        if !dispatchable || !free {
            return Ok(false);
        }

        leases.insert(
            operation_id.to_string(),
            Lease {
                owner: worker_id.to_string(),
                expires_at: lease_until,
            },
        );
        Ok(true)
    }

    async fn get_operation(&self, operation_id: &str) -> Result<Option<Operation>> {
        Ok(self.operation(operation_id).await)
    }

    async fn get_cluster(&self, cluster_id: &str) -> Result<Cluster> {
        self.cluster(cluster_id)
            .await
            .ok_or_else(|| DbError::NotFound(format!("cluster {cluster_id} not found")))
    }

    async fn persist_outcome(
        &self,
        operation_id: &str,
        worker_id: &str,
        update: OperationUpdate,
    ) -> Result<bool> {
        let mut clusters = self.state.clusters.write().await;
        let mut operations = self.state.operations.write().await;
        let mut leases = self.state.leases.write().await;

        if leases.get(operation_id).map(|l| l.owner.as_str()) != Some(worker_id) {
            return Ok(false);
        }
        let Some(operation) = operations
            .get_mut(operation_id)
            .filter(|op| op.status == OperationStatus::InProgress)
        else {
            return Ok(false);
        };
        leases.remove(operation_id);

        match update {
            OperationUpdate::Advanced {
                stage,
                last_transition_at,
                next_attempt_at,
                terminal,
            } => {
                operation.stage = stage;
                operation.last_transition_at = last_transition_at;
                operation.next_attempt_at = next_attempt_at;
                operation.stage_attempts = 0;
                if terminal {
                    operation.status = OperationStatus::Succeeded;
                    if let Some(cluster) = clusters.get_mut(&operation.cluster_id) {
                        if cluster.active_operation_id.as_deref() == Some(operation_id) {
                            cluster.active_operation_id = None;
                        }
                    }
                }
            }
            OperationUpdate::Retrying {
                next_attempt_at,
                failure_count,
                stage_attempts,
                error,
            } => {
                operation.next_attempt_at = next_attempt_at;
                operation.failure_count = failure_count;
                operation.stage_attempts = stage_attempts;
                operation.last_error = Some(error);
            }
            OperationUpdate::Failed {
                failure_count,
                error,
            } => {
                operation.status = OperationStatus::Failed;
                operation.failure_count = failure_count;
                operation.last_error = Some(error);
            }
        }
        Ok(true)
    }

    async fn release_claim(&self, operation_id: &str, worker_id: &str) -> Result<()> {
        let mut leases = self.state.leases.write().await;
        if leases.get(operation_id).map(|l| l.owner.as_str()) == Some(worker_id) {
            leases.remove(operation_id);
        }
        Ok(())
    }
}
