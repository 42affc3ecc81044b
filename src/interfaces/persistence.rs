//! Persistence interfaces: transactional write sessions and operation state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::apperrors::{AppError, ErrComponent, ErrReason};
use crate::model::{Cluster, ErrorRecord, Operation, OperationStage};

/// Result type for persistence operations.
pub type Result<T> = std::result::Result<T, DbError>;

/// Errors that can occur during persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl DbError {
    pub fn reason(&self) -> ErrReason {
        match self {
            DbError::NotFound(_) => ErrReason::DbNotFound,
            #[cfg(feature = "sqlite")]
            DbError::Database(sqlx::Error::RowNotFound) => ErrReason::DbNotFound,
            _ => ErrReason::DbInternal,
        }
    }
}

impl From<DbError> for AppError {
    fn from(err: DbError) -> Self {
        let reason = err.reason();
        AppError::internal(err.to_string())
            .with_component(ErrComponent::Persistence)
            .with_reason(reason)
            .with_source(err)
    }
}

/// A write session committed as one database transaction.
///
/// Writes made through the session become visible together on commit and not
/// at all otherwise. Implementations must not hold database write locks
/// between calls, since stages keep sessions open across remote calls.
/// Callers must invoke [`WriteSessionWithinTransaction::rollback_unless_committed`]
/// on every exit path. Dropping an uncommitted session also rolls it back.
#[async_trait]
pub trait WriteSessionWithinTransaction: Send {
    async fn mark_cluster_as_deleted(&mut self, cluster_id: &str) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    /// Roll back unless [`commit`](Self::commit) already succeeded. Never fails.
    async fn rollback_unless_committed(&mut self);
}

/// Opens transactional sessions.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn new_session_within_transaction(
        &self,
    ) -> Result<Box<dyn WriteSessionWithinTransaction>>;
}

/// Outcome of one stage execution, written by the lease holder.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationUpdate {
    /// Stage succeeded (or asked to be polled again). Resets the stage attempts.
    Advanced {
        stage: OperationStage,
        last_transition_at: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
        /// `stage` is terminal; the operation becomes `succeeded`.
        terminal: bool,
    },
    /// Recoverable failure; stay on the current stage.
    Retrying {
        next_attempt_at: DateTime<Utc>,
        failure_count: u32,
        stage_attempts: u32,
        error: ErrorRecord,
    },
    /// Permanent failure.
    Failed {
        failure_count: u32,
        error: ErrorRecord,
    },
}

/// Operation scheduling state used by the execution engine.
///
/// Implementations must make ownership transitions explicit:
/// - `claim_operation` atomically grants a lease only to an in-progress, due
///   operation that is unleased or whose lease has expired.
/// - `persist_outcome` writes only while `worker_id` still holds the lease on
///   an in-progress operation, and releases the lease in the same write.
#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn create_cluster(&self, cluster: &Cluster) -> Result<()>;

    /// Insert an operation and make it the cluster's active operation.
    async fn create_operation(&self, operation: &Operation) -> Result<()>;

    /// Ids of in-progress operations due at `now`, oldest first.
    async fn list_due_operations(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>>;

    /// Try to take the lease. Returns `false` if another worker holds it or the
    /// operation is not dispatchable.
    async fn claim_operation(
        &self,
        operation_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool>;

    /// `None` when the operation no longer exists.
    async fn get_operation(&self, operation_id: &str) -> Result<Option<Operation>>;

    async fn get_cluster(&self, cluster_id: &str) -> Result<Cluster>;

    /// Returns `false` when the lease was lost or the operation was removed;
    /// nothing is written in that case.
    async fn persist_outcome(
        &self,
        operation_id: &str,
        worker_id: &str,
        update: OperationUpdate,
    ) -> Result<bool>;

    async fn release_claim(&self, operation_id: &str, worker_id: &str) -> Result<()>;
}
