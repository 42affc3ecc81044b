//! Staged operation execution.
//!
//! An operation is an ordered sequence of idempotent [`Stage`]s. The
//! [`OperationExecutor`] claims due operations, runs their current stage
//! and persists the outcome; stages never sleep, they return the stage to
//! run next together with a delay.

mod engine;
mod pipeline;
mod retry;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::apperrors::AppError;
use crate::model::{Cluster, Operation, OperationStage, StageResult};

pub use engine::{EngineConfig, EngineError, OperationExecutor, ProcessOutcome};
pub use pipeline::{PipelineError, Resolved, StagePipeline, StagePipelineBuilder};
pub use retry::{RetryPolicy, MIN_RETRY_DELAY};

/// Marks an [`AppError`] after which the operation must not be retried.
#[derive(Debug, Clone)]
pub struct NonRecoverableError(pub AppError);

impl NonRecoverableError {
    pub fn new(err: AppError) -> Self {
        Self(err)
    }

    pub fn into_inner(self) -> AppError {
        self.0
    }
}

impl fmt::Display for NonRecoverableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "non-recoverable: {}", self.0)
    }
}

impl std::error::Error for NonRecoverableError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// Failure returned by a stage.
#[derive(Debug, Clone)]
pub enum StageError {
    /// Retry the same stage later (unless the error is bad-request or the
    /// operation deadline has passed).
    Recoverable(AppError),
    /// Fail the operation permanently.
    NonRecoverable(NonRecoverableError),
}

impl StageError {
    pub fn app_error(&self) -> &AppError {
        match self {
            StageError::Recoverable(err) => err,
            StageError::NonRecoverable(NonRecoverableError(err)) => err,
        }
    }

    pub fn into_app_error(self) -> AppError {
        match self {
            StageError::Recoverable(err) => err,
            StageError::NonRecoverable(err) => err.into_inner(),
        }
    }

    /// Whether the engine may schedule another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            StageError::Recoverable(err) => err.is_recoverable(),
            StageError::NonRecoverable(_) => false,
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::Recoverable(err) => err.fmt(f),
            StageError::NonRecoverable(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for StageError {}

impl From<AppError> for StageError {
    fn from(err: AppError) -> Self {
        StageError::Recoverable(err)
    }
}

impl From<NonRecoverableError> for StageError {
    fn from(err: NonRecoverableError) -> Self {
        StageError::NonRecoverable(err)
    }
}

/// One retryable, idempotent step of an operation.
///
/// `run` may be invoked again for the same persisted state after a crash,
/// so implementations must check external state before acting on it. Waiting
/// for external convergence is expressed by returning
/// [`StageResult::requeue`] with the stage's own name.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> OperationStage;

    /// Budget for a single invocation of [`Stage::run`].
    fn time_limit(&self) -> Duration;

    async fn run(&self, cluster: &Cluster, operation: &Operation)
        -> Result<StageResult, StageError>;
}
