//! Operation execution engine.
//!
//! Each call to [`OperationExecutor::process`] claims one operation with a
//! time-bounded lease, runs its current stage under the stage's time limit,
//! and writes the outcome back conditioned on still holding the lease. An
//! operation that disappears, or whose lease is taken over while its stage
//! runs, has the stage result discarded. An operation that is no longer the
//! active operation of its cluster is failed without running its stage.
//!
//! Past the operation deadline, neither a recoverable failure nor a stage
//! polling itself again keeps the operation alive.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::apperrors::{AppError, ErrComponent, ErrReason};
use crate::interfaces::persistence::{DbError, OperationStore, OperationUpdate, Result};
use crate::model::{ErrorRecord, Operation, StageResult};

use super::{Resolved, RetryPolicy, Stage, StageError, StagePipeline, MIN_RETRY_DELAY};

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum operations processed concurrently by one executor.
    pub worker_count: usize,
    /// Maximum operations fetched per poll.
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// Must exceed every stage time limit.
    pub lease_ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            batch_size: 32,
            poll_interval: Duration::from_secs(1),
            lease_ttl: Duration::from_secs(900),
            retry: RetryPolicy::default(),
        }
    }
}

/// Errors building an executor.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("lease ttl {lease_ttl:?} must exceed the longest stage time limit {time_limit:?}")]
    LeaseTooShort {
        lease_ttl: Duration,
        time_limit: Duration,
    },

    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),
}

/// What happened to one operation during [`OperationExecutor::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Not due, already leased, or no longer in progress.
    NotClaimed,
    /// The operation vanished or the lease was lost; nothing was written.
    Discarded,
    /// Moved to a later stage.
    Advanced,
    /// Stays on the same stage after a successful poll.
    Requeued,
    /// Recoverable failure; stays on the same stage with a backoff delay.
    Retrying,
    /// Permanently failed.
    Failed,
    /// Another operation took over the cluster; failed without running.
    Superseded,
    /// Reached the terminal stage.
    Finished,
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Pulls due operations and advances them through their pipelines.
pub struct OperationExecutor {
    store: Arc<dyn OperationStore>,
    pipeline: Arc<StagePipeline>,
    config: EngineConfig,
    lease_ttl: chrono::Duration,
    worker_id: String,
}

impl OperationExecutor {
    pub fn new(
        store: Arc<dyn OperationStore>,
        pipeline: Arc<StagePipeline>,
        config: EngineConfig,
    ) -> std::result::Result<Self, EngineError> {
        if config.worker_count == 0 || config.batch_size == 0 {
            return Err(EngineError::InvalidConfig(
                "worker_count and batch_size must be positive".to_string(),
            ));
        }

        let time_limit = pipeline.max_time_limit();
        if config.lease_ttl <= time_limit {
            return Err(EngineError::LeaseTooShort {
                lease_ttl: config.lease_ttl,
                time_limit,
            });
        }
        let lease_ttl = chrono::Duration::from_std(config.lease_ttl)
            .map_err(|e| EngineError::InvalidConfig(format!("lease ttl out of range: {e}")))?;

        Ok(Self {
            store,
            pipeline,
            config,
            lease_ttl,
            worker_id: Uuid::new_v4().to_string(),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim and run one operation.
    pub async fn process(&self, operation_id: &str) -> Result<ProcessOutcome> {
        let now = Utc::now();
        let lease_until = now
            .checked_add_signed(self.lease_ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        if !self
            .store
            .claim_operation(operation_id, &self.worker_id, now, lease_until)
            .await?
        {
            debug!(operation_id, "Operation not claimed");
            return Ok(ProcessOutcome::NotClaimed);
        }

        let result = self.process_claimed(operation_id).await;
        if result.is_err() {
            if let Err(e) = self.store.release_claim(operation_id, &self.worker_id).await {
                warn!(operation_id, error = %e, "Failed to release claim");
            }
        }
        result
    }

    async fn process_claimed(&self, operation_id: &str) -> Result<ProcessOutcome> {
        let Some(operation) = self.store.get_operation(operation_id).await? else {
            info!(operation_id, "Operation no longer exists, skipping");
            return Ok(ProcessOutcome::Discarded);
        };

        let cluster = match self.store.get_cluster(&operation.cluster_id).await {
            Ok(cluster) => cluster,
            Err(e @ DbError::NotFound(_)) => {
                let err = AppError::from(e).append("cluster of operation is missing");
                return self.fail(&operation, err).await;
            }
            Err(e) => return Err(e),
        };

        if cluster.active_operation_id.as_deref() != Some(operation.id.as_str()) {
            let err = AppError::internal(format!(
                "operation superseded, active operation of cluster {} is {}",
                cluster.id,
                cluster.active_operation_id.as_deref().unwrap_or("none")
            ))
            .with_component(ErrComponent::Internal)
            .with_reason(ErrReason::InvalidOperation);
            return match self.fail(&operation, err).await? {
                ProcessOutcome::Failed => Ok(ProcessOutcome::Superseded),
                other => Ok(other),
            };
        }

        let stage = match self.pipeline.resolve(operation.kind, &operation.stage) {
            Ok(Resolved::Step(stage)) => stage,
            Ok(Resolved::Terminal) => {
                let next = StageResult::advance(operation.stage.clone());
                return self.advance(&operation, next).await;
            }
            Err(e) => return self.fail(&operation, AppError::from(e)).await,
        };

        let span = info_span!(
            "stage",
            operation_id = %operation.id,
            cluster_id = %cluster.id,
            tenant = %cluster.tenant,
            kind = %operation.kind,
            stage = %operation.stage,
        );
        let result = self
            .run_stage(stage.as_ref(), &cluster, &operation)
            .instrument(span)
            .await;

        match result {
            Ok(next) => self.advance(&operation, next).await,
            Err(err) => self.handle_failure(&operation, err).await,
        }
    }

    async fn run_stage(
        &self,
        stage: &dyn Stage,
        cluster: &crate::model::Cluster,
        operation: &Operation,
    ) -> std::result::Result<StageResult, StageError> {
        let limit = stage.time_limit();
        debug!(?limit, "Running stage");
        match tokio::time::timeout(limit, stage.run(cluster, operation)).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Recoverable(
                AppError::internal(format!(
                    "stage {} exceeded its time limit of {:?}",
                    operation.stage, limit
                ))
                .with_component(ErrComponent::Internal)
                .with_reason(ErrReason::StageTimeout),
            )),
        }
    }

    async fn advance(&self, operation: &Operation, next: StageResult) -> Result<ProcessOutcome> {
        if let Err(e) = self
            .pipeline
            .check_transition(operation.kind, &operation.stage, &next.stage)
        {
            return self.fail(operation, AppError::from(e)).await;
        }

        let now = Utc::now();
        let terminal = self.pipeline.is_terminal(operation.kind, &next.stage);
        let changed = next.stage != operation.stage;

        if !changed && !terminal && operation.deadline_elapsed(now) {
            let err = AppError::internal(format!("stage {} did not complete", next.stage))
                .with_component(ErrComponent::Internal)
                .with_reason(ErrReason::Internal)
                .append("operation deadline exceeded");
            return self.fail(operation, err).await;
        }

        let mut delay = next.delay;
        if !changed && !terminal && delay.is_zero() {
            warn!(operation_id = %operation.id, stage = %next.stage, "Stage requeued itself without delay");
            delay = MIN_RETRY_DELAY;
        }

        let update = OperationUpdate::Advanced {
            stage: next.stage.clone(),
            last_transition_at: if changed {
                now
            } else {
                operation.last_transition_at
            },
            next_attempt_at: after(now, delay),
            terminal,
        };

        if !self
            .store
            .persist_outcome(&operation.id, &self.worker_id, update)
            .await?
        {
            warn!(operation_id = %operation.id, "Lease lost, discarding stage result");
            return Ok(ProcessOutcome::Discarded);
        }

        let outcome = if terminal {
            info!(operation_id = %operation.id, stage = %next.stage, "Operation finished");
            ProcessOutcome::Finished
        } else if changed {
            info!(operation_id = %operation.id, from = %operation.stage, to = %next.stage, ?delay, "Operation advanced");
            ProcessOutcome::Advanced
        } else {
            debug!(operation_id = %operation.id, stage = %next.stage, ?delay, "Operation requeued");
            ProcessOutcome::Requeued
        };
        Ok(outcome)
    }

    async fn handle_failure(
        &self,
        operation: &Operation,
        err: StageError,
    ) -> Result<ProcessOutcome> {
        if !err.is_retryable() {
            return self.fail(operation, err.into_app_error()).await;
        }

        let now = Utc::now();
        let app_error = err.into_app_error();
        if operation.deadline_elapsed(now) {
            return self
                .fail(operation, app_error.append("operation deadline exceeded"))
                .await;
        }

        let delay = self.config.retry.delay(operation.stage_attempts);
        let failure_count = operation.failure_count.saturating_add(1);
        let stage_attempts = operation.stage_attempts.saturating_add(1);
        warn!(
            operation_id = %operation.id,
            stage = %operation.stage,
            component = %app_error.component(),
            reason = %app_error.reason(),
            failure_count,
            stage_attempts,
            ?delay,
            error = %app_error,
            "Stage failed, retrying"
        );

        let update = OperationUpdate::Retrying {
            next_attempt_at: after(now, delay),
            failure_count,
            stage_attempts,
            error: ErrorRecord::from(&app_error),
        };
        if !self
            .store
            .persist_outcome(&operation.id, &self.worker_id, update)
            .await?
        {
            return Ok(ProcessOutcome::Discarded);
        }
        Ok(ProcessOutcome::Retrying)
    }

    async fn fail(&self, operation: &Operation, err: AppError) -> Result<ProcessOutcome> {
        let failure_count = operation.failure_count.saturating_add(1);
        error!(
            operation_id = %operation.id,
            stage = %operation.stage,
            code = %err.code(),
            component = %err.component(),
            reason = %err.reason(),
            error = %err,
            "Operation failed permanently"
        );

        let update = OperationUpdate::Failed {
            failure_count,
            error: ErrorRecord::from(&err),
        };
        if !self
            .store
            .persist_outcome(&operation.id, &self.worker_id, update)
            .await?
        {
            return Ok(ProcessOutcome::Discarded);
        }
        Ok(ProcessOutcome::Failed)
    }

    /// Process one batch of due operations. Returns how many were attempted.
    pub async fn run_once(&self) -> Result<usize> {
        let due = self
            .store
            .list_due_operations(Utc::now(), self.config.batch_size)
            .await?;
        let count = due.len();

        stream::iter(due)
            .for_each_concurrent(self.config.worker_count, |operation_id| async move {
                match self.process(&operation_id).await {
                    Ok(outcome) => debug!(%operation_id, ?outcome, "Processed operation"),
                    Err(e) => error!(%operation_id, error = %e, "Failed to process operation"),
                }
            })
            .await;

        Ok(count)
    }

    /// Poll until `shutdown` flips to `true`. In-flight stages finish first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            worker_id = %self.worker_id,
            worker_count = self.config.worker_count,
            "Operation executor started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Polling due operations failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(worker_id = %self.worker_id, "Operation executor stopped");
                        break;
                    }
                }
            }
        }
    }
}
