//! Waits for the provider to drop a cluster, then retires its records.
//!
//! The provider reporting the resource as not found is the only signal that
//! deletion finished. Until then the stage requeues itself every
//! [`POLL_DELAY`] without touching the database or the registry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::apperrors::{AppError, ErrReason};
use crate::interfaces::{InfraClient, RegistryClient, SessionFactory, WriteSessionWithinTransaction};
use crate::model::{Cluster, Operation, OperationStage, StageResult};
use crate::operations::{Stage, StageError};

/// Delay between provider polls while the cluster still exists.
pub const POLL_DELAY: Duration = Duration::from_secs(20);

pub struct WaitForClusterDeletionStep {
    infra: Arc<dyn InfraClient>,
    sessions: Arc<dyn SessionFactory>,
    registry: Arc<dyn RegistryClient>,
    next_stage: OperationStage,
    time_limit: Duration,
}

impl WaitForClusterDeletionStep {
    pub fn new(
        infra: Arc<dyn InfraClient>,
        sessions: Arc<dyn SessionFactory>,
        registry: Arc<dyn RegistryClient>,
        next_stage: OperationStage,
        time_limit: Duration,
    ) -> Self {
        Self {
            infra,
            sessions,
            registry,
            next_stage,
            time_limit,
        }
    }

    /// Mark the cluster deleted and unregister it, all within `session`.
    async fn retire_cluster(
        &self,
        session: &mut dyn WriteSessionWithinTransaction,
        cluster: &Cluster,
    ) -> Result<(), AppError> {
        session
            .mark_cluster_as_deleted(&cluster.id)
            .await
            .map_err(|e| AppError::from(e).append("error marking cluster as deleted"))?;

        let exists = self
            .registry
            .cluster_exists(&cluster.id, &cluster.tenant)
            .await
            .map_err(|e| e.append("error checking cluster exists in registry"))?;

        if exists {
            match self.registry.delete_cluster(&cluster.id, &cluster.tenant).await {
                Ok(()) => {}
                // Already gone, e.g. a retry after a failed commit.
                Err(e) if e.reason() == ErrReason::NotFound => {
                    info!(cluster_id = %cluster.id, "Cluster already removed from registry");
                }
                Err(e) => return Err(e.append("error deleting cluster from registry")),
            }
        } else {
            debug!(cluster_id = %cluster.id, "Cluster not registered, skipping unregistration");
        }

        session
            .commit()
            .await
            .map_err(|e| AppError::from(e).append("error committing transaction"))
    }
}

#[async_trait]
impl Stage for WaitForClusterDeletionStep {
    fn name(&self) -> OperationStage {
        OperationStage::WAIT_FOR_CLUSTER_DELETION
    }

    fn time_limit(&self) -> Duration {
        self.time_limit
    }

    async fn run(
        &self,
        cluster: &Cluster,
        _operation: &Operation,
    ) -> Result<StageResult, StageError> {
        match self.infra.get(&cluster.infra_config.name).await {
            Ok(resource) => {
                info!(
                    name = %resource.name,
                    deletion_requested = resource.deletion_requested,
                    "Cluster still exists, waiting"
                );
                return Ok(StageResult::requeue(self.name(), POLL_DELAY));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(AppError::from(e).into()),
        }

        let mut session = self
            .sessions
            .new_session_within_transaction()
            .await
            .map_err(|e| AppError::from(e).append("error starting db session with transaction"))?;

        let result = self.retire_cluster(session.as_mut(), cluster).await;
        session.rollback_unless_committed().await;
        result?;

        info!(cluster_id = %cluster.id, "Cluster deleted");
        Ok(StageResult::advance(self.next_stage.clone()))
    }
}
