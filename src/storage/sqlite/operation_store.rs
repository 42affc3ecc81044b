//! SQLite OperationStore implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Cond, Expr, Order, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{parse_timestamp, timestamp};
use crate::interfaces::persistence::{DbError, OperationStore, OperationUpdate, Result};
use crate::model::{
    Cluster, ErrorRecord, InfraConfig, Operation, OperationKind, OperationStage, OperationStatus,
};
use crate::storage::schema::{
    Clusters, Operations, CREATE_CLUSTERS_TABLE, CREATE_OPERATIONS_DUE_INDEX,
    CREATE_OPERATIONS_TABLE,
};

const OPERATION_COLUMNS: [Operations; 14] = [
    Operations::Id,
    Operations::ClusterId,
    Operations::Kind,
    Operations::CurrentStage,
    Operations::Status,
    Operations::LastTransitionAt,
    Operations::NextAttemptAt,
    Operations::DeadlineAt,
    Operations::FailureCount,
    Operations::StageAttempts,
    Operations::LastErrorMessage,
    Operations::LastErrorComponent,
    Operations::LastErrorReason,
    Operations::CreatedAt,
];

/// SQLite implementation of OperationStore.
pub struct SqliteOperationStore {
    pool: SqlitePool,
}

impl SqliteOperationStore {
    /// Create a new SQLite operation store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_CLUSTERS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(CREATE_OPERATIONS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::query(CREATE_OPERATIONS_DUE_INDEX)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Rows an unexpired lease keeps away from other workers.
    fn unleased(now: &str) -> Cond {
        Cond::any()
            .add(Expr::col(Operations::LeaseOwner).is_null())
            .add(Expr::col(Operations::LeaseExpiresAt).lt(now))
    }
}

fn row_to_operation(row: &SqliteRow) -> Result<Operation> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let failure_count: i64 = row.try_get("failure_count")?;
    let stage_attempts: i64 = row.try_get("stage_attempts")?;

    let last_error = row
        .try_get::<Option<String>, _>("last_error_message")?
        .map(|message| -> Result<ErrorRecord> {
            let component: Option<String> = row.try_get("last_error_component")?;
            let reason: Option<String> = row.try_get("last_error_reason")?;
            Ok(ErrorRecord {
                message,
                component: component
                    .and_then(|c| c.parse().ok())
                    .unwrap_or_default(),
                reason: reason.and_then(|r| r.parse().ok()).unwrap_or_default(),
            })
        })
        .transpose()?;

    Ok(Operation {
        id: row.try_get("id")?,
        cluster_id: row.try_get("cluster_id")?,
        kind: kind
            .parse::<OperationKind>()
            .map_err(|e| DbError::Internal(format!("invalid operation kind: {e}")))?,
        stage: OperationStage::new(row.try_get::<String, _>("current_stage")?),
        status: status
            .parse::<OperationStatus>()
            .map_err(|e| DbError::Internal(format!("invalid operation status: {e}")))?,
        last_transition_at: parse_timestamp(
            "last_transition_at",
            &row.try_get::<String, _>("last_transition_at")?,
        )?,
        next_attempt_at: parse_timestamp(
            "next_attempt_at",
            &row.try_get::<String, _>("next_attempt_at")?,
        )?,
        deadline_at: parse_timestamp("deadline_at", &row.try_get::<String, _>("deadline_at")?)?,
        failure_count: u32::try_from(failure_count)
            .map_err(|_| DbError::Internal(format!("invalid failure count {failure_count}")))?,
        stage_attempts: u32::try_from(stage_attempts)
            .map_err(|_| DbError::Internal(format!("invalid stage attempts {stage_attempts}")))?,
        last_error,
    })
}

fn row_to_cluster(row: &SqliteRow) -> Result<Cluster> {
    let config: String = row.try_get("config")?;
    let parameters = serde_json::from_str(&config)
        .map_err(|e| DbError::Internal(format!("invalid cluster config: {e}")))?;
    let deleted: bool = row.try_get("deleted")?;

    Ok(Cluster {
        id: row.try_get("id")?,
        tenant: row.try_get("tenant")?,
        infra_config: InfraConfig {
            name: row.try_get("name")?,
            provider: row.try_get("provider")?,
            parameters,
        },
        active_operation_id: row.try_get("active_operation_id")?,
        deleted,
        created_at: parse_timestamp("created_at", &row.try_get::<String, _>("created_at")?)?,
    })
}

#[async_trait]
impl OperationStore for SqliteOperationStore {
    async fn create_cluster(&self, cluster: &Cluster) -> Result<()> {
        let config = serde_json::to_string(&cluster.infra_config.parameters)
            .map_err(|e| DbError::Internal(format!("failed to encode cluster config: {e}")))?;

        let (sql, values) = Query::insert()
            .into_table(Clusters::Table)
            .columns([
                Clusters::Id,
                Clusters::Tenant,
                Clusters::Name,
                Clusters::Provider,
                Clusters::Config,
                Clusters::ActiveOperationId,
                Clusters::Deleted,
                Clusters::CreatedAt,
            ])
            .values_panic([
                cluster.id.as_str().into(),
                cluster.tenant.as_str().into(),
                cluster.infra_config.name.as_str().into(),
                cluster.infra_config.provider.as_str().into(),
                config.into(),
                cluster.active_operation_id.clone().into(),
                cluster.deleted.into(),
                timestamp(cluster.created_at).into(),
            ])
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(())
    }

    async fn create_operation(&self, operation: &Operation) -> Result<()> {
        let now = timestamp(Utc::now());
        let error = operation.last_error.as_ref();

        let (insert_sql, insert_values) = Query::insert()
            .into_table(Operations::Table)
            .columns(OPERATION_COLUMNS)
            .values_panic([
                operation.id.as_str().into(),
                operation.cluster_id.as_str().into(),
                operation.kind.as_str().into(),
                operation.stage.as_str().into(),
                operation.status.as_str().into(),
                timestamp(operation.last_transition_at).into(),
                timestamp(operation.next_attempt_at).into(),
                timestamp(operation.deadline_at).into(),
                i64::from(operation.failure_count).into(),
                i64::from(operation.stage_attempts).into(),
                error.map(|e| e.message.clone()).into(),
                error.map(|e| e.component.to_string()).into(),
                error.map(|e| e.reason.to_string()).into(),
                now.into(),
            ])
            .build_sqlx(SqliteQueryBuilder);

        let (link_sql, link_values) = Query::update()
            .table(Clusters::Table)
            .value(Clusters::ActiveOperationId, operation.id.as_str())
            .and_where(Expr::col(Clusters::Id).eq(operation.cluster_id.as_str()))
            .build_sqlx(SqliteQueryBuilder);

        let mut tx = self.pool.begin().await?;
        sqlx::query_with(&insert_sql, insert_values)
            .execute(&mut *tx)
            .await?;
        let linked = sqlx::query_with(&link_sql, link_values)
            .execute(&mut *tx)
            .await?;
        if linked.rows_affected() == 0 {
            return Err(DbError::NotFound(format!(
                "cluster {} not found",
                operation.cluster_id
            )));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_due_operations(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        let now = timestamp(now);

        let (sql, values) = Query::select()
            .column(Operations::Id)
            .from(Operations::Table)
            .and_where(Expr::col(Operations::Status).eq(OperationStatus::InProgress.as_str()))
            .and_where(Expr::col(Operations::NextAttemptAt).lte(now.as_str()))
            .cond_where(Self::unleased(&now))
            .order_by(Operations::NextAttemptAt, Order::Asc)
            .limit(limit as u64)
            .build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&sql, values).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("id").map_err(DbError::from))
            .collect()
    }

    async fn claim_operation(
        &self,
        operation_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<bool> {
        let now = timestamp(now);

        let (sql, values) = Query::update()
            .table(Operations::Table)
            .value(Operations::LeaseOwner, worker_id)
            .value(Operations::LeaseExpiresAt, timestamp(lease_until))
            .and_where(Expr::col(Operations::Id).eq(operation_id))
            .and_where(Expr::col(Operations::Status).eq(OperationStatus::InProgress.as_str()))
            .and_where(Expr::col(Operations::NextAttemptAt).lte(now.as_str()))
            .cond_where(Self::unleased(&now))
            .build_sqlx(SqliteQueryBuilder);

        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_operation(&self, operation_id: &str) -> Result<Option<Operation>> {
        let (sql, values) = Query::select()
            .columns(OPERATION_COLUMNS)
            .from(Operations::Table)
            .and_where(Expr::col(Operations::Id).eq(operation_id))
            .build_sqlx(SqliteQueryBuilder);

        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_operation).transpose()
    }

    async fn get_cluster(&self, cluster_id: &str) -> Result<Cluster> {
        let (sql, values) = Query::select()
            .columns([
                Clusters::Id,
                Clusters::Tenant,
                Clusters::Name,
                Clusters::Provider,
                Clusters::Config,
                Clusters::ActiveOperationId,
                Clusters::Deleted,
                Clusters::CreatedAt,
            ])
            .from(Clusters::Table)
            .and_where(Expr::col(Clusters::Id).eq(cluster_id))
            .build_sqlx(SqliteQueryBuilder);

        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("cluster {cluster_id} not found")))?;

        row_to_cluster(&row)
    }

    async fn persist_outcome(
        &self,
        operation_id: &str,
        worker_id: &str,
        update: OperationUpdate,
    ) -> Result<bool> {
        let mut query = Query::update();
        query
            .table(Operations::Table)
            .value(Operations::LeaseOwner, Option::<String>::None)
            .value(Operations::LeaseExpiresAt, Option::<String>::None)
            .and_where(Expr::col(Operations::Id).eq(operation_id))
            .and_where(Expr::col(Operations::Status).eq(OperationStatus::InProgress.as_str()))
            .and_where(Expr::col(Operations::LeaseOwner).eq(worker_id));

        let mut succeeded = false;
        match &update {
            OperationUpdate::Advanced {
                stage,
                last_transition_at,
                next_attempt_at,
                terminal,
            } => {
                let status = if *terminal {
                    OperationStatus::Succeeded
                } else {
                    OperationStatus::InProgress
                };
                succeeded = *terminal;
                query
                    .value(Operations::CurrentStage, stage.as_str())
                    .value(Operations::Status, status.as_str())
                    .value(Operations::LastTransitionAt, timestamp(*last_transition_at))
                    .value(Operations::NextAttemptAt, timestamp(*next_attempt_at))
                    .value(Operations::StageAttempts, 0i64);
            }
            OperationUpdate::Retrying {
                next_attempt_at,
                failure_count,
                stage_attempts,
                error,
            } => {
                query
                    .value(Operations::NextAttemptAt, timestamp(*next_attempt_at))
                    .value(Operations::FailureCount, i64::from(*failure_count))
                    .value(Operations::StageAttempts, i64::from(*stage_attempts))
                    .value(Operations::LastErrorMessage, error.message.as_str())
                    .value(Operations::LastErrorComponent, error.component.as_str())
                    .value(Operations::LastErrorReason, error.reason.as_str());
            }
            OperationUpdate::Failed {
                failure_count,
                error,
            } => {
                query
                    .value(Operations::Status, OperationStatus::Failed.as_str())
                    .value(Operations::FailureCount, i64::from(*failure_count))
                    .value(Operations::LastErrorMessage, error.message.as_str())
                    .value(Operations::LastErrorComponent, error.component.as_str())
                    .value(Operations::LastErrorReason, error.reason.as_str());
            }
        }
        let (sql, values) = query.build_sqlx(SqliteQueryBuilder);

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query_with(&sql, values).execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        if succeeded {
            let (sql, values) = Query::update()
                .table(Clusters::Table)
                .value(Clusters::ActiveOperationId, Option::<String>::None)
                .and_where(Expr::col(Clusters::ActiveOperationId).eq(operation_id))
                .build_sqlx(SqliteQueryBuilder);
            sqlx::query_with(&sql, values).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn release_claim(&self, operation_id: &str, worker_id: &str) -> Result<()> {
        let (sql, values) = Query::update()
            .table(Operations::Table)
            .value(Operations::LeaseOwner, Option::<String>::None)
            .value(Operations::LeaseExpiresAt, Option::<String>::None)
            .and_where(Expr::col(Operations::Id).eq(operation_id))
            .and_where(Expr::col(Operations::LeaseOwner).eq(worker_id))
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(())
    }
}
