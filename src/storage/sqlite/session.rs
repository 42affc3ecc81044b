//! Transactional write sessions on SQLite.
//!
//! SQLite has a single writer lock, and a stage keeps its session open while
//! it calls remote systems. Sessions therefore stage their writes and apply
//! them in one short transaction at commit. Nothing reaches the database
//! unless commit succeeds.

use async_trait::async_trait;
use sea_query::{Expr, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::SqlitePool;
use tracing::debug;

use crate::interfaces::persistence::{
    DbError, Result, SessionFactory, WriteSessionWithinTransaction,
};
use crate::storage::schema::Clusters;

/// Opens one unit of work per session.
#[derive(Clone)]
pub struct SqliteSessionFactory {
    pool: SqlitePool,
}

impl SqliteSessionFactory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionFactory for SqliteSessionFactory {
    async fn new_session_within_transaction(
        &self,
    ) -> Result<Box<dyn WriteSessionWithinTransaction>> {
        // Fail here rather than at commit when the database is unreachable.
        self.pool.acquire().await?;
        Ok(Box::new(SqliteWriteSession {
            pool: self.pool.clone(),
            deleted_clusters: Vec::new(),
            open: true,
        }))
    }
}

/// Write session whose staged writes land in one transaction on commit.
///
/// A session dropped or rolled back before commit leaves the database as it
/// was.
pub struct SqliteWriteSession {
    pool: SqlitePool,
    deleted_clusters: Vec<String>,
    open: bool,
}

impl SqliteWriteSession {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(DbError::Internal("transaction already finished".to_string()))
        }
    }

    async fn cluster_exists(&self, cluster_id: &str) -> Result<bool> {
        let (sql, values) = Query::select()
            .column(Clusters::Id)
            .from(Clusters::Table)
            .and_where(Expr::col(Clusters::Id).eq(cluster_id))
            .build_sqlx(SqliteQueryBuilder);

        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl WriteSessionWithinTransaction for SqliteWriteSession {
    async fn mark_cluster_as_deleted(&mut self, cluster_id: &str) -> Result<()> {
        self.ensure_open()?;
        if !self.cluster_exists(cluster_id).await? {
            return Err(DbError::NotFound(format!("cluster {cluster_id} not found")));
        }
        self.deleted_clusters.push(cluster_id.to_string());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.open = false;
        let deleted = std::mem::take(&mut self.deleted_clusters);

        let mut tx = self.pool.begin().await?;
        for cluster_id in &deleted {
            let (sql, values) = Query::update()
                .table(Clusters::Table)
                .value(Clusters::Deleted, true)
                .and_where(Expr::col(Clusters::Id).eq(cluster_id.as_str()))
                .build_sqlx(SqliteQueryBuilder);

            let result = sqlx::query_with(&sql, values).execute(&mut *tx).await?;
            if result.rows_affected() == 0 {
                return Err(DbError::NotFound(format!("cluster {cluster_id} not found")));
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn rollback_unless_committed(&mut self) {
        if self.open {
            debug!(staged = self.deleted_clusters.len(), "Discarding uncommitted session");
            self.deleted_clusters.clear();
            self.open = false;
        }
    }
}
