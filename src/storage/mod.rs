//! Storage implementations.

#[cfg(feature = "sqlite")]
use std::sync::Arc;

#[cfg(feature = "sqlite")]
use tracing::info;

#[cfg(feature = "sqlite")]
use crate::config::StorageConfig;
#[cfg(feature = "sqlite")]
use crate::interfaces::{OperationStore, SessionFactory};

pub use crate::interfaces::persistence::{DbError, Result};

#[cfg(feature = "sqlite")]
pub mod schema;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteOperationStore, SqliteSessionFactory};

/// Initialize storage based on configuration.
///
/// Returns the operation store used by the engine and the session factory
/// used by stages, both backed by the same connection pool.
#[cfg(feature = "sqlite")]
pub async fn init_storage(
    config: &StorageConfig,
) -> std::result::Result<(Arc<dyn OperationStore>, Arc<dyn SessionFactory>), Box<dyn std::error::Error>>
{
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

    info!(path = %config.path, max_connections = config.max_connections, "Storage: sqlite");

    if let Some(parent) = std::path::Path::new(&config.path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let opts = SqliteConnectOptions::new()
        .filename(&config.path)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(config.busy_timeout())
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(opts)
        .await?;

    let operation_store = Arc::new(SqliteOperationStore::new(pool.clone()));
    operation_store.init().await?;

    let session_factory = Arc::new(SqliteSessionFactory::new(pool));

    Ok((operation_store, session_factory))
}
