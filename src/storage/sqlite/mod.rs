//! SQLite implementations of storage interfaces.

mod operation_store;
mod session;

use chrono::{DateTime, SecondsFormat, Utc};

pub use operation_store::SqliteOperationStore;
pub use session::{SqliteSessionFactory, SqliteWriteSession};

use crate::interfaces::DbError;

/// Fixed-width RFC 3339 so that text comparison matches time order.
pub(crate) fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DbError::Internal(format!("invalid timestamp in {column}: {e}")))
}
