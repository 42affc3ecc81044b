//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Clusters table schema.
#[derive(Iden)]
pub enum Clusters {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "tenant"]
    Tenant,
    #[iden = "name"]
    Name,
    #[iden = "provider"]
    Provider,
    #[iden = "config"]
    Config,
    #[iden = "active_operation_id"]
    ActiveOperationId,
    #[iden = "deleted"]
    Deleted,
    #[iden = "created_at"]
    CreatedAt,
}

/// Operations table schema.
#[derive(Iden)]
pub enum Operations {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "cluster_id"]
    ClusterId,
    #[iden = "kind"]
    Kind,
    #[iden = "current_stage"]
    CurrentStage,
    #[iden = "status"]
    Status,
    #[iden = "last_transition_at"]
    LastTransitionAt,
    #[iden = "next_attempt_at"]
    NextAttemptAt,
    #[iden = "deadline_at"]
    DeadlineAt,
    #[iden = "failure_count"]
    FailureCount,
    #[iden = "stage_attempts"]
    StageAttempts,
    #[iden = "last_error_message"]
    LastErrorMessage,
    #[iden = "last_error_component"]
    LastErrorComponent,
    #[iden = "last_error_reason"]
    LastErrorReason,
    #[iden = "lease_owner"]
    LeaseOwner,
    #[iden = "lease_expires_at"]
    LeaseExpiresAt,
    #[iden = "created_at"]
    CreatedAt,
}

/// SQL for creating the clusters table.
pub const CREATE_CLUSTERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS clusters (
    id TEXT PRIMARY KEY,
    tenant TEXT NOT NULL,
    name TEXT NOT NULL,
    provider TEXT NOT NULL,
    config TEXT NOT NULL,
    active_operation_id TEXT,
    deleted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
)
"#;

/// SQL for creating the operations table.
pub const CREATE_OPERATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS operations (
    id TEXT PRIMARY KEY,
    cluster_id TEXT NOT NULL REFERENCES clusters(id),
    kind TEXT NOT NULL,
    current_stage TEXT NOT NULL,
    status TEXT NOT NULL,
    last_transition_at TEXT NOT NULL,
    next_attempt_at TEXT NOT NULL,
    deadline_at TEXT NOT NULL,
    failure_count INTEGER NOT NULL DEFAULT 0,
    stage_attempts INTEGER NOT NULL DEFAULT 0,
    last_error_message TEXT,
    last_error_component TEXT,
    last_error_reason TEXT,
    lease_owner TEXT,
    lease_expires_at TEXT,
    created_at TEXT NOT NULL
)
"#;

/// Index backing the due-operation scan.
pub const CREATE_OPERATIONS_DUE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_operations_status_next_attempt
    ON operations(status, next_attempt_at)
"#;
