//! Domain records shared by stages, the engine, and storage.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::apperrors::{AppError, ErrComponent, ErrReason, UnknownVariant};

/// Provider-specific infrastructure configuration of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfraConfig {
    /// Name of the resource at the infrastructure provider.
    pub name: String,
    /// Provider identifier (e.g. "gcp", "aws").
    pub provider: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// A provisioned or to-be-provisioned infrastructure unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub id: String,
    pub tenant: String,
    pub infra_config: InfraConfig,
    pub active_operation_id: Option<String>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Provision,
    Upgrade,
    Deprovision,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Provision => "provision",
            OperationKind::Upgrade => "upgrade",
            OperationKind::Deprovision => "deprovision",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provision" => Ok(OperationKind::Provision),
            "upgrade" => Ok(OperationKind::Upgrade),
            "deprovision" => Ok(OperationKind::Deprovision),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::InProgress)
    }
}

impl FromStr for OperationStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(OperationStatus::InProgress),
            "succeeded" => Ok(OperationStatus::Succeeded),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Name of a pipeline stage.
///
/// Stage names are plain strings so that pipelines can be assembled by the
/// embedding application; well-known names are provided as constants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationStage(Cow<'static, str>);

impl OperationStage {
    pub const WAIT_FOR_CLUSTER_DELETION: OperationStage =
        OperationStage(Cow::Borrowed("WaitForClusterDeletion"));
    pub const FINISHED: OperationStage = OperationStage(Cow::Borrowed("Finished"));

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationStage {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Machine-readable record of the last failure of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub message: String,
    pub component: ErrComponent,
    pub reason: ErrReason,
}

impl From<&AppError> for ErrorRecord {
    fn from(err: &AppError) -> Self {
        Self {
            message: err.to_string(),
            component: err.component(),
            reason: err.reason(),
        }
    }
}

/// The unit of durable work.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: String,
    pub cluster_id: String,
    pub kind: OperationKind,
    pub stage: OperationStage,
    pub status: OperationStatus,
    pub last_transition_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    /// Failures over the whole lifetime of the operation.
    pub failure_count: u32,
    /// Consecutive failures of the current stage; drives the retry backoff.
    pub stage_attempts: u32,
    pub last_error: Option<ErrorRecord>,
}

impl Operation {
    pub fn deadline_elapsed(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline_at
    }
}

/// What a stage asks the engine to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    pub stage: OperationStage,
    pub delay: Duration,
}

impl StageResult {
    /// Move to `stage` immediately.
    pub fn advance(stage: OperationStage) -> Self {
        Self {
            stage,
            delay: Duration::ZERO,
        }
    }

    /// Run `stage` again once `delay` has elapsed.
    pub fn requeue(stage: OperationStage, delay: Duration) -> Self {
        Self { stage, delay }
    }
}
