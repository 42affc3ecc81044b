//! Provisioner - durable staged-operation engine for managed clusters.
//!
//! Long-running cluster lifecycle operations are modelled as ordered,
//! idempotent stages. The [`operations::OperationExecutor`] claims due
//! operations, runs one stage at a time and persists the outcome, retrying
//! recoverable failures with backoff until the operation's deadline.

pub mod apperrors;
pub mod config;
pub mod infra;
pub mod interfaces;
pub mod model;
pub mod operations;
pub mod registry;
pub mod stages;
pub mod storage;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
