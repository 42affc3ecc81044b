//! Registry (catalog) service interface.
//!
//! Every call is scoped to a tenant. Failures are classified [`AppError`]s;
//! see [`crate::registry::map_registry_error`] for how remote error codes map
//! onto the taxonomy.

use async_trait::async_trait;

use crate::apperrors::AppError;
use crate::registry::types::{ClusterInput, OneTimeToken, RegisteredCluster, StatusCondition};

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Register a cluster and return its registry id.
    ///
    /// Fails bad-request when `input` is `None`.
    async fn create_cluster(
        &self,
        input: Option<&ClusterInput>,
        tenant: &str,
    ) -> Result<String, AppError>;

    /// Fails internal (id mismatch) when the registry answers for a different id.
    async fn get_cluster(&self, id: &str, tenant: &str) -> Result<RegisteredCluster, AppError>;

    async fn update_cluster(
        &self,
        id: &str,
        input: Option<&ClusterInput>,
        tenant: &str,
    ) -> Result<(), AppError>;

    async fn delete_cluster(&self, id: &str, tenant: &str) -> Result<(), AppError>;

    /// Overwrite the status condition, preserving name, description and labels.
    ///
    /// Read-modify-write: a concurrent external update between the read and
    /// the write is overwritten.
    async fn set_status_condition(
        &self,
        id: &str,
        condition: StatusCondition,
        tenant: &str,
    ) -> Result<(), AppError>;

    async fn get_connection_token(&self, id: &str, tenant: &str)
        -> Result<OneTimeToken, AppError>;

    /// `Ok(false)` when either the cluster or the tenant is unknown.
    async fn cluster_exists(&self, id: &str, tenant: &str) -> Result<bool, AppError>;
}
