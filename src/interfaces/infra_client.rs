//! Cluster-infrastructure provider interface.

use async_trait::async_trait;

use crate::apperrors::{AppError, ErrComponent};

/// Errors from infrastructure lookups.
///
/// [`InfraError::NotFound`] is the only signal that a resource is gone;
/// every other variant means "state unknown".
#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    #[error("infrastructure resource {0} not found")]
    NotFound(String),

    #[error("{message}")]
    Api { status: Option<u16>, message: String },
}

impl InfraError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, InfraError::NotFound(_))
    }
}

impl From<InfraError> for AppError {
    fn from(err: InfraError) -> Self {
        AppError::internal(err.to_string()).with_component(ErrComponent::InfraClient)
    }
}

/// Snapshot of a provider-side resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InfraResource {
    pub name: String,
    /// Set when the provider has accepted a delete request for the resource.
    pub deletion_requested: bool,
}

/// Read access to the infrastructure provider.
#[async_trait]
pub trait InfraClient: Send + Sync {
    /// Fetch a resource by name.
    ///
    /// Returns [`InfraError::NotFound`] when the provider no longer knows the resource.
    async fn get(&self, name: &str) -> Result<InfraResource, InfraError>;
}
