//! Abstract interfaces for provisioner collaborators.
//!
//! These traits define the contracts for:
//! - Infrastructure provider lookups
//! - Registry (catalog) service calls
//! - Transactional persistence sessions
//! - Operation scheduling state used by the engine

pub mod infra_client;
pub mod persistence;
pub mod registry_client;

pub use infra_client::{InfraClient, InfraError, InfraResource};
pub use persistence::{
    DbError, OperationStore, OperationUpdate, SessionFactory, WriteSessionWithinTransaction,
};
pub use registry_client::RegistryClient;
