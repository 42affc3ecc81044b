//! Infrastructure provider adapters.
//!
//! The provider is consulted only to learn whether a cluster's resource
//! still exists; [`InfraError::NotFound`] is the deletion signal.

pub use crate::interfaces::infra_client::{InfraClient, InfraError, InfraResource};

#[cfg(feature = "k8s")]
mod kube_client;

#[cfg(feature = "k8s")]
pub use kube_client::KubeInfraClient;
