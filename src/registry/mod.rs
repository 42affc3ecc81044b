//! Registry adapter.
//!
//! [`GraphQlRegistryClient`] implements [`RegistryClient`] on top of a
//! [`GraphQlClient`] transport and a shared [`TokenCache`].

pub mod error_mapping;
pub mod graphql;
pub mod oauth;
mod queries;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::apperrors::{AppError, ErrComponent, ErrReason};
use crate::interfaces::RegistryClient;

pub use error_mapping::map_registry_error;
pub use graphql::{GraphQlClient, GraphQlError, GraphQlRequest, HttpGraphQlClient};
pub use oauth::{ClientCredentialsOAuthClient, OAuthClient, Token, TokenCache};

use types::{
    ClusterInput, IdResponse, OneTimeToken, RegisteredCluster, ResultEnvelope, StatusCondition,
};

pub const AUTHORIZATION_HEADER: &str = "Authorization";
pub const TENANT_HEADER: &str = "Tenant";

fn nil_response(message: String) -> AppError {
    AppError::internal(message)
        .with_component(ErrComponent::RegistryClient)
        .with_reason(ErrReason::NilResponse)
}

fn id_mismatch(message: String) -> AppError {
    AppError::internal(message)
        .with_component(ErrComponent::RegistryClient)
        .with_reason(ErrReason::IdMismatch)
}

fn encode_input(input: &ClusterInput) -> Result<Value, AppError> {
    serde_json::to_value(input).map_err(|e| {
        AppError::internal(format!("Failed to encode cluster input: {e}"))
            .with_component(ErrComponent::RegistryTransport)
            .with_reason(ErrReason::InvalidData)
            .with_source(e)
    })
}

/// GraphQL-backed registry client.
pub struct GraphQlRegistryClient {
    graphql: Arc<dyn GraphQlClient>,
    tokens: Arc<TokenCache>,
}

impl GraphQlRegistryClient {
    pub fn new(graphql: Arc<dyn GraphQlClient>, tokens: Arc<TokenCache>) -> Self {
        Self { graphql, tokens }
    }

    /// Run one document against the registry and decode its `result` payload.
    async fn execute<T: DeserializeOwned>(
        &self,
        query: String,
        variables: Value,
        tenant: &str,
    ) -> Result<Option<T>, AppError> {
        let token = self.tokens.access_token().await?;

        let request = GraphQlRequest::new(query, variables)
            .with_header(AUTHORIZATION_HEADER, format!("Bearer {token}"))
            .with_header(TENANT_HEADER, tenant);

        let data = self.graphql.execute(request).await.map_err(|e| match e {
            GraphQlError::Extended {
                message,
                extensions,
            } => map_registry_error(&message, &extensions)
                .append("Failed to execute GraphQL request to registry"),
            other => AppError::internal(format!(
                "Failed to execute GraphQL request to registry: {other}"
            ))
            .with_component(ErrComponent::RegistryTransport)
            .with_source(other),
        })?;

        let envelope: ResultEnvelope<T> = serde_json::from_value(data).map_err(|e| {
            AppError::internal(format!("Failed to decode registry response: {e}"))
                .with_component(ErrComponent::RegistryTransport)
                .with_reason(ErrReason::InvalidResponse)
                .with_source(e)
        })?;

        Ok(envelope.result)
    }

    async fn fetch_cluster(
        &self,
        id: &str,
        tenant: &str,
    ) -> Result<Option<RegisteredCluster>, AppError> {
        self.execute(queries::get_cluster(), json!({ "id": id }), tenant)
            .await
    }
}

#[async_trait]
impl RegistryClient for GraphQlRegistryClient {
    async fn create_cluster(
        &self,
        input: Option<&ClusterInput>,
        tenant: &str,
    ) -> Result<String, AppError> {
        info!(tenant, "Registering cluster in registry");

        let Some(input) = input else {
            return Err(AppError::bad_request(
                "Cannot register cluster in registry: missing cluster input",
            ));
        };

        let variables = json!({ "in": encode_input(input)? });
        let response: Option<IdResponse> = self
            .execute(queries::register_cluster(), variables, tenant)
            .await
            .map_err(|e| e.append("Failed to register cluster in registry. Request failed"))?;

        let Some(response) = response else {
            return Err(nil_response(
                "Failed to register cluster in registry: received nil response".to_string(),
            ));
        };

        info!(tenant, name = %input.name, id = %response.id, "Registered cluster in registry");
        Ok(response.id)
    }

    async fn get_cluster(&self, id: &str, tenant: &str) -> Result<RegisteredCluster, AppError> {
        info!(cluster_id = id, tenant, "Getting cluster from registry");

        let cluster = self
            .fetch_cluster(id, tenant)
            .await
            .map_err(|e| e.append(format!("Failed to get cluster {id} from registry")))?
            .ok_or_else(|| {
                nil_response(format!(
                    "Failed to get cluster {id} from registry: received nil response"
                ))
            })?;

        if cluster.id != id {
            return Err(id_mismatch(format!(
                "Failed to get cluster {id} from registry: received unexpected cluster id {}",
                cluster.id
            )));
        }

        Ok(cluster)
    }

    async fn update_cluster(
        &self,
        id: &str,
        input: Option<&ClusterInput>,
        tenant: &str,
    ) -> Result<(), AppError> {
        info!(cluster_id = id, tenant, "Updating cluster in registry");

        let Some(input) = input else {
            return Err(AppError::bad_request(
                "Cannot update cluster in registry: missing cluster input",
            ));
        };

        let variables = json!({ "id": id, "in": encode_input(input)? });
        let response: IdResponse = self
            .execute(queries::update_cluster(), variables, tenant)
            .await
            .map_err(|e| e.append(format!("Failed to update cluster {id} in registry")))?
            .ok_or_else(|| {
                nil_response(format!(
                    "Failed to update cluster {id} in registry: received nil response"
                ))
            })?;

        if response.id != id {
            return Err(id_mismatch(format!(
                "Failed to update cluster {id} in registry: received unexpected cluster id {}",
                response.id
            )));
        }

        Ok(())
    }

    async fn delete_cluster(&self, id: &str, tenant: &str) -> Result<(), AppError> {
        let response: IdResponse = self
            .execute(queries::unregister_cluster(), json!({ "id": id }), tenant)
            .await
            .map_err(|e| e.append(format!("Failed to unregister cluster {id} in registry")))?
            .ok_or_else(|| {
                nil_response(format!(
                    "Failed to unregister cluster {id} in registry: received nil response"
                ))
            })?;

        if response.id != id {
            return Err(id_mismatch(format!(
                "Failed to unregister cluster {id} in registry: received unexpected cluster id {}",
                response.id
            )));
        }

        info!(cluster_id = id, tenant, "Unregistered cluster in registry");
        Ok(())
    }

    async fn set_status_condition(
        &self,
        id: &str,
        condition: StatusCondition,
        tenant: &str,
    ) -> Result<(), AppError> {
        let current = self.get_cluster(id, tenant).await.map_err(|e| {
            error!(cluster_id = id, error = %e, "Failed to get cluster by ID");
            e.append("failed to get cluster by ID")
        })?;

        let input = ClusterInput {
            name: current.name,
            description: current.description,
            labels: current.labels,
            status_condition: Some(condition),
        };

        self.update_cluster(id, Some(&input), tenant)
            .await
            .map_err(|e| {
                error!(cluster_id = id, error = %e, "Failed to update cluster in registry");
                e.append("failed to update cluster in registry")
            })
    }

    async fn get_connection_token(
        &self,
        id: &str,
        tenant: &str,
    ) -> Result<OneTimeToken, AppError> {
        let token: OneTimeToken = self
            .execute(queries::request_one_time_token(), json!({ "id": id }), tenant)
            .await
            .map_err(|e| {
                e.append(format!(
                    "Failed to get one-time token for cluster {id} in registry"
                ))
            })?
            .ok_or_else(|| {
                nil_response(format!(
                    "Failed to get one-time token for cluster {id} in registry: received nil response"
                ))
            })?;

        info!(cluster_id = id, tenant, "Received one-time token from registry");
        Ok(token)
    }

    async fn cluster_exists(&self, id: &str, tenant: &str) -> Result<bool, AppError> {
        match self.fetch_cluster(id, tenant).await {
            Ok(cluster) => Ok(cluster.is_some()),
            Err(e) if e.reason() == ErrReason::TenantNotFound => Ok(false),
            Err(e) => Err(e.append(format!("Failed to get cluster {id} from registry"))),
        }
    }
}
