//! Kubernetes-backed [`InfraClient`].

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use tracing::debug;

use crate::config::InfraSettings;
use crate::interfaces::infra_client::{InfraClient, InfraError, InfraResource};

/// Reads provider resources of one group/version/kind from one namespace.
pub struct KubeInfraClient {
    api: Api<DynamicObject>,
}

impl KubeInfraClient {
    pub fn new(client: Client, settings: &InfraSettings) -> Self {
        let gvk = GroupVersionKind::gvk(&settings.group, &settings.version, &settings.kind);
        let resource = ApiResource::from_gvk(&gvk);
        Self {
            api: Api::namespaced_with(client, &settings.namespace, &resource),
        }
    }

    /// Connect using the in-cluster config or the local kubeconfig.
    pub async fn try_default(settings: &InfraSettings) -> Result<Self, InfraError> {
        let client = Client::try_default().await.map_err(map_kube_error)?;
        Ok(Self::new(client, settings))
    }
}

#[async_trait]
impl InfraClient for KubeInfraClient {
    async fn get(&self, name: &str) -> Result<InfraResource, InfraError> {
        match self.api.get(name).await {
            Ok(object) => {
                debug!(name, "Provider resource found");
                Ok(InfraResource {
                    name: object.metadata.name.unwrap_or_else(|| name.to_string()),
                    deletion_requested: object.metadata.deletion_timestamp.is_some(),
                })
            }
            Err(kube::Error::Api(response)) if response.code == 404 => {
                Err(InfraError::NotFound(name.to_string()))
            }
            Err(e) => Err(map_kube_error(e)),
        }
    }
}

fn map_kube_error(err: kube::Error) -> InfraError {
    match err {
        kube::Error::Api(response) => InfraError::Api {
            status: Some(response.code),
            message: response.message,
        },
        other => InfraError::Api {
            status: None,
            message: other.to_string(),
        },
    }
}
