//! provisioner: staged-operation daemon
//!
//! Polls the operation store for due operations and drives them through
//! their stage pipelines until Ctrl+C.
//!
//! ## Architecture
//! ```text
//! [SQLite operations] -> [OperationExecutor] -> [Stage]
//!                               |                  |
//!                               v                  v
//!                        [persist outcome]  [Provider / Registry]
//! ```
//!
//! ## Configuration
//! - PROVISIONER_CONFIG: path to a YAML config file
//! - PROVISIONER__<SECTION>__<KEY>: overrides for individual settings
//! - PROVISIONER_LOG / PROVISIONER_LOG_FORMAT: log filter and format

use std::sync::Arc;

use tracing::{error, info};

use provisioner::config::Config;
use provisioner::infra::KubeInfraClient;
use provisioner::model::{OperationKind, OperationStage};
use provisioner::operations::{EngineConfig, OperationExecutor, StagePipeline};
use provisioner::registry::{
    ClientCredentialsOAuthClient, GraphQlRegistryClient, HttpGraphQlClient, TokenCache,
};
use provisioner::stages::deprovisioning::WaitForClusterDeletionStep;
use provisioner::storage::init_storage;
use provisioner::utils::bootstrap::{init_tracing, shutdown_on_ctrl_c};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting provisioner");

    let (operation_store, sessions) = init_storage(&config.storage).await?;

    let infra = Arc::new(KubeInfraClient::try_default(&config.infra).await?);
    info!(
        namespace = %config.infra.namespace,
        kind = %config.infra.kind,
        "Provider client ready"
    );

    let oauth = ClientCredentialsOAuthClient::new(
        &config.registry.oauth.token_url,
        &config.registry.oauth.client_id,
        &config.registry.oauth.client_secret,
        config.registry.timeout(),
    )?;
    let graphql = HttpGraphQlClient::new(&config.registry.url, config.registry.timeout())?;
    let registry = Arc::new(GraphQlRegistryClient::new(
        Arc::new(graphql),
        Arc::new(TokenCache::new(Arc::new(oauth))),
    ));
    info!(url = %config.registry.url, "Registry client ready");

    let wait_for_deletion = WaitForClusterDeletionStep::new(
        infra,
        sessions,
        registry,
        OperationStage::FINISHED,
        config.stages.wait_for_cluster_deletion.time_limit(),
    );
    let pipeline = StagePipeline::builder()
        .kind(OperationKind::Deprovision)
        .stage(Arc::new(wait_for_deletion))
        .terminal(OperationStage::FINISHED)
        .build()?;

    let executor = OperationExecutor::new(
        operation_store,
        Arc::new(pipeline),
        EngineConfig::from(&config.engine),
    )?;

    info!("Provisioner running, press Ctrl+C to exit");

    executor.run(shutdown_on_ctrl_c()).await;

    Ok(())
}
