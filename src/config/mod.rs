//! Application configuration.
//!
//! A single [`Config`] aggregates every section and is loaded from YAML
//! files and environment variables with the `config` crate.

use std::time::Duration;

use serde::Deserialize;

use crate::operations::{EngineConfig, RetryPolicy};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "PROVISIONER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PROVISIONER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "PROVISIONER_LOG";
/// Environment variable selecting the log format (`json` or plain).
pub const LOG_FORMAT_ENV_VAR: &str = "PROVISIONER_LOG_FORMAT";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineSection,
    pub storage: StorageConfig,
    pub registry: RegistryConfig,
    pub infra: InfraSettings,
    pub stages: StagesConfig,
}

/// Engine tuning as written in configuration files.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Operations processed concurrently.
    pub worker_count: usize,
    /// Operations fetched per poll.
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    /// Lease length; must exceed every stage time limit.
    pub lease_ttl_secs: u64,
    pub retry: RetrySection,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            worker_count: 8,
            batch_size: 32,
            poll_interval_ms: 1000,
            lease_ttl_secs: 900,
            retry: RetrySection::default(),
        }
    }
}

/// Backoff strategy discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    Fixed,
    #[default]
    Exponential,
}

/// Backoff applied after recoverable stage failures.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub strategy: RetryStrategy,
    pub base_delay_ms: u64,
    /// Ignored by the fixed strategy.
    pub max_delay_ms: u64,
    /// Relative spread, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            base_delay_ms: 5_000,
            max_delay_ms: 300_000,
            jitter: 0.1,
        }
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        let base = Duration::from_millis(section.base_delay_ms);
        match section.strategy {
            RetryStrategy::Fixed => RetryPolicy::Fixed(base),
            RetryStrategy::Exponential => RetryPolicy::Exponential {
                base,
                max: Duration::from_millis(section.max_delay_ms),
                jitter: section.jitter,
            },
        }
    }
}

impl From<&EngineSection> for EngineConfig {
    fn from(section: &EngineSection) -> Self {
        Self {
            worker_count: section.worker_count,
            batch_size: section.batch_size,
            poll_interval: Duration::from_millis(section.poll_interval_ms),
            lease_ttl: Duration::from_secs(section.lease_ttl_secs),
            retry: RetryPolicy::from(&section.retry),
        }
    }
}

/// SQLite storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to database file.
    pub path: String,
    pub max_connections: u32,
    /// How long a write waits for SQLite's write lock before failing.
    pub busy_timeout_ms: u64,
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "data/provisioner.db".to_string(),
            max_connections: 5,
            busy_timeout_ms: 5000,
        }
    }
}

/// Registry (cluster catalog) endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// GraphQL endpoint URL.
    pub url: String,
    pub timeout_secs: u64,
    pub oauth: OAuthConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3000/graphql".to_string(),
            timeout_secs: 30,
            oauth: OAuthConfig::default(),
        }
    }
}

impl RegistryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// OAuth client-credentials settings for the registry.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Provider resource coordinates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InfraSettings {
    pub namespace: String,
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Default for InfraSettings {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            group: "core.gardener.cloud".to_string(),
            version: "v1beta1".to_string(),
            kind: "Shoot".to_string(),
        }
    }
}

/// Per-stage settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    pub wait_for_cluster_deletion: StageConfig,
}

impl StagesConfig {
    /// Longest configured stage time limit.
    pub fn max_time_limit(&self) -> Duration {
        self.wait_for_cluster_deletion.time_limit()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    pub time_limit_secs: u64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            time_limit_secs: 600,
        }
    }
}

impl StageConfig {
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }
}

impl Config {
    /// Load configuration from file and environment, then validate it.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;
        if engine.worker_count == 0 {
            return Err(ConfigError::Invalid(
                "engine.worker_count must be positive".to_string(),
            ));
        }
        if engine.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "engine.batch_size must be positive".to_string(),
            ));
        }
        if engine.retry.strategy == RetryStrategy::Exponential
            && engine.retry.max_delay_ms < engine.retry.base_delay_ms
        {
            return Err(ConfigError::Invalid(format!(
                "engine.retry.max_delay_ms ({}) is below base_delay_ms ({})",
                engine.retry.max_delay_ms, engine.retry.base_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&engine.retry.jitter) {
            return Err(ConfigError::Invalid(format!(
                "engine.retry.jitter must be within 0.0..=1.0, got {}",
                engine.retry.jitter
            )));
        }

        let time_limit = self.stages.max_time_limit();
        if Duration::from_secs(engine.lease_ttl_secs) <= time_limit {
            return Err(ConfigError::Invalid(format!(
                "engine.lease_ttl_secs ({}) must exceed the longest stage time limit ({}s)",
                engine.lease_ttl_secs,
                time_limit.as_secs()
            )));
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}
