use std::{path::PathBuf, time::Duration};

use reconflow_core::{
    executor::ExecutorSettings,
    graph::HostOwnership,
    queue::{ChainFailurePolicy, RuntimeConfig},
};
use serde::Serialize;

/// Fully resolved runtime configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub catalog: CatalogConfig,
    pub executor: ExecutorConfig,
    pub queue: QueueConfig,
    pub graph: GraphConfig,
    #[serde(skip)]
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Serialize)]
pub struct DatabaseConfig {
    #[serde(skip)]
    pub url: Option<String>,
    pub max_connections: u32,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogConfig {
    pub scanners: PathBuf,
    pub strategies: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutorConfig {
    pub artifact_dir: PathBuf,
    pub command_timeout_secs: u64,
    pub shell: String,
    pub log_limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueConfig {
    pub max_concurrent_chains: usize,
    pub lease_ttl_secs: u64,
    pub poll_interval_ms: u64,
    pub failure_policy: ChainFailurePolicy,
    pub lease_sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphConfig {
    pub host_ownership: HostOwnership,
}

/// Where the configuration came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

impl Config {
    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            artifact_dir: self.executor.artifact_dir.clone(),
            command_timeout: Duration::from_secs(self.executor.command_timeout_secs),
            shell: self.executor.shell.clone(),
            log_limit: self.executor.log_limit,
        }
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            max_concurrent_chains: self.queue.max_concurrent_chains,
            lease_ttl: Duration::from_secs(self.queue.lease_ttl_secs),
            poll_interval: Duration::from_millis(self.queue.poll_interval_ms),
            housekeeper_interval: Duration::from_secs(self.queue.lease_sweep_interval_secs),
            failure_policy: self.queue.failure_policy,
            ..RuntimeConfig::default()
        }
    }
}
