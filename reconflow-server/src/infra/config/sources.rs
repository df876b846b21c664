use std::path::PathBuf;

use reconflow_core::{graph::HostOwnership, queue::ChainFailurePolicy};
use serde::Deserialize;

/// Raw configuration as written in `reconflow.toml`. Every value is optional.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub database: FileDatabaseConfig,
    #[serde(default)]
    pub catalog: FileCatalogConfig,
    #[serde(default)]
    pub executor: FileExecutorConfig,
    #[serde(default)]
    pub queue: FileQueueConfig,
    #[serde(default)]
    pub graph: FileGraphConfig,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileDatabaseConfig {
    pub url: Option<String>,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileCatalogConfig {
    pub scanners: Option<PathBuf>,
    pub strategies: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileExecutorConfig {
    pub artifact_dir: Option<PathBuf>,
    pub command_timeout_secs: Option<u64>,
    pub shell: Option<String>,
    pub log_limit: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileQueueConfig {
    pub max_concurrent_chains: Option<usize>,
    pub lease_ttl_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub failure_policy: Option<ChainFailurePolicy>,
    pub lease_sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileGraphConfig {
    pub host_ownership: Option<HostOwnership>,
}

/// Values taken from the process environment.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub database_url: Option<String>,
    pub max_concurrent_chains: Option<usize>,
    pub artifact_dir: Option<PathBuf>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: non_empty_var("RECONFLOW_CONFIG").map(PathBuf::from),
            server_host: non_empty_var("RECONFLOW_HOST"),
            server_port: non_empty_var("RECONFLOW_PORT").and_then(|s| s.parse().ok()),
            database_url: non_empty_var("DATABASE_URL"),
            max_concurrent_chains: non_empty_var("RECONFLOW_MAX_CHAINS")
                .and_then(|s| s.parse().ok()),
            artifact_dir: non_empty_var("RECONFLOW_ARTIFACT_DIR").map(PathBuf::from),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}
