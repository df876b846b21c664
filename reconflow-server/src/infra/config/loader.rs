use std::{
    fs,
    path::{Path, PathBuf},
};

use thiserror::Error;

use super::{
    models::{
        CatalogConfig, Config, ConfigMetadata, DatabaseConfig, ExecutorConfig,
        GraphConfig, QueueConfig, ServerConfig,
    },
    sources::{EnvConfig, FileConfig},
};

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["reconflow.toml", "config/reconflow.toml"];

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };

        let env = EnvConfig::gather();
        let (file, config_path) = self.load_file_config(&env)?;
        compose_config(
            file,
            env,
            ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        )
    }

    /// Explicit path first, then `RECONFLOW_CONFIG`, then the default
    /// locations. Only a missing explicit or env path is an error.
    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let requested = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());

        let path = match requested {
            Some(path) if !path.exists() => {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            Some(path) => path,
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(path) => path,
                None => return Ok((None, None)),
            },
        };

        let file = read_file_config(&path)?;
        Ok((Some(file), Some(path)))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Merge file values and environment overrides over the defaults, then
/// validate.
pub fn compose_config(
    file: Option<FileConfig>,
    env: EnvConfig,
    metadata: ConfigMetadata,
) -> Result<ConfigLoad, ConfigLoadError> {
    let mut warnings = Vec::new();
    if metadata.config_path.is_none() {
        warnings.push(
            "No reconflow.toml detected; using defaults and environment variables"
                .to_string(),
        );
    }

    let FileConfig {
        server,
        database,
        catalog,
        executor,
        queue,
        graph,
    } = file.unwrap_or_default();

    let config = Config {
        server: ServerConfig {
            host: env
                .server_host
                .or(server.host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env.server_port.or(server.port).unwrap_or(8000),
        },
        database: DatabaseConfig {
            url: env
                .database_url
                .or(database.url)
                .filter(|url| !url.trim().is_empty()),
            max_connections: database.max_connections.unwrap_or(10),
        },
        catalog: CatalogConfig {
            scanners: catalog
                .scanners
                .unwrap_or_else(|| PathBuf::from("configs/scanners.yaml")),
            strategies: catalog
                .strategies
                .unwrap_or_else(|| PathBuf::from("configs/scan_strategies.yaml")),
        },
        executor: ExecutorConfig {
            artifact_dir: env
                .artifact_dir
                .or(executor.artifact_dir)
                .unwrap_or_else(|| PathBuf::from("artifacts")),
            command_timeout_secs: executor.command_timeout_secs.unwrap_or(3600),
            shell: executor.shell.unwrap_or_else(|| "/bin/sh".to_string()),
            log_limit: executor.log_limit.unwrap_or(2000),
        },
        queue: QueueConfig {
            max_concurrent_chains: env
                .max_concurrent_chains
                .or(queue.max_concurrent_chains)
                .unwrap_or(5),
            lease_ttl_secs: queue.lease_ttl_secs.unwrap_or(7200),
            poll_interval_ms: queue.poll_interval_ms.unwrap_or(1000),
            failure_policy: queue.failure_policy.unwrap_or_default(),
            lease_sweep_interval_secs: queue.lease_sweep_interval_secs.unwrap_or(60),
        },
        graph: GraphConfig {
            host_ownership: graph.host_ownership.unwrap_or_default(),
        },
        metadata,
    };

    validate(&config)?;
    if config.database.url.is_none() {
        warnings.push(
            "No database url configured; only --in-memory mode is available".to_string(),
        );
    }
    Ok(ConfigLoad { config, warnings })
}

fn validate(config: &Config) -> Result<(), ConfigLoadError> {
    let checks = [
        (config.queue.max_concurrent_chains == 0, "queue.max_concurrent_chains must be at least 1"),
        (config.queue.lease_ttl_secs == 0, "queue.lease_ttl_secs must be positive"),
        (config.queue.poll_interval_ms == 0, "queue.poll_interval_ms must be positive"),
        (
            config.queue.lease_sweep_interval_secs == 0,
            "queue.lease_sweep_interval_secs must be positive",
        ),
        (
            config.executor.command_timeout_secs == 0,
            "executor.command_timeout_secs must be positive",
        ),
        (config.executor.log_limit == 0, "executor.log_limit must be positive"),
        (config.executor.shell.trim().is_empty(), "executor.shell must not be empty"),
        (config.database.max_connections == 0, "database.max_connections must be at least 1"),
    ];
    match checks.into_iter().find(|(failed, _)| *failed) {
        Some((_, message)) => Err(ConfigLoadError::Invalid(message.to_string())),
        None => Ok(()),
    }
}
