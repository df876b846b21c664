pub mod loader;
pub mod models;
pub mod sources;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions, compose_config};
pub use models::{
    CatalogConfig, Config, ConfigMetadata, DatabaseConfig, ExecutorConfig, GraphConfig,
    QueueConfig, ServerConfig,
};
pub use sources::{EnvConfig, FileConfig};
