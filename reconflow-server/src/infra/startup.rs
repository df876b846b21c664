use std::sync::Arc;

use anyhow::{Context, Result};
use reconflow_core::{
    catalog::ScanCatalog,
    infra::{connect, run_migrations},
    queue::ChainRuntime,
};
use tracing::{info, warn};

use crate::infra::{
    app_state::{AppState, Storage},
    config::Config,
};

/// Which backends the process runs against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Postgres,
    /// Process-local store and queue; nothing survives a restart.
    InMemory,
}

/// Load the catalog, open the backends and assemble the application state.
/// The catalog must load; a bad step definition stops startup.
pub async fn build_state(config: Config, backend: Backend) -> Result<AppState> {
    let catalog = ScanCatalog::load(&config.catalog.scanners, &config.catalog.strategies)
        .with_context(|| {
            format!(
                "failed to load scan catalog from {} and {}",
                config.catalog.scanners.display(),
                config.catalog.strategies.display()
            )
        })?;

    let storage = match backend {
        Backend::InMemory => {
            warn!("running with the in-memory backend; state is lost on exit");
            Storage::in_memory().0
        }
        Backend::Postgres => {
            let url = config
                .database
                .url
                .as_deref()
                .context("DATABASE_URL (or [database].url) is required without --in-memory")?;
            let pool = connect(url, config.database.max_connections)
                .await
                .context("failed to connect to PostgreSQL")?;
            run_migrations(&pool)
                .await
                .context("database migration failed")?;
            Storage::postgres(pool).await?
        }
    };

    Ok(AppState::from_parts(config, catalog, storage))
}

/// Worker pool over the state's queue and executor.
pub fn chain_runtime(state: &AppState) -> ChainRuntime {
    let runtime_config = state.config.runtime_config();
    info!(
        max_concurrent_chains = runtime_config.max_concurrent_chains,
        failure_policy = ?runtime_config.failure_policy,
        lease_ttl_secs = runtime_config.lease_ttl.as_secs(),
        artifact_dir = %state.config.executor.artifact_dir.display(),
        "worker settings in effect"
    );
    ChainRuntime::new(
        runtime_config,
        Arc::clone(&state.queue),
        Arc::clone(&state.executor),
    )
}
