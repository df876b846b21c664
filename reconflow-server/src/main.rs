//! # reconflow
//!
//! Reconnaissance scan orchestration.
//!
//! - `reconflow` (or `reconflow serve`) runs the HTTP API.
//! - `reconflow worker` runs the chain worker pool against Postgres.
//! - `reconflow db migrate` applies the schema and exits.
//!
//! With `--in-memory` the server keeps everything in process and runs the
//! worker pool itself, which is handy for trying strategies locally.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use reconflow_core::infra::{connect, run_migrations};
use reconflow_server::{
    create_app,
    infra::{
        config::{Config, ConfigLoad, ConfigLoader, ConfigLoaderOptions},
        startup::{Backend, build_state, chain_runtime},
    },
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "reconflow")]
#[command(about = "Chained reconnaissance scans with an idempotent asset graph")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Path to reconflow.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to an env file loaded before reading configuration
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Keep all state in process and run the worker pool alongside the API
    #[arg(long, global = true, env = "RECONFLOW_IN_MEMORY", default_value_t = false)]
    in_memory: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API (default)
    Serve,
    /// Run the chain worker pool
    Worker,
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli.serve)?;

    match cli.command {
        None | Some(Command::Serve) => run_server(config, &cli.serve).await,
        Some(Command::Worker) => run_worker(config).await,
        Some(Command::Db(DbCommand::Migrate)) => run_db_migrate(&config).await,
    }
}

fn load_runtime_config(args: &ServeArgs) -> anyhow::Result<Config> {
    let ConfigLoad {
        mut config,
        warnings,
    } = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: args.config.clone(),
        env_file: args.env_file.clone(),
    })
    .load()
    .context("failed to load configuration")?;

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host.clone() {
        config.server.host = host;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "info,scan::queue=info,tower_http=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }
    for warning in &warnings {
        warn!(message = %warning, "configuration warning");
    }

    info!(
        queue.max_concurrent_chains = config.queue.max_concurrent_chains,
        queue.failure_policy = ?config.queue.failure_policy,
        graph.host_ownership = ?config.graph.host_ownership,
        executor.command_timeout_secs = config.executor.command_timeout_secs,
        "scan configuration in effect"
    );
    Ok(config)
}

async fn run_db_migrate(config: &Config) -> anyhow::Result<()> {
    let url = config
        .database
        .url
        .as_deref()
        .context("DATABASE_URL (or [database].url) is required for migrations")?;
    let pool = connect(url, config.database.max_connections)
        .await
        .context("failed to connect to PostgreSQL for migration")?;
    run_migrations(&pool)
        .await
        .context("database migration failed")?;
    info!("Database migrations applied successfully");
    Ok(())
}

async fn run_server(config: Config, args: &ServeArgs) -> anyhow::Result<()> {
    let backend = if args.in_memory {
        Backend::InMemory
    } else {
        Backend::Postgres
    };
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let state = build_state(config, backend).await?;
    let runtime = (backend == Backend::InMemory).then(|| chain_runtime(&state));
    if let Some(runtime) = &runtime {
        runtime.start().await;
    }

    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, in_memory = args.in_memory, "reconflow API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(runtime) = runtime {
        runtime.shutdown().await?;
    }
    info!("server stopped");
    Ok(())
}

async fn run_worker(config: Config) -> anyhow::Result<()> {
    let state = build_state(config, Backend::Postgres).await?;
    info!(
        configs = state.catalog.configs().len(),
        strategies = state.catalog.strategies().len(),
        "worker catalog loaded"
    );

    let runtime = chain_runtime(&state);
    runtime.start().await;
    shutdown_signal().await;
    runtime.shutdown().await?;
    info!("worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}
