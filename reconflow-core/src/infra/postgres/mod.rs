mod assets;
mod graph;
mod tasks;

pub use assets::PostgresAssetRepository;
pub use graph::PostgresGraphStore;
pub use tasks::PostgresTaskRepository;

use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;

use crate::error::Result;

/// Open a connection pool to the scan database.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(database_url)
        .await?;
    info!(max_connections, "connected to Postgres");
    Ok(pool)
}

/// Apply pending schema migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    crate::MIGRATOR.run(pool).await?;
    info!("database migrations applied");
    Ok(())
}
