//! Storage adapters for the task, asset and graph ports.

pub mod memory;
pub mod postgres;

pub use memory::{GraphSnapshot, InMemoryStore};
pub use postgres::{
    PostgresAssetRepository, PostgresGraphStore, PostgresTaskRepository,
    connect, run_migrations,
};
