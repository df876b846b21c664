//! Core library for reconflow.
//!
//! A scan strategy is an ordered chain of steps. Submitting one creates a
//! pending [`tasks::TaskRecord`] per step and enqueues the ordered id list as
//! a single chain message. A bounded pool of workers ([`queue::ChainRuntime`])
//! pulls chains and hands each task, strictly in order, to the
//! [`executor::TaskExecutor`], which runs the external tool, parses its output
//! ([`parser`]) and merges the records into the asset graph ([`graph`]).
//!
//! Persistence sits behind async repository ports with a Postgres
//! implementation ([`infra::postgres`]) and an in-memory one
//! ([`infra::memory`]) used by tests and development mode.

pub mod catalog;
pub mod error;
pub mod executor;
pub mod graph;
pub mod infra;
pub mod parser;
pub mod queue;
pub mod submission;
pub mod tasks;

pub use error::{ReconError, Result};

/// Embedded schema migrations for the Postgres backend.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
