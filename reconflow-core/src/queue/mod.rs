//! Chain queue: durable, at-least-once delivery of ordered task-id lists to a
//! bounded pool of workers.
//!
//! A worker leases one chain at a time and keeps the lease alive while it runs
//! the chain's tasks in order. Leases that are not renewed expire and a
//! housekeeper returns the chain to `ready`, so a chain whose worker died is
//! delivered again. Redelivered tasks that already left `pending` are skipped
//! by the executor.

mod memory;
mod postgres;
mod runtime;

pub use memory::InMemoryChainQueue;
pub use postgres::PostgresChainQueue;
pub use runtime::{
    ChainFailurePolicy, ChainInterruption, ChainReport, ChainRuntime, RuntimeConfig,
    run_chain,
};

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ReconError, Result},
    tasks::TaskId,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ChainId(pub Uuid);

impl ChainId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ChainId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered task ids of one strategy submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainMessage {
    pub chain_id: ChainId,
    pub task_ids: Vec<TaskId>,
}

impl ChainMessage {
    pub fn new(task_ids: Vec<TaskId>) -> Self {
        Self {
            chain_id: ChainId::new(),
            task_ids,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainState {
    Ready,
    Leased,
    Completed,
    Failed,
}

impl ChainState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainState::Ready => "ready",
            ChainState::Leased => "leased",
            ChainState::Completed => "completed",
            ChainState::Failed => "failed",
        }
    }
}

impl FromStr for ChainState {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ready" => Ok(ChainState::Ready),
            "leased" => Ok(ChainState::Leased),
            "completed" => Ok(ChainState::Completed),
            "failed" => Ok(ChainState::Failed),
            other => Err(ReconError::Queue(format!("unknown chain state '{other}'"))),
        }
    }
}

/// Lease metadata returned when a worker dequeues a chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainLease {
    pub lease_id: LeaseId,
    pub chain: ChainMessage,
    pub lease_owner: String,
    pub expires_at: DateTime<Utc>,
    /// Deliveries so far, including this one.
    pub attempts: u32,
}

#[derive(Clone, Debug)]
pub struct DequeueRequest {
    pub worker_id: String,
    pub lease_ttl: chrono::Duration,
}

#[derive(Clone, Debug)]
pub struct LeaseRenewal {
    pub lease_id: LeaseId,
    pub worker_id: String,
    pub extend_by: chrono::Duration,
}

/// Number of chains in each state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub ready: usize,
    pub leased: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }
}

/// Queue backend consumed by the submission service and the chain runtime.
#[async_trait]
pub trait QueueService: Send + Sync + fmt::Debug {
    async fn enqueue(&self, chain: ChainMessage) -> Result<ChainId>;

    /// Lease the oldest ready chain, if any.
    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<ChainLease>>;

    /// Extend a live lease. `NotFound` once the lease is gone or expired.
    async fn renew(&self, renewal: LeaseRenewal) -> Result<ChainLease>;

    async fn complete(&self, lease_id: LeaseId) -> Result<()>;

    async fn fail(&self, lease_id: LeaseId, error: Option<String>) -> Result<()>;

    /// Return chains with expired leases to `ready`. Returns how many moved.
    async fn scan_expired_leases(&self) -> Result<u64>;

    async fn counts(&self) -> Result<QueueCounts>;
}
