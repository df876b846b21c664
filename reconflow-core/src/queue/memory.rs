use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    ChainId, ChainLease, ChainMessage, ChainState, DequeueRequest, LeaseId,
    LeaseRenewal, QueueCounts, QueueService,
};
use crate::error::{ReconError, Result};

#[derive(Debug)]
struct Entry {
    chain: ChainMessage,
    state: ChainState,
    attempts: u32,
    lease: Option<ActiveLease>,
    last_error: Option<String>,
}

#[derive(Debug, Clone)]
struct ActiveLease {
    id: LeaseId,
    owner: String,
    expires_at: DateTime<Utc>,
}

impl Entry {
    fn to_lease(&self) -> Option<ChainLease> {
        let lease = self.lease.as_ref()?;
        Some(ChainLease {
            lease_id: lease.id,
            chain: self.chain.clone(),
            lease_owner: lease.owner.clone(),
            expires_at: lease.expires_at,
            attempts: self.attempts,
        })
    }
}

/// Process-local chain queue with the same lease semantics as the Postgres
/// queue. Chains are served in enqueue order.
#[derive(Debug, Default)]
pub struct InMemoryChainQueue {
    entries: Mutex<Vec<Entry>>,
}

impl InMemoryChainQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last recorded failure of a chain, if it failed.
    pub async fn last_error(&self, chain_id: ChainId) -> Option<String> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .find(|e| e.chain.chain_id == chain_id)
            .and_then(|e| e.last_error.clone())
    }

    async fn finish(
        &self,
        lease_id: LeaseId,
        state: ChainState,
        error: Option<String>,
    ) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| {
            e.state == ChainState::Leased
                && e.lease.as_ref().is_some_and(|l| l.id == lease_id)
        }) {
            entry.state = state;
            entry.lease = None;
            entry.last_error = error;
            debug!(
                target: "scan::queue",
                chain_id = %entry.chain.chain_id,
                state = state.as_str(),
                "chain finished"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl QueueService for InMemoryChainQueue {
    async fn enqueue(&self, chain: ChainMessage) -> Result<ChainId> {
        let chain_id = chain.chain_id;
        let mut entries = self.entries.lock().await;
        entries.push(Entry {
            chain,
            state: ChainState::Ready,
            attempts: 0,
            lease: None,
            last_error: None,
        });
        debug!(target: "scan::queue", %chain_id, "chain enqueued");
        Ok(chain_id)
    }

    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<ChainLease>> {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.iter_mut().find(|e| e.state == ChainState::Ready)
        else {
            return Ok(None);
        };
        entry.state = ChainState::Leased;
        entry.attempts += 1;
        entry.lease = Some(ActiveLease {
            id: LeaseId::new(),
            owner: request.worker_id,
            expires_at: Utc::now() + request.lease_ttl,
        });
        Ok(entry.to_lease())
    }

    async fn renew(&self, renewal: LeaseRenewal) -> Result<ChainLease> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| {
                e.state == ChainState::Leased
                    && e.lease
                        .as_ref()
                        .is_some_and(|l| l.id == renewal.lease_id && l.expires_at > now)
            })
            .ok_or_else(|| ReconError::NotFound("lease not found or expired".into()))?;
        if let Some(lease) = entry.lease.as_mut() {
            lease.expires_at = now + renewal.extend_by;
        }
        entry
            .to_lease()
            .ok_or_else(|| ReconError::Internal("renewed chain lost its lease".into()))
    }

    async fn complete(&self, lease_id: LeaseId) -> Result<()> {
        self.finish(lease_id, ChainState::Completed, None).await
    }

    async fn fail(&self, lease_id: LeaseId, error: Option<String>) -> Result<()> {
        self.finish(lease_id, ChainState::Failed, error).await
    }

    async fn scan_expired_leases(&self) -> Result<u64> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        let mut resurrected = 0;
        for entry in entries.iter_mut().filter(|e| {
            e.state == ChainState::Leased
                && e.lease.as_ref().is_some_and(|l| l.expires_at <= now)
        }) {
            entry.state = ChainState::Ready;
            entry.lease = None;
            resurrected += 1;
        }
        if resurrected > 0 {
            info!(target: "scan::queue", resurrected, "expired chain leases returned to ready");
        }
        Ok(resurrected)
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let entries = self.entries.lock().await;
        let mut counts = QueueCounts::default();
        for entry in entries.iter() {
            match entry.state {
                ChainState::Ready => counts.ready += 1,
                ChainState::Leased => counts.leased += 1,
                ChainState::Completed => counts.completed += 1,
                ChainState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}
