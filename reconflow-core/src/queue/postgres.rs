use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ChainId, ChainLease, ChainMessage, ChainState, DequeueRequest, LeaseId,
    LeaseRenewal, QueueCounts, QueueService,
};
use crate::{
    error::{ReconError, Result},
    tasks::TaskId,
};

/// Durable chain queue backed by the `scan_chains` table.
#[derive(Clone)]
pub struct PostgresChainQueue {
    pool: PgPool,
}

impl fmt::Debug for PostgresChainQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresChainQueue")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

#[derive(sqlx::FromRow)]
struct LeasedRow {
    id: Uuid,
    task_ids: Vec<i64>,
    attempts: i32,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
}

impl LeasedRow {
    fn into_lease(self, lease_id: LeaseId) -> Result<ChainLease> {
        let expires_at = self.lease_expires_at.ok_or_else(|| {
            ReconError::Internal("leased chain has NULL lease_expires_at".into())
        })?;
        Ok(ChainLease {
            lease_id,
            chain: ChainMessage {
                chain_id: ChainId(self.id),
                task_ids: self.task_ids.into_iter().map(TaskId).collect(),
            },
            lease_owner: self.lease_owner.unwrap_or_default(),
            expires_at,
            attempts: u32::try_from(self.attempts).unwrap_or_default(),
        })
    }
}

impl PostgresChainQueue {
    /// Create the queue and verify the database is reachable.
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                ReconError::Queue(format!(
                    "chain queue failed Postgres health check: {e}"
                ))
            })?;
        info!(target: "scan::queue", "chain queue connected to Postgres");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn finish(
        &self,
        lease_id: LeaseId,
        state: ChainState,
        error: Option<String>,
    ) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE scan_chains
            SET state = $2,
                last_error = $3,
                lease_id = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE lease_id = $1 AND state = 'leased'
            "#,
        )
        .bind(lease_id.0)
        .bind(state.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| ReconError::Queue(format!("chain {} update failed: {e}", state.as_str())))?;

        if res.rows_affected() > 0 {
            debug!(target: "scan::queue", lease = %lease_id.0, state = state.as_str(), "chain finished");
        } else {
            warn!(target: "scan::queue", lease = %lease_id.0, "chain lease no longer held; finish ignored");
        }
        Ok(())
    }
}

#[async_trait]
impl QueueService for PostgresChainQueue {
    async fn enqueue(&self, chain: ChainMessage) -> Result<ChainId> {
        let task_ids: Vec<i64> = chain.task_ids.iter().map(|t| t.0).collect();
        sqlx::query(
            r#"
            INSERT INTO scan_chains (id, task_ids, state)
            VALUES ($1, $2, 'ready')
            "#,
        )
        .bind(chain.chain_id.0)
        .bind(&task_ids)
        .execute(&self.pool)
        .await
        .map_err(|e| ReconError::Queue(format!("chain enqueue failed: {e}")))?;

        debug!(target: "scan::queue", chain_id = %chain.chain_id, tasks = ?task_ids, "chain enqueued");
        Ok(chain.chain_id)
    }

    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<ChainLease>> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            ReconError::Queue(format!("begin dequeue tx failed: {e}"))
        })?;

        let next: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM scan_chains
            WHERE state = 'ready'
            ORDER BY created_at, id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| ReconError::Queue(format!("dequeue select failed: {e}")))?;

        let Some(id) = next else {
            // Nothing ready
            drop(tx);
            return Ok(None);
        };

        let lease_id = LeaseId::new();
        let expires_at = Utc::now() + request.lease_ttl;
        let row: Option<LeasedRow> = sqlx::query_as(
            r#"
            UPDATE scan_chains
            SET state = 'leased',
                lease_id = $1,
                lease_owner = $2,
                lease_expires_at = $3,
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id = $4 AND state = 'ready'
            RETURNING id, task_ids, attempts, lease_owner, lease_expires_at
            "#,
        )
        .bind(lease_id.0)
        .bind(&request.worker_id)
        .bind(expires_at)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| ReconError::Queue(format!("dequeue update->leased failed: {e}")))?;

        let Some(row) = row else {
            // Raced with a state change; treat as empty
            drop(tx);
            return Ok(None);
        };
        let lease = row.into_lease(lease_id)?;

        tx.commit().await.map_err(|e| {
            ReconError::Queue(format!("dequeue tx commit failed: {e}"))
        })?;
        Ok(Some(lease))
    }

    async fn renew(&self, renewal: LeaseRenewal) -> Result<ChainLease> {
        let extend_ms = renewal.extend_by.num_milliseconds();
        let row: Option<LeasedRow> = sqlx::query_as(
            r#"
            UPDATE scan_chains
            SET lease_expires_at = NOW() + ($1::bigint) * INTERVAL '1 millisecond',
                updated_at = NOW()
            WHERE lease_id = $2
              AND state = 'leased'
              AND lease_expires_at > NOW()
            RETURNING id, task_ids, attempts, lease_owner, lease_expires_at
            "#,
        )
        .bind(extend_ms)
        .bind(renewal.lease_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ReconError::Queue(format!("renew update failed: {e}")))?;

        let Some(row) = row else {
            return Err(ReconError::NotFound("lease not found or expired".into()));
        };
        let lease = row.into_lease(renewal.lease_id)?;
        debug!(
            target: "scan::queue",
            lease = %lease.lease_id.0,
            until = %lease.expires_at,
            "renewed chain lease"
        );
        Ok(lease)
    }

    async fn complete(&self, lease_id: LeaseId) -> Result<()> {
        self.finish(lease_id, ChainState::Completed, None).await
    }

    async fn fail(&self, lease_id: LeaseId, error: Option<String>) -> Result<()> {
        self.finish(lease_id, ChainState::Failed, error).await
    }

    async fn scan_expired_leases(&self) -> Result<u64> {
        let res = sqlx::query(
            r#"
            UPDATE scan_chains
            SET state = 'ready',
                lease_id = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE state = 'leased'
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ReconError::Queue(format!("lease expiry scan failed: {e}")))?;

        let resurrected = res.rows_affected();
        if resurrected > 0 {
            info!(target: "scan::queue", resurrected, "expired chain leases returned to ready");
        }
        Ok(resurrected)
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT state, COUNT(*) FROM scan_chains GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ReconError::Queue(format!("queue count failed: {e}")))?;

        let mut counts = QueueCounts::default();
        for (state, count) in rows {
            let count = usize::try_from(count).unwrap_or_default();
            match state.parse()? {
                ChainState::Ready => counts.ready = count,
                ChainState::Leased => counts.leased = count,
                ChainState::Completed => counts.completed = count,
                ChainState::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }
}
