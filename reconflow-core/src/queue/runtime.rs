use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{ChainLease, ChainMessage, DequeueRequest, LeaseRenewal, QueueService};
use crate::{
    error::{ReconError, Result},
    executor::{ExecutionOutcome, TaskExecutor},
    tasks::{TaskId, TaskStatus, head_chars},
};

/// What a chain does after one of its steps fails.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ChainFailurePolicy {
    /// Run the remaining steps anyway.
    #[default]
    Continue,
    /// Stop the chain; remaining steps are marked failed without running.
    Halt,
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Worker slots; each runs one chain at a time.
    pub max_concurrent_chains: usize,
    pub lease_ttl: Duration,
    /// Fraction of the lease ttl after which a renewal is attempted.
    pub renew_at_fraction: f32,
    /// Idle wait between empty dequeues.
    pub poll_interval: Duration,
    pub housekeeper_interval: Duration,
    pub failure_policy: ChainFailurePolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chains: 5,
            lease_ttl: Duration::from_secs(7200),
            renew_at_fraction: 0.5,
            poll_interval: Duration::from_millis(1000),
            housekeeper_interval: Duration::from_secs(60),
            failure_policy: ChainFailurePolicy::Continue,
        }
    }
}

/// Why a chain stopped early while its remaining steps stay pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainInterruption {
    /// The worker no longer holds the lease.
    LeaseLost,
    /// This step is still running under an earlier delivery of the chain.
    StepInFlight(TaskId),
}

/// Per-chain tally.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainReport {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Set when the halt policy stopped the chain after this task failed.
    pub halted_at: Option<TaskId>,
    /// Set when the chain must be left to a later delivery.
    pub interrupted: Option<ChainInterruption>,
}

/// Run a chain's tasks strictly in order, awaiting each one.
///
/// Any `Err` from the executor is mapped to a failed task here, so a chain
/// reaches its end or its halt point unless it is interrupted. `lease_lost`
/// is checked before every step; once it fires no further step starts. A
/// step found still `running` stops the chain as well, so a redelivery
/// never overtakes the worker that is still executing it.
pub async fn run_chain(
    executor: &TaskExecutor,
    chain: &ChainMessage,
    policy: ChainFailurePolicy,
    lease_lost: &CancellationToken,
) -> ChainReport {
    let total = chain.task_ids.len();
    let mut report = ChainReport::default();
    info!(
        target: "scan::chain",
        chain_id = %chain.chain_id,
        steps = total,
        "chain started"
    );

    for (idx, &task_id) in chain.task_ids.iter().enumerate() {
        if lease_lost.is_cancelled() {
            warn!(
                target: "scan::chain",
                chain_id = %chain.chain_id,
                step = idx + 1,
                total,
                "chain lease lost; leaving remaining steps to the next delivery"
            );
            report.interrupted = Some(ChainInterruption::LeaseLost);
            break;
        }
        info!(
            target: "scan::chain",
            chain_id = %chain.chain_id,
            step = idx + 1,
            total,
            %task_id,
            "starting step"
        );
        let outcome = match executor.execute(task_id).await {
            Ok(outcome) => outcome,
            Err(e) => supervise_fault(executor, task_id, &e).await,
        };

        match outcome {
            ExecutionOutcome::Completed { .. } => report.completed += 1,
            ExecutionOutcome::Skipped {
                status: Some(TaskStatus::Running),
            } => {
                warn!(
                    target: "scan::chain",
                    chain_id = %chain.chain_id,
                    %task_id,
                    "step is still running elsewhere; stopping this delivery"
                );
                report.interrupted = Some(ChainInterruption::StepInFlight(task_id));
                break;
            }
            ExecutionOutcome::Skipped { .. } => report.skipped += 1,
            ExecutionOutcome::Failed { .. } => {
                report.failed += 1;
                if policy == ChainFailurePolicy::Halt {
                    let reason = format!(
                        "skipped: chain halted after task {task_id} failed"
                    );
                    for &rest in &chain.task_ids[idx + 1..] {
                        match executor.tasks().mark_failed(rest, &reason, None).await {
                            Ok(true) => report.failed += 1,
                            Ok(false) => {}
                            Err(e) => error!(
                                target: "scan::chain",
                                task_id = %rest,
                                error = %e,
                                "could not mark halted step failed"
                            ),
                        }
                    }
                    report.halted_at = Some(task_id);
                    break;
                }
            }
        }
    }

    info!(
        target: "scan::chain",
        chain_id = %chain.chain_id,
        completed = report.completed,
        failed = report.failed,
        skipped = report.skipped,
        halted = report.halted_at.is_some(),
        interrupted = report.interrupted.is_some(),
        "chain finished"
    );
    report
}

async fn supervise_fault(
    executor: &TaskExecutor,
    task_id: TaskId,
    fault: &ReconError,
) -> ExecutionOutcome {
    error!(target: "scan::chain", %task_id, error = %fault, "task execution fault");
    let message = fault.to_string();
    let reason = head_chars(&message, executor.settings().log_limit).to_owned();
    if let Err(e) = executor.tasks().mark_failed(task_id, &reason, None).await {
        error!(
            target: "scan::chain",
            %task_id,
            error = %e,
            "could not record task failure"
        );
    }
    ExecutionOutcome::Failed { reason }
}

/// Bounded worker pool pulling chains from a [`QueueService`].
pub struct ChainRuntime {
    config: RuntimeConfig,
    queue: Arc<dyn QueueService>,
    executor: Arc<TaskExecutor>,
    shutdown_token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ChainRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handle_count = self
            .handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();
        f.debug_struct("ChainRuntime")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .field("handles", &handle_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl ChainRuntime {
    pub fn new(
        config: RuntimeConfig,
        queue: Arc<dyn QueueService>,
        executor: Arc<TaskExecutor>,
    ) -> Self {
        Self {
            config,
            queue,
            executor,
            shutdown_token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Spawn the worker pool and the lease housekeeper.
    pub async fn start(&self) {
        let parallelism = self.config.max_concurrent_chains.max(1);
        info!(
            target: "scan::queue",
            workers = parallelism,
            failure_policy = ?self.config.failure_policy,
            lease_ttl_secs = self.config.lease_ttl.as_secs(),
            "starting chain runtime"
        );
        self.spawn_worker_pool(parallelism).await;
        self.spawn_housekeeper().await;
    }

    async fn spawn_worker_pool(&self, parallelism: usize) {
        let worker_group = format!("chain-{}", std::process::id());
        let mut handles = self.handles.lock().await;

        for i in 0..parallelism {
            let worker_id = format!("{worker_group}-w{i}");
            let queue = Arc::clone(&self.queue);
            let executor = Arc::clone(&self.executor);
            let shutdown = self.shutdown_token.clone();
            let config = self.config.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    if shutdown.is_cancelled() {
                        info!(target: "scan::queue", worker = %worker_id, "worker shutting down");
                        break;
                    }

                    let request = DequeueRequest {
                        worker_id: worker_id.clone(),
                        lease_ttl: to_chrono(config.lease_ttl),
                    };
                    match queue.dequeue(request).await {
                        Ok(Some(lease)) => {
                            run_leased_chain(&queue, &executor, &config, &worker_id, lease)
                                .await;
                        }
                        Ok(None) => {
                            tokio::select! {
                                _ = shutdown.cancelled() => {}
                                _ = tokio::time::sleep(config.poll_interval) => {}
                            }
                        }
                        Err(err) => {
                            warn!(target: "scan::queue", worker = %worker_id, error = %err, "dequeue failed");
                            tokio::select! {
                                _ = shutdown.cancelled() => {}
                                _ = tokio::time::sleep(config.poll_interval) => {}
                            }
                        }
                    }
                }
            }));
        }
    }

    async fn spawn_housekeeper(&self) {
        let queue = Arc::clone(&self.queue);
        let interval = self.config.housekeeper_interval;
        let shutdown = self.shutdown_token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!(target: "scan::queue", "housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = queue.scan_expired_leases().await {
                            warn!(target: "scan::queue", error = %err, "housekeeper scan_expired_leases error");
                        }
                    }
                }
            }
        });
        self.handles.lock().await.push(handle);
    }

    /// Stop pulling new chains and wait for running ones to finish their
    /// current chain.
    pub async fn shutdown(&self) -> Result<()> {
        info!(target: "scan::queue", "initiating graceful shutdown of chain runtime");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(target: "scan::queue", "worker task failed: {e:?}"),
                Err(_) => warn!(target: "scan::queue", "worker task timed out during shutdown"),
            }
        }

        info!(target: "scan::queue", "chain runtime shutdown complete");
        Ok(())
    }
}

async fn run_leased_chain(
    queue: &Arc<dyn QueueService>,
    executor: &TaskExecutor,
    config: &RuntimeConfig,
    worker_id: &str,
    lease: ChainLease,
) {
    let lease_id = lease.lease_id;
    if lease.attempts > 1 {
        info!(
            target: "scan::queue",
            chain_id = %lease.chain.chain_id,
            attempts = lease.attempts,
            "chain redelivered"
        );
    }

    let (cancel_tx, mut cancel_rx) = tokio::sync::mpsc::channel::<()>(1);
    let lease_lost = CancellationToken::new();
    let renewer_lost = lease_lost.clone();
    let renewer_queue = Arc::clone(queue);
    let renewer_worker = worker_id.to_owned();
    let ttl = config.lease_ttl;
    let renew_every = ttl.mul_f32(config.renew_at_fraction.clamp(0.05, 0.95));
    // Below this much remaining lease time a failed renewal gives the lease up.
    let give_up_within = ttl / 20;
    let renew_handle = tokio::spawn(async move {
        let mut expires_at = Instant::now() + ttl;
        let mut wait = renew_every;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {},
                _ = cancel_rx.recv() => { break; }
            }
            let sent_at = Instant::now();
            match renewer_queue
                .renew(LeaseRenewal {
                    lease_id,
                    worker_id: renewer_worker.clone(),
                    extend_by: to_chrono(ttl),
                })
                .await
            {
                Ok(_) => {
                    expires_at = sent_at + ttl;
                    wait = renew_every;
                }
                Err(ReconError::NotFound(_)) => {
                    warn!(target: "scan::queue", lease = ?lease_id, "chain lease lost; it may be redelivered");
                    renewer_lost.cancel();
                    break;
                }
                Err(err) => {
                    let remaining = expires_at.saturating_duration_since(Instant::now());
                    if remaining <= give_up_within {
                        warn!(
                            target: "scan::queue",
                            lease = ?lease_id,
                            error = %err,
                            "lease renew failed and the lease is about to expire; giving it up"
                        );
                        renewer_lost.cancel();
                        break;
                    }
                    warn!(
                        target: "scan::queue",
                        error = %err,
                        retry_in_ms = (remaining / 2).as_millis() as u64,
                        "lease renew failed"
                    );
                    wait = remaining / 2;
                }
            }
        }
    });

    let report = run_chain(executor, &lease.chain, config.failure_policy, &lease_lost).await;

    let _ = cancel_tx.try_send(());
    let _ = renew_handle.await;

    if let Some(interruption) = report.interrupted {
        info!(
            target: "scan::queue",
            chain_id = %lease.chain.chain_id,
            reason = ?interruption,
            "chain left for redelivery once its lease expires"
        );
        return;
    }

    let finished = match report.halted_at {
        Some(task_id) => {
            queue
                .fail(lease_id, Some(format!("halted after task {task_id} failed")))
                .await
        }
        None => queue.complete(lease_id).await,
    };
    if let Err(err) = finished {
        error!(target: "scan::queue", error = %err, "queue finish error");
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or_else(|_| chrono::Duration::days(365))
}
