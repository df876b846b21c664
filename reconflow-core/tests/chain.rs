mod common;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use common::Harness;
use reconflow_core::{
    error::{ReconError, Result},
    queue::{
        ChainFailurePolicy, ChainId, ChainInterruption, ChainLease, ChainMessage,
        ChainReport, ChainRuntime, DequeueRequest, InMemoryChainQueue, LeaseId,
        LeaseRenewal, QueueCounts, QueueService, RuntimeConfig, run_chain,
    },
    tasks::{TaskRepository, TaskStatus},
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn discover_then_probe_builds_the_graph() {
    let h = Harness::new();
    let asset = h.asset("example.com").await;
    let submitted = h.submissions.submit(asset.id, "web", false).await.unwrap();

    let lease = h
        .queue
        .dequeue(DequeueRequest {
            worker_id: "w0".into(),
            lease_ttl: chrono::Duration::minutes(5),
        })
        .await
        .unwrap()
        .unwrap();
    let report = run_chain(
        &h.executor,
        &lease.chain,
        ChainFailurePolicy::Continue,
        &CancellationToken::new(),
    )
    .await;
    assert_eq!(report.completed, 2);
    assert_eq!(report.failed, 0);

    for id in &submitted.task_ids {
        assert_eq!(h.task(*id).await.status, TaskStatus::Completed);
    }

    let graph = h.store.graph().await;
    assert_eq!(graph.hosts.len(), 1);
    let host = graph.host("sub.example.com").unwrap();
    assert_eq!(host.root_asset_id, Some(asset.id.0));
    assert_eq!(graph.ip_addresses.len(), 1);
    let ip = graph.ip("1.2.3.4").unwrap();
    // Resolved during discovery, seen again by the HTTP step: one A record.
    assert_eq!(graph.dns_records.len(), 1);
    assert_eq!(graph.dns_records[0].host_id, host.id);
    assert_eq!(graph.dns_records[0].ip_address_id, ip.id);
    assert_eq!(graph.dns_records[0].record_type, "A");
    assert_eq!(graph.ports.len(), 1);
    assert_eq!(graph.ports[0].ip_address_id, ip.id);
    assert_eq!(graph.ports[0].port_number, 80);
    assert_eq!(graph.http_services.len(), 1);
    assert_eq!(graph.http_services[0].url, "http://sub.example.com:80");
    assert_eq!(graph.http_services[0].status_code, Some(200));
    assert_eq!(graph.http_services[0].port_id, graph.ports[0].id);
}

#[tokio::test]
async fn continue_policy_runs_steps_after_a_failure() {
    let h = Harness::new();
    let asset = h.asset("example.com").await;
    let submitted = h.submissions.submit(asset.id, "fragile", false).await.unwrap();

    let chain = ChainMessage::new(submitted.task_ids.clone());
    let report = run_chain(
        &h.executor,
        &chain,
        ChainFailurePolicy::Continue,
        &CancellationToken::new(),
    )
    .await;
    assert_eq!(
        report,
        ChainReport {
            completed: 1,
            failed: 1,
            skipped: 0,
            halted_at: None,
            interrupted: None,
        }
    );
    assert_eq!(h.task(submitted.task_ids[0]).await.status, TaskStatus::Failed);
    assert_eq!(h.task(submitted.task_ids[1]).await.status, TaskStatus::Completed);
    assert!(h.store.graph().await.host("sub.example.com").is_some());
}

#[tokio::test]
async fn halt_policy_fails_the_remaining_steps_without_running_them() {
    let h = Harness::new();
    let asset = h.asset("example.com").await;
    let submitted = h.submissions.submit(asset.id, "fragile", false).await.unwrap();

    let chain = ChainMessage::new(submitted.task_ids.clone());
    let report = run_chain(
        &h.executor,
        &chain,
        ChainFailurePolicy::Halt,
        &CancellationToken::new(),
    )
    .await;
    assert_eq!(report.halted_at, Some(submitted.task_ids[0]));
    assert_eq!(report.failed, 2);
    assert_eq!(report.completed, 0);

    let skipped = h.task(submitted.task_ids[1]).await;
    assert_eq!(skipped.status, TaskStatus::Failed);
    assert!(skipped.log.unwrap().starts_with("skipped: chain halted"));
    assert!(skipped.started_at.is_none());
    assert!(h.store.graph().await.hosts.is_empty());
}

#[tokio::test]
async fn worker_pool_drains_every_submitted_chain() {
    let h = Harness::new();
    let mut expected = Vec::new();
    for name in ["a.test", "b.test", "c.test"] {
        let asset = h.asset(name).await;
        let submitted = h.submissions.submit(asset.id, "web", false).await.unwrap();
        expected.extend(submitted.task_ids);
    }

    let runtime = ChainRuntime::new(
        RuntimeConfig {
            max_concurrent_chains: 2,
            poll_interval: Duration::from_millis(20),
            housekeeper_interval: Duration::from_millis(50),
            ..RuntimeConfig::default()
        },
        Arc::clone(&h.queue) as Arc<dyn QueueService>,
        Arc::clone(&h.executor),
    );
    runtime.start().await;

    let drained = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if h.queue.counts().await.unwrap().finished() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    runtime.shutdown().await.unwrap();
    assert!(drained.is_ok(), "chains were not drained in time");

    for id in expected {
        assert_eq!(h.task(id).await.status, TaskStatus::Completed);
    }
    let graph = h.store.graph().await;
    assert_eq!(graph.hosts.len(), 3);
    assert_eq!(graph.http_services.len(), 3);
    // All probes resolve to the same address.
    assert_eq!(graph.ip_addresses.len(), 1);
    assert_eq!(graph.ports.len(), 1);
}

#[tokio::test]
async fn cancelled_lease_starts_no_further_steps() {
    let h = Harness::new();
    let asset = h.asset("example.com").await;
    let submitted = h.submissions.submit(asset.id, "web", false).await.unwrap();

    let lease_lost = CancellationToken::new();
    lease_lost.cancel();
    let chain = ChainMessage::new(submitted.task_ids.clone());
    let report = run_chain(&h.executor, &chain, ChainFailurePolicy::Continue, &lease_lost).await;

    assert_eq!(report.interrupted, Some(ChainInterruption::LeaseLost));
    assert_eq!(report.completed, 0);
    for id in &submitted.task_ids {
        assert_eq!(h.task(*id).await.status, TaskStatus::Pending);
    }
}

#[tokio::test]
async fn redelivery_stops_at_a_step_that_is_still_running() {
    let h = Harness::new();
    let asset = h.asset("example.com").await;
    let submitted = h.submissions.submit(asset.id, "web", false).await.unwrap();
    let (first, second) = (submitted.task_ids[0], submitted.task_ids[1]);
    assert!(h.store.mark_running(first).await.unwrap());

    let chain = ChainMessage::new(submitted.task_ids.clone());
    let report = run_chain(
        &h.executor,
        &chain,
        ChainFailurePolicy::Continue,
        &CancellationToken::new(),
    )
    .await;

    assert_eq!(report.interrupted, Some(ChainInterruption::StepInFlight(first)));
    assert_eq!(report.skipped, 0);
    assert_eq!(h.task(second).await.status, TaskStatus::Pending);
}

/// Queue whose lease renewals always fail with a transport error.
#[derive(Debug)]
struct UnrenewableQueue(Arc<InMemoryChainQueue>);

#[async_trait]
impl QueueService for UnrenewableQueue {
    async fn enqueue(&self, chain: ChainMessage) -> Result<ChainId> {
        self.0.enqueue(chain).await
    }

    async fn dequeue(&self, request: DequeueRequest) -> Result<Option<ChainLease>> {
        self.0.dequeue(request).await
    }

    async fn renew(&self, _renewal: LeaseRenewal) -> Result<ChainLease> {
        Err(ReconError::Queue("connection reset".into()))
    }

    async fn complete(&self, lease_id: LeaseId) -> Result<()> {
        self.0.complete(lease_id).await
    }

    async fn fail(&self, lease_id: LeaseId, error: Option<String>) -> Result<()> {
        self.0.fail(lease_id, error).await
    }

    async fn scan_expired_leases(&self) -> Result<u64> {
        self.0.scan_expired_leases().await
    }

    async fn counts(&self) -> Result<QueueCounts> {
        self.0.counts().await
    }
}

#[tokio::test]
async fn steps_stay_ordered_when_lease_renewal_keeps_failing() {
    let h = Harness::new();
    let asset = h.asset("example.com").await;
    let submitted = h
        .submissions
        .submit(asset.id, "slow-then-web", false)
        .await
        .unwrap();
    let (slow, fast) = (submitted.task_ids[0], submitted.task_ids[1]);

    // The slow step outlives several lease ttls.
    let runtime = ChainRuntime::new(
        RuntimeConfig {
            max_concurrent_chains: 2,
            lease_ttl: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
            housekeeper_interval: Duration::from_millis(50),
            ..RuntimeConfig::default()
        },
        Arc::new(UnrenewableQueue(Arc::clone(&h.queue))),
        Arc::clone(&h.executor),
    );
    runtime.start().await;

    let settled = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let tasks = h.store.all_tasks().await;
            let done = [slow, fast].iter().all(|id| {
                tasks.iter().any(|t| t.id == *id && t.status.is_terminal())
            });
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    runtime.shutdown().await.unwrap();
    assert!(settled.is_ok(), "chain steps did not settle in time");

    let slow = h.task(slow).await;
    let fast = h.task(fast).await;
    assert_eq!(slow.status, TaskStatus::Completed);
    assert_eq!(fast.status, TaskStatus::Completed);
    assert!(
        fast.started_at.unwrap() >= slow.completed_at.unwrap(),
        "second step started before the first one finished"
    );
}
