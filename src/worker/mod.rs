//! Scheduled maintenance tasks, guarded by the distributed lock.
//!
//! Three tasks exist: draining the async-accept queue, a recovery dispatch
//! pass over receipts that never produced a delivery attempt, and cleanup of
//! expired queue entries. Each maps to one [`LockType`], so at most one
//! instance runs a given task at a time; an external scheduler invokes them
//! through the admin endpoint.

pub mod queue;

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::ingest::{IngestRequest, Pipeline, Rejection};
use crate::ledger::LedgerError;
use crate::lock::{DistributedLock, JobOutcome, LockError};
use crate::types::{ConsentFlags, LockType, NormalizedEvent};

pub use queue::{IngestQueue, QueuedRequest};

/// Entries processed per drain invocation. The scheduler calls again soon;
/// a bounded batch keeps each run inside one lock TTL.
const DRAIN_BATCH: usize = 100;

/// How long spooled requests are kept before cleanup discards them.
const QUEUE_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Receipts younger than this are left alone by recovery dispatch, so it
/// never races an ingest whose dispatch loop is still in flight.
const REDISPATCH_GRACE: Duration = Duration::from_secs(300);

/// A schedulable maintenance task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    DrainQueue,
    RunDispatch,
    Cleanup,
}

impl Task {
    pub fn parse(s: &str) -> Option<Task> {
        match s {
            "drain_queue" => Some(Task::DrainQueue),
            "run_dispatch" => Some(Task::RunDispatch),
            "cleanup" => Some(Task::Cleanup),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        self.lock_type().as_str()
    }

    pub fn lock_type(&self) -> LockType {
        match self {
            Task::DrainQueue => LockType::DrainQueue,
            Task::RunDispatch => LockType::RunDispatch,
            Task::Cleanup => LockType::Cleanup,
        }
    }

    /// Lock TTL for one run. Renewal extends it for long runs; this only has
    /// to outlive a crash, not the whole task.
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(120)
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors from task execution. Lock contention is not an error; it surfaces
/// as [`JobOutcome::Skipped`].
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("queue error: {0}")]
    Queue(#[from] io::Error),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// What one task run accomplished.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TaskReport {
    #[serde(rename_all = "camelCase")]
    DrainQueue {
        /// Entries processed and removed.
        drained: usize,
        /// Entries removed because the request can never succeed.
        rejected: usize,
        /// Entries kept for a later drain (transient failure).
        kept: usize,
        /// Entries still queued after this run.
        remaining: usize,
    },
    #[serde(rename_all = "camelCase")]
    RunDispatch {
        receipts_scanned: usize,
        redispatched: usize,
        delivered: usize,
        failed: usize,
    },
    #[serde(rename_all = "camelCase")]
    Cleanup { purged: usize },
}

/// Runs maintenance tasks under the distributed lock.
pub struct TaskRunner {
    pipeline: Arc<Pipeline>,
    lock: DistributedLock,
    queue: IngestQueue,
}

impl TaskRunner {
    pub fn new(pipeline: Arc<Pipeline>, lock: DistributedLock, queue: IngestQueue) -> Self {
        Self {
            pipeline,
            lock,
            queue,
        }
    }

    pub fn queue(&self) -> &IngestQueue {
        &self.queue
    }

    /// Runs `task` under its lock.
    ///
    /// `force` bypasses the lock entirely. It exists for operators recovering
    /// from a wedged backend and gives up the single-runner guarantee, so it
    /// is always logged loudly.
    pub async fn run(&self, task: Task, force: bool) -> Result<JobOutcome<TaskReport>> {
        if force {
            warn!(task = %task, "forced run, bypassing the scheduler lock");
            return Ok(JobOutcome::Completed(self.execute(task).await?));
        }

        match self
            .lock
            .run_exclusive(task.lock_type(), task.lock_ttl(), self.execute(task))
            .await?
        {
            JobOutcome::Completed(report) => Ok(JobOutcome::Completed(report?)),
            JobOutcome::Skipped { remaining } => {
                info!(task = %task, remaining_ms = remaining.as_millis() as u64, "task skipped, lock held elsewhere");
                Ok(JobOutcome::Skipped { remaining })
            }
        }
    }

    async fn execute(&self, task: Task) -> Result<TaskReport> {
        match task {
            Task::DrainQueue => self.drain_queue().await,
            Task::RunDispatch => self.run_dispatch().await,
            Task::Cleanup => self.cleanup(),
        }
    }

    /// Feeds spooled requests through the ingestion pipeline, oldest first.
    async fn drain_queue(&self) -> Result<TaskReport> {
        let entries = self.queue.claim(DRAIN_BATCH)?;

        let mut drained = 0;
        let mut rejected = 0;
        let mut kept = 0;
        for entry in entries {
            let request = IngestRequest {
                body: entry.request.body.clone().into_bytes(),
                shop_domain: entry.request.shop_domain.clone(),
                origin: entry.request.origin.clone(),
                referer: entry.request.referer.clone(),
                signature: entry.request.signature.clone(),
            };

            match self.pipeline.ingest(request).await {
                Ok(_) => {
                    entry.remove()?;
                    drained += 1;
                }
                // Transient conditions clear on their own: the store may come
                // back, the rate-limit window rolls over, an IO hiccup passes.
                // These requests were 202-acknowledged, so they stay queued.
                Err(
                    Rejection::StoreUnavailable
                    | Rejection::RateLimited
                    | Rejection::Internal(_),
                ) => {
                    kept += 1;
                }
                Err(err) => {
                    warn!(entry = %entry.request.id, error = %err, "dropping spooled request");
                    entry.remove()?;
                    rejected += 1;
                }
            }
        }

        let remaining = self.queue.len()?;
        info!(drained, rejected, kept, remaining, "queue drain finished");
        Ok(TaskReport::DrainQueue {
            drained,
            rejected,
            kept,
            remaining,
        })
    }

    /// Re-dispatches receipts whose destinations never got an attempt.
    ///
    /// A crash between the receipt write and the dispatch loop leaves exactly
    /// this gap: a durable receipt, destinations recorded, no attempt rows.
    /// The rebuilt payload reuses the canonical event id, so a destination
    /// that did receive the original call dedups the replay.
    async fn run_dispatch(&self) -> Result<TaskReport> {
        let ledger = self.pipeline.ledger().clone();
        let cutoff = Utc::now()
            - chrono::TimeDelta::from_std(REDISPATCH_GRACE).unwrap_or(chrono::TimeDelta::zero());

        let mut scanned = 0;
        let mut redispatched = 0;
        let mut delivered = 0;
        let mut failed = 0;

        for shop in ledger.shops()? {
            let record = match self.pipeline.resolver().resolve(shop.as_str()).await {
                Ok(record) => record,
                Err(err) => {
                    warn!(shop = %shop, error = %err, "skipping shop during recovery dispatch");
                    continue;
                }
            };

            let attempted: HashSet<_> = ledger
                .read_attempts(&shop)?
                .into_iter()
                .map(|attempt| attempt.event_id)
                .collect();

            for receipt in ledger.read_receipts(&shop)? {
                scanned += 1;
                if receipt.platforms.is_empty()
                    || attempted.contains(&receipt.event_id)
                    || receipt.created_at >= cutoff
                {
                    continue;
                }

                // The original normalized payload is gone; rebuild the parts
                // the destinations actually need from the receipt.
                let event = NormalizedEvent {
                    shop: receipt.shop.clone(),
                    event_type: receipt.event_type,
                    timestamp: receipt.created_at,
                    origin: receipt.origin,
                    consent: ConsentFlags::default(),
                    order_id: None,
                    checkout_token: None,
                    session_id: None,
                    value: receipt.value,
                    currency: receipt.currency.clone(),
                    items: Vec::new(),
                    nonce: None,
                };

                redispatched += 1;
                for platform in &receipt.platforms {
                    let Some(settings) = record.platforms.get(platform) else {
                        warn!(shop = %shop, platform = %platform, "destination no longer configured");
                        continue;
                    };
                    let attempt = self
                        .pipeline
                        .dispatcher()
                        .send(
                            *platform,
                            &event,
                            &receipt.event_id,
                            &receipt.order_key,
                            settings,
                        )
                        .await;
                    ledger.append_attempt(&shop, &attempt)?;
                    match attempt.status {
                        crate::ledger::AttemptStatus::Ok => delivered += 1,
                        _ => failed += 1,
                    }
                }
            }
        }

        info!(scanned, redispatched, delivered, failed, "recovery dispatch finished");
        Ok(TaskReport::RunDispatch {
            receipts_scanned: scanned,
            redispatched,
            delivered,
            failed,
        })
    }

    /// Discards queue entries past the retention window.
    fn cleanup(&self) -> Result<TaskReport> {
        let purged = self.queue.purge_stale(QUEUE_RETENTION)?;
        info!(purged, "queue cleanup finished");
        Ok(TaskReport::Cleanup { purged })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::Router;
    use axum::routing::post;
    use tempfile::TempDir;

    use crate::auth::{compute_signature, format_signature_header};
    use crate::dispatch::{Dispatcher, EndpointBases};
    use crate::ledger::{EventReceipt, Ledger};
    use crate::shop::ShopResolver;
    use crate::shop::test_fixtures::{shop_record, write_record};
    use crate::store::{MemoryStore, StoreHandle};
    use crate::types::{
        EventId, EventOrigin, EventType, HolderToken, OrderKey, Platform, ShopId,
    };

    const DOMAIN: &str = "example.myshopify.com";

    struct Harness {
        runner: TaskRunner,
        lock: DistributedLock,
        ledger: Ledger,
        _data_dir: TempDir,
    }

    async fn serve_ok() -> String {
        let router = Router::new()
            .route("/{pixel}/events", post(|| async { "{}" }))
            .route("/mp/collect", post(|| async { "" }))
            .route("/open_api/v1.3/event/track/", post(|| async { r#"{"code":0}"# }))
            .route("/v5/ad_accounts/{acct}/events", post(|| async { "{}" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn harness_with(record: crate::shop::ShopRecord) -> Harness {
        let data_dir = TempDir::new().unwrap();
        write_record(data_dir.path(), &record);

        let base = serve_ok().await;
        let bases = EndpointBases {
            meta: base.clone(),
            google: base.clone(),
            google_eu: base.clone(),
            tiktok: base.clone(),
            pinterest: base,
        };

        let store: StoreHandle = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(data_dir.path());
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(ShopResolver::new(data_dir.path())),
            store.clone(),
            ledger.clone(),
            Arc::new(Dispatcher::with_bases(Duration::from_secs(2), bases).unwrap()),
            Duration::from_secs(600),
        ));
        let lock = DistributedLock::new(store);
        let queue = IngestQueue::new(data_dir.path());

        Harness {
            runner: TaskRunner::new(pipeline, lock.clone(), queue),
            lock,
            ledger,
            _data_dir: data_dir,
        }
    }

    async fn harness() -> Harness {
        harness_with(shop_record(DOMAIN)).await
    }

    fn spooled_purchase(order_id: u64) -> QueuedRequest {
        let body = format!(
            r#"{{
                "eventName": "purchase",
                "timestamp": "{}",
                "consent": {{"marketing": true}},
                "data": {{"orderId": {order_id}, "value": 42.5, "currency": "USD"}},
                "nonce": "n-{order_id}"
            }}"#,
            Utc::now().to_rfc3339()
        );
        let signature = format_signature_header(&compute_signature(
            body.as_bytes(),
            b"current-secret",
        ));
        queue::queued_request(body, Some(DOMAIN.into()), None, None, Some(signature))
    }

    fn receipt(event_id: &str, platforms: Vec<Platform>) -> EventReceipt {
        EventReceipt {
            shop: ShopId::new(DOMAIN),
            event_id: EventId::new(event_id),
            event_type: EventType::Purchase,
            order_key: OrderKey::new("1001"),
            alt_order_key: None,
            origin: EventOrigin::Server,
            platforms,
            value: Some(42.5),
            currency: Some("USD".into()),
            created_at: Utc::now() - chrono::TimeDelta::minutes(30),
        }
    }

    fn report(outcome: JobOutcome<TaskReport>) -> TaskReport {
        match outcome {
            JobOutcome::Completed(report) => report,
            JobOutcome::Skipped { .. } => panic!("expected Completed"),
        }
    }

    #[test]
    fn task_names_roundtrip() {
        for task in [Task::DrainQueue, Task::RunDispatch, Task::Cleanup] {
            assert_eq!(Task::parse(task.as_str()), Some(task));
        }
        assert_eq!(Task::parse("reindex"), None);
    }

    #[tokio::test]
    async fn drain_processes_spooled_requests() {
        let h = harness().await;
        h.runner.queue().enqueue(&spooled_purchase(1001)).unwrap();
        h.runner.queue().enqueue(&spooled_purchase(1002)).unwrap();

        let outcome = h.runner.run(Task::DrainQueue, false).await.unwrap();
        assert_eq!(
            report(outcome),
            TaskReport::DrainQueue {
                drained: 2,
                rejected: 0,
                kept: 0,
                remaining: 0,
            }
        );

        let receipts = h.ledger.read_receipts(&ShopId::new(DOMAIN)).unwrap();
        assert_eq!(receipts.len(), 2);
        assert!(h.runner.queue().is_empty().unwrap());
    }

    #[tokio::test]
    async fn drain_drops_permanently_rejected_entries() {
        let h = harness().await;
        let mut dead = spooled_purchase(1001);
        dead.shop_domain = Some("nobody.example".into());
        h.runner.queue().enqueue(&dead).unwrap();

        let outcome = h.runner.run(Task::DrainQueue, false).await.unwrap();
        assert_eq!(
            report(outcome),
            TaskReport::DrainQueue {
                drained: 0,
                rejected: 1,
                kept: 0,
                remaining: 0,
            }
        );
        assert!(h.runner.queue().is_empty().unwrap());
    }

    #[tokio::test]
    async fn drain_keeps_rate_limited_entries_for_a_later_pass() {
        let mut record = shop_record(DOMAIN);
        record.rate_limit_per_minute = 1;
        let h = harness_with(record).await;
        h.runner.queue().enqueue(&spooled_purchase(1001)).unwrap();
        h.runner.queue().enqueue(&spooled_purchase(1002)).unwrap();

        let outcome = h.runner.run(Task::DrainQueue, false).await.unwrap();
        assert_eq!(
            report(outcome),
            TaskReport::DrainQueue {
                drained: 1,
                rejected: 0,
                kept: 1,
                remaining: 1,
            }
        );

        // The acknowledged request that hit the limit is still queued, and
        // exactly one receipt exists for the one that went through.
        assert_eq!(h.runner.queue().len().unwrap(), 1);
        assert_eq!(h.ledger.read_receipts(&ShopId::new(DOMAIN)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn drain_skips_when_lock_held_elsewhere() {
        let h = harness().await;
        h.runner.queue().enqueue(&spooled_purchase(1001)).unwrap();

        let other = HolderToken::generate();
        h.lock
            .acquire(LockType::DrainQueue, &other, Duration::from_secs(60))
            .await
            .unwrap();

        let outcome = h.runner.run(Task::DrainQueue, false).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Skipped { .. }));
        // Nothing was processed.
        assert_eq!(h.runner.queue().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn forced_run_bypasses_a_held_lock() {
        let h = harness().await;
        h.runner.queue().enqueue(&spooled_purchase(1001)).unwrap();

        let other = HolderToken::generate();
        h.lock
            .acquire(LockType::DrainQueue, &other, Duration::from_secs(60))
            .await
            .unwrap();

        let outcome = h.runner.run(Task::DrainQueue, true).await.unwrap();
        match report(outcome) {
            TaskReport::DrainQueue { drained, .. } => assert_eq!(drained, 1),
            other => panic!("expected drain report, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_dispatch_recovers_receipts_without_attempts() {
        let h = harness().await;
        h.ledger
            .record_receipt(&receipt("orphaned-event", vec![Platform::Meta]))
            .unwrap();

        let outcome = h.runner.run(Task::RunDispatch, false).await.unwrap();
        assert_eq!(
            report(outcome),
            TaskReport::RunDispatch {
                receipts_scanned: 1,
                redispatched: 1,
                delivered: 1,
                failed: 0,
            }
        );

        let attempts = h.ledger.read_attempts(&ShopId::new(DOMAIN)).unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].event_id, EventId::new("orphaned-event"));
        assert_eq!(attempts[0].platform, Platform::Meta);
    }

    #[tokio::test]
    async fn run_dispatch_leaves_attempted_receipts_alone() {
        let h = harness().await;
        let r = receipt("already-sent", vec![Platform::Meta]);
        h.ledger.record_receipt(&r).unwrap();

        // First pass delivers; a second pass must not send again.
        h.runner.run(Task::RunDispatch, false).await.unwrap();
        let outcome = h.runner.run(Task::RunDispatch, false).await.unwrap();
        assert_eq!(
            report(outcome),
            TaskReport::RunDispatch {
                receipts_scanned: 1,
                redispatched: 0,
                delivered: 0,
                failed: 0,
            }
        );
        assert_eq!(h.ledger.read_attempts(&ShopId::new(DOMAIN)).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_dispatch_waits_out_the_grace_window() {
        let h = harness().await;
        let mut fresh = receipt("in-flight", vec![Platform::Meta]);
        fresh.created_at = Utc::now();
        h.ledger.record_receipt(&fresh).unwrap();

        let outcome = h.runner.run(Task::RunDispatch, false).await.unwrap();
        assert_eq!(
            report(outcome),
            TaskReport::RunDispatch {
                receipts_scanned: 1,
                redispatched: 0,
                delivered: 0,
                failed: 0,
            }
        );
        assert!(h.ledger.read_attempts(&ShopId::new(DOMAIN)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_dispatch_ignores_consent_filtered_receipts() {
        let h = harness().await;
        h.ledger.record_receipt(&receipt("no-consent", vec![])).unwrap();

        let outcome = h.runner.run(Task::RunDispatch, false).await.unwrap();
        assert_eq!(
            report(outcome),
            TaskReport::RunDispatch {
                receipts_scanned: 1,
                redispatched: 0,
                delivered: 0,
                failed: 0,
            }
        );
    }

    #[tokio::test]
    async fn cleanup_purges_expired_entries_only() {
        let h = harness().await;
        let mut old = spooled_purchase(1001);
        old.received_at = Utc::now() - chrono::TimeDelta::hours(48);
        h.runner.queue().enqueue(&old).unwrap();
        h.runner.queue().enqueue(&spooled_purchase(1002)).unwrap();

        let outcome = h.runner.run(Task::Cleanup, false).await.unwrap();
        assert_eq!(report(outcome), TaskReport::Cleanup { purged: 1 });
        assert_eq!(h.runner.queue().len().unwrap(), 1);
    }
}
