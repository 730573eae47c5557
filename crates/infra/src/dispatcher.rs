//! Dispatcher: claim owned rows, run handlers, record outcomes.
//!
//! ## Outcomes
//!
//! | Handler result | Retry budget | Row becomes |
//! |----------------|--------------|-------------|
//! | `Ok` | - | `SENT` |
//! | `Retryable` / timeout | `retry_count + 1 < max_retries` | `FAILED`, due after backoff |
//! | `Retryable` / timeout | exhausted | `DEAD` + dead-letter event |
//! | `Permanent` | - | `DEAD` + dead-letter event |
//! | no matching handler | - | `NEW` (lease released) |
//!
//! A row can sit in the permit queue after its claim, so the lease is renewed
//! right before the handler starts; a refused renewal skips the handler.
//!
//! Every write is guarded by lease ownership. A write that matches nothing
//! means the lease expired and another instance reclaimed the row; it is
//! logged and counted as `lost`, never treated as an error.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use outboxd_core::clock::saturating_add;
use outboxd_core::task::truncate_error;
use outboxd_core::{BucketId, Clock, RetryDecision, RetryPolicy, TaskRecord};
use outboxd_events::DeadLetterEvent;

use crate::claim::{ClaimError, ClaimService};
use crate::dead_letter::DeadLetterSink;
use crate::enqueue::Kick;
use crate::handler::{HandlerError, HandlerRegistry};
use crate::task_store::{FailureUpdate, TaskStore, TaskStoreError};

#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error(transparent)]
    Store(#[from] TaskStoreError),

    /// The worker pool was shut down mid-cycle.
    #[error("worker pool closed")]
    Closed,
}

/// What happened to one claimed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Sent,
    Failed { retry_count: u32 },
    Dead { retry_count: u32 },
    Released,
    /// A guarded write matched nothing: the lease was lost.
    Lost,
}

/// Per-cycle counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    pub dead: usize,
    pub released: usize,
    pub lost: usize,
    /// Rows whose outcome could not be written (store error or panic).
    pub errors: usize,
}

impl DispatchReport {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Sent => self.sent += 1,
            Outcome::Failed { .. } => self.failed += 1,
            Outcome::Dead { .. } => self.dead += 1,
            Outcome::Released => self.released += 1,
            Outcome::Lost => self.lost += 1,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }
}

/// Dispatcher wiring. Cheap to clone; clones share the worker pool.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    claims: ClaimService,
    handlers: Arc<HandlerRegistry>,
    sink: Arc<dyn DeadLetterSink>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    handler_timeout: Duration,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TaskStore>,
        claims: ClaimService,
        handlers: Arc<HandlerRegistry>,
        sink: Arc<dyn DeadLetterSink>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        handler_timeout: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            store,
            claims,
            handlers,
            sink,
            clock,
            policy,
            handler_timeout,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    pub fn claims(&self) -> &ClaimService {
        &self.claims
    }

    /// Claim and process every eligible row in `buckets`, at most
    /// `max_concurrency` handlers at a time.
    pub async fn dispatch_owned(&self, buckets: &[BucketId]) -> Result<DispatchReport, DispatchError> {
        let mut report = DispatchReport::default();
        if buckets.is_empty() {
            return Ok(report);
        }

        let rows = self.claims.claim_owned(buckets, self.clock.now()).await?;
        report.claimed = rows.len();
        if rows.is_empty() {
            return Ok(report);
        }

        let mut workers = JoinSet::new();
        for task in rows {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|_| DispatchError::Closed)?;
            let this = self.clone();
            workers.spawn(async move {
                let _permit = permit;
                this.process(task).await
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(outcome)) => report.record(outcome),
                Ok(Err(err)) => {
                    error!(error = %err, "failed to record outbox task outcome");
                    report.errors += 1;
                }
                Err(err) => {
                    error!(error = %err, "outbox worker panicked");
                    report.errors += 1;
                }
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                sent = report.sent,
                failed = report.failed,
                dead = report.dead,
                released = report.released,
                lost = report.lost,
                "outbox dispatch cycle finished"
            );
        }
        Ok(report)
    }

    /// Fast path for a post-commit kick. `None` when the row was no longer
    /// claimable (another instance got it, or it is not due).
    pub async fn dispatch_kick(&self, kick: Kick) -> Result<Option<Outcome>, DispatchError> {
        let Some(task) = self.claims.claim_one(kick.task, self.clock.now()).await? else {
            debug!(task_id = %kick.task.id, "kicked task not claimable");
            return Ok(None);
        };

        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::Closed)?;
        Ok(Some(self.process(task).await?))
    }

    /// Run the handler for one leased row and record the outcome.
    pub async fn process(&self, task: TaskRecord) -> Result<Outcome, DispatchError> {
        let owner = self.claims.instance();
        let key = task.key();

        let Some(handler) = self.handlers.pick(&task.task_type).cloned() else {
            warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                "no outbox handler for task type; releasing"
            );
            let released = self.store.release_lock(key, owner, self.clock.now()).await?;
            return Ok(self.guarded(released, &task, Outcome::Released));
        };

        if !self.claims.extend(key, self.clock.now()).await? {
            debug!(task_id = %task.id, task_type = %task.task_type, "lease gone before handler start");
            return Ok(Outcome::Lost);
        }

        let result = match tokio::time::timeout(self.handler_timeout, handler.handle(&task)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::retryable(format!(
                "handler {} timed out after {:?}",
                handler.name(),
                self.handler_timeout
            ))),
        };
        let now = self.clock.now();

        let err = match result {
            Ok(()) => {
                let sent = self.store.mark_sent(key, owner, now).await?;
                if sent {
                    debug!(task_id = %task.id, task_type = %task.task_type, "outbox task sent");
                }
                return Ok(self.guarded(sent, &task, Outcome::Sent));
            }
            Err(err) => err,
        };

        let message = truncate_error(err.message());
        match self.policy.on_failure(task.retry_count, err.is_permanent()) {
            RetryDecision::Retry { retry_count, delay } => {
                let failure = FailureUpdate {
                    retry_count,
                    next_retry_at: saturating_add(now, delay),
                    error: message.clone(),
                    now,
                };
                let failed = self.store.mark_failed(key, owner, &failure).await?;
                if failed {
                    warn!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        business_key = %task.business_key,
                        retry_count,
                        next_retry_at = %failure.next_retry_at,
                        error = %message,
                        "outbox task failed; will retry"
                    );
                }
                Ok(self.guarded(failed, &task, Outcome::Failed { retry_count }))
            }
            RetryDecision::Dead { retry_count } => {
                let dead = self
                    .store
                    .mark_dead(key, owner, retry_count, &message, now)
                    .await?;
                if !dead {
                    return Ok(self.guarded(false, &task, Outcome::Dead { retry_count }));
                }

                error!(
                    alert = "outbox_dead_letter",
                    task_id = %task.id,
                    task_type = %task.task_type,
                    business_key = %task.business_key,
                    handler = %handler.name(),
                    retry_count,
                    error = %message,
                    "outbox task dead-lettered"
                );
                let handler_name = handler.name().to_string();
                self.sink
                    .notify(DeadLetterEvent::new(task, handler_name, retry_count, message, now));
                Ok(Outcome::Dead { retry_count })
            }
        }
    }

    fn guarded(&self, applied: bool, task: &TaskRecord, outcome: Outcome) -> Outcome {
        if applied {
            outcome
        } else {
            warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                bucket = %task.bucket,
                "outbox lease lost before outcome was recorded"
            );
            Outcome::Lost
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("claims", &self.claims)
            .field("handlers", &self.handlers)
            .field("policy", &self.policy)
            .field("handler_timeout", &self.handler_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{DateTime, Utc};
    use outboxd_core::{Backoff, InstanceId, ManualClock, NewTask, ShardMap, TaskStatus};
    use outboxd_events::{EventBus, InMemoryEventBus};

    use crate::handler::OutboxHandler;
    use crate::task_store::{InMemoryTaskStore, InsertOutcome};

    struct Scripted {
        calls: AtomicUsize,
        fail_first: usize,
        permanent: bool,
    }

    #[async_trait::async_trait]
    impl OutboxHandler for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn supports(&self, task_type: &str) -> bool {
            task_type == "REFUND_HTTP"
        }

        async fn handle(&self, _task: &TaskRecord) -> Result<(), HandlerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                if self.permanent {
                    Err(HandlerError::permanent("refund rejected"))
                } else {
                    Err(HandlerError::retryable("upstream 503"))
                }
            } else {
                Ok(())
            }
        }
    }

    struct Hang;

    #[async_trait::async_trait]
    impl OutboxHandler for Hang {
        fn name(&self) -> &str {
            "hang"
        }

        fn supports(&self, task_type: &str) -> bool {
            task_type == "SLOW_HTTP"
        }

        async fn handle(&self, _task: &TaskRecord) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        clock: Arc<ManualClock>,
        bus: Arc<InMemoryEventBus<DeadLetterEvent>>,
        dispatcher: Dispatcher,
    }

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn fixture(handlers: HandlerRegistry, policy: RetryPolicy) -> Fixture {
        let store = InMemoryTaskStore::arc(ShardMap::new(4).unwrap());
        let clock = ManualClock::arc(start());
        let bus = Arc::new(InMemoryEventBus::new());
        let claims = ClaimService::new(store.clone(), InstanceId::new(), Duration::from_secs(30), 50);
        let dispatcher = Dispatcher::new(
            store.clone(),
            claims,
            Arc::new(handlers),
            bus.clone(),
            clock.clone(),
            policy,
            Duration::from_millis(50),
            4,
        );
        Fixture {
            store,
            clock,
            bus,
            dispatcher,
        }
    }

    fn all_buckets() -> Vec<BucketId> {
        BucketId::all().collect()
    }

    async fn insert(store: &InMemoryTaskStore, task: NewTask, now: DateTime<Utc>) -> TaskRecord {
        match store.insert(task, now).await.unwrap() {
            InsertOutcome::Inserted(row) => row,
            InsertOutcome::Duplicate => panic!("unexpected duplicate"),
        }
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_immediately() {
        let handler = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
            permanent: true,
        });
        let f = fixture(HandlerRegistry::new().with(handler.clone()), RetryPolicy::default());
        let events = f.bus.subscribe();
        let row = insert(&f.store, NewTask::new("REFUND_HTTP", "order-42", "store-7", "{}"), start()).await;

        let report = f.dispatcher.dispatch_owned(&all_buckets()).await.unwrap();
        assert_eq!(report.dead, 1);

        let stored = f.store.get(row.key()).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Dead);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("refund rejected"));

        let events = events.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].handler_name, "scripted");
        assert_eq!(events[0].task.id, row.id);
    }

    #[tokio::test]
    async fn missing_handler_releases_the_row() {
        let f = fixture(HandlerRegistry::new(), RetryPolicy::default());
        let row = insert(&f.store, NewTask::new("UNKNOWN_HTTP", "x-1", "store-7", "{}"), start()).await;

        let report = f.dispatcher.dispatch_owned(&all_buckets()).await.unwrap();
        assert_eq!(report.released, 1);

        let stored = f.store.get(row.key()).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::New);
        assert!(stored.lock_owner.is_none());
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn handler_timeout_counts_as_retryable_failure() {
        let f = fixture(
            HandlerRegistry::new().with(Arc::new(Hang)),
            RetryPolicy::new(5, Backoff::Fixed(Duration::from_secs(1))),
        );
        let row = insert(&f.store, NewTask::new("SLOW_HTTP", "s-1", "store-7", "{}"), start()).await;

        let report = f.dispatcher.dispatch_owned(&all_buckets()).await.unwrap();
        assert_eq!(report.failed, 1);

        let stored = f.store.get(row.key()).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.next_retry_at, Some(start() + chrono::Duration::seconds(1)));
        assert!(stored.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn late_outcome_after_reclaim_is_lost() {
        let handler = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            fail_first: 0,
            permanent: false,
        });
        let f = fixture(HandlerRegistry::new().with(handler), RetryPolicy::default());
        insert(&f.store, NewTask::new("REFUND_HTTP", "order-42", "store-7", "{}"), start()).await;

        let mut rows = f
            .dispatcher
            .claims()
            .claim_owned(&all_buckets(), start())
            .await
            .unwrap();
        let task = rows.remove(0);

        f.clock.advance(Duration::from_secs(31));
        f.store.recover_stuck(f.clock.now()).await.unwrap();

        assert_eq!(f.dispatcher.process(task).await.unwrap(), Outcome::Lost);
        assert_eq!(f.store.snapshot()[0].status, TaskStatus::Failed);
    }

    /// Takes 20s of clock time per call and records whether its row was
    /// still leased to the dispatcher when it started.
    struct Slow {
        store: Arc<InMemoryTaskStore>,
        clock: Arc<ManualClock>,
        owner: InstanceId,
        leased_at_start: std::sync::Mutex<Vec<bool>>,
    }

    #[async_trait::async_trait]
    impl OutboxHandler for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn supports(&self, task_type: &str) -> bool {
            task_type == "REFUND_HTTP"
        }

        async fn handle(&self, task: &TaskRecord) -> Result<(), HandlerError> {
            let row = self.store.get(task.key()).await.unwrap().unwrap();
            let leased = row.leased_by(&self.owner.to_string(), self.clock.now());
            self.leased_at_start.lock().unwrap().push(leased);
            self.clock.advance(Duration::from_secs(20));
            Ok(())
        }
    }

    #[tokio::test]
    async fn queued_rows_never_run_on_an_expired_lease() {
        let store = InMemoryTaskStore::arc(ShardMap::new(4).unwrap());
        let clock = ManualClock::arc(start());
        let owner = InstanceId::new();
        let handler = Arc::new(Slow {
            store: store.clone(),
            clock: clock.clone(),
            owner: owner.clone(),
            leased_at_start: std::sync::Mutex::new(Vec::new()),
        });
        let claims = ClaimService::new(store.clone(), owner, Duration::from_secs(30), 50);
        let dispatcher = Dispatcher::new(
            store.clone(),
            claims,
            Arc::new(HandlerRegistry::new().with(handler.clone())),
            Arc::new(InMemoryEventBus::<DeadLetterEvent>::new()),
            clock.clone(),
            RetryPolicy::default(),
            Duration::from_secs(10),
            1,
        );
        for i in 0..3 {
            insert(&store, NewTask::new("REFUND_HTTP", format!("order-{i}"), "store-7", "{}"), start()).await;
        }

        let report = dispatcher.dispatch_owned(&all_buckets()).await.unwrap();
        assert_eq!(report.claimed, 3);
        assert_eq!(report.sent, 2);
        assert_eq!(report.lost, 1);

        let leased = handler.leased_at_start.lock().unwrap().clone();
        assert_eq!(leased, vec![true, true]);

        let stranded: Vec<_> = store
            .snapshot()
            .into_iter()
            .filter(|row| row.status == TaskStatus::Processing)
            .collect();
        assert_eq!(stranded.len(), 1);
        assert_eq!(store.recover_stuck(clock.now()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn backoff_pushes_next_retry_further_each_time() {
        let handler = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
            permanent: false,
        });
        let policy = RetryPolicy::new(
            4,
            Backoff::Exponential {
                base: Duration::from_secs(1),
                max: Duration::from_secs(60),
            },
        );
        let f = fixture(HandlerRegistry::new().with(handler), policy);
        let row = insert(&f.store, NewTask::new("REFUND_HTTP", "order-42", "store-7", "{}"), start()).await;

        let mut gaps = Vec::new();
        loop {
            let stored = f.store.get(row.key()).await.unwrap().unwrap();
            if stored.status == TaskStatus::Dead {
                assert_eq!(stored.retry_count, 4);
                break;
            }
            if let Some(at) = stored.next_retry_at {
                gaps.push(at - stored.updated_at);
                f.clock.set(at);
            }
            f.dispatcher.dispatch_owned(&all_buckets()).await.unwrap();
        }

        assert_eq!(gaps.len(), 3);
        assert!(gaps.windows(2).all(|w| w[0] < w[1]));
    }
}
