//! Transactional enqueue with post-commit kicks.
//!
//! Rows are written through the caller's transaction so the business change
//! and its side effect commit together. Kicks are queued only once the
//! commit has succeeded; a rollback (or a dropped transaction) sends none.
//! Kicks only cut latency: the periodic poll alone still processes every row.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use outboxd_core::{Clock, NewTask, TaskKey, TaskRecord};

use crate::task_store::{InsertOutcome, TaskStore, TaskStoreError, TaskTransaction};

/// Request to dispatch one task now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Kick {
    pub task: TaskKey,
}

/// Sending half of the bounded kick queue.
#[derive(Debug, Clone)]
pub struct Kicker {
    tx: mpsc::Sender<Kick>,
}

impl Kicker {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Kick>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a kick without waiting. Returns whether it was queued.
    pub fn kick(&self, task: TaskKey) -> bool {
        match self.tx.try_send(Kick { task }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(task_id = %task.id, "kick queue full; task left to the periodic poll");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(task_id = %task.id, "kick queue closed");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum EnqueueError {
    #[error("invalid task: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] TaskStoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(TaskRecord),
    /// `(task_type, business_key)` already exists; nothing was written.
    Duplicate,
}

impl EnqueueOutcome {
    pub fn record(&self) -> Option<&TaskRecord> {
        match self {
            EnqueueOutcome::Enqueued(row) => Some(row),
            EnqueueOutcome::Duplicate => None,
        }
    }
}

/// Entry point for business code.
#[derive(Clone)]
pub struct EnqueueService {
    kicker: Kicker,
    clock: Arc<dyn Clock>,
}

impl EnqueueService {
    pub fn new(kicker: Kicker, clock: Arc<dyn Clock>) -> Self {
        Self { kicker, clock }
    }

    /// Wrap a caller-owned transaction.
    pub fn begin<T: TaskTransaction>(&self, tx: T) -> OutboxTransaction<T> {
        OutboxTransaction {
            tx,
            pending: Vec::new(),
            kicker: self.kicker.clone(),
            clock: Arc::clone(&self.clock),
        }
    }

    /// Enqueue outside any business transaction (auto-commit), then kick.
    pub async fn enqueue_now(&self, store: &dyn TaskStore, task: NewTask) -> Result<EnqueueOutcome, EnqueueError> {
        validate(&task)?;
        match store.insert(task, self.clock.now()).await? {
            InsertOutcome::Inserted(row) => {
                self.kicker.kick(row.key());
                Ok(EnqueueOutcome::Enqueued(row))
            }
            InsertOutcome::Duplicate => Ok(EnqueueOutcome::Duplicate),
        }
    }

    /// Queue a kick for an existing row (used after a manual replay).
    pub fn kick(&self, task: TaskKey) -> bool {
        self.kicker.kick(task)
    }
}

impl std::fmt::Debug for EnqueueService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnqueueService")
            .field("kicker", &self.kicker)
            .finish()
    }
}

fn validate(task: &NewTask) -> Result<(), EnqueueError> {
    task.validate()
        .map_err(|e| EnqueueError::Invalid(e.to_string()))
}

/// A business transaction that outbox tasks ride along with.
pub struct OutboxTransaction<T> {
    tx: T,
    pending: Vec<TaskKey>,
    kicker: Kicker,
    clock: Arc<dyn Clock>,
}

impl<T: TaskTransaction> OutboxTransaction<T> {
    /// The wrapped transaction, for the caller's own writes.
    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.tx
    }

    /// Tasks that will be kicked on commit.
    pub fn pending(&self) -> &[TaskKey] {
        &self.pending
    }

    pub async fn enqueue(&mut self, task: NewTask) -> Result<EnqueueOutcome, EnqueueError> {
        validate(&task)?;
        let (task_type, business_key) = (task.task_type.clone(), task.business_key.clone());

        match self.tx.insert_task(task, self.clock.now()).await? {
            InsertOutcome::Inserted(row) => {
                debug!(task_id = %row.id, task_type = %row.task_type, bucket = %row.bucket, "outbox task staged");
                self.pending.push(row.key());
                Ok(EnqueueOutcome::Enqueued(row))
            }
            InsertOutcome::Duplicate => {
                debug!(task_type = %task_type, business_key = %business_key, "duplicate outbox task ignored");
                Ok(EnqueueOutcome::Duplicate)
            }
        }
    }

    /// Commit, then kick every staged task. Returns the number of kicks
    /// queued.
    pub async fn commit(self) -> Result<usize, EnqueueError> {
        self.tx.commit().await?;
        Ok(self
            .pending
            .iter()
            .filter(|key| self.kicker.kick(**key))
            .count())
    }

    pub async fn rollback(self) -> Result<(), EnqueueError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outboxd_core::{ShardMap, SystemClock};

    use crate::task_store::InMemoryTaskStore;

    fn service(capacity: usize) -> (EnqueueService, mpsc::Receiver<Kick>) {
        let (kicker, rx) = Kicker::channel(capacity);
        (EnqueueService::new(kicker, Arc::new(SystemClock)), rx)
    }

    fn refund(key: &str) -> NewTask {
        NewTask::new("REFUND_HTTP", key, "store-7", "{}")
    }

    #[tokio::test]
    async fn kicks_fire_only_after_commit() {
        let store = InMemoryTaskStore::arc(ShardMap::default());
        let (enqueue, mut rx) = service(8);

        let mut tx = enqueue.begin(store.begin());
        let outcome = tx.enqueue(refund("order-42")).await.unwrap();
        let key = outcome.record().unwrap().key();
        assert!(rx.try_recv().is_err());

        assert_eq!(tx.commit().await.unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), Kick { task: key });
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn rollback_and_drop_send_no_kick() {
        let store = InMemoryTaskStore::arc(ShardMap::default());
        let (enqueue, mut rx) = service(8);

        let mut tx = enqueue.begin(store.begin());
        tx.enqueue(refund("order-1")).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = enqueue.begin(store.begin());
        tx.enqueue(refund("order-2")).await.unwrap();
        drop(tx);

        assert!(rx.try_recv().is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn duplicate_is_a_no_op_without_kick() {
        let store = InMemoryTaskStore::arc(ShardMap::default());
        let (enqueue, mut rx) = service(8);

        enqueue.enqueue_now(store.as_ref(), refund("order-42")).await.unwrap();
        rx.try_recv().unwrap();

        let again = enqueue.enqueue_now(store.as_ref(), refund("order-42")).await.unwrap();
        assert_eq!(again, EnqueueOutcome::Duplicate);
        assert!(rx.try_recv().is_err());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn full_queue_does_not_fail_the_commit() {
        let store = InMemoryTaskStore::arc(ShardMap::default());
        let (enqueue, _rx) = service(1);

        let mut tx = enqueue.begin(store.begin());
        for i in 0..3 {
            tx.enqueue(refund(&format!("order-{i}"))).await.unwrap();
        }

        assert_eq!(tx.commit().await.unwrap(), 1);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn invalid_task_is_rejected() {
        let store = InMemoryTaskStore::arc(ShardMap::default());
        let (enqueue, _rx) = service(1);

        let err = enqueue
            .enqueue_now(store.as_ref(), NewTask::new("", "k", "p", "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::Invalid(_)));
    }
}
