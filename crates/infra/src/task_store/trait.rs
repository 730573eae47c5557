use std::ops::Range;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use outboxd_core::{BucketId, InstanceId, NewTask, ShardId, ShardMap, TaskId, TaskKey, TaskRecord, TaskStatus};

/// Result of inserting a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(TaskRecord),
    /// `(task_type, business_key)` already exists; nothing was written.
    Duplicate,
}

/// A lease being granted by a claim.
///
/// `acquired_at` doubles as the "now" used for every eligibility predicate of
/// the claim (due time, expired lease).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub owner: InstanceId,
    pub acquired_at: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl Lease {
    pub fn new(owner: InstanceId, acquired_at: DateTime<Utc>, duration: std::time::Duration) -> Self {
        Self {
            owner,
            acquired_at,
            until: outboxd_core::clock::saturating_add(acquired_at, duration),
        }
    }

    pub fn owner_str(&self) -> String {
        self.owner.to_string()
    }
}

/// Failure bookkeeping written by `mark_failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureUpdate {
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
    pub error: String,
    pub now: DateTime<Utc>,
}

/// Optional filters for listing dead letters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadLetterFilter {
    pub task_type: Option<String>,
    pub business_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 20,
        }
    }
}

/// Row counts by status, plus claimable rows as of a given instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub new: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
    pub dead: u64,
    /// NEW or FAILED rows that are due now.
    pub due: u64,
}

impl StatusCounts {
    pub fn record(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::New => self.new += count,
            TaskStatus::Processing => self.processing += count,
            TaskStatus::Sent => self.sent += count,
            TaskStatus::Failed => self.failed += count,
            TaskStatus::Dead => self.dead += count,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("invalid task: {0}")]
    Invalid(String),

    /// Unique violation on `(task_type, business_key)`.
    #[error("duplicate task: {0}")]
    Duplicate(String),

    /// A stored value could not be decoded into a task record.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable task storage.
///
/// Every write to `status` or `lock_*` goes through one of the guarded
/// operations below. Guarded operations return `false` (or an empty list)
/// when the guard does not match; that is a lost race, not an error.
///
/// ## Claim predicate
///
/// A row is claimable at `now` when all of the following hold:
///
/// - `status IN (NEW, FAILED)`
/// - `next_retry_at IS NULL OR next_retry_at <= now`
/// - `lock_until IS NULL OR lock_until < now`
///
/// ## Owner guard
///
/// `mark_sent`, `mark_failed`, `mark_dead`, `release_lock` and `extend_lease`
/// only apply when `status = PROCESSING AND lock_owner = owner`.
#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    /// Bucket-to-shard layout the store was opened with.
    fn shard_map(&self) -> &ShardMap;

    /// Insert outside any caller transaction (auto-commit).
    async fn insert(&self, task: NewTask, now: DateTime<Utc>) -> Result<InsertOutcome, TaskStoreError>;

    async fn get(&self, key: TaskKey) -> Result<Option<TaskRecord>, TaskStoreError>;

    /// Look a task up by id alone (scans every shard).
    async fn find_by_id(&self, id: TaskId) -> Result<Option<TaskRecord>, TaskStoreError>;

    /// Phases one and two of the batch claim, atomically: select up to
    /// `limit` claimable ids in `buckets` (skipping rows locked by concurrent
    /// claimers, lowest id first) and lease them. Returns the leased ids.
    async fn claim_batch(
        &self,
        shard: ShardId,
        buckets: &[BucketId],
        lease: &Lease,
        limit: u32,
    ) -> Result<Vec<TaskId>, TaskStoreError>;

    /// Lease specific ids, re-checking the claim predicate per row. Returns
    /// the ids actually leased.
    async fn claim_by_ids(
        &self,
        shard: ShardId,
        ids: &[TaskId],
        lease: &Lease,
    ) -> Result<Vec<TaskId>, TaskStoreError>;

    /// Phase three: read full rows, ordered by id.
    async fn load_by_ids(&self, shard: ShardId, ids: &[TaskId]) -> Result<Vec<TaskRecord>, TaskStoreError>;

    async fn mark_sent(&self, key: TaskKey, owner: &InstanceId, now: DateTime<Utc>) -> Result<bool, TaskStoreError>;

    /// PROCESSING -> FAILED; clears the lease.
    async fn mark_failed(
        &self,
        key: TaskKey,
        owner: &InstanceId,
        failure: &FailureUpdate,
    ) -> Result<bool, TaskStoreError>;

    async fn mark_dead(
        &self,
        key: TaskKey,
        owner: &InstanceId,
        retry_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError>;

    /// PROCESSING -> NEW without counting a failure.
    async fn release_lock(&self, key: TaskKey, owner: &InstanceId, now: DateTime<Utc>) -> Result<bool, TaskStoreError>;

    /// Push `lock_until` out while the current lease is still valid.
    async fn extend_lease(
        &self,
        key: TaskKey,
        owner: &InstanceId,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError>;

    /// PROCESSING rows with `lock_until < now` -> FAILED, due immediately.
    async fn recover_stuck(&self, now: DateTime<Utc>) -> Result<u64, TaskStoreError>;

    /// DEAD -> NEW with a fresh retry budget.
    async fn reset_dead_to_new(&self, key: TaskKey, now: DateTime<Utc>) -> Result<bool, TaskStoreError>;

    /// DEAD rows, most recently updated first.
    async fn list_dead_letters(&self, filter: &DeadLetterFilter, page: Page) -> Result<Vec<TaskRecord>, TaskStoreError>;

    async fn find_dead(&self, business_key: &str, task_type: Option<&str>) -> Result<Vec<TaskRecord>, TaskStoreError>;

    /// Delete rows in `status` created before `cutoff` whose bucket falls in
    /// `buckets`.
    async fn purge(
        &self,
        status: TaskStatus,
        buckets: Range<u32>,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, TaskStoreError>;

    async fn status_counts(&self, now: DateTime<Utc>) -> Result<StatusCounts, TaskStoreError>;
}

/// A caller-owned transaction that outbox rows can be written into.
///
/// Business code performs its own writes through the concrete transaction
/// type and adds tasks via `insert_task`; both commit or neither does.
#[async_trait::async_trait]
pub trait TaskTransaction: Send {
    async fn insert_task(&mut self, task: NewTask, now: DateTime<Utc>) -> Result<InsertOutcome, TaskStoreError>;

    async fn commit(self) -> Result<(), TaskStoreError>;

    async fn rollback(self) -> Result<(), TaskStoreError>;
}

#[async_trait::async_trait]
impl<S: TaskStore + ?Sized> TaskStore for Arc<S> {
    fn shard_map(&self) -> &ShardMap {
        (**self).shard_map()
    }

    async fn insert(&self, task: NewTask, now: DateTime<Utc>) -> Result<InsertOutcome, TaskStoreError> {
        (**self).insert(task, now).await
    }

    async fn get(&self, key: TaskKey) -> Result<Option<TaskRecord>, TaskStoreError> {
        (**self).get(key).await
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<TaskRecord>, TaskStoreError> {
        (**self).find_by_id(id).await
    }

    async fn claim_batch(
        &self,
        shard: ShardId,
        buckets: &[BucketId],
        lease: &Lease,
        limit: u32,
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        (**self).claim_batch(shard, buckets, lease, limit).await
    }

    async fn claim_by_ids(
        &self,
        shard: ShardId,
        ids: &[TaskId],
        lease: &Lease,
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        (**self).claim_by_ids(shard, ids, lease).await
    }

    async fn load_by_ids(&self, shard: ShardId, ids: &[TaskId]) -> Result<Vec<TaskRecord>, TaskStoreError> {
        (**self).load_by_ids(shard, ids).await
    }

    async fn mark_sent(&self, key: TaskKey, owner: &InstanceId, now: DateTime<Utc>) -> Result<bool, TaskStoreError> {
        (**self).mark_sent(key, owner, now).await
    }

    async fn mark_failed(
        &self,
        key: TaskKey,
        owner: &InstanceId,
        failure: &FailureUpdate,
    ) -> Result<bool, TaskStoreError> {
        (**self).mark_failed(key, owner, failure).await
    }

    async fn mark_dead(
        &self,
        key: TaskKey,
        owner: &InstanceId,
        retry_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        (**self).mark_dead(key, owner, retry_count, error, now).await
    }

    async fn release_lock(&self, key: TaskKey, owner: &InstanceId, now: DateTime<Utc>) -> Result<bool, TaskStoreError> {
        (**self).release_lock(key, owner, now).await
    }

    async fn extend_lease(
        &self,
        key: TaskKey,
        owner: &InstanceId,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        (**self).extend_lease(key, owner, until, now).await
    }

    async fn recover_stuck(&self, now: DateTime<Utc>) -> Result<u64, TaskStoreError> {
        (**self).recover_stuck(now).await
    }

    async fn reset_dead_to_new(&self, key: TaskKey, now: DateTime<Utc>) -> Result<bool, TaskStoreError> {
        (**self).reset_dead_to_new(key, now).await
    }

    async fn list_dead_letters(&self, filter: &DeadLetterFilter, page: Page) -> Result<Vec<TaskRecord>, TaskStoreError> {
        (**self).list_dead_letters(filter, page).await
    }

    async fn find_dead(&self, business_key: &str, task_type: Option<&str>) -> Result<Vec<TaskRecord>, TaskStoreError> {
        (**self).find_dead(business_key, task_type).await
    }

    async fn purge(
        &self,
        status: TaskStatus,
        buckets: Range<u32>,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, TaskStoreError> {
        (**self).purge(status, buckets, cutoff).await
    }

    async fn status_counts(&self, now: DateTime<Utc>) -> Result<StatusCounts, TaskStoreError> {
        (**self).status_counts(now).await
    }
}
