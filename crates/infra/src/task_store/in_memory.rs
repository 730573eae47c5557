use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use outboxd_core::task::truncate_error;
use outboxd_core::{BucketId, InstanceId, NewTask, ShardId, ShardMap, TaskId, TaskKey, TaskRecord, TaskStatus};

use super::r#trait::{
    DeadLetterFilter, FailureUpdate, InsertOutcome, Lease, Page, StatusCounts, TaskStore, TaskStoreError,
    TaskTransaction,
};

#[derive(Debug, Default)]
struct Inner {
    rows: BTreeMap<TaskId, TaskRecord>,
    keys: HashMap<(String, String), TaskId>,
}

impl Inner {
    fn contains_key(&self, task_type: &str, business_key: &str) -> bool {
        self.keys
            .contains_key(&(task_type.to_string(), business_key.to_string()))
    }

    fn put(&mut self, row: TaskRecord) {
        self.keys
            .insert((row.task_type.clone(), row.business_key.clone()), row.id);
        self.rows.insert(row.id, row);
    }

    fn remove(&mut self, id: TaskId) {
        if let Some(row) = self.rows.remove(&id) {
            self.keys.remove(&(row.task_type, row.business_key));
        }
    }

    /// Row at `key`, provided it is PROCESSING and owned by `owner`.
    fn owned_mut(&mut self, key: TaskKey, owner: &str) -> Option<&mut TaskRecord> {
        self.rows.get_mut(&key.id).filter(|row| {
            row.bucket == key.bucket
                && row.status == TaskStatus::Processing
                && row.lock_owner.as_deref() == Some(owner)
        })
    }
}

/// In-memory task store.
///
/// Intended for tests/dev. A single lock serializes every operation, which
/// gives the same row-level exclusivity the Postgres claim gets from
/// `FOR UPDATE SKIP LOCKED`. `(task_type, business_key)` is unique across the
/// whole store.
#[derive(Debug)]
pub struct InMemoryTaskStore {
    inner: RwLock<Inner>,
    next_id: AtomicI64,
    shards: ShardMap,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new(ShardMap::default())
    }
}

impl InMemoryTaskStore {
    pub fn new(shards: ShardMap) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_id: AtomicI64::new(1),
            shards,
        }
    }

    pub fn arc(shards: ShardMap) -> Arc<Self> {
        Arc::new(Self::new(shards))
    }

    /// Open a transaction that stages rows until `commit`.
    pub fn begin(self: &Arc<Self>) -> InMemoryTaskTransaction {
        InMemoryTaskTransaction {
            store: Arc::clone(self),
            staged: Vec::new(),
        }
    }

    /// Every stored row, ordered by id.
    pub fn snapshot(&self) -> Vec<TaskRecord> {
        self.read()
            .map(|inner| inner.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.read().map(|inner| inner.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn allocate_id(&self) -> TaskId {
        TaskId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, TaskStoreError> {
        self.inner
            .read()
            .map_err(|_| TaskStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, TaskStoreError> {
        self.inner
            .write()
            .map_err(|_| TaskStoreError::Storage("lock poisoned".to_string()))
    }

    fn in_shard(&self, row: &TaskRecord, shard: ShardId) -> bool {
        self.shards.shard_for(row.bucket) == shard
    }

    fn lease_row(row: &mut TaskRecord, lease: &Lease, owner: &str) {
        row.status = TaskStatus::Processing;
        row.lock_owner = Some(owner.to_string());
        row.locked_at = Some(lease.acquired_at);
        row.lock_until = Some(lease.until);
        row.updated_at = lease.acquired_at;
    }
}

fn validated(task: &NewTask) -> Result<(), TaskStoreError> {
    task.validate()
        .map_err(|e| TaskStoreError::Invalid(e.to_string()))
}

#[async_trait::async_trait]
impl TaskStore for InMemoryTaskStore {
    fn shard_map(&self) -> &ShardMap {
        &self.shards
    }

    async fn insert(&self, task: NewTask, now: DateTime<Utc>) -> Result<InsertOutcome, TaskStoreError> {
        validated(&task)?;
        let mut inner = self.write()?;
        if inner.contains_key(&task.task_type, &task.business_key) {
            return Ok(InsertOutcome::Duplicate);
        }

        let row = TaskRecord::from_new(self.allocate_id(), task, now);
        inner.put(row.clone());
        Ok(InsertOutcome::Inserted(row))
    }

    async fn get(&self, key: TaskKey) -> Result<Option<TaskRecord>, TaskStoreError> {
        let inner = self.read()?;
        Ok(inner
            .rows
            .get(&key.id)
            .filter(|row| row.bucket == key.bucket)
            .cloned())
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<TaskRecord>, TaskStoreError> {
        Ok(self.read()?.rows.get(&id).cloned())
    }

    async fn claim_batch(
        &self,
        shard: ShardId,
        buckets: &[BucketId],
        lease: &Lease,
        limit: u32,
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        if buckets.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let owner = lease.owner_str();
        let now = lease.acquired_at;
        let mut inner = self.write()?;

        let ids: Vec<TaskId> = inner
            .rows
            .values()
            .filter(|row| self.in_shard(row, shard))
            .filter(|row| buckets.contains(&row.bucket))
            .filter(|row| row.is_claimable(now))
            .map(|row| row.id)
            .take(limit as usize)
            .collect();

        for id in &ids {
            if let Some(row) = inner.rows.get_mut(id) {
                Self::lease_row(row, lease, &owner);
            }
        }

        Ok(ids)
    }

    async fn claim_by_ids(
        &self,
        shard: ShardId,
        ids: &[TaskId],
        lease: &Lease,
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        let owner = lease.owner_str();
        let now = lease.acquired_at;
        let mut inner = self.write()?;

        let mut claimed = Vec::new();
        for id in ids {
            let Some(row) = inner.rows.get_mut(id) else {
                continue;
            };
            if self.shards.shard_for(row.bucket) != shard || !row.is_claimable(now) {
                continue;
            }
            Self::lease_row(row, lease, &owner);
            claimed.push(*id);
        }

        claimed.sort();
        Ok(claimed)
    }

    async fn load_by_ids(&self, shard: ShardId, ids: &[TaskId]) -> Result<Vec<TaskRecord>, TaskStoreError> {
        let inner = self.read()?;
        let mut rows: Vec<TaskRecord> = ids
            .iter()
            .filter_map(|id| inner.rows.get(id))
            .filter(|row| self.in_shard(row, shard))
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.id);
        Ok(rows)
    }

    async fn mark_sent(&self, key: TaskKey, owner: &InstanceId, now: DateTime<Utc>) -> Result<bool, TaskStoreError> {
        let mut inner = self.write()?;
        let Some(row) = inner.owned_mut(key, &owner.to_string()) else {
            return Ok(false);
        };

        row.status = TaskStatus::Sent;
        row.lock_owner = None;
        row.locked_at = None;
        row.lock_until = None;
        row.next_retry_at = None;
        row.completed_at = Some(now);
        row.updated_at = now;
        Ok(true)
    }

    async fn mark_failed(
        &self,
        key: TaskKey,
        owner: &InstanceId,
        failure: &FailureUpdate,
    ) -> Result<bool, TaskStoreError> {
        let mut inner = self.write()?;
        let Some(row) = inner.owned_mut(key, &owner.to_string()) else {
            return Ok(false);
        };

        row.status = TaskStatus::Failed;
        row.retry_count = failure.retry_count;
        row.next_retry_at = Some(failure.next_retry_at);
        row.last_error = Some(truncate_error(&failure.error));
        row.lock_owner = None;
        row.locked_at = None;
        row.lock_until = None;
        row.updated_at = failure.now;
        Ok(true)
    }

    async fn mark_dead(
        &self,
        key: TaskKey,
        owner: &InstanceId,
        retry_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        let mut inner = self.write()?;
        let Some(row) = inner.owned_mut(key, &owner.to_string()) else {
            return Ok(false);
        };

        row.status = TaskStatus::Dead;
        row.retry_count = retry_count;
        row.next_retry_at = None;
        row.last_error = Some(truncate_error(error));
        row.lock_owner = None;
        row.locked_at = None;
        row.lock_until = None;
        row.completed_at = Some(now);
        row.updated_at = now;
        Ok(true)
    }

    async fn release_lock(&self, key: TaskKey, owner: &InstanceId, now: DateTime<Utc>) -> Result<bool, TaskStoreError> {
        let mut inner = self.write()?;
        let Some(row) = inner.owned_mut(key, &owner.to_string()) else {
            return Ok(false);
        };

        row.status = TaskStatus::New;
        row.lock_owner = None;
        row.locked_at = None;
        row.lock_until = None;
        row.updated_at = now;
        Ok(true)
    }

    async fn extend_lease(
        &self,
        key: TaskKey,
        owner: &InstanceId,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        let mut inner = self.write()?;
        let owner = owner.to_string();
        match inner.owned_mut(key, &owner) {
            Some(row) if row.leased_by(&owner, now) => {
                row.lock_until = Some(until);
                row.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn recover_stuck(&self, now: DateTime<Utc>) -> Result<u64, TaskStoreError> {
        let mut inner = self.write()?;
        let message = super::recover_message(now);

        let mut recovered = 0;
        for row in inner.rows.values_mut() {
            if row.status == TaskStatus::Processing && row.lock_until.is_some_and(|until| until < now) {
                row.status = TaskStatus::Failed;
                row.lock_owner = None;
                row.locked_at = None;
                row.lock_until = None;
                row.next_retry_at = Some(now);
                row.last_error = Some(message.clone());
                row.updated_at = now;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn reset_dead_to_new(&self, key: TaskKey, now: DateTime<Utc>) -> Result<bool, TaskStoreError> {
        let mut inner = self.write()?;
        let Some(row) = inner
            .rows
            .get_mut(&key.id)
            .filter(|row| row.bucket == key.bucket && row.status == TaskStatus::Dead)
        else {
            return Ok(false);
        };

        row.status = TaskStatus::New;
        row.retry_count = 0;
        row.next_retry_at = None;
        row.last_error = None;
        row.completed_at = None;
        row.updated_at = now;
        Ok(true)
    }

    async fn list_dead_letters(&self, filter: &DeadLetterFilter, page: Page) -> Result<Vec<TaskRecord>, TaskStoreError> {
        let inner = self.read()?;
        let mut dead: Vec<TaskRecord> = inner
            .rows
            .values()
            .filter(|row| row.status == TaskStatus::Dead)
            .filter(|row| filter.task_type.as_deref().is_none_or(|t| row.task_type == t))
            .filter(|row| {
                filter
                    .business_key
                    .as_deref()
                    .is_none_or(|k| row.business_key == k)
            })
            .cloned()
            .collect();

        dead.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(dead
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn find_dead(&self, business_key: &str, task_type: Option<&str>) -> Result<Vec<TaskRecord>, TaskStoreError> {
        let inner = self.read()?;
        Ok(inner
            .rows
            .values()
            .filter(|row| row.status == TaskStatus::Dead && row.business_key == business_key)
            .filter(|row| task_type.is_none_or(|t| row.task_type == t))
            .cloned()
            .collect())
    }

    async fn purge(
        &self,
        status: TaskStatus,
        buckets: Range<u32>,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, TaskStoreError> {
        let mut inner = self.write()?;
        let doomed: Vec<TaskId> = inner
            .rows
            .values()
            .filter(|row| row.status == status)
            .filter(|row| buckets.contains(&row.bucket.get()))
            .filter(|row| row.created_at < cutoff)
            .map(|row| row.id)
            .collect();

        for id in &doomed {
            inner.remove(*id);
        }
        Ok(doomed.len() as u64)
    }

    async fn status_counts(&self, now: DateTime<Utc>) -> Result<StatusCounts, TaskStoreError> {
        let inner = self.read()?;
        let mut counts = StatusCounts::default();
        for row in inner.rows.values() {
            counts.record(row.status, 1);
            if row.status.is_claimable() && row.is_due(now) {
                counts.due += 1;
            }
        }
        Ok(counts)
    }
}

/// Transaction over [`InMemoryTaskStore`].
///
/// Ids are drawn at insert time, so a rolled-back transaction leaves a gap,
/// the same as a Postgres sequence.
#[derive(Debug)]
pub struct InMemoryTaskTransaction {
    store: Arc<InMemoryTaskStore>,
    staged: Vec<TaskRecord>,
}

impl InMemoryTaskTransaction {
    /// Rows staged so far.
    pub fn staged(&self) -> &[TaskRecord] {
        &self.staged
    }
}

#[async_trait::async_trait]
impl TaskTransaction for InMemoryTaskTransaction {
    async fn insert_task(&mut self, task: NewTask, now: DateTime<Utc>) -> Result<InsertOutcome, TaskStoreError> {
        validated(&task)?;

        let staged_dup = self
            .staged
            .iter()
            .any(|row| row.task_type == task.task_type && row.business_key == task.business_key);
        if staged_dup || self.store.read()?.contains_key(&task.task_type, &task.business_key) {
            return Ok(InsertOutcome::Duplicate);
        }

        let row = TaskRecord::from_new(self.store.allocate_id(), task, now);
        self.staged.push(row.clone());
        Ok(InsertOutcome::Inserted(row))
    }

    async fn commit(self) -> Result<(), TaskStoreError> {
        let mut inner = self.store.write()?;
        for row in self.staged {
            // A concurrent commit may have taken the key since staging.
            if !inner.contains_key(&row.task_type, &row.business_key) {
                inner.put(row);
            }
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), TaskStoreError> {
        Ok(())
    }
}
