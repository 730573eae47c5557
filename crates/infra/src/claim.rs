//! Claim service: leases batches of eligible rows to this instance.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use outboxd_core::clock::saturating_add;
use outboxd_core::{BucketId, InstanceId, TaskKey, TaskRecord};

use crate::task_store::{Lease, TaskStore, TaskStoreError};

#[derive(Debug, Clone, Error)]
pub enum ClaimError {
    #[error(transparent)]
    Store(#[from] TaskStoreError),
}

/// Leases rows for one instance.
///
/// Every claim path goes through the store's guarded update, so two
/// instances can never hold a valid lease on the same row at once.
#[derive(Clone)]
pub struct ClaimService {
    store: Arc<dyn TaskStore>,
    instance: InstanceId,
    lease_duration: Duration,
    batch_size: u32,
}

impl ClaimService {
    pub fn new(store: Arc<dyn TaskStore>, instance: InstanceId, lease_duration: Duration, batch_size: u32) -> Self {
        Self {
            store,
            instance,
            lease_duration,
            batch_size,
        }
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    fn lease(&self, now: DateTime<Utc>) -> Lease {
        Lease::new(self.instance, now, self.lease_duration)
    }

    /// Claim up to `batch_size` rows per shard across `buckets`, returning the
    /// leased rows ordered by shard, then id.
    pub async fn claim_owned(&self, buckets: &[BucketId], now: DateTime<Utc>) -> Result<Vec<TaskRecord>, ClaimError> {
        let lease = self.lease(now);
        let mut claimed = Vec::new();

        for (shard, owned) in self.store.shard_map().group_by_shard(buckets) {
            let ids = self
                .store
                .claim_batch(shard, &owned, &lease, self.batch_size)
                .await?;
            if ids.is_empty() {
                continue;
            }

            let rows = self.store.load_by_ids(shard, &ids).await?;
            debug!(shard = %shard, claimed = rows.len(), "claimed outbox batch");
            claimed.extend(rows);
        }

        Ok(claimed)
    }

    /// Claim one specific row. `None` means it is not claimable right now
    /// (already taken, not due, or finished).
    pub async fn claim_one(&self, key: TaskKey, now: DateTime<Utc>) -> Result<Option<TaskRecord>, ClaimError> {
        let shard = self.store.shard_map().shard_for(key.bucket);
        let ids = self
            .store
            .claim_by_ids(shard, &[key.id], &self.lease(now))
            .await?;
        if ids.is_empty() {
            return Ok(None);
        }

        let mut rows = self.store.load_by_ids(shard, &ids).await?;
        Ok(rows.pop())
    }

    /// Renew the lease on a row this instance holds by a full lease period.
    pub async fn extend(&self, key: TaskKey, now: DateTime<Utc>) -> Result<bool, ClaimError> {
        let until = saturating_add(now, self.lease_duration);
        let extended = self
            .store
            .extend_lease(key, &self.instance, until, now)
            .await?;
        if !extended {
            warn!(task_id = %key.id, bucket = %key.bucket, "lease extension refused; lease lost");
        }
        Ok(extended)
    }

    /// Return expired leases to FAILED so they become claimable again.
    pub async fn recover_stuck(&self, now: DateTime<Utc>) -> Result<u64, ClaimError> {
        let recovered = self.store.recover_stuck(now).await?;
        if recovered > 0 {
            warn!(recovered, "reclaimed outbox tasks with expired leases");
        }
        Ok(recovered)
    }
}

impl std::fmt::Debug for ClaimService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimService")
            .field("instance", &self.instance)
            .field("lease_duration", &self.lease_duration)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outboxd_core::{NewTask, ShardMap, TaskStatus};

    use crate::task_store::{InMemoryTaskStore, InsertOutcome};

    const LEASE: Duration = Duration::from_secs(30);

    fn service(store: &Arc<InMemoryTaskStore>, batch: u32) -> ClaimService {
        ClaimService::new(store.clone(), InstanceId::new(), LEASE, batch)
    }

    async fn seed(store: &InMemoryTaskStore, n: usize, now: DateTime<Utc>) -> Vec<TaskRecord> {
        let mut rows = Vec::new();
        for i in 0..n {
            let task = NewTask::new("REFUND_HTTP", format!("order-{i}"), format!("store-{i}"), "{}");
            if let InsertOutcome::Inserted(row) = store.insert(task, now).await.unwrap() {
                rows.push(row);
            }
        }
        rows
    }

    #[tokio::test]
    async fn batch_size_applies_per_shard() {
        let store = InMemoryTaskStore::arc(ShardMap::new(1).unwrap());
        let now = Utc::now();
        seed(&store, 10, now).await;

        let claims = service(&store, 4);
        let all: Vec<BucketId> = BucketId::all().collect();

        let first = claims.claim_owned(&all, now).await.unwrap();
        assert_eq!(first.len(), 4);
        assert!(first.windows(2).all(|w| w[0].id < w[1].id));
        assert!(first.iter().all(|r| r.status == TaskStatus::Processing));
        assert!(first
            .iter()
            .all(|r| r.lock_owner.as_deref() == Some(claims.instance().to_string().as_str())));
    }

    #[tokio::test]
    async fn unowned_buckets_are_not_claimed() {
        let store = InMemoryTaskStore::arc(ShardMap::new(4).unwrap());
        let now = Utc::now();
        let rows = seed(&store, 6, now).await;

        let target = rows[0].bucket;
        let claims = service(&store, 50);
        let claimed = claims.claim_owned(&[target], now).await.unwrap();

        assert!(!claimed.is_empty());
        assert!(claimed.iter().all(|r| r.bucket == target));
    }

    #[tokio::test]
    async fn claim_one_loses_to_existing_lease() {
        let store = InMemoryTaskStore::arc(ShardMap::default());
        let now = Utc::now();
        let row = seed(&store, 1, now).await.remove(0);

        let a = service(&store, 50);
        let b = service(&store, 50);

        assert!(a.claim_one(row.key(), now).await.unwrap().is_some());
        assert!(b.claim_one(row.key(), now).await.unwrap().is_none());
        assert!(a.extend(row.key(), now).await.unwrap());
        assert!(!b.extend(row.key(), now).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_recovered_and_reclaimable() {
        let store = InMemoryTaskStore::arc(ShardMap::default());
        let now = Utc::now();
        let row = seed(&store, 1, now).await.remove(0);

        let a = service(&store, 50);
        let b = service(&store, 50);
        a.claim_one(row.key(), now).await.unwrap();

        let later = saturating_add(now, LEASE) + chrono::Duration::seconds(1);
        assert_eq!(b.recover_stuck(later).await.unwrap(), 1);
        assert!(b.claim_one(row.key(), later).await.unwrap().is_some());
    }
}
