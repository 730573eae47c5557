//! Operator actions: dead-letter inspection and replay, node enable/disable.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use outboxd_core::{Clock, NodeId, TaskId, TaskRecord, TaskStatus};

use crate::enqueue::EnqueueService;
use crate::registry::{NodeRegistry, NodeRegistryError};
use crate::task_store::{DeadLetterFilter, Page, TaskStore, TaskStoreError};

#[derive(Debug, Clone, Error)]
pub enum AdminError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {id} is {status}, not DEAD")]
    NotDead { id: TaskId, status: TaskStatus },

    #[error("node not found: {0}")]
    UnknownNode(NodeId),

    #[error(transparent)]
    Store(#[from] TaskStoreError),

    #[error(transparent)]
    Registry(#[from] NodeRegistryError),
}

/// Inspect and replay dead-lettered rows.
#[derive(Clone)]
pub struct DeadLetterAdmin {
    store: Arc<dyn TaskStore>,
    enqueue: EnqueueService,
    clock: Arc<dyn Clock>,
}

impl DeadLetterAdmin {
    pub fn new(store: Arc<dyn TaskStore>, enqueue: EnqueueService, clock: Arc<dyn Clock>) -> Self {
        Self { store, enqueue, clock }
    }

    /// DEAD rows matching `filter`, most recently updated first.
    pub async fn list(&self, filter: &DeadLetterFilter, page: Page) -> Result<Vec<TaskRecord>, AdminError> {
        Ok(self.store.list_dead_letters(filter, page).await?)
    }

    /// Reset one DEAD row to NEW with a fresh retry budget, then kick it.
    pub async fn replay(&self, id: TaskId) -> Result<TaskRecord, AdminError> {
        let row = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(AdminError::NotFound(id))?;
        if row.status != TaskStatus::Dead {
            return Err(AdminError::NotDead { id, status: row.status });
        }

        if !self.store.reset_dead_to_new(row.key(), self.clock.now()).await? {
            // Replayed concurrently; report what is there now.
            let current = self.store.get(row.key()).await?.ok_or(AdminError::NotFound(id))?;
            return Err(AdminError::NotDead {
                id,
                status: current.status,
            });
        }

        info!(
            task_id = %row.id,
            task_type = %row.task_type,
            business_key = %row.business_key,
            "dead-letter task replayed"
        );
        self.enqueue.kick(row.key());
        self.store
            .get(row.key())
            .await?
            .ok_or(AdminError::NotFound(id))
    }

    /// Replay every DEAD row with `business_key` (optionally narrowed by
    /// type). Returns the number of rows reset.
    pub async fn replay_business_key(&self, business_key: &str, task_type: Option<&str>) -> Result<usize, AdminError> {
        let dead = self.store.find_dead(business_key, task_type).await?;
        let now = self.clock.now();

        let mut replayed = 0;
        for row in dead {
            if self.store.reset_dead_to_new(row.key(), now).await? {
                self.enqueue.kick(row.key());
                replayed += 1;
            }
        }

        info!(business_key = %business_key, task_type = ?task_type, replayed, "dead-letter tasks replayed");
        Ok(replayed)
    }
}

impl std::fmt::Debug for DeadLetterAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterAdmin")
            .field("enqueue", &self.enqueue)
            .finish()
    }
}

/// Take nodes in and out of bucket ownership without stopping them.
#[derive(Clone)]
pub struct NodeAdmin {
    registry: Arc<dyn NodeRegistry>,
}

impl NodeAdmin {
    pub fn new(registry: Arc<dyn NodeRegistry>) -> Self {
        Self { registry }
    }

    /// A disabled node keeps heartbeating but drops out of membership at
    /// the next dispatch cycle.
    pub async fn set_enabled(&self, node_id: &NodeId, enabled: bool) -> Result<(), AdminError> {
        if !self.registry.set_enabled(node_id, enabled).await? {
            warn!(node_id = %node_id, "set_enabled on unknown node");
            return Err(AdminError::UnknownNode(node_id.clone()));
        }
        info!(node_id = %node_id, enabled, "node enabled flag changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use outboxd_core::{InstanceId, ManualClock, NewTask, ShardMap};
    use tokio::sync::mpsc;

    use crate::enqueue::{Kick, Kicker};
    use crate::registry::InMemoryNodeRegistry;
    use crate::task_store::{InMemoryTaskStore, InsertOutcome, Lease};

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn admin(store: &Arc<InMemoryTaskStore>) -> (DeadLetterAdmin, mpsc::Receiver<Kick>) {
        let clock = ManualClock::arc(now());
        let (kicker, rx) = Kicker::channel(16);
        let enqueue = EnqueueService::new(kicker, clock.clone());
        (DeadLetterAdmin::new(store.clone(), enqueue, clock), rx)
    }

    async fn kill(store: &InMemoryTaskStore, task_type: &str, business_key: &str) -> TaskRecord {
        let InsertOutcome::Inserted(row) = store
            .insert(NewTask::new(task_type, business_key, "store-7", "{}"), now())
            .await
            .unwrap()
        else {
            panic!("expected insert");
        };
        let lease = Lease::new(InstanceId::new(), now(), Duration::from_secs(30));
        let shard = store.shard_map().shard_for(row.bucket);
        store.claim_by_ids(shard, &[row.id], &lease).await.unwrap();
        assert!(store.mark_dead(row.key(), &lease.owner, 3, "boom", now()).await.unwrap());
        row
    }

    #[tokio::test]
    async fn replay_resets_budget_and_kicks() {
        let store = InMemoryTaskStore::arc(ShardMap::default());
        let (admin, mut rx) = admin(&store);
        let row = kill(&store, "REFUND_HTTP", "order-42").await;

        let listed = admin.list(&DeadLetterFilter::default(), Page::default()).await.unwrap();
        assert_eq!(listed.len(), 1);

        let replayed = admin.replay(row.id).await.unwrap();
        assert_eq!(replayed.status, TaskStatus::New);
        assert_eq!(replayed.retry_count, 0);
        assert!(replayed.last_error.is_none());
        assert!(replayed.next_retry_at.is_none());
        assert_eq!(rx.try_recv().unwrap().task, row.key());

        let again = admin.replay(row.id).await.unwrap_err();
        assert!(matches!(again, AdminError::NotDead { status: TaskStatus::New, .. }));
    }

    #[tokio::test]
    async fn replay_unknown_id_is_not_found() {
        let store = InMemoryTaskStore::arc(ShardMap::default());
        let (admin, _rx) = admin(&store);
        assert!(matches!(
            admin.replay(TaskId::new(404)).await.unwrap_err(),
            AdminError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn replay_by_business_key_respects_type_filter() {
        let store = InMemoryTaskStore::arc(ShardMap::default());
        let (admin, _rx) = admin(&store);
        kill(&store, "REFUND_HTTP", "order-42").await;
        kill(&store, "NOTIFY_HTTP", "order-42").await;
        kill(&store, "REFUND_HTTP", "order-43").await;

        assert_eq!(admin.replay_business_key("order-42", Some("NOTIFY_HTTP")).await.unwrap(), 1);
        assert_eq!(admin.replay_business_key("order-42", None).await.unwrap(), 1);

        let filter = DeadLetterFilter {
            task_type: None,
            business_key: Some("order-43".into()),
        };
        assert_eq!(admin.list(&filter, Page::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn node_admin_toggles_enabled() {
        let registry = Arc::new(InMemoryNodeRegistry::new());
        let node = NodeId::new("10.0.0.1:8080").unwrap();
        registry.register(&node, now(), Duration::from_secs(30)).await.unwrap();

        let admin = NodeAdmin::new(registry.clone());
        admin.set_enabled(&node, false).await.unwrap();
        assert!(registry.list_live(now()).await.unwrap().is_empty());

        let ghost = NodeId::new("10.0.0.9:8080").unwrap();
        assert!(matches!(
            admin.set_enabled(&ghost, true).await.unwrap_err(),
            AdminError::UnknownNode(_)
        ));
    }
}
