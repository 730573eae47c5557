use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use outboxd_core::clock::saturating_add;
use outboxd_core::NodeId;

use super::r#trait::{NodeRecord, NodeRegistry, NodeRegistryError};

/// In-memory node registry.
///
/// Intended for tests/dev; several engines sharing one `Arc` behave like
/// instances sharing one database table.
#[derive(Debug, Default)]
pub struct InMemoryNodeRegistry {
    nodes: RwLock<BTreeMap<NodeId, NodeRecord>>,
}

impl InMemoryNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned() -> NodeRegistryError {
    NodeRegistryError::Storage("lock poisoned".to_string())
}

#[async_trait::async_trait]
impl NodeRegistry for InMemoryNodeRegistry {
    async fn register(&self, node_id: &NodeId, now: DateTime<Utc>, ttl: Duration) -> Result<NodeRecord, NodeRegistryError> {
        let mut nodes = self.nodes.write().map_err(|_| poisoned())?;
        let record = nodes
            .entry(node_id.clone())
            .and_modify(|existing| {
                existing.expires_at = saturating_add(now, ttl);
                existing.last_heartbeat_at = now;
            })
            .or_insert_with(|| NodeRecord::new(node_id.clone(), now, ttl));
        Ok(record.clone())
    }

    async fn heartbeat(&self, node_id: &NodeId, now: DateTime<Utc>, ttl: Duration) -> Result<bool, NodeRegistryError> {
        let mut nodes = self.nodes.write().map_err(|_| poisoned())?;
        match nodes.get_mut(node_id) {
            Some(record) => {
                record.expires_at = saturating_add(now, ttl);
                record.last_heartbeat_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_live(&self, now: DateTime<Utc>) -> Result<Vec<NodeRecord>, NodeRegistryError> {
        let nodes = self.nodes.read().map_err(|_| poisoned())?;
        // BTreeMap iteration is already ordered by node_id.
        Ok(nodes
            .values()
            .filter(|record| record.is_live(now))
            .cloned()
            .collect())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>, limit: u32) -> Result<u64, NodeRegistryError> {
        let mut nodes = self.nodes.write().map_err(|_| poisoned())?;
        let mut expired: Vec<(DateTime<Utc>, NodeId)> = nodes
            .values()
            .filter(|record| record.expires_at <= now)
            .map(|record| (record.expires_at, record.node_id.clone()))
            .collect();
        expired.sort();
        expired.truncate(limit as usize);

        for (_, node_id) in &expired {
            nodes.remove(node_id);
        }
        Ok(expired.len() as u64)
    }

    async fn set_enabled(&self, node_id: &NodeId, enabled: bool) -> Result<bool, NodeRegistryError> {
        let mut nodes = self.nodes.write().map_err(|_| poisoned())?;
        match nodes.get_mut(node_id) {
            Some(record) => {
                record.enabled = enabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn deregister(&self, node_id: &NodeId) -> Result<bool, NodeRegistryError> {
        let mut nodes = self.nodes.write().map_err(|_| poisoned())?;
        Ok(nodes.remove(node_id).is_some())
    }

    async fn get(&self, node_id: &NodeId) -> Result<Option<NodeRecord>, NodeRegistryError> {
        let nodes = self.nodes.read().map_err(|_| poisoned())?;
        Ok(nodes.get(node_id).cloned())
    }
}
