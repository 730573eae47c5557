use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use outboxd_core::clock::saturating_add;
use outboxd_core::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    /// Disabled nodes keep heartbeating but own no buckets.
    pub enabled: bool,
    pub expires_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl NodeRecord {
    pub fn new(node_id: NodeId, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            node_id,
            enabled: true,
            expires_at: saturating_add(now, ttl),
            registered_at: now,
            last_heartbeat_at: now,
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.expires_at > now
    }
}

#[derive(Debug, Clone, Error)]
pub enum NodeRegistryError {
    #[error("node not found: {0}")]
    NotFound(NodeId),

    #[error("corrupt node row: {0}")]
    Corrupt(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Registry of running instances.
///
/// Only the owning instance writes its own row, except for the
/// administrative [`NodeRegistry::set_enabled`].
#[async_trait::async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Create the row, or refresh its expiry if it already exists. An
    /// existing `enabled` flag is preserved.
    async fn register(&self, node_id: &NodeId, now: DateTime<Utc>, ttl: Duration) -> Result<NodeRecord, NodeRegistryError>;

    /// Renew `expires_at`. `false` means the row is gone (swept while this
    /// instance stalled) and the caller should re-register.
    async fn heartbeat(&self, node_id: &NodeId, now: DateTime<Utc>, ttl: Duration) -> Result<bool, NodeRegistryError>;

    /// Enabled nodes with `expires_at > now`, ordered by `node_id`.
    async fn list_live(&self, now: DateTime<Utc>) -> Result<Vec<NodeRecord>, NodeRegistryError>;

    /// Delete up to `limit` rows with `expires_at <= now`.
    async fn sweep_expired(&self, now: DateTime<Utc>, limit: u32) -> Result<u64, NodeRegistryError>;

    async fn set_enabled(&self, node_id: &NodeId, enabled: bool) -> Result<bool, NodeRegistryError>;

    async fn deregister(&self, node_id: &NodeId) -> Result<bool, NodeRegistryError>;

    async fn get(&self, node_id: &NodeId) -> Result<Option<NodeRecord>, NodeRegistryError>;
}

#[async_trait::async_trait]
impl<R: NodeRegistry + ?Sized> NodeRegistry for Arc<R> {
    async fn register(&self, node_id: &NodeId, now: DateTime<Utc>, ttl: Duration) -> Result<NodeRecord, NodeRegistryError> {
        (**self).register(node_id, now, ttl).await
    }

    async fn heartbeat(&self, node_id: &NodeId, now: DateTime<Utc>, ttl: Duration) -> Result<bool, NodeRegistryError> {
        (**self).heartbeat(node_id, now, ttl).await
    }

    async fn list_live(&self, now: DateTime<Utc>) -> Result<Vec<NodeRecord>, NodeRegistryError> {
        (**self).list_live(now).await
    }

    async fn sweep_expired(&self, now: DateTime<Utc>, limit: u32) -> Result<u64, NodeRegistryError> {
        (**self).sweep_expired(now, limit).await
    }

    async fn set_enabled(&self, node_id: &NodeId, enabled: bool) -> Result<bool, NodeRegistryError> {
        (**self).set_enabled(node_id, enabled).await
    }

    async fn deregister(&self, node_id: &NodeId) -> Result<bool, NodeRegistryError> {
        (**self).deregister(node_id).await
    }

    async fn get(&self, node_id: &NodeId) -> Result<Option<NodeRecord>, NodeRegistryError> {
        (**self).get(node_id).await
    }
}
