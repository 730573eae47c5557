//! Redis Streams transport publisher.
//!
//! Each message is one `XADD` to a stream named after its destination, so
//! consumers subscribe per `topic:tag`:
//!
//! - **Stream Key**: `{prefix}:{topic}:{tag}` (prefix defaults to `outbox`)
//! - **Fields**: `routing_key`, `idempotency_key`, `payload`
//!
//! The redis client here is synchronous; publishing runs on the blocking pool.

use std::sync::Arc;

use tracing::instrument;

use super::{TransportError, TransportMessage, TransportPublisher};

const DEFAULT_PREFIX: &str = "outbox";

#[derive(Debug, Clone)]
pub struct RedisStreamPublisher {
    client: Arc<redis::Client>,
    prefix: String,
    max_len: Option<usize>,
}

impl RedisStreamPublisher {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, TransportError> {
        let client =
            redis::Client::open(redis_url.as_ref()).map_err(|e| TransportError::Unavailable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            prefix: DEFAULT_PREFIX.to_string(),
            max_len: None,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Trim each stream to roughly `max_len` entries (`MAXLEN ~`).
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn stream_key(&self, destination: &str) -> String {
        format!("{}:{}", self.prefix, destination)
    }

    #[instrument(
        skip(self, message),
        fields(destination = %message.destination, routing_key = %message.routing_key),
        err
    )]
    fn publish_sync(&self, message: &TransportMessage) -> Result<String, TransportError> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.stream_key(&message.destination));
        if let Some(max_len) = self.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*")
            .arg("routing_key")
            .arg(&message.routing_key)
            .arg("idempotency_key")
            .arg(&message.idempotency_key)
            .arg("payload")
            .arg(&message.payload);

        cmd.query(&mut conn)
            .map_err(|e| TransportError::Unavailable(format!("XADD failed: {}", e)))
    }
}

#[async_trait::async_trait]
impl TransportPublisher for RedisStreamPublisher {
    async fn publish(&self, message: TransportMessage) -> Result<(), TransportError> {
        let publisher = self.clone();
        tokio::task::spawn_blocking(move || publisher.publish_sync(&message))
            .await
            .map_err(|e| TransportError::Unavailable(format!("publish task failed: {}", e)))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_key_includes_prefix_and_destination() {
        let publisher = RedisStreamPublisher::new("redis://127.0.0.1:6379")
            .unwrap()
            .with_prefix("shop");
        assert_eq!(publisher.stream_key("orders:PAID"), "shop:orders:PAID");
    }
}
