//! Built-in transport handler: tasks whose type ends in `_MQ` are published
//! to a message bus through a [`TransportPublisher`].

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use outboxd_core::task::TRANSPORT_SUFFIX;
use outboxd_core::{NewTask, TaskRecord, Transport};

use crate::handler::{HandlerError, OutboxHandler};

pub use in_memory::InMemoryPublisher;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamPublisher;

/// One message handed to the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    /// `topic:tag`.
    pub destination: String,
    /// Message key, falling back to the business key.
    pub routing_key: String,
    pub payload: String,
    /// Stable across redeliveries of the same task.
    pub idempotency_key: String,
}

impl TransportMessage {
    /// Build the message for a transport task. A missing topic or tag can
    /// never succeed, so it is a permanent failure.
    pub fn from_task(task: &TaskRecord) -> Result<Self, HandlerError> {
        let topic = non_blank(task.transport.topic.as_deref())
            .ok_or_else(|| HandlerError::permanent(format!("task {} has no topic", task.id)))?;
        let tag = non_blank(task.transport.tag.as_deref())
            .ok_or_else(|| HandlerError::permanent(format!("task {} has no tag", task.id)))?;

        let routing_key = non_blank(task.transport.message_key.as_deref())
            .unwrap_or(&task.business_key)
            .to_string();

        Ok(Self {
            destination: format!("{topic}:{tag}"),
            routing_key,
            payload: task.payload.clone(),
            idempotency_key: format!("{}:{}", task.task_type, task.business_key),
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("message rejected: {0}")]
    Rejected(String),
}

/// Message-bus client seam.
#[async_trait::async_trait]
pub trait TransportPublisher: Send + Sync {
    async fn publish(&self, message: TransportMessage) -> Result<(), TransportError>;
}

#[async_trait::async_trait]
impl<P: TransportPublisher + ?Sized> TransportPublisher for Arc<P> {
    async fn publish(&self, message: TransportMessage) -> Result<(), TransportError> {
        (**self).publish(message).await
    }
}

/// Handler for every `*_MQ` task type.
pub struct TransportHandler {
    publisher: Arc<dyn TransportPublisher>,
}

impl TransportHandler {
    pub const NAME: &'static str = "transport";

    pub fn new(publisher: Arc<dyn TransportPublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait::async_trait]
impl OutboxHandler for TransportHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn supports(&self, task_type: &str) -> bool {
        task_type.ends_with(TRANSPORT_SUFFIX)
    }

    async fn handle(&self, task: &TaskRecord) -> Result<(), HandlerError> {
        let message = TransportMessage::from_task(task)?;
        debug!(
            task_id = %task.id,
            destination = %message.destination,
            routing_key = %message.routing_key,
            "publishing outbox message"
        );

        // Every transport error is retried; the budget decides when to stop.
        self.publisher
            .publish(message)
            .await
            .map_err(|e| HandlerError::retryable(e.to_string()))
    }
}

/// Task type for messages to `topic`: upper-cased, `-` replaced with `_`,
/// plus the transport suffix.
pub fn message_task_type(topic: &str) -> String {
    format!("{}{TRANSPORT_SUFFIX}", topic.to_uppercase().replace('-', "_"))
}

/// Build a transport task. The business key is the message key, or
/// `topic:tag` when there is none.
pub fn message_task(
    topic: &str,
    tag: &str,
    message_key: Option<&str>,
    partition_key: impl Into<String>,
    payload: impl Into<String>,
) -> NewTask {
    let business_key = message_key.map_or_else(|| format!("{topic}:{tag}"), str::to_string);
    let mut transport = Transport::new(topic, tag);
    if let Some(key) = message_key {
        transport = transport.with_message_key(key);
    }

    NewTask::new(message_task_type(topic), business_key, partition_key, payload).with_transport(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use outboxd_core::TaskId;

    fn record(task: NewTask) -> TaskRecord {
        TaskRecord::from_new(TaskId::new(9), task, Utc::now())
    }

    #[test]
    fn message_task_derives_type_and_key() {
        let task = message_task("order-events", "CREATED", None, "store-7", "{}");
        assert_eq!(task.task_type, "ORDER_EVENTS_MQ");
        assert_eq!(task.business_key, "order-events:CREATED");

        let keyed = message_task("order-events", "CREATED", Some("order-42"), "store-7", "{}");
        assert_eq!(keyed.business_key, "order-42");
        assert_eq!(keyed.transport.message_key.as_deref(), Some("order-42"));
    }

    #[test]
    fn message_routes_to_topic_and_tag() {
        let task = record(message_task("order-events", "CREATED", Some("order-42"), "store-7", "{\"id\":42}"));
        let message = TransportMessage::from_task(&task).unwrap();

        assert_eq!(message.destination, "order-events:CREATED");
        assert_eq!(message.routing_key, "order-42");
        assert_eq!(message.payload, "{\"id\":42}");
        assert_eq!(message.idempotency_key, "ORDER_EVENTS_MQ:order-42");
    }

    #[test]
    fn routing_key_falls_back_to_business_key() {
        let task = record(
            NewTask::new("ORDER_MQ", "order-42", "store-7", "{}").with_transport(Transport::new("orders", "PAID")),
        );
        assert_eq!(TransportMessage::from_task(&task).unwrap().routing_key, "order-42");
    }

    #[test]
    fn missing_topic_is_permanent() {
        let task = record(NewTask::new("ORDER_MQ", "order-42", "store-7", "{}"));
        assert!(TransportMessage::from_task(&task).unwrap_err().is_permanent());
    }

    #[tokio::test]
    async fn publisher_failure_is_retryable() {
        let publisher = InMemoryPublisher::arc();
        publisher.fail_next(1);
        let handler = TransportHandler::new(publisher.clone());
        let task = record(message_task("orders", "PAID", None, "store-7", "{}"));

        assert!(handler.supports(&task.task_type));
        assert!(!handler.handle(&task).await.unwrap_err().is_permanent());
        handler.handle(&task).await.unwrap();
        assert_eq!(publisher.published().len(), 1);
    }
}
