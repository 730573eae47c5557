//! Dead-letter notification sink.

use tracing::error;

use outboxd_events::{DeadLetterEvent, EventBus};

/// Receives one event per task that reaches DEAD.
///
/// Notification is best-effort: the DEAD row is already committed, so a
/// failed publish is logged and dropped.
pub trait DeadLetterSink: Send + Sync {
    fn notify(&self, event: DeadLetterEvent);
}

impl<B> DeadLetterSink for B
where
    B: EventBus<DeadLetterEvent>,
{
    fn notify(&self, event: DeadLetterEvent) {
        let task_id = event.task.id;
        if let Err(err) = self.publish(event) {
            error!(task_id = %task_id, error = ?err, "failed to publish dead-letter event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use outboxd_core::{NewTask, TaskId, TaskRecord};
    use outboxd_events::InMemoryEventBus;

    #[test]
    fn any_event_bus_is_a_sink() {
        let bus = Arc::new(InMemoryEventBus::<DeadLetterEvent>::new());
        let sub = bus.subscribe();
        let sink: Arc<dyn DeadLetterSink> = bus.clone();

        let now = Utc::now();
        let task = TaskRecord::from_new(TaskId::new(1), NewTask::new("REFUND_HTTP", "order-42", "s", "{}"), now);
        sink.notify(DeadLetterEvent::new(task, "refund", 2, "boom", now));

        let received = sub.drain();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].retry_count, 2);
        assert_eq!(received[0].handler_name, "refund");
    }
}
