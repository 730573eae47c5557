//! Handler contract and the predicate table that resolves task types.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use outboxd_core::TaskRecord;

/// Outcome of a failed handler call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Transient; retried with backoff until the budget runs out.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Will never succeed; the task goes straight to dead-letter.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) => msg,
        }
    }
}

/// Executes the side effect recorded by a task.
///
/// Delivery is at-least-once: a handler may see the same task again after a
/// lease expiry, so implementations must be idempotent.
#[async_trait::async_trait]
pub trait OutboxHandler: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, task_type: &str) -> bool;

    async fn handle(&self, task: &TaskRecord) -> Result<(), HandlerError>;
}

#[async_trait::async_trait]
impl<H: OutboxHandler + ?Sized> OutboxHandler for Arc<H> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn supports(&self, task_type: &str) -> bool {
        (**self).supports(task_type)
    }

    async fn handle(&self, task: &TaskRecord) -> Result<(), HandlerError> {
        (**self).handle(task).await
    }
}

/// Result of looking up a handler for a task type.
pub enum Resolution<'a> {
    Unique(&'a Arc<dyn OutboxHandler>),
    /// More than one handler matched; the first registered wins.
    Ambiguous {
        chosen: &'a Arc<dyn OutboxHandler>,
        others: Vec<&'a str>,
    },
    Missing,
}

impl<'a> Resolution<'a> {
    pub fn handler(&self) -> Option<&'a Arc<dyn OutboxHandler>> {
        match self {
            Resolution::Unique(h) => Some(*h),
            Resolution::Ambiguous { chosen, .. } => Some(*chosen),
            Resolution::Missing => None,
        }
    }
}

/// A task type claimed by more than one handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task type {task_type} matches handlers {handlers:?}")]
pub struct HandlerConflict {
    pub task_type: String,
    pub handlers: Vec<String>,
}

/// Ordered predicate table. Registration order decides ties.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn OutboxHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn OutboxHandler>) {
        info!(handler = %handler.name(), "outbox handler registered");
        self.handlers.push(handler);
    }

    pub fn with(mut self, handler: Arc<dyn OutboxHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn resolve(&self, task_type: &str) -> Resolution<'_> {
        let mut matching = self.handlers.iter().filter(|h| h.supports(task_type));
        let Some(chosen) = matching.next() else {
            return Resolution::Missing;
        };

        let others: Vec<&str> = matching.map(|h| h.name()).collect();
        if others.is_empty() {
            Resolution::Unique(chosen)
        } else {
            Resolution::Ambiguous { chosen, others }
        }
    }

    /// Resolve and log ambiguity at error level.
    pub fn pick(&self, task_type: &str) -> Option<&Arc<dyn OutboxHandler>> {
        let resolution = self.resolve(task_type);
        if let Resolution::Ambiguous { chosen, others } = &resolution {
            error!(
                task_type = %task_type,
                chosen = %chosen.name(),
                others = ?others,
                "multiple outbox handlers match task type"
            );
        }
        resolution.handler()
    }

    /// Startup check: every listed type resolves to exactly one handler.
    pub fn check<'t>(&self, task_types: impl IntoIterator<Item = &'t str>) -> Result<(), HandlerConflict> {
        for task_type in task_types {
            if let Resolution::Ambiguous { chosen, others } = self.resolve(task_type) {
                let mut handlers = vec![chosen.name().to_string()];
                handlers.extend(others.into_iter().map(str::to_string));
                return Err(HandlerConflict {
                    task_type: task_type.to_string(),
                    handlers,
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|h| h.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Prefix(&'static str);

    #[async_trait::async_trait]
    impl OutboxHandler for Prefix {
        fn name(&self) -> &str {
            self.0
        }

        fn supports(&self, task_type: &str) -> bool {
            task_type.starts_with(self.0)
        }

        async fn handle(&self, _task: &TaskRecord) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn first_registered_match_wins() {
        let registry = HandlerRegistry::new()
            .with(Arc::new(Prefix("REFUND")))
            .with(Arc::new(Prefix("REF")));

        match registry.resolve("REFUND_HTTP") {
            Resolution::Ambiguous { chosen, others } => {
                assert_eq!(chosen.name(), "REFUND");
                assert_eq!(others, vec!["REF"]);
            }
            _ => panic!("expected ambiguity"),
        }
        assert_eq!(registry.pick("REFUND_HTTP").unwrap().name(), "REFUND");
        assert!(matches!(registry.resolve("REFX"), Resolution::Unique(_)));
        assert!(matches!(registry.resolve("ORDER"), Resolution::Missing));
    }

    #[test]
    fn check_reports_conflicting_types() {
        let registry = HandlerRegistry::new()
            .with(Arc::new(Prefix("REFUND")))
            .with(Arc::new(Prefix("REF")));

        assert!(registry.check(["REFX", "ORDER"]).is_ok());
        let conflict = registry.check(["REFUND_HTTP"]).unwrap_err();
        assert_eq!(conflict.handlers, vec!["REFUND", "REF"]);
    }

    #[test]
    fn handler_error_carries_message() {
        assert!(HandlerError::permanent("bad").is_permanent());
        assert_eq!(HandlerError::retryable("later").message(), "later");
    }
}
