//! Dead-letter notification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use outboxd_core::TaskRecord;

/// Emitted once per DEAD transition.
///
/// `task` is the row as it was claimed (before the DEAD update), so consumers
/// see the payload and routing exactly as the handler did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEvent {
    pub task: TaskRecord,
    pub handler_name: String,
    pub retry_count: u32,
    pub last_error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEvent {
    pub fn new(
        task: TaskRecord,
        handler_name: impl Into<String>,
        retry_count: u32,
        last_error: impl Into<String>,
        dead_lettered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task,
            handler_name: handler_name.into(),
            retry_count,
            last_error: last_error.into(),
            dead_lettered_at,
        }
    }
}
