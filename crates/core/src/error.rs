//! Core error model.

use thiserror::Error;

use crate::task::TaskStatus;

/// Result type used across the core layer.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Deterministic failures raised by pure outbox logic.
///
/// Storage, transport and runtime failures live in `outboxd-infra`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutboxError {
    /// A value failed validation (e.g. empty business key).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A status change not permitted by the task state machine.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    /// An identifier or enum literal failed to parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested record does not exist.
    #[error("not found")]
    NotFound,
}

impl OutboxError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn transition(from: TaskStatus, to: TaskStatus) -> Self {
        Self::InvalidTransition { from, to }
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}
