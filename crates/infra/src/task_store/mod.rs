//! Outbox row storage.
//!
//! The store is the single coordination point between instances: every claim,
//! completion, failure, release and reclaim is one guarded statement against
//! it. Nothing else writes `status` or the `lock_*` columns.

pub mod in_memory;
pub mod postgres;
pub mod schema;
pub mod r#trait;

pub use in_memory::{InMemoryTaskStore, InMemoryTaskTransaction};
pub use postgres::{PgTaskStore, PgTaskTransaction};
pub use schema::ensure_schema;
pub use r#trait::{
    DeadLetterFilter, FailureUpdate, InsertOutcome, Lease, Page, StatusCounts, TaskStore, TaskStoreError,
    TaskTransaction,
};

/// Prefix written to `last_error` by lease reclaim.
pub const RECOVER_PREFIX: &str = "[RECOVER]";

pub(crate) fn recover_message(now: chrono::DateTime<chrono::Utc>) -> String {
    format!("{RECOVER_PREFIX} lease expired, reclaimed at {}", now.to_rfc3339())
}
