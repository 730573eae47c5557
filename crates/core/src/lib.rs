//! `outboxd-core` — pure building blocks of the outbox dispatch engine.
//!
//! Nothing in this crate performs IO. Task records, the status state machine,
//! bucket routing, shard membership and retry economics are all plain values
//! and functions so that every instance (and every test) computes them the
//! same way.

pub mod bucket;
pub mod clock;
pub mod error;
pub mod id;
pub mod membership;
pub mod retry;
pub mod task;

pub use bucket::{BucketId, ShardId, ShardMap, BUCKET_COUNT};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{OutboxError, OutboxResult};
pub use id::{InstanceId, NodeId, TaskId};
pub use membership::Membership;
pub use retry::{Backoff, RetryDecision, RetryPolicy};
pub use task::{NewTask, TaskKey, TaskRecord, TaskStatus, Transport};
