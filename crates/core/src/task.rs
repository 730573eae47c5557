//! Task records and the status state machine.
//!
//! ```text
//!            claim                 success
//!   NEW ───────────────▶ PROCESSING ─────────▶ SENT
//!    ▲                   │  ▲   │
//!    │ release           │  │   │ failure, budget exhausted
//!    └───────────────────┘  │   └────────────────────────▶ DEAD
//!                 failure / │ claim (when due)              │
//!                 reclaim   ▼                               │
//!                        FAILED                             │
//!   NEW ◀───────────────────────────────────────────────────┘
//!                         manual replay
//! ```
//!
//! SENT is terminal. DEAD only leaves through an explicit replay.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bucket::{self, BucketId};
use crate::error::{OutboxError, OutboxResult};
use crate::id::TaskId;

/// Maximum stored length of `last_error`, in characters.
pub const MAX_ERROR_LEN: usize = 500;

/// Task types ending with this suffix go to the built-in transport handler.
pub const TRANSPORT_SUFFIX: &str = "_MQ";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    New,
    Processing,
    Sent,
    Failed,
    Dead,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::New => "NEW",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Sent => "SENT",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Dead => "DEAD",
        }
    }

    /// Statuses a claim may pick up (subject to due time and lease).
    pub fn is_claimable(self) -> bool {
        matches!(self, TaskStatus::New | TaskStatus::Failed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Sent | TaskStatus::Dead)
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (New, Processing)
                | (Failed, Processing)
                | (Processing, Sent)
                | (Processing, Failed)
                | (Processing, Dead)
                | (Processing, New)
                | (Dead, New)
        )
    }

    /// Validate a transition, returning the target status.
    pub fn transition(self, next: TaskStatus) -> OutboxResult<TaskStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(OutboxError::transition(self, next))
        }
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(TaskStatus::New),
            "PROCESSING" => Ok(TaskStatus::Processing),
            "SENT" => Ok(TaskStatus::Sent),
            "FAILED" => Ok(TaskStatus::Failed),
            "DEAD" => Ok(TaskStatus::Dead),
            other => Err(OutboxError::invalid_id(format!("TaskStatus: {other}"))),
        }
    }
}

/// Message-bus routing for transport tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transport {
    pub topic: Option<String>,
    pub tag: Option<String>,
    pub message_key: Option<String>,
}

impl Transport {
    pub fn new(topic: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            tag: Some(tag.into()),
            message_key: None,
        }
    }

    pub fn with_message_key(mut self, key: impl Into<String>) -> Self {
        self.message_key = Some(key.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.topic.is_none() && self.tag.is_none() && self.message_key.is_none()
    }
}

/// A task as supplied by business code, before it is routed and stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub task_type: String,
    pub business_key: String,
    pub partition_key: String,
    pub payload: String,
    pub transport: Transport,
}

impl NewTask {
    pub fn new(
        task_type: impl Into<String>,
        business_key: impl Into<String>,
        partition_key: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            task_type: task_type.into(),
            business_key: business_key.into(),
            partition_key: partition_key.into(),
            payload: payload.into(),
            transport: Transport::default(),
        }
    }

    /// Build a task whose payload is `value` serialized as JSON.
    pub fn json<T: Serialize>(
        task_type: impl Into<String>,
        business_key: impl Into<String>,
        partition_key: impl Into<String>,
        value: &T,
    ) -> OutboxResult<Self> {
        let payload = serde_json::to_string(value)
            .map_err(|e| OutboxError::validation(format!("payload serialization: {e}")))?;
        Ok(Self::new(task_type, business_key, partition_key, payload))
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn validate(&self) -> OutboxResult<()> {
        if self.task_type.trim().is_empty() {
            return Err(OutboxError::validation("task_type must not be empty"));
        }
        if self.business_key.trim().is_empty() {
            return Err(OutboxError::validation("business_key must not be empty"));
        }
        if self.partition_key.is_empty() {
            return Err(OutboxError::validation("partition_key must not be empty"));
        }
        Ok(())
    }

    /// Bucket this task is stored under.
    pub fn bucket(&self) -> BucketId {
        bucket::route(&self.partition_key)
    }
}

/// Address of a stored task: the id plus the bucket that locates its shard.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub id: TaskId,
    pub bucket: BucketId,
}

impl TaskKey {
    pub fn new(id: TaskId, bucket: BucketId) -> Self {
        Self { id, bucket }
    }
}

/// A stored outbox row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: String,
    pub business_key: String,
    pub partition_key: String,
    pub bucket: BucketId,
    pub payload: String,
    pub transport: Transport,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub lock_owner: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// A freshly enqueued row.
    pub fn from_new(id: TaskId, task: NewTask, now: DateTime<Utc>) -> Self {
        let bucket = task.bucket();
        Self {
            id,
            task_type: task.task_type,
            business_key: task.business_key,
            partition_key: task.partition_key,
            bucket,
            payload: task.payload,
            transport: task.transport,
            status: TaskStatus::New,
            retry_count: 0,
            next_retry_at: None,
            lock_owner: None,
            locked_at: None,
            lock_until: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.id, self.bucket)
    }

    /// Due for (re)processing at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// No lease is held, or the held lease has expired strictly before `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lock_until.is_none_or(|until| until < now)
    }

    /// Eligible for a claim at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.is_due(now) && self.lease_expired(now)
    }

    /// Holds a lease owned by `owner` that is still valid at `now`.
    pub fn leased_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Processing
            && self.lock_owner.as_deref() == Some(owner)
            && self.lock_until.is_some_and(|until| until >= now)
    }

    pub fn is_transport(&self) -> bool {
        self.task_type.ends_with(TRANSPORT_SUFFIX)
    }
}

/// Truncate an error message to [`MAX_ERROR_LEN`] characters.
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_LEN) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(now: DateTime<Utc>) -> TaskRecord {
        TaskRecord::from_new(
            TaskId::new(1),
            NewTask::new("REFUND_HTTP", "order-42", "store-7", "{}"),
            now,
        )
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            TaskStatus::New,
            TaskStatus::Processing,
            TaskStatus::Sent,
            TaskStatus::Failed,
            TaskStatus::Dead,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("DONE".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn state_machine_only_allows_documented_edges() {
        use TaskStatus::*;
        assert!(New.can_transition_to(Processing));
        assert!(Failed.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Dead));
        assert!(Dead.can_transition_to(New));

        assert!(Sent.transition(New).is_err());
        assert!(New.transition(Sent).is_err());
        assert!(Dead.transition(Processing).is_err());
        assert_eq!(
            Failed.transition(Sent),
            Err(OutboxError::transition(Failed, Sent))
        );
    }

    #[test]
    fn fresh_record_is_claimable() {
        let now = Utc::now();
        let rec = record(now);
        assert_eq!(rec.status, TaskStatus::New);
        assert_eq!(rec.bucket, bucket::route("store-7"));
        assert!(rec.is_claimable(now));
    }

    #[test]
    fn lease_is_valid_through_its_expiry_instant() {
        let now = Utc::now();
        let mut rec = record(now);
        rec.status = TaskStatus::Processing;
        rec.lock_owner = Some("me".into());
        rec.lock_until = Some(now);

        assert!(rec.leased_by("me", now));
        assert!(!rec.lease_expired(now));
        assert!(rec.lease_expired(now + chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn future_retry_is_not_due() {
        let now = Utc::now();
        let mut rec = record(now);
        rec.status = TaskStatus::Failed;
        rec.next_retry_at = Some(now + chrono::Duration::seconds(2));

        assert!(!rec.is_claimable(now));
        assert!(rec.is_claimable(now + chrono::Duration::seconds(2)));
    }

    #[test]
    fn new_task_validation() {
        assert!(NewTask::new("", "k", "p", "{}").validate().is_err());
        assert!(NewTask::new("T", " ", "p", "{}").validate().is_err());
        assert!(NewTask::new("T", "k", "", "{}").validate().is_err());
        assert!(NewTask::new("T", "k", "p", "").validate().is_ok());
    }

    #[test]
    fn transport_suffix_selects_transport() {
        let now = Utc::now();
        let mut rec = record(now);
        assert!(!rec.is_transport());
        rec.task_type = "ORDER_CREATED_MQ".into();
        assert!(rec.is_transport());
    }

    #[test]
    fn truncate_error_respects_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_LEN + 10);
        let truncated = truncate_error(&long);
        assert_eq!(truncated.chars().count(), MAX_ERROR_LEN);
        assert_eq!(truncate_error("short"), "short");
    }
}
