//! Retention cleanup and backlog monitoring.

use std::ops::Range;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use outboxd_core::clock::saturating_sub;
use outboxd_core::{TaskStatus, BUCKET_COUNT};

use crate::config::RetentionConfig;
use crate::task_store::{StatusCounts, TaskStore, TaskStoreError};

/// Rows removed by one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub sent: u64,
    pub dead: u64,
}

impl CleanupReport {
    pub fn total(&self) -> u64 {
        self.sent + self.dead
    }
}

/// Deletes finished rows past their retention window.
///
/// Buckets are walked in ranges of `batch_buckets` so a single statement
/// never scans the whole table.
#[derive(Clone)]
pub struct CleanupTask {
    store: Arc<dyn TaskStore>,
    config: RetentionConfig,
}

impl CleanupTask {
    pub fn new(store: Arc<dyn TaskStore>, config: RetentionConfig) -> Self {
        Self { store, config }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<CleanupReport, TaskStoreError> {
        let report = CleanupReport {
            sent: self
                .purge(TaskStatus::Sent, saturating_sub(now, self.config.sent_retention))
                .await?,
            dead: self
                .purge(TaskStatus::Dead, saturating_sub(now, self.config.dead_retention))
                .await?,
        };

        if report.total() > 0 {
            info!(sent = report.sent, dead = report.dead, "outbox retention cleanup removed rows");
        }
        Ok(report)
    }

    async fn purge(&self, status: TaskStatus, cutoff: DateTime<Utc>) -> Result<u64, TaskStoreError> {
        let mut removed = 0;
        for range in bucket_ranges(self.config.batch_buckets) {
            let n = self.store.purge(status, range.clone(), cutoff).await?;
            if n > 0 {
                debug!(status = %status, buckets = ?range, removed = n, "purged outbox rows");
            }
            removed += n;
        }
        Ok(removed)
    }
}

/// Consecutive bucket ranges of width `step` covering every bucket.
pub fn bucket_ranges(step: u32) -> impl Iterator<Item = Range<u32>> {
    let step = step.clamp(1, BUCKET_COUNT);
    (0..BUCKET_COUNT)
        .step_by(step as usize)
        .map(move |start| start..(start + step).min(BUCKET_COUNT))
}

/// Severity of the current backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BacklogLevel {
    Normal,
    Warn,
    Error,
}

/// Logs when due-but-unprocessed rows pile up.
#[derive(Clone)]
pub struct BacklogMonitor {
    store: Arc<dyn TaskStore>,
    warn_at: u64,
    error_at: u64,
}

impl BacklogMonitor {
    pub fn new(store: Arc<dyn TaskStore>, config: &RetentionConfig) -> Self {
        Self {
            store,
            warn_at: config.backlog_warn,
            error_at: config.backlog_error,
        }
    }

    pub fn level(&self, due: u64) -> BacklogLevel {
        if due > self.error_at {
            BacklogLevel::Error
        } else if due > self.warn_at {
            BacklogLevel::Warn
        } else {
            BacklogLevel::Normal
        }
    }

    pub async fn check(&self, now: DateTime<Utc>) -> Result<(StatusCounts, BacklogLevel), TaskStoreError> {
        let counts = self.store.status_counts(now).await?;
        let level = self.level(counts.due);

        match level {
            BacklogLevel::Error => error!(
                alert = "outbox_backlog",
                due = counts.due,
                processing = counts.processing,
                dead = counts.dead,
                threshold = self.error_at,
                "outbox backlog critical"
            ),
            BacklogLevel::Warn => warn!(
                due = counts.due,
                processing = counts.processing,
                dead = counts.dead,
                threshold = self.warn_at,
                "outbox backlog growing"
            ),
            BacklogLevel::Normal => debug!(
                new = counts.new,
                processing = counts.processing,
                sent = counts.sent,
                failed = counts.failed,
                dead = counts.dead,
                due = counts.due,
                "outbox status"
            ),
        }
        Ok((counts, level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use outboxd_core::{InstanceId, NewTask, ShardMap};
    use proptest::prelude::*;

    use crate::task_store::{InMemoryTaskStore, InsertOutcome, Lease};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn retention() -> RetentionConfig {
        RetentionConfig {
            batch_buckets: 100,
            backlog_warn: 2,
            backlog_error: 4,
            ..RetentionConfig::default()
        }
    }

    async fn finish(store: &InMemoryTaskStore, key: &str, dead: bool) {
        let InsertOutcome::Inserted(row) = store
            .insert(NewTask::new("REFUND_HTTP", key, key, "{}"), t0())
            .await
            .unwrap()
        else {
            panic!("expected insert");
        };
        let lease = Lease::new(InstanceId::new(), t0(), Duration::from_secs(30));
        let shard = store.shard_map().shard_for(row.bucket);
        store.claim_by_ids(shard, &[row.id], &lease).await.unwrap();
        if dead {
            store.mark_dead(row.key(), &lease.owner, 1, "boom", t0()).await.unwrap();
        } else {
            store.mark_sent(row.key(), &lease.owner, t0()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn cleanup_honours_each_retention_window() {
        let store = InMemoryTaskStore::arc(ShardMap::new(4).unwrap());
        for i in 0..5 {
            finish(&store, &format!("sent-{i}"), false).await;
        }
        finish(&store, "dead-0", true).await;
        store
            .insert(NewTask::new("REFUND_HTTP", "pending", "p", "{}"), t0())
            .await
            .unwrap();

        let cleanup = CleanupTask::new(store.clone(), retention());

        let early = cleanup.run(t0() + chrono::Duration::days(1)).await.unwrap();
        assert_eq!(early.total(), 0);

        let week = cleanup.run(t0() + chrono::Duration::days(8)).await.unwrap();
        assert_eq!(week, CleanupReport { sent: 5, dead: 0 });

        let quarter = cleanup.run(t0() + chrono::Duration::days(91)).await.unwrap();
        assert_eq!(quarter, CleanupReport { sent: 0, dead: 1 });

        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn retention_beyond_the_calendar_keeps_everything() {
        let store = InMemoryTaskStore::arc(ShardMap::new(4).unwrap());
        finish(&store, "sent-0", false).await;
        finish(&store, "dead-0", true).await;

        let config = RetentionConfig {
            sent_retention: Duration::from_secs(u64::MAX),
            dead_retention: Duration::from_secs(86_400 * 1_000_000_000),
            ..retention()
        };
        let report = CleanupTask::new(store.clone(), config)
            .run(t0() + chrono::Duration::days(365))
            .await
            .unwrap();
        assert_eq!(report.total(), 0);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn monitor_escalates_with_due_backlog() {
        let store = InMemoryTaskStore::arc(ShardMap::default());
        let monitor = BacklogMonitor::new(store.clone(), &retention());

        for i in 0..3 {
            store
                .insert(NewTask::new("REFUND_HTTP", format!("o-{i}"), "p", "{}"), t0())
                .await
                .unwrap();
        }
        let (counts, level) = monitor.check(t0()).await.unwrap();
        assert_eq!(counts.new, 3);
        assert_eq!(counts.due, 3);
        assert_eq!(level, BacklogLevel::Warn);

        for i in 3..5 {
            store
                .insert(NewTask::new("REFUND_HTTP", format!("o-{i}"), "p", "{}"), t0())
                .await
                .unwrap();
        }
        assert_eq!(monitor.check(t0()).await.unwrap().1, BacklogLevel::Error);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        #[test]
        fn bucket_ranges_tile_every_bucket(step in 0u32..2048) {
            let ranges: Vec<Range<u32>> = bucket_ranges(step).collect();
            prop_assert_eq!(ranges.first().map(|r| r.start), Some(0));
            prop_assert_eq!(ranges.last().map(|r| r.end), Some(BUCKET_COUNT));
            for pair in ranges.windows(2) {
                prop_assert_eq!(pair[0].end, pair[1].start);
            }
        }
    }
}
