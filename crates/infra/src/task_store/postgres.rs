//! Postgres-backed task store.
//!
//! Rows live in `{table}_{NN}`, one physical table per shard, all drawing ids
//! from the shared sequence `{table}_id_seq`. See [`super::schema`] for DDL.
//!
//! ## Claiming
//!
//! `claim_batch` runs in one transaction:
//!
//! 1. `SELECT id ... ORDER BY id LIMIT n FOR UPDATE SKIP LOCKED` over the
//!    owned buckets of one shard
//! 2. guarded `UPDATE ... SET status = 'PROCESSING', lock_* WHERE id = ANY(ids)`
//!    that repeats every predicate of step 1
//!
//! Concurrent claimers skip each other's locked rows instead of blocking, and
//! the guard in step 2 makes a stale read harmless.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | TaskStoreError |
//! |------------|----------------------|----------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (check constraint violation) | `23514` | `Invalid` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | ColumnDecode / Decode | N/A | `Corrupt` |
//! | Other | N/A | `Storage` |

use std::ops::Range;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{instrument, Span};

use outboxd_core::task::truncate_error;
use outboxd_core::{
    BucketId, InstanceId, NewTask, ShardId, ShardMap, TaskId, TaskKey, TaskRecord, TaskStatus, Transport,
};

use super::r#trait::{
    DeadLetterFilter, FailureUpdate, InsertOutcome, Lease, Page, StatusCounts, TaskStore, TaskStoreError,
    TaskTransaction,
};
use crate::config::TableName;

const COLUMNS: &str = "id, task_type, business_key, partition_key, bucket_id, payload, \
     topic, tag, message_key, status, retry_count, next_retry_at, lock_owner, locked_at, \
     lock_until, last_error, created_at, updated_at, completed_at";

/// Predicate shared by every claim statement. `$2` is the claim instant.
const CLAIMABLE: &str = "status IN ('NEW', 'FAILED') \
     AND (next_retry_at IS NULL OR next_retry_at <= $2) \
     AND (lock_until IS NULL OR lock_until < $2)";

/// Predicate shared by every owner-guarded update. `$1` is the id, `$2` the
/// bucket and `$3` the owner.
const OWNED: &str = "id = $1 AND bucket_id = $2 AND status = 'PROCESSING' AND lock_owner = $3";

/// Postgres-backed task store.
///
/// ## Thread Safety
///
/// `PgTaskStore` is `Send + Sync`; connections come from the shared SQLx pool.
#[derive(Debug, Clone)]
pub struct PgTaskStore {
    pool: Arc<PgPool>,
    table: TableName,
    shards: ShardMap,
}

impl PgTaskStore {
    pub fn new(pool: PgPool, table: TableName, shards: ShardMap) -> Self {
        Self {
            pool: Arc::new(pool),
            table,
            shards,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Start a transaction that business writes and outbox inserts share.
    pub async fn begin(&self) -> Result<PgTaskTransaction<'static>, TaskStoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(PgTaskTransaction::new(tx, self.table.clone(), self.shards.clone()))
    }

    fn shard_table(&self, shard: ShardId) -> String {
        shard_table(&self.table, shard)
    }

    fn table_for(&self, bucket: BucketId) -> String {
        self.shard_table(self.shards.shard_for(bucket))
    }

    async fn guarded_update(
        &self,
        operation: &str,
        sql: &str,
        key: TaskKey,
        owner: &InstanceId,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        let result = sqlx::query(sql)
            .bind(key.id.get())
            .bind(bucket_i32(key.bucket))
            .bind(owner.to_string())
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok(result.rows_affected() == 1)
    }
}

pub(crate) fn shard_table(table: &TableName, shard: ShardId) -> String {
    format!("{}_{}", table.as_str(), shard.table_suffix())
}

fn bucket_i32(bucket: BucketId) -> i32 {
    bucket.get() as i32
}

fn decode_record(row: &PgRow) -> Result<TaskRecord, TaskStoreError> {
    let row = TaskRow::from_row(row).map_err(|e| TaskStoreError::Corrupt(format!("failed to decode task row: {e}")))?;
    TaskRecord::try_from(row)
}

fn decode_all(rows: &[PgRow]) -> Result<Vec<TaskRecord>, TaskStoreError> {
    rows.iter().map(decode_record).collect()
}

/// Insert on a pooled connection (auto-commit) or inside a caller's
/// transaction.
async fn insert_row(
    conn: &mut PgConnection,
    table: &TableName,
    shards: &ShardMap,
    task: NewTask,
    now: DateTime<Utc>,
) -> Result<InsertOutcome, TaskStoreError> {
    task.validate()
        .map_err(|e| TaskStoreError::Invalid(e.to_string()))?;

    let bucket = task.bucket();
    let shard = shards.shard_for(bucket);
    let sql = format!(
        r#"
        INSERT INTO {table} (
            task_type, business_key, partition_key, bucket_id, payload,
            topic, tag, message_key, status, retry_count, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'NEW', 0, $9, $9)
        ON CONFLICT (task_type, business_key) DO NOTHING
        RETURNING {COLUMNS}
        "#,
        table = shard_table(table, shard),
    );

    let result = sqlx::query(&sql)
        .bind(&task.task_type)
        .bind(&task.business_key)
        .bind(&task.partition_key)
        .bind(bucket_i32(bucket))
        .bind(&task.payload)
        .bind(task.transport.topic.as_deref())
        .bind(task.transport.tag.as_deref())
        .bind(task.transport.message_key.as_deref())
        .bind(now)
        .fetch_optional(&mut *conn)
        .await;

    match result {
        Ok(Some(row)) => Ok(InsertOutcome::Inserted(decode_record(&row)?)),
        Ok(None) => Ok(InsertOutcome::Duplicate),
        Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::Duplicate),
        Err(e) => Err(map_sqlx_error("insert", e)),
    }
}

#[async_trait::async_trait]
impl TaskStore for PgTaskStore {
    fn shard_map(&self) -> &ShardMap {
        &self.shards
    }

    #[instrument(
        skip(self, task),
        fields(task_type = %task.task_type, business_key = %task.business_key),
        err
    )]
    async fn insert(&self, task: NewTask, now: DateTime<Utc>) -> Result<InsertOutcome, TaskStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;
        insert_row(&mut *conn, &self.table, &self.shards, task, now).await
    }

    #[instrument(skip(self), fields(task_id = %key.id, bucket = %key.bucket), err)]
    async fn get(&self, key: TaskKey) -> Result<Option<TaskRecord>, TaskStoreError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {table} WHERE id = $1 AND bucket_id = $2",
            table = self.table_for(key.bucket),
        );
        let row = sqlx::query(&sql)
            .bind(key.id.get())
            .bind(bucket_i32(key.bucket))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode_record).transpose()
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn find_by_id(&self, id: TaskId) -> Result<Option<TaskRecord>, TaskStoreError> {
        for shard in self.shards.shards() {
            let sql = format!(
                "SELECT {COLUMNS} FROM {table} WHERE id = $1",
                table = self.shard_table(shard),
            );
            let row = sqlx::query(&sql)
                .bind(id.get())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("find_by_id", e))?;

            if let Some(row) = row {
                return decode_record(&row).map(Some);
            }
        }
        Ok(None)
    }

    #[instrument(
        skip(self, buckets, lease),
        fields(shard = %shard, bucket_count = buckets.len(), claimed),
        err
    )]
    async fn claim_batch(
        &self,
        shard: ShardId,
        buckets: &[BucketId],
        lease: &Lease,
        limit: u32,
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        if buckets.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let span = Span::current();
        let table = self.shard_table(shard);
        let bucket_ids: Vec<i32> = buckets.iter().copied().map(bucket_i32).collect();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let select = format!(
            r#"
            SELECT id FROM {table}
            WHERE bucket_id = ANY($1) AND {CLAIMABLE}
            ORDER BY id
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#
        );
        let candidates: Vec<i64> = sqlx::query_scalar(&select)
            .bind(&bucket_ids)
            .bind(lease.acquired_at)
            .bind(i64::from(limit))
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        if candidates.is_empty() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("claim_batch", e))?;
            span.record("claimed", 0);
            return Ok(Vec::new());
        }

        let claimed = claim_ids(&mut *tx, &table, &candidates, lease).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        span.record("claimed", claimed.len());
        Ok(claimed)
    }

    #[instrument(skip(self, ids, lease), fields(shard = %shard, claimed), err)]
    async fn claim_by_ids(
        &self,
        shard: ShardId,
        ids: &[TaskId],
        lease: &Lease,
    ) -> Result<Vec<TaskId>, TaskStoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let raw: Vec<i64> = ids.iter().map(|id| id.get()).collect();
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("claim_by_ids", e))?;
        let claimed = claim_ids(&mut *conn, &self.shard_table(shard), &raw, lease).await?;

        Span::current().record("claimed", claimed.len());
        Ok(claimed)
    }

    #[instrument(skip(self, ids), fields(shard = %shard, count = ids.len()), err)]
    async fn load_by_ids(&self, shard: ShardId, ids: &[TaskId]) -> Result<Vec<TaskRecord>, TaskStoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let raw: Vec<i64> = ids.iter().map(|id| id.get()).collect();
        let sql = format!(
            "SELECT {COLUMNS} FROM {table} WHERE id = ANY($1) ORDER BY id",
            table = self.shard_table(shard),
        );
        let rows = sqlx::query(&sql)
            .bind(&raw)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_by_ids", e))?;

        decode_all(&rows)
    }

    #[instrument(skip(self, owner), fields(task_id = %key.id, bucket = %key.bucket), err)]
    async fn mark_sent(&self, key: TaskKey, owner: &InstanceId, now: DateTime<Utc>) -> Result<bool, TaskStoreError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'SENT', lock_owner = NULL, locked_at = NULL, lock_until = NULL,
                next_retry_at = NULL, completed_at = $4, updated_at = $4
            WHERE {OWNED}
            "#,
            table = self.table_for(key.bucket),
        );
        self.guarded_update("mark_sent", &sql, key, owner, now).await
    }

    #[instrument(
        skip(self, owner, failure),
        fields(task_id = %key.id, bucket = %key.bucket, retry_count = failure.retry_count),
        err
    )]
    async fn mark_failed(
        &self,
        key: TaskKey,
        owner: &InstanceId,
        failure: &FailureUpdate,
    ) -> Result<bool, TaskStoreError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'FAILED', retry_count = $4, next_retry_at = $5, last_error = $6,
                lock_owner = NULL, locked_at = NULL, lock_until = NULL, updated_at = $7
            WHERE {OWNED}
            "#,
            table = self.table_for(key.bucket),
        );
        let result = sqlx::query(&sql)
            .bind(key.id.get())
            .bind(bucket_i32(key.bucket))
            .bind(owner.to_string())
            .bind(failure.retry_count as i32)
            .bind(failure.next_retry_at)
            .bind(truncate_error(&failure.error))
            .bind(failure.now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_failed", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(
        skip(self, owner, error),
        fields(task_id = %key.id, bucket = %key.bucket, retry_count = retry_count),
        err
    )]
    async fn mark_dead(
        &self,
        key: TaskKey,
        owner: &InstanceId,
        retry_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'DEAD', retry_count = $4, last_error = $5, next_retry_at = NULL,
                lock_owner = NULL, locked_at = NULL, lock_until = NULL,
                completed_at = $6, updated_at = $6
            WHERE {OWNED}
            "#,
            table = self.table_for(key.bucket),
        );
        let result = sqlx::query(&sql)
            .bind(key.id.get())
            .bind(bucket_i32(key.bucket))
            .bind(owner.to_string())
            .bind(retry_count as i32)
            .bind(truncate_error(error))
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_dead", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, owner), fields(task_id = %key.id, bucket = %key.bucket), err)]
    async fn release_lock(&self, key: TaskKey, owner: &InstanceId, now: DateTime<Utc>) -> Result<bool, TaskStoreError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'NEW', lock_owner = NULL, locked_at = NULL, lock_until = NULL, updated_at = $4
            WHERE {OWNED}
            "#,
            table = self.table_for(key.bucket),
        );
        self.guarded_update("release_lock", &sql, key, owner, now).await
    }

    #[instrument(skip(self, owner), fields(task_id = %key.id, bucket = %key.bucket), err)]
    async fn extend_lease(
        &self,
        key: TaskKey,
        owner: &InstanceId,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET lock_until = $5, updated_at = $4
            WHERE {OWNED} AND lock_until >= $4
            "#,
            table = self.table_for(key.bucket),
        );
        let result = sqlx::query(&sql)
            .bind(key.id.get())
            .bind(bucket_i32(key.bucket))
            .bind(owner.to_string())
            .bind(now)
            .bind(until)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("extend_lease", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(recovered), err)]
    async fn recover_stuck(&self, now: DateTime<Utc>) -> Result<u64, TaskStoreError> {
        let message = super::recover_message(now);
        let mut recovered = 0;

        for shard in self.shards.shards() {
            let sql = format!(
                r#"
                UPDATE {table}
                SET status = 'FAILED', lock_owner = NULL, locked_at = NULL, lock_until = NULL,
                    next_retry_at = $1, last_error = $2, updated_at = $1
                WHERE status = 'PROCESSING' AND lock_until < $1
                "#,
                table = self.shard_table(shard),
            );
            let result = sqlx::query(&sql)
                .bind(now)
                .bind(&message)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("recover_stuck", e))?;
            recovered += result.rows_affected();
        }

        Span::current().record("recovered", recovered);
        Ok(recovered)
    }

    #[instrument(skip(self), fields(task_id = %key.id, bucket = %key.bucket), err)]
    async fn reset_dead_to_new(&self, key: TaskKey, now: DateTime<Utc>) -> Result<bool, TaskStoreError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'NEW', retry_count = 0, next_retry_at = NULL, last_error = NULL,
                completed_at = NULL, updated_at = $3
            WHERE id = $1 AND bucket_id = $2 AND status = 'DEAD'
            "#,
            table = self.table_for(key.bucket),
        );
        let result = sqlx::query(&sql)
            .bind(key.id.get())
            .bind(bucket_i32(key.bucket))
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("reset_dead_to_new", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, filter), fields(offset = page.offset, limit = page.limit), err)]
    async fn list_dead_letters(&self, filter: &DeadLetterFilter, page: Page) -> Result<Vec<TaskRecord>, TaskStoreError> {
        // Each shard contributes its newest offset+limit rows; the merge below
        // pages across shards.
        let window = i64::from(page.offset) + i64::from(page.limit);
        let mut dead = Vec::new();

        for shard in self.shards.shards() {
            let sql = format!(
                r#"
                SELECT {COLUMNS} FROM {table}
                WHERE status = 'DEAD'
                  AND ($1::TEXT IS NULL OR task_type = $1)
                  AND ($2::TEXT IS NULL OR business_key = $2)
                ORDER BY updated_at DESC, id DESC
                LIMIT $3
                "#,
                table = self.shard_table(shard),
            );
            let rows = sqlx::query(&sql)
                .bind(filter.task_type.as_deref())
                .bind(filter.business_key.as_deref())
                .bind(window)
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

            dead.extend(decode_all(&rows)?);
        }

        dead.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(dead
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn find_dead(&self, business_key: &str, task_type: Option<&str>) -> Result<Vec<TaskRecord>, TaskStoreError> {
        let mut dead = Vec::new();
        for shard in self.shards.shards() {
            let sql = format!(
                r#"
                SELECT {COLUMNS} FROM {table}
                WHERE status = 'DEAD' AND business_key = $1 AND ($2::TEXT IS NULL OR task_type = $2)
                ORDER BY id
                "#,
                table = self.shard_table(shard),
            );
            let rows = sqlx::query(&sql)
                .bind(business_key)
                .bind(task_type)
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("find_dead", e))?;

            dead.extend(decode_all(&rows)?);
        }
        Ok(dead)
    }

    #[instrument(
        skip(self),
        fields(status = %status, from = buckets.start, to = buckets.end, deleted),
        err
    )]
    async fn purge(
        &self,
        status: TaskStatus,
        buckets: Range<u32>,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, TaskStoreError> {
        let mut deleted = 0;
        for shard in self.shards.shards() {
            let sql = format!(
                r#"
                DELETE FROM {table}
                WHERE status = $1 AND bucket_id >= $2 AND bucket_id < $3 AND created_at < $4
                "#,
                table = self.shard_table(shard),
            );
            let result = sqlx::query(&sql)
                .bind(status.as_str())
                .bind(buckets.start as i32)
                .bind(buckets.end as i32)
                .bind(cutoff)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("purge", e))?;
            deleted += result.rows_affected();
        }

        Span::current().record("deleted", deleted);
        Ok(deleted)
    }

    #[instrument(skip(self), err)]
    async fn status_counts(&self, now: DateTime<Utc>) -> Result<StatusCounts, TaskStoreError> {
        let mut counts = StatusCounts::default();
        for shard in self.shards.shards() {
            let sql = format!(
                r#"
                SELECT status,
                       COUNT(*) AS total,
                       COUNT(*) FILTER (
                           WHERE status IN ('NEW', 'FAILED')
                             AND (next_retry_at IS NULL OR next_retry_at <= $1)
                       ) AS due
                FROM {table}
                GROUP BY status
                "#,
                table = self.shard_table(shard),
            );
            let rows = sqlx::query(&sql)
                .bind(now)
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("status_counts", e))?;

            for row in rows {
                let status: String = row
                    .try_get("status")
                    .map_err(|e| TaskStoreError::Corrupt(format!("failed to read status: {e}")))?;
                let total: i64 = row
                    .try_get("total")
                    .map_err(|e| TaskStoreError::Corrupt(format!("failed to read total: {e}")))?;
                let due: i64 = row
                    .try_get("due")
                    .map_err(|e| TaskStoreError::Corrupt(format!("failed to read due: {e}")))?;

                let status: TaskStatus = status
                    .parse()
                    .map_err(|e| TaskStoreError::Corrupt(format!("{e}")))?;
                counts.record(status, total as u64);
                counts.due += due as u64;
            }
        }
        Ok(counts)
    }
}

/// Guarded phase-two update shared by batch and single-id claims.
async fn claim_ids(
    conn: &mut PgConnection,
    table: &str,
    ids: &[i64],
    lease: &Lease,
) -> Result<Vec<TaskId>, TaskStoreError> {
    let sql = format!(
        r#"
        UPDATE {table}
        SET status = 'PROCESSING', lock_owner = $3, locked_at = $2, lock_until = $4, updated_at = $2
        WHERE id = ANY($1) AND {CLAIMABLE}
        RETURNING id
        "#
    );
    let mut claimed: Vec<i64> = sqlx::query_scalar(&sql)
        .bind(ids)
        .bind(lease.acquired_at)
        .bind(lease.owner_str())
        .bind(lease.until)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

    claimed.sort_unstable();
    Ok(claimed.into_iter().map(TaskId::new).collect())
}

/// Caller-owned Postgres transaction carrying outbox inserts.
///
/// Business writes go through [`PgTaskTransaction::conn`]; both commit
/// together.
pub struct PgTaskTransaction<'c> {
    tx: Transaction<'c, Postgres>,
    table: TableName,
    shards: ShardMap,
}

impl<'c> PgTaskTransaction<'c> {
    /// Wrap a transaction the caller already opened. `shards` must match the
    /// map the dispatching store uses.
    pub fn new(tx: Transaction<'c, Postgres>, table: TableName, shards: ShardMap) -> Self {
        Self { tx, table, shards }
    }

    pub fn conn(&mut self) -> &mut PgConnection {
        &mut *self.tx
    }
}

#[async_trait::async_trait]
impl<'c> TaskTransaction for PgTaskTransaction<'c> {
    async fn insert_task(&mut self, task: NewTask, now: DateTime<Utc>) -> Result<InsertOutcome, TaskStoreError> {
        insert_row(&mut *self.tx, &self.table, &self.shards, task, now).await
    }

    async fn commit(self) -> Result<(), TaskStoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self) -> Result<(), TaskStoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

/// Map SQLx errors to TaskStoreError.
pub(super) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TaskStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => TaskStoreError::Duplicate(msg),
                Some("23514") => TaskStoreError::Invalid(msg),
                _ => TaskStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => TaskStoreError::Storage(format!("connection pool closed in {}", operation)),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            TaskStoreError::Corrupt(format!("decode error in {}: {}", operation, err))
        }
        _ => TaskStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct TaskRow {
    id: i64,
    task_type: String,
    business_key: String,
    partition_key: String,
    bucket_id: i32,
    payload: String,
    topic: Option<String>,
    tag: Option<String>,
    message_key: Option<String>,
    status: String,
    retry_count: i32,
    next_retry_at: Option<DateTime<Utc>>,
    lock_owner: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    lock_until: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            id: row.try_get("id")?,
            task_type: row.try_get("task_type")?,
            business_key: row.try_get("business_key")?,
            partition_key: row.try_get("partition_key")?,
            bucket_id: row.try_get("bucket_id")?,
            payload: row.try_get("payload")?,
            topic: row.try_get("topic")?,
            tag: row.try_get("tag")?,
            message_key: row.try_get("message_key")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            next_retry_at: row.try_get("next_retry_at")?,
            lock_owner: row.try_get("lock_owner")?,
            locked_at: row.try_get("locked_at")?,
            lock_until: row.try_get("lock_until")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = TaskStoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str, e: outboxd_core::OutboxError| {
            TaskStoreError::Corrupt(format!("task {}: {what}: {e}", row.id))
        };

        let bucket = u32::try_from(row.bucket_id)
            .map_err(|_| TaskStoreError::Corrupt(format!("task {}: negative bucket_id", row.id)))
            .and_then(|b| BucketId::new(b).map_err(|e| corrupt("bucket_id", e)))?;
        let status: TaskStatus = row.status.parse().map_err(|e| corrupt("status", e))?;

        Ok(TaskRecord {
            id: TaskId::new(row.id),
            task_type: row.task_type,
            business_key: row.business_key,
            partition_key: row.partition_key,
            bucket,
            payload: row.payload,
            transport: Transport {
                topic: row.topic,
                tag: row.tag,
                message_key: row.message_key,
            },
            status,
            retry_count: row.retry_count.max(0) as u32,
            next_retry_at: row.next_retry_at,
            lock_owner: row.lock_owner,
            locked_at: row.locked_at,
            lock_until: row.lock_until,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}
