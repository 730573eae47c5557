//! Postgres-backed node registry over `{table}_node`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{instrument, Span};

use outboxd_core::clock::saturating_add;
use outboxd_core::NodeId;

use super::r#trait::{NodeRecord, NodeRegistry, NodeRegistryError};
use crate::config::TableName;
use crate::task_store::schema::node_table;

const COLUMNS: &str = "node_id, enabled, expires_at, registered_at, last_heartbeat_at";

#[derive(Debug, Clone)]
pub struct PgNodeRegistry {
    pool: Arc<PgPool>,
    table: String,
}

impl PgNodeRegistry {
    pub fn new(pool: PgPool, table: &TableName) -> Self {
        Self {
            pool: Arc::new(pool),
            table: node_table(table),
        }
    }
}

#[async_trait::async_trait]
impl NodeRegistry for PgNodeRegistry {
    #[instrument(skip(self), fields(node_id = %node_id), err)]
    async fn register(&self, node_id: &NodeId, now: DateTime<Utc>, ttl: Duration) -> Result<NodeRecord, NodeRegistryError> {
        let sql = format!(
            r#"
            INSERT INTO {table} (node_id, enabled, expires_at, registered_at, last_heartbeat_at)
            VALUES ($1, TRUE, $2, $3, $3)
            ON CONFLICT (node_id) DO UPDATE
            SET expires_at = EXCLUDED.expires_at, last_heartbeat_at = EXCLUDED.last_heartbeat_at
            RETURNING {COLUMNS}
            "#,
            table = self.table,
        );
        let row = sqlx::query(&sql)
            .bind(node_id.as_str())
            .bind(saturating_add(now, ttl))
            .bind(now)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("register", e))?;

        decode(&row)
    }

    #[instrument(skip(self), fields(node_id = %node_id), err)]
    async fn heartbeat(&self, node_id: &NodeId, now: DateTime<Utc>, ttl: Duration) -> Result<bool, NodeRegistryError> {
        let sql = format!(
            "UPDATE {table} SET expires_at = $2, last_heartbeat_at = $3 WHERE node_id = $1",
            table = self.table,
        );
        let result = sqlx::query(&sql)
            .bind(node_id.as_str())
            .bind(saturating_add(now, ttl))
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("heartbeat", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(live), err)]
    async fn list_live(&self, now: DateTime<Utc>) -> Result<Vec<NodeRecord>, NodeRegistryError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {table} WHERE enabled AND expires_at > $1 ORDER BY node_id ASC",
            table = self.table,
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_live", e))?;

        let live = rows.iter().map(decode).collect::<Result<Vec<_>, _>>()?;
        Span::current().record("live", live.len());
        Ok(live)
    }

    #[instrument(skip(self), fields(swept), err)]
    async fn sweep_expired(&self, now: DateTime<Utc>, limit: u32) -> Result<u64, NodeRegistryError> {
        let sql = format!(
            r#"
            DELETE FROM {table}
            WHERE node_id IN (
                SELECT node_id FROM {table}
                WHERE expires_at <= $1
                ORDER BY expires_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            "#,
            table = self.table,
        );
        let result = sqlx::query(&sql)
            .bind(now)
            .bind(i64::from(limit))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("sweep_expired", e))?;

        Span::current().record("swept", result.rows_affected());
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(node_id = %node_id), err)]
    async fn set_enabled(&self, node_id: &NodeId, enabled: bool) -> Result<bool, NodeRegistryError> {
        let sql = format!("UPDATE {table} SET enabled = $2 WHERE node_id = $1", table = self.table);
        let result = sqlx::query(&sql)
            .bind(node_id.as_str())
            .bind(enabled)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_enabled", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(node_id = %node_id), err)]
    async fn deregister(&self, node_id: &NodeId) -> Result<bool, NodeRegistryError> {
        let sql = format!("DELETE FROM {table} WHERE node_id = $1", table = self.table);
        let result = sqlx::query(&sql)
            .bind(node_id.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("deregister", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(node_id = %node_id), err)]
    async fn get(&self, node_id: &NodeId) -> Result<Option<NodeRecord>, NodeRegistryError> {
        let sql = format!("SELECT {COLUMNS} FROM {table} WHERE node_id = $1", table = self.table);
        let row = sqlx::query(&sql)
            .bind(node_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode).transpose()
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> NodeRegistryError {
    match err {
        sqlx::Error::Database(db_err) => {
            NodeRegistryError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => NodeRegistryError::Storage(format!("connection pool closed in {}", operation)),
        _ => NodeRegistryError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn decode(row: &PgRow) -> Result<NodeRecord, NodeRegistryError> {
    let row = NodeRow::from_row(row).map_err(|e| NodeRegistryError::Corrupt(format!("failed to decode node row: {e}")))?;
    NodeRecord::try_from(row)
}

// SQLx row types

#[derive(Debug)]
struct NodeRow {
    node_id: String,
    enabled: bool,
    expires_at: DateTime<Utc>,
    registered_at: DateTime<Utc>,
    last_heartbeat_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for NodeRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(NodeRow {
            node_id: row.try_get("node_id")?,
            enabled: row.try_get("enabled")?,
            expires_at: row.try_get("expires_at")?,
            registered_at: row.try_get("registered_at")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        })
    }
}

impl TryFrom<NodeRow> for NodeRecord {
    type Error = NodeRegistryError;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        Ok(NodeRecord {
            node_id: NodeId::new(row.node_id).map_err(|e| NodeRegistryError::Corrupt(e.to_string()))?,
            enabled: row.enabled,
            expires_at: row.expires_at,
            registered_at: row.registered_at,
            last_heartbeat_at: row.last_heartbeat_at,
        })
    }
}
