//! Idempotent DDL for the task tables and the node table.

use sqlx::PgPool;
use tracing::info;

use outboxd_core::{ShardMap, BUCKET_COUNT};

use super::postgres::{map_sqlx_error, shard_table};
use super::r#trait::TaskStoreError;
use crate::config::TableName;

pub fn sequence_name(table: &TableName) -> String {
    format!("{}_id_seq", table.as_str())
}

pub fn node_table(table: &TableName) -> String {
    format!("{}_node", table.as_str())
}

/// Every statement `ensure_schema` runs, in order.
pub fn statements(table: &TableName, shards: &ShardMap) -> Vec<String> {
    let seq = sequence_name(table);
    let mut ddl = vec![format!("CREATE SEQUENCE IF NOT EXISTS {seq}")];

    for shard in shards.shards() {
        let t = shard_table(table, shard);
        ddl.push(format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                id             BIGINT PRIMARY KEY DEFAULT nextval('{seq}'),
                task_type      TEXT NOT NULL,
                business_key   TEXT NOT NULL,
                partition_key  TEXT NOT NULL,
                bucket_id      INTEGER NOT NULL CHECK (bucket_id >= 0 AND bucket_id < {BUCKET_COUNT}),
                payload        TEXT NOT NULL,
                topic          TEXT NULL,
                tag            TEXT NULL,
                message_key    TEXT NULL,
                status         TEXT NOT NULL
                               CHECK (status IN ('NEW', 'PROCESSING', 'SENT', 'FAILED', 'DEAD')),
                retry_count    INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
                next_retry_at  TIMESTAMPTZ NULL,
                lock_owner     TEXT NULL,
                locked_at      TIMESTAMPTZ NULL,
                lock_until     TIMESTAMPTZ NULL,
                last_error     VARCHAR(500) NULL,
                created_at     TIMESTAMPTZ NOT NULL,
                updated_at     TIMESTAMPTZ NOT NULL,
                completed_at   TIMESTAMPTZ NULL,
                CONSTRAINT {t}_type_key_uq UNIQUE (task_type, business_key)
            )
            "#
        ));
        ddl.push(format!(
            "CREATE INDEX IF NOT EXISTS {t}_claim_idx ON {t} (bucket_id, status, next_retry_at, id)"
        ));
        ddl.push(format!(
            "CREATE INDEX IF NOT EXISTS {t}_lease_idx ON {t} (lock_until) WHERE status = 'PROCESSING'"
        ));
        ddl.push(format!(
            "CREATE INDEX IF NOT EXISTS {t}_retention_idx ON {t} (status, created_at)"
        ));
    }

    let nodes = node_table(table);
    ddl.push(format!(
        r#"
        CREATE TABLE IF NOT EXISTS {nodes} (
            node_id            TEXT PRIMARY KEY,
            enabled            BOOLEAN NOT NULL DEFAULT TRUE,
            expires_at         TIMESTAMPTZ NOT NULL,
            registered_at      TIMESTAMPTZ NOT NULL,
            last_heartbeat_at  TIMESTAMPTZ NOT NULL
        )
        "#
    ));
    ddl.push(format!(
        "CREATE INDEX IF NOT EXISTS {nodes}_expires_idx ON {nodes} (expires_at)"
    ));

    ddl
}

/// Create the sequence, one table per shard, and the node table.
pub async fn ensure_schema(pool: &PgPool, table: &TableName, shards: &ShardMap) -> Result<(), TaskStoreError> {
    for statement in statements(table, shards) {
        sqlx::query(&statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    }

    info!(
        table = %table,
        shard_count = shards.shard_count(),
        "outbox schema ready"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_table_per_shard_sharing_a_sequence() {
        let table = TableName::new("outbox").unwrap();
        let ddl = statements(&table, &ShardMap::new(3).unwrap());

        assert_eq!(ddl[0], "CREATE SEQUENCE IF NOT EXISTS outbox_id_seq");
        for name in ["outbox_00", "outbox_01", "outbox_02"] {
            assert!(ddl
                .iter()
                .any(|s| s.contains(&format!("CREATE TABLE IF NOT EXISTS {name} ("))));
        }
        assert_eq!(
            ddl.iter()
                .filter(|s| s.contains("nextval('outbox_id_seq')"))
                .count(),
            3
        );
        assert!(ddl.iter().any(|s| s.contains("outbox_node")));
    }
}
