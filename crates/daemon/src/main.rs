//! `outboxd`: runs one outbox dispatch instance against Postgres.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use outboxd_core::NodeId;
use outboxd_events::{DeadLetterEvent, EventBus, InMemoryEventBus};
use outboxd_infra::registry::PgNodeRegistry;
use outboxd_infra::task_store::{ensure_schema, PgTaskStore};
use outboxd_infra::transport::{RedisStreamPublisher, TransportHandler};
use outboxd_infra::{OutboxConfig, OutboxEngine};
use outboxd_observability::LogFormat;

const DEFAULT_NODE_PORT: &str = "8080";

fn node_id() -> anyhow::Result<NodeId> {
    if let Ok(id) = std::env::var("OUTBOX_NODE_ID") {
        return NodeId::new(id).context("invalid OUTBOX_NODE_ID");
    }

    let host = std::env::var("HOSTNAME").context("OUTBOX_NODE_ID or HOSTNAME must be set")?;
    let port = std::env::var("OUTBOX_NODE_PORT").unwrap_or_else(|_| DEFAULT_NODE_PORT.to_string());
    let port: u16 = port.parse().context("invalid OUTBOX_NODE_PORT")?;
    NodeId::from_addr(&host, port).context("invalid node address")
}

/// Log every dead letter as one JSON line for downstream alerting.
fn spawn_dead_letter_logger(bus: &InMemoryEventBus<DeadLetterEvent>) {
    let sub = bus.subscribe();
    tokio::task::spawn_blocking(move || {
        while let Ok(event) = sub.recv() {
            match serde_json::to_string(&event) {
                Ok(json) => tracing::error!(
                    alert = "outbox_dead_letter",
                    task_id = %event.task.id,
                    event = %json,
                    "dead-letter event"
                ),
                Err(err) => tracing::warn!(error = %err, "failed to encode dead-letter event"),
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let format = std::env::var("OUTBOX_LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse::<LogFormat>().ok())
        .unwrap_or_default();
    outboxd_observability::tracing::init(format);

    let config = OutboxConfig::from_env().context("invalid outbox configuration")?;
    let shards = config.shard_map()?;
    let node_id = node_id()?;

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = PgPoolOptions::new()
        .max_connections((config.workers.max_concurrency as u32).saturating_add(4))
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    ensure_schema(&pool, &config.table, &shards)
        .await
        .context("failed to apply outbox schema")?;

    let store = Arc::new(PgTaskStore::new(pool.clone(), config.table.clone(), shards));
    let registry = Arc::new(PgNodeRegistry::new(pool, &config.table));

    let dead_letters = Arc::new(InMemoryEventBus::<DeadLetterEvent>::new());
    spawn_dead_letter_logger(&dead_letters);

    let mut engine = OutboxEngine::new(config, node_id, store, registry).with_dead_letter_sink(dead_letters);

    match std::env::var("REDIS_URL") {
        Ok(url) => {
            let publisher = RedisStreamPublisher::new(&url).context("invalid REDIS_URL")?;
            engine = engine.with_handler(Arc::new(TransportHandler::new(Arc::new(publisher))));
            tracing::info!("transport handler enabled (redis streams)");
        }
        Err(_) => tracing::warn!("REDIS_URL not set; *_MQ tasks will be released back to NEW by this node"),
    }

    let handle = engine.start().await.context("failed to start outbox engine")?;

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    handle.shutdown().await.context("shutdown failed")?;
    Ok(())
}
