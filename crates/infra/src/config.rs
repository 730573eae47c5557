//! Engine configuration.
//!
//! Every tunable is externally supplied; defaults mirror a production
//! deployment. [`OutboxConfig::from_env`] reads `OUTBOX_*` variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `OUTBOX_TABLE` | `outbox` |
//! | `OUTBOX_SHARD_COUNT` | `32` |
//! | `OUTBOX_POLL_INTERVAL_MS` | `2000` |
//! | `OUTBOX_LEASE_SECS` | `30` |
//! | `OUTBOX_BATCH_SIZE` | `50` |
//! | `OUTBOX_MAX_RETRIES` | `20` |
//! | `OUTBOX_BACKOFF` | `exponential:2s:300s` |
//! | `OUTBOX_RECLAIM_INTERVAL_MS` | `10000` |
//! | `OUTBOX_HANDLER_TIMEOUT_SECS` | `10` |
//! | `OUTBOX_HEARTBEAT_INTERVAL_SECS` | `10` |
//! | `OUTBOX_HEARTBEAT_TIMEOUT_SECS` | `30` |
//! | `OUTBOX_NODE_SWEEP_INTERVAL_SECS` | `60` |
//! | `OUTBOX_MAX_CONCURRENCY` | `10` |
//! | `OUTBOX_KICK_QUEUE_CAPACITY` | `100` |
//! | `OUTBOX_SENT_RETENTION_DAYS` | `7` |
//! | `OUTBOX_DEAD_RETENTION_DAYS` | `90` |
//! | `OUTBOX_CLEANUP_BATCH_BUCKETS` | `32` |
//! | `OUTBOX_BACKLOG_WARN` | `100` |
//! | `OUTBOX_BACKLOG_ERROR` | `1000` |
//!
//! `OUTBOX_BACKOFF` accepts `fixed:5s`, `linear:1s:60s`,
//! `exponential:2s:300s` or `schedule:1s,2s,4s`. Durations take an `ms`, `s`,
//! `m` or `h` suffix.

use std::str::FromStr;
use std::time::Duration;

use outboxd_core::{Backoff, RetryPolicy, ShardMap, BUCKET_COUNT};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Base table name. Interpolated into SQL, so restricted to `[A-Za-z0-9_]+`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigError::invalid("OUTBOX_TABLE", "must not be empty"));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ConfigError::invalid(
                "OUTBOX_TABLE",
                format!("'{name}' may only contain [A-Za-z0-9_]"),
            ));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TableName {
    fn default() -> Self {
        Self("outbox".to_string())
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRegistryConfig {
    pub heartbeat_interval: Duration,
    /// A node whose last heartbeat is older than this is no longer live.
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    /// Maximum expired rows deleted per sweep.
    pub sweep_limit: u32,
}

impl Default for NodeRegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            sweep_limit: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Handler invocations running at once per instance.
    pub max_concurrency: usize,
    /// Pending post-commit kicks; overflow falls back to the periodic poll.
    pub kick_queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            kick_queue_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionConfig {
    pub sent_retention: Duration,
    pub dead_retention: Duration,
    /// Buckets covered by one delete statement.
    pub batch_buckets: u32,
    pub cleanup_interval: Duration,
    pub monitor_interval: Duration,
    pub backlog_warn: u64,
    pub backlog_error: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            sent_retention: Duration::from_secs(7 * SECS_PER_DAY),
            dead_retention: Duration::from_secs(90 * SECS_PER_DAY),
            batch_buckets: 32,
            cleanup_interval: Duration::from_secs(24 * 60 * 60),
            monitor_interval: Duration::from_secs(60),
            backlog_warn: 100,
            backlog_error: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxConfig {
    pub table: TableName,
    pub shard_count: u32,
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    /// Rows claimed per shard per cycle.
    pub batch_size: u32,
    pub retry: RetryPolicy,
    pub reclaim_interval: Duration,
    pub handler_timeout: Duration,
    pub node: NodeRegistryConfig,
    pub workers: WorkerPoolConfig,
    pub retention: RetentionConfig,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            table: TableName::default(),
            shard_count: 32,
            poll_interval: Duration::from_millis(2000),
            lease_duration: Duration::from_secs(30),
            batch_size: 50,
            retry: RetryPolicy::default(),
            reclaim_interval: Duration::from_millis(10_000),
            handler_timeout: Duration::from_secs(10),
            node: NodeRegistryConfig::default(),
            workers: WorkerPoolConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl OutboxConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("OUTBOX_TABLE") {
            cfg.table = TableName::new(v.trim())?;
        }
        if let Some(v) = get("OUTBOX_SHARD_COUNT") {
            cfg.shard_count = parse_num("OUTBOX_SHARD_COUNT", &v)?;
        }
        if let Some(v) = get("OUTBOX_POLL_INTERVAL_MS") {
            cfg.poll_interval = Duration::from_millis(parse_num("OUTBOX_POLL_INTERVAL_MS", &v)?);
        }
        if let Some(v) = get("OUTBOX_LEASE_SECS") {
            cfg.lease_duration = Duration::from_secs(parse_num("OUTBOX_LEASE_SECS", &v)?);
        }
        if let Some(v) = get("OUTBOX_BATCH_SIZE") {
            cfg.batch_size = parse_num("OUTBOX_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("OUTBOX_MAX_RETRIES") {
            cfg.retry.max_retries = parse_num("OUTBOX_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("OUTBOX_BACKOFF") {
            cfg.retry.backoff = parse_backoff(&v)?;
        }
        if let Some(v) = get("OUTBOX_RECLAIM_INTERVAL_MS") {
            cfg.reclaim_interval =
                Duration::from_millis(parse_num("OUTBOX_RECLAIM_INTERVAL_MS", &v)?);
        }
        if let Some(v) = get("OUTBOX_HANDLER_TIMEOUT_SECS") {
            cfg.handler_timeout =
                Duration::from_secs(parse_num("OUTBOX_HANDLER_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("OUTBOX_HEARTBEAT_INTERVAL_SECS") {
            cfg.node.heartbeat_interval =
                Duration::from_secs(parse_num("OUTBOX_HEARTBEAT_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = get("OUTBOX_HEARTBEAT_TIMEOUT_SECS") {
            cfg.node.heartbeat_timeout =
                Duration::from_secs(parse_num("OUTBOX_HEARTBEAT_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("OUTBOX_NODE_SWEEP_INTERVAL_SECS") {
            cfg.node.sweep_interval =
                Duration::from_secs(parse_num("OUTBOX_NODE_SWEEP_INTERVAL_SECS", &v)?);
        }
        if let Some(v) = get("OUTBOX_MAX_CONCURRENCY") {
            cfg.workers.max_concurrency = parse_num("OUTBOX_MAX_CONCURRENCY", &v)?;
        }
        if let Some(v) = get("OUTBOX_KICK_QUEUE_CAPACITY") {
            cfg.workers.kick_queue_capacity = parse_num("OUTBOX_KICK_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = get("OUTBOX_SENT_RETENTION_DAYS") {
            cfg.retention.sent_retention = days("OUTBOX_SENT_RETENTION_DAYS", parse_num("OUTBOX_SENT_RETENTION_DAYS", &v)?)?;
        }
        if let Some(v) = get("OUTBOX_DEAD_RETENTION_DAYS") {
            cfg.retention.dead_retention = days("OUTBOX_DEAD_RETENTION_DAYS", parse_num("OUTBOX_DEAD_RETENTION_DAYS", &v)?)?;
        }
        if let Some(v) = get("OUTBOX_CLEANUP_BATCH_BUCKETS") {
            cfg.retention.batch_buckets = parse_num("OUTBOX_CLEANUP_BATCH_BUCKETS", &v)?;
        }
        if let Some(v) = get("OUTBOX_BACKLOG_WARN") {
            cfg.retention.backlog_warn = parse_num("OUTBOX_BACKLOG_WARN", &v)?;
        }
        if let Some(v) = get("OUTBOX_BACKLOG_ERROR") {
            cfg.retention.backlog_error = parse_num("OUTBOX_BACKLOG_ERROR", &v)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_count == 0 || self.shard_count > BUCKET_COUNT {
            return Err(ConfigError::invalid(
                "OUTBOX_SHARD_COUNT",
                format!("must be in [1, {BUCKET_COUNT}]"),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("OUTBOX_BATCH_SIZE", "must be positive"));
        }
        if self.poll_interval.is_zero() || self.reclaim_interval.is_zero() {
            return Err(ConfigError::Inconsistent(
                "poll and reclaim intervals must be positive".into(),
            ));
        }
        if self.lease_duration.is_zero() {
            return Err(ConfigError::invalid("OUTBOX_LEASE_SECS", "must be positive"));
        }
        if self.handler_timeout.is_zero() || self.handler_timeout >= self.lease_duration {
            return Err(ConfigError::Inconsistent(format!(
                "handler timeout ({:?}) must be positive and shorter than the lease ({:?})",
                self.handler_timeout, self.lease_duration
            )));
        }
        self.retry
            .validate()
            .map_err(|e| ConfigError::invalid("OUTBOX_BACKOFF", e.to_string()))?;
        if self.node.heartbeat_interval.is_zero()
            || self.node.heartbeat_timeout <= self.node.heartbeat_interval
        {
            return Err(ConfigError::Inconsistent(
                "heartbeat timeout must exceed a positive heartbeat interval".into(),
            ));
        }
        if self.workers.max_concurrency == 0 || self.workers.kick_queue_capacity == 0 {
            return Err(ConfigError::Inconsistent(
                "worker concurrency and kick queue capacity must be positive".into(),
            ));
        }
        for (key, value) in [
            ("OUTBOX_LEASE_SECS", self.lease_duration),
            ("OUTBOX_HEARTBEAT_TIMEOUT_SECS", self.node.heartbeat_timeout),
            ("OUTBOX_SENT_RETENTION_DAYS", self.retention.sent_retention),
            ("OUTBOX_DEAD_RETENTION_DAYS", self.retention.dead_retention),
        ] {
            if value > MAX_DURATION {
                return Err(ConfigError::invalid(key, format!("{value:?} exceeds {MAX_DURATION:?}")));
            }
        }
        if self.retention.batch_buckets == 0 {
            return Err(ConfigError::invalid("OUTBOX_CLEANUP_BATCH_BUCKETS", "must be positive"));
        }
        if self.retention.backlog_warn > self.retention.backlog_error {
            return Err(ConfigError::Inconsistent(
                "backlog warn threshold exceeds error threshold".into(),
            ));
        }
        Ok(())
    }

    pub fn shard_map(&self) -> Result<ShardMap, ConfigError> {
        ShardMap::new(self.shard_count)
            .map_err(|e| ConfigError::invalid("OUTBOX_SHARD_COUNT", e.to_string()))
    }

    pub fn with_table(mut self, table: TableName) -> Self {
        self.table = table;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_shard_count(mut self, shard_count: u32) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease(mut self, lease: Duration, handler_timeout: Duration) -> Self {
        self.lease_duration = lease;
        self.handler_timeout = handler_timeout;
        self
    }
}

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Upper bound for every configured duration: a century.
pub const MAX_DURATION: Duration = Duration::from_secs(36_500 * SECS_PER_DAY);

fn days(key: &'static str, n: u64) -> Result<Duration, ConfigError> {
    n.checked_mul(SECS_PER_DAY)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::invalid(key, format!("{n} days overflows")))
}

fn parse_num<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(key, format!("'{raw}': {e}")))
}

/// Parse `500ms`, `2s`, `5m` or `1h`.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    let (digits, unit) = raw
        .find(|c: char| !c.is_ascii_digit())
        .map(|idx| raw.split_at(idx))
        .ok_or_else(|| ConfigError::invalid("OUTBOX_BACKOFF", format!("'{raw}' lacks a unit")))?;
    let value: u64 = digits
        .parse()
        .map_err(|e| ConfigError::invalid("OUTBOX_BACKOFF", format!("'{raw}': {e}")))?;

    let secs = |per: u64| {
        value
            .checked_mul(per)
            .map(Duration::from_secs)
            .ok_or_else(|| ConfigError::invalid("OUTBOX_BACKOFF", format!("'{raw}' overflows")))
    };
    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => secs(60)?,
        "h" => secs(3600)?,
        other => {
            return Err(ConfigError::invalid(
                "OUTBOX_BACKOFF",
                format!("unknown unit '{other}' in '{raw}'"),
            ))
        }
    };
    if duration > MAX_DURATION {
        return Err(ConfigError::invalid(
            "OUTBOX_BACKOFF",
            format!("'{raw}' exceeds {MAX_DURATION:?}"),
        ));
    }
    Ok(duration)
}

/// Parse an `OUTBOX_BACKOFF` specification.
pub fn parse_backoff(raw: &str) -> Result<Backoff, ConfigError> {
    let mut parts = raw.trim().splitn(2, ':');
    let kind = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default();

    let backoff = match kind {
        "fixed" => Backoff::Fixed(parse_duration(rest)?),
        "exponential" | "linear" => {
            let (first, max) = rest.split_once(':').ok_or_else(|| {
                ConfigError::invalid("OUTBOX_BACKOFF", format!("'{raw}' needs <base>:<max>"))
            })?;
            let first = parse_duration(first)?;
            let max = parse_duration(max)?;
            if kind == "exponential" {
                Backoff::Exponential { base: first, max }
            } else {
                Backoff::Linear { step: first, max }
            }
        }
        "schedule" => Backoff::Schedule(
            rest.split(',')
                .map(parse_duration)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        other => {
            return Err(ConfigError::invalid(
                "OUTBOX_BACKOFF",
                format!("unknown strategy '{other}'"),
            ));
        }
    };

    backoff
        .validate()
        .map_err(|e| ConfigError::invalid("OUTBOX_BACKOFF", e.to_string()))?;
    Ok(backoff)
}
