//! Per-instance runtime: the background loops that keep one node alive and
//! dispatching.
//!
//! | Loop | Period | Work |
//! |------|--------|------|
//! | heartbeat | `node.heartbeat_interval` | renew the node row, log cluster status |
//! | dispatch | `poll_interval` + kicks | claim and process owned buckets |
//! | reclaim | `reclaim_interval` | return expired leases to FAILED |
//! | sweep | `node.sweep_interval` | delete expired node rows |
//! | cleanup | `retention.cleanup_interval` | purge old SENT/DEAD rows |
//! | monitor | `retention.monitor_interval` | log backlog levels |
//!
//! Every loop watches one shutdown channel, finishes its current iteration,
//! and exits. The node row is deleted last so its buckets move on the next
//! cycle of the surviving nodes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use outboxd_core::{Clock, InstanceId, Membership, NodeId, SystemClock};

use crate::admin::{DeadLetterAdmin, NodeAdmin};
use crate::claim::{ClaimError, ClaimService};
use crate::cleanup::{BacklogMonitor, CleanupTask};
use crate::config::{ConfigError, OutboxConfig};
use crate::dead_letter::DeadLetterSink;
use crate::dispatcher::{DispatchError, DispatchReport, Dispatcher};
use crate::enqueue::{EnqueueService, Kick, Kicker};
use crate::handler::{HandlerRegistry, OutboxHandler};
use crate::registry::{NodeRegistry, NodeRegistryError};
use crate::task_store::{TaskStore, TaskStoreError};

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] NodeRegistryError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error(transparent)]
    Store(#[from] TaskStoreError),

    #[error("no dead-letter sink configured")]
    MissingSink,
}

/// Builder for one engine instance.
pub struct OutboxEngine {
    config: OutboxConfig,
    node_id: NodeId,
    instance: InstanceId,
    store: Arc<dyn TaskStore>,
    registry: Arc<dyn NodeRegistry>,
    handlers: HandlerRegistry,
    sink: Option<Arc<dyn DeadLetterSink>>,
    clock: Arc<dyn Clock>,
}

impl OutboxEngine {
    pub fn new(
        config: OutboxConfig,
        node_id: NodeId,
        store: Arc<dyn TaskStore>,
        registry: Arc<dyn NodeRegistry>,
    ) -> Self {
        Self {
            config,
            node_id,
            instance: InstanceId::new(),
            store,
            registry,
            handlers: HandlerRegistry::new(),
            sink: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn OutboxHandler>) -> Self {
        self.handlers.register(handler);
        self
    }

    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_instance(mut self, instance: InstanceId) -> Self {
        self.instance = instance;
        self
    }

    /// Validate and wire everything without starting any loop. The returned
    /// runtime can be driven by hand, one cycle at a time.
    pub fn build(self) -> Result<(EngineRuntime, mpsc::Receiver<Kick>), EngineError> {
        self.config.validate()?;
        let sink = self.sink.ok_or(EngineError::MissingSink)?;

        let (kicker, kicks) = Kicker::channel(self.config.workers.kick_queue_capacity);
        let enqueue = EnqueueService::new(kicker, Arc::clone(&self.clock));
        let claims = ClaimService::new(
            Arc::clone(&self.store),
            self.instance,
            self.config.lease_duration,
            self.config.batch_size,
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.store),
            claims,
            Arc::new(self.handlers),
            sink,
            Arc::clone(&self.clock),
            self.config.retry.clone(),
            self.config.handler_timeout,
            self.config.workers.max_concurrency,
        );

        let runtime = EngineRuntime {
            inner: Arc::new(RuntimeInner {
                cleanup: CleanupTask::new(Arc::clone(&self.store), self.config.retention.clone()),
                monitor: BacklogMonitor::new(Arc::clone(&self.store), &self.config.retention),
                admin: DeadLetterAdmin::new(Arc::clone(&self.store), enqueue.clone(), Arc::clone(&self.clock)),
                node_admin: NodeAdmin::new(Arc::clone(&self.registry)),
                config: self.config,
                node_id: self.node_id,
                registry: self.registry,
                dispatcher,
                enqueue,
                clock: self.clock,
            }),
        };
        Ok((runtime, kicks))
    }

    /// Register the node and start every background loop.
    pub async fn start(self) -> Result<EngineHandle, EngineError> {
        let (runtime, kicks) = self.build()?;
        runtime.register().await?;

        let (shutdown, _) = watch::channel(false);
        let config = runtime.config().clone();
        let mut joins = Vec::new();

        joins.push(spawn_loop("heartbeat", config.node.heartbeat_interval, &shutdown, {
            let rt = runtime.clone();
            move || {
                let rt = rt.clone();
                async move { rt.heartbeat_once().await.map(|_| ()) }
            }
        }));
        joins.push(spawn_dispatch_loop(runtime.clone(), kicks, shutdown.subscribe()));
        joins.push(spawn_loop("reclaim", config.reclaim_interval, &shutdown, {
            let rt = runtime.clone();
            move || {
                let rt = rt.clone();
                async move { rt.reclaim_once().await.map(|_| ()) }
            }
        }));
        joins.push(spawn_loop("node-sweep", config.node.sweep_interval, &shutdown, {
            let rt = runtime.clone();
            move || {
                let rt = rt.clone();
                async move { rt.sweep_once().await.map(|_| ()) }
            }
        }));
        joins.push(spawn_loop("cleanup", config.retention.cleanup_interval, &shutdown, {
            let rt = runtime.clone();
            move || {
                let rt = rt.clone();
                async move { rt.cleanup_once().await.map(|_| ()) }
            }
        }));
        joins.push(spawn_loop("backlog-monitor", config.retention.monitor_interval, &shutdown, {
            let rt = runtime.clone();
            move || {
                let rt = rt.clone();
                async move { rt.monitor_once().await.map(|_| ()) }
            }
        }));

        info!(
            node_id = %runtime.node_id(),
            instance = %runtime.instance(),
            shard_count = config.shard_count,
            "outbox engine started"
        );
        Ok(EngineHandle {
            runtime,
            shutdown,
            joins,
        })
    }
}

struct RuntimeInner {
    config: OutboxConfig,
    node_id: NodeId,
    registry: Arc<dyn NodeRegistry>,
    dispatcher: Dispatcher,
    enqueue: EnqueueService,
    admin: DeadLetterAdmin,
    node_admin: NodeAdmin,
    cleanup: CleanupTask,
    monitor: BacklogMonitor,
    clock: Arc<dyn Clock>,
}

/// One iteration of each loop, callable directly.
#[derive(Clone)]
pub struct EngineRuntime {
    inner: Arc<RuntimeInner>,
}

impl EngineRuntime {
    pub fn config(&self) -> &OutboxConfig {
        &self.inner.config
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    pub fn instance(&self) -> &InstanceId {
        self.inner.dispatcher.claims().instance()
    }

    pub fn enqueue(&self) -> &EnqueueService {
        &self.inner.enqueue
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn dead_letters(&self) -> &DeadLetterAdmin {
        &self.inner.admin
    }

    pub fn nodes(&self) -> &NodeAdmin {
        &self.inner.node_admin
    }

    fn ttl(&self) -> Duration {
        self.inner.config.node.heartbeat_timeout
    }

    pub async fn register(&self) -> Result<(), EngineError> {
        let record = self
            .inner
            .registry
            .register(&self.inner.node_id, self.inner.clock.now(), self.ttl())
            .await?;
        info!(node_id = %record.node_id, enabled = record.enabled, "outbox node registered");
        Ok(())
    }

    /// This node's slot among live nodes, or `None` if it is not live.
    pub async fn membership(&self) -> Result<Option<Membership>, EngineError> {
        let live: Vec<NodeId> = self
            .inner
            .registry
            .list_live(self.inner.clock.now())
            .await?
            .into_iter()
            .map(|n| n.node_id)
            .collect();
        Ok(Membership::compute(&live, &self.inner.node_id))
    }

    /// Renew the node row, re-registering if it was swept.
    pub async fn heartbeat_once(&self) -> Result<Option<Membership>, EngineError> {
        let alive = self
            .inner
            .registry
            .heartbeat(&self.inner.node_id, self.inner.clock.now(), self.ttl())
            .await?;
        if !alive {
            warn!(node_id = %self.inner.node_id, "node row missing on heartbeat; re-registering");
            self.register().await?;
        }

        let membership = self.membership().await?;
        match &membership {
            Some(m) => debug!(
                node_id = %self.inner.node_id,
                live_nodes = m.live_count(),
                index = m.index(),
                owned_buckets = m.owned_count(),
                "outbox cluster status"
            ),
            None => debug!(node_id = %self.inner.node_id, "node not live; owns no buckets"),
        }
        Ok(membership)
    }

    /// Recompute ownership and dispatch every owned bucket once.
    pub async fn dispatch_once(&self) -> Result<DispatchReport, EngineError> {
        let Some(membership) = self.membership().await? else {
            debug!(node_id = %self.inner.node_id, "skipping dispatch; node not live");
            return Ok(DispatchReport::default());
        };
        Ok(self
            .inner
            .dispatcher
            .dispatch_owned(&membership.owned_buckets())
            .await?)
    }

    pub async fn reclaim_once(&self) -> Result<u64, EngineError> {
        let claims = self.inner.dispatcher.claims();
        Ok(claims.recover_stuck(self.inner.clock.now()).await?)
    }

    pub async fn sweep_once(&self) -> Result<u64, EngineError> {
        let swept = self
            .inner
            .registry
            .sweep_expired(self.inner.clock.now(), self.inner.config.node.sweep_limit)
            .await?;
        if swept > 0 {
            info!(swept, "expired outbox nodes removed");
        }
        Ok(swept)
    }

    pub async fn cleanup_once(&self) -> Result<u64, EngineError> {
        let report = self
            .inner
            .cleanup
            .run(self.inner.clock.now())
            .await?;
        Ok(report.total())
    }

    pub async fn monitor_once(&self) -> Result<u64, EngineError> {
        let (counts, _) = self
            .inner
            .monitor
            .check(self.inner.clock.now())
            .await?;
        Ok(counts.due)
    }

    pub async fn deregister(&self) -> Result<bool, EngineError> {
        let removed = self.inner.registry.deregister(&self.inner.node_id).await?;
        info!(node_id = %self.inner.node_id, removed, "outbox node deregistered");
        Ok(removed)
    }
}

impl std::fmt::Debug for EngineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntime")
            .field("node_id", &self.inner.node_id)
            .field("dispatcher", &self.inner.dispatcher)
            .finish()
    }
}

/// Handle to a running engine.
#[derive(Debug)]
pub struct EngineHandle {
    runtime: EngineRuntime,
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn runtime(&self) -> &EngineRuntime {
        &self.runtime
    }

    pub fn enqueue(&self) -> &EnqueueService {
        self.runtime.enqueue()
    }

    /// Stop every loop after its current iteration, then deregister.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(err) = join.await {
                error!(error = %err, "outbox loop panicked");
            }
        }
        self.runtime.deregister().await?;
        info!(node_id = %self.runtime.node_id(), "outbox engine stopped");
        Ok(())
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn spawn_loop<F, Fut>(name: &'static str, period: Duration, shutdown: &watch::Sender<bool>, mut step: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
{
    let mut stop = shutdown.subscribe();
    tokio::spawn(async move {
        let mut interval = ticker(period);
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = interval.tick() => {
                    if let Err(err) = step().await {
                        error!(worker = name, error = %err, "outbox loop iteration failed");
                    }
                }
            }
        }
        debug!(worker = name, "outbox loop stopped");
    })
}

fn spawn_dispatch_loop(
    runtime: EngineRuntime,
    mut kicks: mpsc::Receiver<Kick>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = ticker(runtime.config().poll_interval);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = interval.tick() => {
                    if let Err(err) = runtime.dispatch_once().await {
                        error!(worker = "dispatch", error = %err, "outbox dispatch cycle failed");
                    }
                }
                Some(kick) = kicks.recv() => {
                    let dispatcher = runtime.dispatcher().clone();
                    in_flight.spawn(async move {
                        if let Err(err) = dispatcher.dispatch_kick(kick).await {
                            warn!(task_id = %kick.task.id, error = %err, "kicked dispatch failed");
                        }
                    });
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        while in_flight.join_next().await.is_some() {}
        debug!(worker = "dispatch", "outbox loop stopped");
    })
}
