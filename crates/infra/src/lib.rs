//! Infrastructure layer: storage adapters, claim/dispatch machinery and the
//! per-instance engine.

pub mod admin;
pub mod claim;
pub mod cleanup;
pub mod config;
pub mod dead_letter;
pub mod dispatcher;
pub mod enqueue;
pub mod handler;
pub mod registry;
pub mod task_store;
pub mod transport;
pub mod workers;


pub use admin::{AdminError, DeadLetterAdmin, NodeAdmin};
pub use claim::{ClaimError, ClaimService};
pub use config::{ConfigError, OutboxConfig, TableName};
pub use dead_letter::DeadLetterSink;
pub use dispatcher::{DispatchError, DispatchReport, Dispatcher, Outcome};
pub use enqueue::{EnqueueError, EnqueueOutcome, EnqueueService, Kick, Kicker, OutboxTransaction};
pub use handler::{HandlerError, HandlerRegistry, OutboxHandler};
pub use workers::{EngineError, EngineHandle, EngineRuntime, OutboxEngine};
