//! Background loops.

pub mod engine;

pub use engine::{EngineError, EngineHandle, EngineRuntime, OutboxEngine};
