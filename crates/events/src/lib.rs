//! Outbox notifications and the pub/sub mechanics that carry them.

pub mod bus;
pub mod dead_letter;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use dead_letter::DeadLetterEvent;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
