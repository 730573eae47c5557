//! Heartbeat-backed node registry.
//!
//! Each instance keeps one row alive by heartbeating. Bucket ownership is
//! never stored: every dispatch cycle reads [`NodeRegistry::list_live`] and
//! derives it with [`outboxd_core::Membership`].

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryNodeRegistry;
pub use postgres::PgNodeRegistry;
pub use r#trait::{NodeRecord, NodeRegistry, NodeRegistryError};
