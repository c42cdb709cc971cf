//! Append-only event store boundary.
//!
//! Durable storage is provided by the surrounding platform; this module
//! defines the tenant-scoped contract the quota commands and projection
//! handlers rely on, plus an in-memory implementation for tests/dev.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
