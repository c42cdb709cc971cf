//! Infrastructure layer: event store, projections, quota read model,
//! command surface and the projection worker.

pub mod command_dispatcher;
pub mod commands;
pub mod event_store;
pub mod projections;
pub mod read_model;
pub mod workers;


pub use commands::{CommandError, EventSourcedQuotaCommands, QuotaCommands};
pub use read_model::{QueryError, QuotaQueries, QuotaReadModel, UsageError, UsageQuerier};
