//! Projections (read model builders).
//!
//! Projections consume domain events and build query-optimized tables.
//! All projections are:
//! - **Rebuildable**: Can be reconstructed from the event stream
//! - **Tenant-isolated**: Data is partitioned by tenant
//! - **Idempotent**: Safe for at-least-once delivery

pub mod handler;
pub mod quotas;
pub mod store;

pub use handler::{Applied, DEFAULT_MAX_ATTEMPTS, ProjectionError, ProjectionHandler, QuarantinedStream};
pub use quotas::{QUOTA_NOTIFICATIONS_TABLE, QUOTAS_TABLE, QuotaProjection};
pub use store::{ExecuteError, InMemoryProjectionStore, Row, StatementExecutor};
