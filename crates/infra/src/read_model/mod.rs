//! Quota read model and the usage-source capability it delegates to.

pub mod quotas;
pub mod usage;

pub use quotas::{
    ProjectionQuotaQueries, QueryError, QuotaNotificationReadModel, QuotaQueries, QuotaReadModel,
    due_notifications, used_percent,
};
pub use usage::{UsageError, UsageQuerier};
