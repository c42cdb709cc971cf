//! Quota domain: accounting units, period arithmetic and the quota aggregate.

pub mod period;
pub mod quota;
pub mod unit;

pub use period::{current_period_start, duration_nanos};
pub use quota::{
    AddQuota, ConfirmNotified, NotificationDueEvent, Quota, QuotaAdded, QuotaCommand, QuotaEvent,
    QuotaNotificationConfig, QuotaNotificationDue, QuotaNotified, QuotaRemoved, RemoveQuota,
    ReportNotificationDue, already_reported, next_due_threshold, quota_aggregate_id, QUOTA_AGGREGATE_TYPE,
};
pub use unit::Unit;
