//! Quota command surface.
//!
//! Writes go through the event-sourced `Quota` aggregate; reported
//! notifications become `quota.notificationdue` events which the quota
//! projection folds back into the de-duplication columns.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use quotaflow_core::TenantId;
use quotaflow_quota::{
    AddQuota, ConfirmNotified, NotificationDueEvent, Quota, QuotaCommand, RemoveQuota,
    ReportNotificationDue, Unit, quota_aggregate_id,
};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::event_store::{EventStore, StoredEvent};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("quota not found")]
    NotFound,

    #[error("invalid quota command: {0}")]
    Invalid(String),

    #[error("quota already exists or was modified concurrently: {0}")]
    Conflict(String),

    #[error(transparent)]
    Dispatch(DispatchError),
}

impl CommandError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CommandError::NotFound)
    }
}

impl From<DispatchError> for CommandError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::NotFound => CommandError::NotFound,
            DispatchError::Validation(msg) | DispatchError::InvariantViolation(msg) => {
                CommandError::Invalid(msg)
            }
            DispatchError::Concurrency(msg) => CommandError::Conflict(msg),
            other => CommandError::Dispatch(other),
        }
    }
}

#[async_trait]
pub trait QuotaCommands: Send + Sync {
    /// Record that the given notifications are due.
    ///
    /// Notifications already reported for the same period and threshold are
    /// accepted without appending anything.
    async fn report_quota_usage(&self, due: &[NotificationDueEvent]) -> Result<(), CommandError>;
}

#[async_trait]
impl<C> QuotaCommands for std::sync::Arc<C>
where
    C: QuotaCommands + ?Sized,
{
    async fn report_quota_usage(&self, due: &[NotificationDueEvent]) -> Result<(), CommandError> {
        (**self).report_quota_usage(due).await
    }
}

/// Quota commands backed by an event store.
#[derive(Debug)]
pub struct EventSourcedQuotaCommands<S> {
    dispatcher: CommandDispatcher<S>,
}

impl<S> EventSourcedQuotaCommands<S>
where
    S: EventStore,
{
    pub fn new(store: S) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(store),
        }
    }

    pub fn store(&self) -> &S {
        self.dispatcher.store()
    }

    pub fn add_quota(&self, tenant_id: &TenantId, cmd: AddQuota) -> Result<Vec<StoredEvent>, CommandError> {
        let id = quota_aggregate_id(tenant_id, cmd.unit);
        let unit = cmd.unit;
        let committed =
            self.dispatcher
                .dispatch(tenant_id, &id, QuotaCommand::AddQuota(cmd), Quota::empty)?;
        info!(tenant_id = %tenant_id, %unit, "quota added");
        Ok(committed)
    }

    pub fn remove_quota(&self, tenant_id: &TenantId, unit: Unit) -> Result<Vec<StoredEvent>, CommandError> {
        let id = quota_aggregate_id(tenant_id, unit);
        let committed = self.dispatcher.dispatch(
            tenant_id,
            &id,
            QuotaCommand::RemoveQuota(RemoveQuota),
            Quota::empty,
        )?;
        info!(tenant_id = %tenant_id, %unit, "quota removed");
        Ok(committed)
    }

    /// Record that a due notification reached its call URL.
    pub fn confirm_notified(&self, due: &NotificationDueEvent) -> Result<Vec<StoredEvent>, CommandError> {
        Ok(self.dispatcher.dispatch(
            &due.tenant_id,
            &due.quota_id,
            QuotaCommand::ConfirmNotified(ConfirmNotified { due: due.clone() }),
            Quota::empty,
        )?)
    }
}

#[async_trait]
impl<S> QuotaCommands for EventSourcedQuotaCommands<S>
where
    S: EventStore,
{
    async fn report_quota_usage(&self, due: &[NotificationDueEvent]) -> Result<(), CommandError> {
        for notification in due {
            let committed = self.dispatcher.dispatch(
                &notification.tenant_id,
                &notification.quota_id,
                QuotaCommand::ReportNotificationDue(ReportNotificationDue {
                    due: notification.clone(),
                }),
                Quota::empty,
            )?;
            if !committed.is_empty() {
                info!(
                    tenant_id = %notification.tenant_id,
                    notification_id = %notification.notification_id,
                    threshold = notification.threshold,
                    usage = notification.usage,
                    "quota notification due"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};

    use quotaflow_quota::QuotaNotificationConfig;

    use super::*;
    use crate::event_store::InMemoryEventStore;

    fn anchor() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()
    }

    fn add() -> AddQuota {
        AddQuota {
            unit: Unit::RequestsAllAuthenticated,
            amount: 10,
            limit: true,
            from: anchor(),
            interval: Duration::from_secs(300),
            notifications: vec![QuotaNotificationConfig {
                id: "n1".to_string(),
                percent: 50,
                repeat: false,
                call_url: "https://hook.test".to_string(),
            }],
        }
    }

    fn due(tenant: &TenantId, threshold: u16) -> NotificationDueEvent {
        NotificationDueEvent {
            tenant_id: tenant.clone(),
            quota_id: quota_aggregate_id(tenant, Unit::RequestsAllAuthenticated),
            notification_id: "n1".to_string(),
            unit: Unit::RequestsAllAuthenticated,
            call_url: "https://hook.test".to_string(),
            period_start: anchor(),
            threshold,
            usage: 5,
        }
    }

    #[test]
    fn second_quota_for_same_unit_conflicts() {
        let commands = EventSourcedQuotaCommands::new(InMemoryEventStore::new());
        let tenant = TenantId::new("tenant");
        commands.add_quota(&tenant, add()).unwrap();
        let err = commands.add_quota(&tenant, add()).unwrap_err();
        assert!(matches!(err, CommandError::Conflict(_)));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let commands = EventSourcedQuotaCommands::new(InMemoryEventStore::new());
        let err = commands
            .add_quota(
                &TenantId::new("tenant"),
                AddQuota {
                    interval: Duration::ZERO,
                    ..add()
                },
            )
            .unwrap_err();
        assert!(matches!(err, CommandError::Invalid(_)));
    }

    #[tokio::test]
    async fn reporting_twice_appends_once() {
        let store = Arc::new(InMemoryEventStore::new());
        let commands = EventSourcedQuotaCommands::new(store.clone());
        let tenant = TenantId::new("tenant");
        commands.add_quota(&tenant, add()).unwrap();

        commands.report_quota_usage(&[due(&tenant, 50)]).await.unwrap();
        commands.report_quota_usage(&[due(&tenant, 50)]).await.unwrap();

        let id = quota_aggregate_id(&tenant, Unit::RequestsAllAuthenticated);
        let stream = store.load_stream(&tenant, &id).unwrap();
        assert_eq!(stream.len(), 2);
        assert_eq!(stream[1].event_type, "quota.notificationdue");
    }

    #[tokio::test]
    async fn due_for_removed_quota_is_not_found() {
        let commands = EventSourcedQuotaCommands::new(InMemoryEventStore::new());
        let tenant = TenantId::new("tenant");
        commands.add_quota(&tenant, add()).unwrap();
        commands
            .remove_quota(&tenant, Unit::RequestsAllAuthenticated)
            .unwrap();

        let err = commands
            .report_quota_usage(&[due(&tenant, 50)])
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn confirm_notified_appends_delivery_event() {
        let commands = EventSourcedQuotaCommands::new(InMemoryEventStore::new());
        let tenant = TenantId::new("tenant");
        commands.add_quota(&tenant, add()).unwrap();
        let committed = commands.confirm_notified(&due(&tenant, 50)).unwrap();
        assert_eq!(committed[0].event_type, "quota.notified");
    }
}
