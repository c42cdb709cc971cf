//! Quota read model: quota definitions, usage, remaining capacity and due
//! notifications, answered from the quota projection tables.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use quotaflow_core::{Clock, SystemClock, TenantId};
use quotaflow_events::{ColumnValue, Condition};
use quotaflow_quota::{
    NotificationDueEvent, Unit, already_reported, current_period_start, quota_aggregate_id,
};

use super::usage::{UsageError, UsageQuerier};
use crate::projections::quotas::{
    QUOTA_NOTIFICATIONS_TABLE, QUOTAS_TABLE, notification_columns, quota_columns,
};
use crate::projections::store::{ExecuteError, Row, StatementExecutor};

#[derive(Debug, Error)]
pub enum QueryError {
    /// No quota configured; callers treat this as "no limiting".
    #[error("quota not found")]
    NotFound,

    #[error("no usage source registered for unit {0}")]
    NoUsageSource(Unit),

    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error(transparent)]
    Storage(#[from] ExecuteError),

    #[error("malformed projection row: {0}")]
    Malformed(String),
}

impl QueryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, QueryError::NotFound)
    }
}

/// Projected notification of a quota, with its de-duplication state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaNotificationReadModel {
    pub id: String,
    pub call_url: String,
    pub percent: u16,
    pub repeat: bool,
    /// Period of the last reported due event, if any.
    pub latest_due_period_start: Option<DateTime<Utc>>,
    /// Lowest threshold that is due again within that period.
    pub next_due_threshold: u16,
}

/// Projected quota of one tenant and unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaReadModel {
    pub tenant_id: TenantId,
    pub unit: Unit,
    pub amount: u64,
    pub limit: bool,
    pub from: DateTime<Utc>,
    pub interval: Duration,
    /// Start of the period containing "now" at query time.
    pub current_period_start: DateTime<Utc>,
    pub notifications: Vec<QuotaNotificationReadModel>,
}

#[async_trait]
pub trait QuotaQueries: Send + Sync {
    async fn get_quota(&self, tenant_id: &TenantId, unit: Unit) -> Result<QuotaReadModel, QueryError>;

    async fn get_quota_usage(
        &self,
        tenant_id: &TenantId,
        unit: Unit,
        period_start: DateTime<Utc>,
    ) -> Result<u64, QueryError>;

    /// `None` means "no limit": no quota configured, or the quota only observes.
    async fn get_remaining_quota_usage(
        &self,
        tenant_id: &TenantId,
        unit: Unit,
    ) -> Result<Option<u64>, QueryError>;

    async fn get_due_quota_notifications(
        &self,
        tenant_id: &TenantId,
        unit: Unit,
        quota: &QuotaReadModel,
        period_start: DateTime<Utc>,
        used_abs: u64,
    ) -> Result<Vec<NotificationDueEvent>, QueryError>;
}

#[async_trait]
impl<Q> QuotaQueries for Arc<Q>
where
    Q: QuotaQueries + ?Sized,
{
    async fn get_quota(&self, tenant_id: &TenantId, unit: Unit) -> Result<QuotaReadModel, QueryError> {
        (**self).get_quota(tenant_id, unit).await
    }

    async fn get_quota_usage(
        &self,
        tenant_id: &TenantId,
        unit: Unit,
        period_start: DateTime<Utc>,
    ) -> Result<u64, QueryError> {
        (**self).get_quota_usage(tenant_id, unit, period_start).await
    }

    async fn get_remaining_quota_usage(
        &self,
        tenant_id: &TenantId,
        unit: Unit,
    ) -> Result<Option<u64>, QueryError> {
        (**self).get_remaining_quota_usage(tenant_id, unit).await
    }

    async fn get_due_quota_notifications(
        &self,
        tenant_id: &TenantId,
        unit: Unit,
        quota: &QuotaReadModel,
        period_start: DateTime<Utc>,
        used_abs: u64,
    ) -> Result<Vec<NotificationDueEvent>, QueryError> {
        (**self)
            .get_due_quota_notifications(tenant_id, unit, quota, period_start, used_abs)
            .await
    }
}

/// Usage in percent of `amount`, rounded down. `None` for a zero amount.
pub fn used_percent(used_abs: u64, amount: u64) -> Option<u64> {
    if amount == 0 {
        return None;
    }
    let rel = u128::from(used_abs) * 100 / u128::from(amount);
    Some(u64::try_from(rel).unwrap_or(u64::MAX))
}

/// Notifications of `quota` newly crossed by `used_abs` within the period
/// starting at `period_start`.
///
/// A notification fires at `percent`; a repeating one at the highest multiple
/// of `percent` reached. It is skipped when it was already reported for this
/// period at the same or a higher threshold.
pub fn due_notifications(
    quota: &QuotaReadModel,
    period_start: DateTime<Utc>,
    used_abs: u64,
) -> Vec<NotificationDueEvent> {
    let Some(used_rel) = used_percent(used_abs, quota.amount) else {
        return Vec::new();
    };
    let quota_id = quota_aggregate_id(&quota.tenant_id, quota.unit);

    quota
        .notifications
        .iter()
        .filter(|n| n.percent > 0 && used_rel >= u64::from(n.percent))
        .filter_map(|n| {
            let threshold = if n.repeat {
                let percent = u64::from(n.percent);
                // Highest multiple of `percent` that still fits a threshold.
                let cap = u64::from(u16::MAX) / percent * percent;
                let reached = (used_rel / percent * percent).min(cap);
                u16::try_from(reached).unwrap_or(n.percent)
            } else {
                n.percent
            };

            if already_reported(n.latest_due_period_start, n.next_due_threshold, period_start, threshold) {
                return None;
            }
            Some(NotificationDueEvent {
                tenant_id: quota.tenant_id.clone(),
                quota_id: quota_id.clone(),
                notification_id: n.id.clone(),
                unit: quota.unit,
                call_url: n.call_url.clone(),
                period_start,
                threshold,
                usage: used_abs,
            })
        })
        .collect()
}

/// [`QuotaQueries`] over the quota projection tables.
///
/// Usage is delegated to the usage source registered for the unit.
pub struct ProjectionQuotaQueries<X> {
    executor: X,
    usage_sources: RwLock<HashMap<Unit, Arc<dyn UsageQuerier>>>,
    clock: Arc<dyn Clock>,
}

impl<X> ProjectionQuotaQueries<X>
where
    X: StatementExecutor,
{
    pub fn new(executor: X) -> Self {
        Self::with_clock(executor, Arc::new(SystemClock))
    }

    pub fn with_clock(executor: X, clock: Arc<dyn Clock>) -> Self {
        Self {
            executor,
            usage_sources: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Register `source` for the unit it reports; replaces an earlier one.
    pub fn register_usage_source(&self, source: Arc<dyn UsageQuerier>) {
        if let Ok(mut sources) = self.usage_sources.write() {
            sources.insert(source.quota_unit(), source);
        }
    }

    fn usage_source(&self, unit: Unit) -> Result<Arc<dyn UsageQuerier>, QueryError> {
        self.usage_sources
            .read()
            .map_err(|_| QueryError::Storage(ExecuteError::Storage("lock poisoned".to_string())))?
            .get(&unit)
            .cloned()
            .ok_or(QueryError::NoUsageSource(unit))
    }

    fn load_quota(&self, tenant_id: &TenantId, unit: Unit) -> Result<QuotaReadModel, QueryError> {
        let rows = self.executor.select(
            QUOTAS_TABLE,
            &[
                Condition::new(quota_columns::INSTANCE_ID, tenant_id),
                Condition::new(quota_columns::UNIT, unit),
            ],
        )?;
        let row = rows.first().ok_or(QueryError::NotFound)?;

        let from = column(row, quota_columns::FROM, |v| v.as_timestamp())?;
        let interval = column(row, quota_columns::INTERVAL, |v| v.as_interval())?;

        let notifications = self
            .executor
            .select(
                QUOTA_NOTIFICATIONS_TABLE,
                &[
                    Condition::new(notification_columns::INSTANCE_ID, tenant_id),
                    Condition::new(notification_columns::UNIT, unit),
                ],
            )?
            .iter()
            .map(notification_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(QuotaReadModel {
            tenant_id: tenant_id.clone(),
            unit,
            amount: column(row, quota_columns::AMOUNT, |v| v.as_unsigned())?,
            limit: column(row, quota_columns::LIMIT, |v| v.as_bool())?,
            from,
            interval,
            current_period_start: current_period_start(from, interval, self.clock.now()),
            notifications,
        })
    }
}

fn column<T>(
    row: &Row,
    name: &str,
    read: impl Fn(&ColumnValue) -> Option<T>,
) -> Result<T, QueryError> {
    row.get(name)
        .and_then(read)
        .ok_or_else(|| QueryError::Malformed(format!("column {name} missing or mistyped")))
}

fn notification_from_row(row: &Row) -> Result<QuotaNotificationReadModel, QueryError> {
    let percent = column(row, notification_columns::PERCENT, |v| v.as_integer())?;
    let next_due_threshold = row
        .get(notification_columns::NEXT_DUE_THRESHOLD)
        .and_then(|v| v.as_integer())
        .unwrap_or(0);

    Ok(QuotaNotificationReadModel {
        id: column(row, notification_columns::ID, |v| v.as_text().map(str::to_string))?,
        call_url: column(row, notification_columns::CALL_URL, |v| {
            v.as_text().map(str::to_string)
        })?,
        percent: u16::try_from(percent)
            .map_err(|_| QueryError::Malformed(format!("percent {percent} out of range")))?,
        repeat: column(row, notification_columns::REPEAT, |v| v.as_bool())?,
        latest_due_period_start: row
            .get(notification_columns::LATEST_DUE_PERIOD_START)
            .and_then(|v| v.as_timestamp()),
        next_due_threshold: u16::try_from(next_due_threshold).unwrap_or(u16::MAX),
    })
}

#[async_trait]
impl<X> QuotaQueries for ProjectionQuotaQueries<X>
where
    X: StatementExecutor,
{
    async fn get_quota(&self, tenant_id: &TenantId, unit: Unit) -> Result<QuotaReadModel, QueryError> {
        self.load_quota(tenant_id, unit)
    }

    async fn get_quota_usage(
        &self,
        tenant_id: &TenantId,
        unit: Unit,
        period_start: DateTime<Utc>,
    ) -> Result<u64, QueryError> {
        let source = self.usage_source(unit)?;
        Ok(source.query_usage(tenant_id, period_start).await?)
    }

    async fn get_remaining_quota_usage(
        &self,
        tenant_id: &TenantId,
        unit: Unit,
    ) -> Result<Option<u64>, QueryError> {
        let quota = match self.load_quota(tenant_id, unit) {
            Ok(quota) => quota,
            Err(QueryError::NotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
        if !quota.limit {
            return Ok(None);
        }

        let usage = self
            .get_quota_usage(tenant_id, unit, quota.current_period_start)
            .await?;
        let remaining = quota.amount.saturating_sub(usage);
        debug!(tenant_id = %tenant_id, %unit, usage, remaining, "remaining quota usage");
        Ok(Some(remaining))
    }

    async fn get_due_quota_notifications(
        &self,
        _tenant_id: &TenantId,
        _unit: Unit,
        quota: &QuotaReadModel,
        period_start: DateTime<Utc>,
        used_abs: u64,
    ) -> Result<Vec<NotificationDueEvent>, QueryError> {
        Ok(due_notifications(quota, period_start, used_abs))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;

    use quotaflow_core::{AggregateId, FixedClock};
    use quotaflow_events::{EventEnvelope, Reducer};

    use super::*;
    use crate::projections::quotas::QuotaProjection;
    use crate::projections::store::InMemoryProjectionStore;

    struct FixedUsage(u64);

    #[async_trait]
    impl UsageQuerier for FixedUsage {
        fn quota_unit(&self) -> Unit {
            Unit::RequestsAllAuthenticated
        }

        async fn query_usage(&self, _tenant_id: &TenantId, _start: DateTime<Utc>) -> Result<u64, UsageError> {
            Ok(self.0)
        }
    }

    struct FailingUsage;

    #[async_trait]
    impl UsageQuerier for FailingUsage {
        fn quota_unit(&self) -> Unit {
            Unit::RequestsAllAuthenticated
        }

        async fn query_usage(&self, _tenant_id: &TenantId, _start: DateTime<Utc>) -> Result<u64, UsageError> {
            Err(UsageError::Query("backend down".to_string()))
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, h, m, 0).unwrap()
    }

    fn queries(limit: bool) -> ProjectionQuotaQueries<Arc<InMemoryProjectionStore>> {
        let store = Arc::new(InMemoryProjectionStore::with_tables(QuotaProjection::tables()));
        let env = EventEnvelope::new(
            TenantId::new("tenant"),
            AggregateId::new("tenant.quota.1"),
            "quota",
            "quota.added",
            json!({
                "unit": 1,
                "amount": 10,
                "limit": limit,
                "from": "2023-01-01T00:00:00Z",
                "interval": 300000000000u64,
                "notifications": [{"id": "n1", "percent": 50, "repeat": true, "callURL": "https://hook.test"}]
            }),
        );
        let stmt = QuotaProjection.reduce(&env).unwrap();
        store.execute(QuotaProjection.name(), &stmt).unwrap();

        ProjectionQuotaQueries::with_clock(store, Arc::new(FixedClock::new(at(0, 12))))
    }

    fn quota(notifications: Vec<QuotaNotificationReadModel>) -> QuotaReadModel {
        QuotaReadModel {
            tenant_id: TenantId::new("tenant"),
            unit: Unit::RequestsAllAuthenticated,
            amount: 10,
            limit: true,
            from: at(0, 0),
            interval: Duration::from_secs(300),
            current_period_start: at(0, 10),
            notifications,
        }
    }

    fn notification(percent: u16, repeat: bool) -> QuotaNotificationReadModel {
        QuotaNotificationReadModel {
            id: "n1".to_string(),
            call_url: "https://hook.test".to_string(),
            percent,
            repeat,
            latest_due_period_start: None,
            next_due_threshold: 0,
        }
    }

    #[tokio::test]
    async fn get_quota_reads_projection_and_current_period() {
        let queries = queries(true);
        let quota = queries
            .get_quota(&TenantId::new("tenant"), Unit::RequestsAllAuthenticated)
            .await
            .unwrap();
        assert_eq!(quota.amount, 10);
        assert_eq!(quota.current_period_start, at(0, 10));
        assert_eq!(quota.notifications.len(), 1);
        assert_eq!(quota.notifications[0].percent, 50);
    }

    #[tokio::test]
    async fn unknown_quota_is_not_found_and_unlimited() {
        let queries = queries(true);
        let tenant = TenantId::new("other");
        let err = queries
            .get_quota(&tenant, Unit::RequestsAllAuthenticated)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(
            queries
                .get_remaining_quota_usage(&tenant, Unit::RequestsAllAuthenticated)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn remaining_is_floored_at_zero() {
        let queries = queries(true);
        queries.register_usage_source(Arc::new(FixedUsage(4)));
        let tenant = TenantId::new("tenant");
        assert_eq!(
            queries
                .get_remaining_quota_usage(&tenant, Unit::RequestsAllAuthenticated)
                .await
                .unwrap(),
            Some(6)
        );

        queries.register_usage_source(Arc::new(FixedUsage(25)));
        assert_eq!(
            queries
                .get_remaining_quota_usage(&tenant, Unit::RequestsAllAuthenticated)
                .await
                .unwrap(),
            Some(0)
        );
    }

    #[tokio::test]
    async fn observing_quota_has_no_limit() {
        let queries = queries(false);
        queries.register_usage_source(Arc::new(FixedUsage(4)));
        let remaining = queries
            .get_remaining_quota_usage(&TenantId::new("tenant"), Unit::RequestsAllAuthenticated)
            .await
            .unwrap();
        assert_eq!(remaining, None);
    }

    #[tokio::test]
    async fn usage_errors_propagate() {
        let queries = queries(true);
        let tenant = TenantId::new("tenant");
        let err = queries
            .get_remaining_quota_usage(&tenant, Unit::RequestsAllAuthenticated)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::NoUsageSource(_)));

        queries.register_usage_source(Arc::new(FailingUsage));
        let err = queries
            .get_remaining_quota_usage(&tenant, Unit::RequestsAllAuthenticated)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Usage(_)));
    }

    #[test]
    fn zero_amount_has_nothing_due() {
        let mut q = quota(vec![notification(10, false)]);
        q.amount = 0;
        assert!(due_notifications(&q, at(0, 10), 1_000).is_empty());
    }

    #[test]
    fn single_notification_fires_at_its_percent() {
        let q = quota(vec![notification(50, false)]);
        assert!(due_notifications(&q, at(0, 10), 4).is_empty());

        let due = due_notifications(&q, at(0, 10), 9);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].threshold, 50);
        assert_eq!(due[0].usage, 9);
        assert_eq!(due[0].quota_id.as_str(), "tenant.quota.1");
    }

    #[test]
    fn repeating_notification_uses_highest_multiple() {
        let q = quota(vec![notification(20, true)]);
        let due = due_notifications(&q, at(0, 10), 13);
        assert_eq!(due[0].threshold, 120);
    }

    #[test]
    fn reported_threshold_is_not_due_again_in_same_period() {
        let mut n = notification(20, true);
        n.latest_due_period_start = Some(at(0, 10));
        n.next_due_threshold = 41;
        let q = quota(vec![n]);

        assert!(due_notifications(&q, at(0, 10), 5).is_empty());
        assert_eq!(due_notifications(&q, at(0, 10), 6)[0].threshold, 60);
        // A new period starts over.
        assert_eq!(due_notifications(&q, at(0, 15), 5)[0].threshold, 40);
    }

    #[test]
    fn saturated_threshold_is_reported_once_per_period() {
        let q = quota(vec![notification(1, true), notification(100, true)]);
        let due = due_notifications(&q, at(0, 10), 100_000);
        assert_eq!(due[0].threshold, u16::MAX);
        assert_eq!(due[1].threshold, 65_500);

        let mut q = q;
        for (n, event) in q.notifications.iter_mut().zip(&due) {
            n.latest_due_period_start = Some(event.period_start);
            n.next_due_threshold = quotaflow_quota::next_due_threshold(event.threshold);
        }
        assert!(due_notifications(&q, at(0, 10), 200_000).is_empty());
    }

    proptest! {
        /// Property: once a due threshold is folded back, the same usage is quiet.
        #[test]
        fn due_thresholds_are_deduplicated(
            percent in 1u16..200,
            repeat in any::<bool>(),
            amount in 1u64..10_000,
            used_percent_of_amount in 0u64..600,
        ) {
            let used = amount * used_percent_of_amount / 100;
            let q = quota(vec![notification(percent, repeat)]);
            let mut q = QuotaReadModel { amount, ..q };
            let due = due_notifications(&q, at(0, 10), used);
            prop_assert!(due.len() <= 1);

            if let Some(event) = due.first() {
                let rel = used_percent(used, amount).unwrap();
                prop_assert!(u64::from(event.threshold) <= rel);
                prop_assert!(event.threshold >= percent);

                let n = &mut q.notifications[0];
                n.latest_due_period_start = Some(event.period_start);
                n.next_due_threshold = quotaflow_quota::next_due_threshold(event.threshold);
                prop_assert!(due_notifications(&q, at(0, 10), used).is_empty());
            }
        }
    }
}
