//! Quota projection: folds quota and instance events into the
//! `projections.quotas` and `projections.quotas_notifications` tables.

use serde_json::Value as JsonValue;

use quotaflow_core::{DomainError, DomainResult};
use quotaflow_events::{Column, Condition, EventEnvelope, Execution, Reducer, Statement, ensure_event};
use quotaflow_quota::{
    QUOTA_AGGREGATE_TYPE, QuotaAdded, QuotaEvent, QuotaNotificationDue, QuotaRemoved,
    next_due_threshold,
};

use super::store::INSTANCE_ID_COLUMN;

pub const QUOTA_PROJECTION: &str = "projections.quotas";
pub const QUOTAS_TABLE: &str = "projections.quotas";
pub const QUOTA_NOTIFICATIONS_TABLE: &str = "projections.quotas_notifications";

pub const INSTANCE_AGGREGATE_TYPE: &str = "instance";
pub const INSTANCE_REMOVED: &str = "instance.removed";

pub mod quota_columns {
    pub const INSTANCE_ID: &str = super::INSTANCE_ID_COLUMN;
    pub const UNIT: &str = "unit";
    pub const AMOUNT: &str = "amount";
    pub const FROM: &str = "from_anchor";
    pub const INTERVAL: &str = "interval";
    pub const LIMIT: &str = "limit_usage";
}

pub mod notification_columns {
    pub const INSTANCE_ID: &str = super::INSTANCE_ID_COLUMN;
    pub const UNIT: &str = "unit";
    pub const ID: &str = "id";
    pub const CALL_URL: &str = "call_url";
    pub const PERCENT: &str = "percent";
    pub const REPEAT: &str = "repeat";
    pub const LATEST_DUE_PERIOD_START: &str = "latest_due_period_start";
    pub const NEXT_DUE_THRESHOLD: &str = "next_due_threshold";
}

type ReduceFn = fn(&EventEnvelope<JsonValue>) -> DomainResult<Statement>;

/// Every event the projection handles, with its reducer.
const REDUCERS: &[(&str, &str, ReduceFn)] = &[
    (QUOTA_AGGREGATE_TYPE, QuotaEvent::ADDED, reduce_quota_added),
    (QUOTA_AGGREGATE_TYPE, QuotaEvent::REMOVED, reduce_quota_removed),
    (QUOTA_AGGREGATE_TYPE, QuotaEvent::NOTIFICATION_DUE, reduce_quota_notification_due),
    (QUOTA_AGGREGATE_TYPE, QuotaEvent::NOTIFIED, reduce_quota_notified),
    (INSTANCE_AGGREGATE_TYPE, INSTANCE_REMOVED, reduce_instance_removed),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaProjection;

impl QuotaProjection {
    pub fn new() -> Self {
        Self
    }

    /// Tables this projection writes to.
    pub fn tables() -> [&'static str; 2] {
        [QUOTAS_TABLE, QUOTA_NOTIFICATIONS_TABLE]
    }

    pub fn subscribes_to(aggregate_type: &str, event_type: &str) -> bool {
        REDUCERS
            .iter()
            .any(|(agg, ev, _)| *agg == aggregate_type && *ev == event_type)
    }
}

impl Reducer for QuotaProjection {
    fn name(&self) -> &'static str {
        QUOTA_PROJECTION
    }

    fn reduce(&self, envelope: &EventEnvelope<JsonValue>) -> DomainResult<Statement> {
        let reduce = REDUCERS
            .iter()
            .find(|(agg, ev, _)| *agg == envelope.aggregate_type() && *ev == envelope.event_type())
            .map(|(_, _, f)| *f)
            .ok_or_else(|| {
                DomainError::invalid_argument(format!(
                    "reduce.unsupported.event: {}/{}",
                    envelope.aggregate_type(),
                    envelope.event_type()
                ))
            })?;
        reduce(envelope)
    }
}

pub fn reduce_quota_added(envelope: &EventEnvelope<JsonValue>) -> DomainResult<Statement> {
    ensure_event(envelope, QUOTA_AGGREGATE_TYPE, QuotaEvent::ADDED)?;
    let e: QuotaAdded = envelope.decode_payload()?;
    let tenant = envelope.tenant_id();

    let mut executions = vec![Execution::insert(
        QUOTAS_TABLE,
        vec![
            Column::new(quota_columns::INSTANCE_ID, tenant),
            Column::new(quota_columns::UNIT, e.unit),
            Column::new(quota_columns::AMOUNT, e.amount),
            Column::new(quota_columns::FROM, e.from),
            Column::new(quota_columns::INTERVAL, e.interval),
            Column::new(quota_columns::LIMIT, e.limit),
        ],
    )];

    executions.extend(e.notifications.iter().map(|n| {
        Execution::insert(
            QUOTA_NOTIFICATIONS_TABLE,
            vec![
                Column::new(notification_columns::INSTANCE_ID, tenant),
                Column::new(notification_columns::UNIT, e.unit),
                Column::new(notification_columns::ID, n.id.as_str()),
                Column::new(notification_columns::CALL_URL, n.call_url.as_str()),
                Column::new(notification_columns::PERCENT, n.percent),
                Column::new(notification_columns::REPEAT, n.repeat),
            ],
        )
    }));

    Ok(Statement::for_event(envelope, executions))
}

pub fn reduce_quota_removed(envelope: &EventEnvelope<JsonValue>) -> DomainResult<Statement> {
    ensure_event(envelope, QUOTA_AGGREGATE_TYPE, QuotaEvent::REMOVED)?;
    let e: QuotaRemoved = envelope.decode_payload()?;
    let tenant = envelope.tenant_id();

    Ok(Statement::for_event(
        envelope,
        vec![
            Execution::delete(
                QUOTAS_TABLE,
                vec![
                    Condition::new(quota_columns::INSTANCE_ID, tenant),
                    Condition::new(quota_columns::UNIT, e.unit),
                ],
            ),
            Execution::delete(
                QUOTA_NOTIFICATIONS_TABLE,
                vec![
                    Condition::new(notification_columns::INSTANCE_ID, tenant),
                    Condition::new(notification_columns::UNIT, e.unit),
                ],
            ),
        ],
    ))
}

pub fn reduce_quota_notification_due(envelope: &EventEnvelope<JsonValue>) -> DomainResult<Statement> {
    ensure_event(envelope, QUOTA_AGGREGATE_TYPE, QuotaEvent::NOTIFICATION_DUE)?;
    let e: QuotaNotificationDue = envelope.decode_payload()?;

    Ok(Statement::update(
        envelope,
        QUOTA_NOTIFICATIONS_TABLE,
        vec![
            Column::new(notification_columns::LATEST_DUE_PERIOD_START, e.period_start),
            Column::new(
                notification_columns::NEXT_DUE_THRESHOLD,
                next_due_threshold(e.threshold),
            ),
        ],
        vec![
            Condition::new(notification_columns::INSTANCE_ID, envelope.tenant_id()),
            Condition::new(notification_columns::UNIT, e.unit),
            Condition::new(notification_columns::ID, e.id),
        ],
    ))
}

/// Delivery confirmations carry no projected state; the sequence still advances.
pub fn reduce_quota_notified(envelope: &EventEnvelope<JsonValue>) -> DomainResult<Statement> {
    ensure_event(envelope, QUOTA_AGGREGATE_TYPE, QuotaEvent::NOTIFIED)?;
    Ok(Statement::no_op(envelope))
}

pub fn reduce_instance_removed(envelope: &EventEnvelope<JsonValue>) -> DomainResult<Statement> {
    ensure_event(envelope, INSTANCE_AGGREGATE_TYPE, INSTANCE_REMOVED)?;
    let tenant = envelope.tenant_id();

    Ok(Statement::for_event(
        envelope,
        vec![
            Execution::delete(QUOTAS_TABLE, vec![Condition::new(quota_columns::INSTANCE_ID, tenant)]),
            Execution::delete(
                QUOTA_NOTIFICATIONS_TABLE,
                vec![Condition::new(notification_columns::INSTANCE_ID, tenant)],
            ),
        ],
    ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    use quotaflow_core::{AggregateId, TenantId};
    use quotaflow_events::{ColumnValue, Operation};

    use super::*;

    fn event(aggregate_type: &str, event_type: &str, payload: JsonValue) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            TenantId::new("instance-id"),
            AggregateId::new("agg-id"),
            aggregate_type,
            event_type,
            payload,
        )
        .with_sequence(15, 10)
    }

    fn base_event() -> EventEnvelope<JsonValue> {
        event("base", "base.event", json!({}))
    }

    #[test]
    fn reduces_quota_added_into_single_insert() {
        let env = event(
            QUOTA_AGGREGATE_TYPE,
            QuotaEvent::ADDED,
            json!({
                "unit": 1,
                "amount": 10,
                "limit": true,
                "from": "2023-01-01T00:00:00Z",
                "interval": 300000000000u64
            }),
        );

        let stmt = reduce_quota_added(&env).unwrap();
        assert_eq!(stmt.aggregate_type, "quota");
        assert_eq!(stmt.sequence, 15);
        assert_eq!(stmt.previous_sequence, 10);
        assert_eq!(stmt.executions.len(), 1);

        let exec = &stmt.executions[0];
        assert_eq!(exec.table, QUOTAS_TABLE);
        let columns = exec.insert_columns().unwrap();
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            ["instance_id", "unit", "amount", "from_anchor", "interval", "limit_usage"]
        );
        let values: Vec<ColumnValue> = columns.iter().map(|c| c.value.clone()).collect();
        assert_eq!(
            values,
            vec![
                ColumnValue::Text("instance-id".to_string()),
                ColumnValue::Integer(1),
                ColumnValue::Unsigned(10),
                ColumnValue::Timestamp(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()),
                ColumnValue::Interval(Duration::from_secs(5 * 60)),
                ColumnValue::Bool(true),
            ]
        );
    }

    #[test]
    fn per_event_reducers_reject_other_events() {
        let reducers: [ReduceFn; 5] = [
            reduce_quota_added,
            reduce_quota_removed,
            reduce_quota_notification_due,
            reduce_quota_notified,
            reduce_instance_removed,
        ];
        for reduce in reducers {
            let err = reduce(&base_event()).unwrap_err();
            assert!(err.is_invalid_argument());
        }
    }

    #[test]
    fn unsupported_event_is_invalid_argument() {
        let err = QuotaProjection.reduce(&base_event()).unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn malformed_payload_is_invalid_argument() {
        let env = event(QUOTA_AGGREGATE_TYPE, QuotaEvent::ADDED, json!({"unit": "requests"}));
        assert!(QuotaProjection.reduce(&env).unwrap_err().is_invalid_argument());

        let env = event(QUOTA_AGGREGATE_TYPE, QuotaEvent::REMOVED, json!({"unit": 9}));
        assert!(QuotaProjection.reduce(&env).unwrap_err().is_invalid_argument());
    }

    #[test]
    fn notifications_become_rows() {
        let env = event(
            QUOTA_AGGREGATE_TYPE,
            QuotaEvent::ADDED,
            json!({
                "unit": 2,
                "amount": 100,
                "limit": false,
                "from": "2023-01-01T00:00:00Z",
                "interval": 3600000000000u64,
                "notifications": [
                    {"id": "n1", "percent": 50, "repeat": true, "callURL": "https://example.test/hook"}
                ]
            }),
        );

        let stmt = QuotaProjection.reduce(&env).unwrap();
        assert_eq!(stmt.executions.len(), 2);
        assert_eq!(stmt.executions[1].table, QUOTA_NOTIFICATIONS_TABLE);
    }

    #[test]
    fn notification_due_updates_dedup_columns() {
        let env = event(
            QUOTA_AGGREGATE_TYPE,
            QuotaEvent::NOTIFICATION_DUE,
            json!({
                "unit": 1,
                "id": "n1",
                "callURL": "https://example.test/hook",
                "periodStart": "2023-01-01T00:00:00Z",
                "threshold": 50,
                "usage": 5
            }),
        );

        let stmt = QuotaProjection.reduce(&env).unwrap();
        let Operation::Update { values, conditions } = &stmt.executions[0].operation else {
            panic!("expected update");
        };
        assert_eq!(values[1].value, ColumnValue::Integer(51));
        assert_eq!(conditions.len(), 3);
    }

    #[test]
    fn notified_is_a_no_op_that_still_advances() {
        let env = event(
            QUOTA_AGGREGATE_TYPE,
            QuotaEvent::NOTIFIED,
            json!({
                "unit": 1,
                "id": "n1",
                "periodStart": "2023-01-01T00:00:00Z",
                "threshold": 50,
                "usage": 5
            }),
        );
        let stmt = QuotaProjection.reduce(&env).unwrap();
        assert!(stmt.is_no_op());
        assert_eq!(stmt.sequence, 15);
    }

    #[test]
    fn instance_removed_clears_both_tables() {
        let env = event(INSTANCE_AGGREGATE_TYPE, INSTANCE_REMOVED, json!({}));
        let stmt = QuotaProjection.reduce(&env).unwrap();
        let tables: Vec<&str> = stmt.executions.iter().map(|e| e.table.as_str()).collect();
        assert_eq!(tables, [QUOTAS_TABLE, QUOTA_NOTIFICATIONS_TABLE]);
    }

    proptest! {
        /// Property: statements always carry the event's own stream positions.
        #[test]
        fn statement_positions_follow_event(previous in 0u64..1_000_000, gap in 1u64..1_000) {
            let env = event(QUOTA_AGGREGATE_TYPE, QuotaEvent::REMOVED, json!({"unit": 1}))
                .with_sequence(previous + gap, previous);
            let stmt = QuotaProjection.reduce(&env).unwrap();
            prop_assert_eq!(stmt.previous_sequence, previous);
            prop_assert_eq!(stmt.sequence, previous + gap);
        }
    }
}
