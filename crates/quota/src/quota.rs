use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use quotaflow_core::{Aggregate, AggregateId, AggregateRoot, DomainError, DomainResult, TenantId};
use quotaflow_events::{Event, EventEnvelope};

use crate::period::duration_nanos;
use crate::unit::Unit;

pub const QUOTA_AGGREGATE_TYPE: &str = "quota";

/// Deterministic aggregate id of the quota for `(tenant, unit)`.
///
/// A tenant has at most one quota per unit, so the id is derived rather than
/// generated; adding a second quota for the same unit hits the same stream.
pub fn quota_aggregate_id(tenant_id: &TenantId, unit: Unit) -> AggregateId {
    AggregateId::new(format!("{}.quota.{}", tenant_id, unit.code()))
}

/// Configured threshold notification of a quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaNotificationConfig {
    pub id: String,
    /// Threshold in percent of the quota amount.
    pub percent: u16,
    /// Fire again at every multiple of `percent` within a period.
    #[serde(default)]
    pub repeat: bool,
    #[serde(rename = "callURL", alias = "callUrl", default)]
    pub call_url: String,
}

/// Event: QuotaAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaAdded {
    pub unit: Unit,
    pub amount: u64,
    pub limit: bool,
    pub from: DateTime<Utc>,
    #[serde(with = "duration_nanos")]
    pub interval: Duration,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notifications: Vec<QuotaNotificationConfig>,
}

/// Event: QuotaRemoved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRemoved {
    pub unit: Unit,
}

/// Event: a notification threshold was crossed and reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaNotificationDue {
    pub unit: Unit,
    /// Notification id.
    pub id: String,
    #[serde(rename = "callURL", alias = "callUrl", default)]
    pub call_url: String,
    pub period_start: DateTime<Utc>,
    pub threshold: u16,
    pub usage: u64,
}

/// Event: a due notification was delivered to its call URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaNotified {
    pub unit: Unit,
    pub id: String,
    #[serde(rename = "callURL", alias = "callUrl", default)]
    pub call_url: String,
    pub period_start: DateTime<Utc>,
    pub threshold: u16,
    pub usage: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaEvent {
    QuotaAdded(QuotaAdded),
    QuotaRemoved(QuotaRemoved),
    QuotaNotificationDue(QuotaNotificationDue),
    QuotaNotified(QuotaNotified),
}

impl QuotaEvent {
    pub const ADDED: &'static str = "quota.added";
    pub const REMOVED: &'static str = "quota.removed";
    pub const NOTIFICATION_DUE: &'static str = "quota.notificationdue";
    pub const NOTIFIED: &'static str = "quota.notified";
}

impl Event for QuotaEvent {
    fn event_type(&self) -> &'static str {
        match self {
            QuotaEvent::QuotaAdded(_) => Self::ADDED,
            QuotaEvent::QuotaRemoved(_) => Self::REMOVED,
            QuotaEvent::QuotaNotificationDue(_) => Self::NOTIFICATION_DUE,
            QuotaEvent::QuotaNotified(_) => Self::NOTIFIED,
        }
    }

    fn aggregate_type(&self) -> &'static str {
        QUOTA_AGGREGATE_TYPE
    }

    /// Flat JSON payload (the variant's fields, without a tag).
    fn to_payload(&self) -> DomainResult<JsonValue> {
        let value = match self {
            QuotaEvent::QuotaAdded(e) => serde_json::to_value(e),
            QuotaEvent::QuotaRemoved(e) => serde_json::to_value(e),
            QuotaEvent::QuotaNotificationDue(e) => serde_json::to_value(e),
            QuotaEvent::QuotaNotified(e) => serde_json::to_value(e),
        };
        value.map_err(|e| DomainError::invalid_argument(format!("payload serialization failed: {e}")))
    }

    /// Unknown event types and malformed payloads are `InvalidArgument`.
    fn from_envelope(envelope: &EventEnvelope<JsonValue>) -> DomainResult<Self> {
        if envelope.aggregate_type() != QUOTA_AGGREGATE_TYPE {
            return Err(DomainError::invalid_argument(format!(
                "not a quota event: aggregate type {}",
                envelope.aggregate_type()
            )));
        }
        match envelope.event_type() {
            Self::ADDED => Ok(Self::QuotaAdded(envelope.decode_payload()?)),
            Self::REMOVED => Ok(Self::QuotaRemoved(envelope.decode_payload()?)),
            Self::NOTIFICATION_DUE => Ok(Self::QuotaNotificationDue(envelope.decode_payload()?)),
            Self::NOTIFIED => Ok(Self::QuotaNotified(envelope.decode_payload()?)),
            other => Err(DomainError::invalid_argument(format!(
                "unknown quota event type {other}"
            ))),
        }
    }
}

/// A notification threshold newly crossed in the current period.
///
/// Produced by the quota read model, consumed by the quota command surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationDueEvent {
    pub tenant_id: TenantId,
    pub quota_id: AggregateId,
    pub notification_id: String,
    pub unit: Unit,
    pub call_url: String,
    pub period_start: DateTime<Utc>,
    pub threshold: u16,
    pub usage: u64,
}

impl NotificationDueEvent {
    pub fn to_event(&self) -> QuotaNotificationDue {
        QuotaNotificationDue {
            unit: self.unit,
            id: self.notification_id.clone(),
            call_url: self.call_url.clone(),
            period_start: self.period_start,
            threshold: self.threshold,
            usage: self.usage,
        }
    }
}

/// Command: AddQuota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddQuota {
    pub unit: Unit,
    pub amount: u64,
    pub limit: bool,
    pub from: DateTime<Utc>,
    pub interval: Duration,
    pub notifications: Vec<QuotaNotificationConfig>,
}

/// Command: RemoveQuota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveQuota;

/// Command: record that a notification threshold is due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportNotificationDue {
    pub due: NotificationDueEvent,
}

/// Command: record that a due notification was delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmNotified {
    pub due: NotificationDueEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaCommand {
    AddQuota(AddQuota),
    RemoveQuota(RemoveQuota),
    ReportNotificationDue(ReportNotificationDue),
    ConfirmNotified(ConfirmNotified),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NotificationState {
    config: QuotaNotificationConfig,
    latest_due_period_start: Option<DateTime<Utc>>,
    next_due_threshold: u16,
}

/// Aggregate root: Quota (one per tenant and unit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quota {
    id: AggregateId,
    unit: Option<Unit>,
    amount: u64,
    limit: bool,
    from: Option<DateTime<Utc>>,
    interval: Duration,
    notifications: Vec<NotificationState>,
    active: bool,
    version: u64,
}

impl Quota {
    /// Create an empty, not-yet-added aggregate instance for rehydration.
    pub fn empty(id: AggregateId) -> Self {
        Self {
            id,
            unit: None,
            amount: 0,
            limit: false,
            from: None,
            interval: Duration::ZERO,
            notifications: Vec::new(),
            active: false,
            version: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn unit(&self) -> Option<Unit> {
        self.unit
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn limit(&self) -> bool {
        self.limit
    }

    pub fn from(&self) -> Option<DateTime<Utc>> {
        self.from
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn notification(&self, id: &str) -> Option<&NotificationState> {
        self.notifications.iter().find(|n| n.config.id == id)
    }

    fn notification_mut(&mut self, id: &str) -> Option<&mut NotificationState> {
        self.notifications.iter_mut().find(|n| n.config.id == id)
    }
}

impl AggregateRoot for Quota {
    type Id = AggregateId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl Aggregate for Quota {
    type Command = QuotaCommand;
    type Event = QuotaEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event, sequence: u64) {
        match event {
            QuotaEvent::QuotaAdded(e) => {
                self.unit = Some(e.unit);
                self.amount = e.amount;
                self.limit = e.limit;
                self.from = Some(e.from);
                self.interval = e.interval;
                self.notifications = e
                    .notifications
                    .iter()
                    .cloned()
                    .map(|config| NotificationState {
                        config,
                        latest_due_period_start: None,
                        next_due_threshold: 0,
                    })
                    .collect();
                self.active = true;
            }
            QuotaEvent::QuotaRemoved(_) => {
                self.active = false;
                self.notifications.clear();
            }
            QuotaEvent::QuotaNotificationDue(e) => {
                if let Some(n) = self.notification_mut(&e.id) {
                    n.latest_due_period_start = Some(e.period_start);
                    n.next_due_threshold = next_due_threshold(e.threshold);
                }
            }
            QuotaEvent::QuotaNotified(_) => {}
        }

        self.version = sequence;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            QuotaCommand::AddQuota(cmd) => self.handle_add(cmd),
            QuotaCommand::RemoveQuota(_) => self.handle_remove(),
            QuotaCommand::ReportNotificationDue(cmd) => self.handle_due(&cmd.due),
            QuotaCommand::ConfirmNotified(cmd) => self.handle_notified(&cmd.due),
        }
    }
}

/// Lowest threshold that is due again within the same period after
/// `threshold` was reported.
pub fn next_due_threshold(threshold: u16) -> u16 {
    threshold.saturating_add(1)
}

/// Whether `threshold` was already reported within the period starting at
/// `period_start`. A saturated `next_due_threshold` counts as reported so the
/// top threshold is not due again on every evaluation.
pub fn already_reported(
    latest_due_period_start: Option<DateTime<Utc>>,
    next_due_threshold: u16,
    period_start: DateTime<Utc>,
    threshold: u16,
) -> bool {
    latest_due_period_start == Some(period_start)
        && (threshold < next_due_threshold || next_due_threshold == u16::MAX)
}

impl Quota {
    fn handle_add(&self, cmd: &AddQuota) -> Result<Vec<QuotaEvent>, DomainError> {
        if self.active {
            return Err(DomainError::conflict("quota for this unit already exists"));
        }
        if cmd.interval.is_zero() {
            return Err(DomainError::invalid_argument("quota interval must be positive"));
        }
        for (idx, n) in cmd.notifications.iter().enumerate() {
            if n.id.trim().is_empty() {
                return Err(DomainError::invalid_argument(format!(
                    "notification {idx} has no id"
                )));
            }
            if n.percent == 0 {
                return Err(DomainError::invalid_argument(format!(
                    "notification {} percent must be positive",
                    n.id
                )));
            }
            if cmd.notifications[..idx].iter().any(|other| other.id == n.id) {
                return Err(DomainError::invalid_argument(format!(
                    "duplicate notification id {}",
                    n.id
                )));
            }
        }

        Ok(vec![QuotaEvent::QuotaAdded(QuotaAdded {
            unit: cmd.unit,
            amount: cmd.amount,
            limit: cmd.limit,
            from: cmd.from,
            interval: cmd.interval,
            notifications: cmd.notifications.clone(),
        })])
    }

    fn handle_remove(&self) -> Result<Vec<QuotaEvent>, DomainError> {
        match (self.active, self.unit) {
            (true, Some(unit)) => Ok(vec![QuotaEvent::QuotaRemoved(QuotaRemoved { unit })]),
            _ => Err(DomainError::not_found()),
        }
    }

    fn handle_due(&self, due: &NotificationDueEvent) -> Result<Vec<QuotaEvent>, DomainError> {
        if !self.active {
            return Err(DomainError::not_found());
        }
        if self.unit != Some(due.unit) {
            return Err(DomainError::invariant("unit mismatch"));
        }
        let Some(n) = self.notification(&due.notification_id) else {
            return Err(DomainError::not_found());
        };

        // Already reported for this period and threshold: nothing new happened.
        if already_reported(n.latest_due_period_start, n.next_due_threshold, due.period_start, due.threshold) {
            return Ok(vec![]);
        }

        Ok(vec![QuotaEvent::QuotaNotificationDue(due.to_event())])
    }

    fn handle_notified(&self, due: &NotificationDueEvent) -> Result<Vec<QuotaEvent>, DomainError> {
        if !self.active {
            return Err(DomainError::not_found());
        }
        if self.notification(&due.notification_id).is_none() {
            return Err(DomainError::not_found());
        }
        Ok(vec![QuotaEvent::QuotaNotified(QuotaNotified {
            unit: due.unit,
            id: due.notification_id.clone(),
            call_url: due.call_url.clone(),
            period_start: due.period_start,
            threshold: due.threshold,
            usage: due.usage,
        })])
    }
}
