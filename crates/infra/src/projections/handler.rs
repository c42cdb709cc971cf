//! Drives a reducer against a statement executor.
//!
//! The handler keeps no cursor of its own: the executor's recorded sequence
//! per aggregate stream is the checkpoint. Re-delivered events are skipped,
//! gaps are surfaced to the caller, which retries after catching up.
//!
//! An event that keeps failing is retried on later catch-ups up to
//! `max_attempts` times. After that its aggregate stream is quarantined:
//! the event and every later event of the same stream are skipped so other
//! streams keep projecting. `rebuild_tenant` lifts the tenant's quarantines.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

use quotaflow_core::{AggregateId, DomainError, TenantId};
use quotaflow_events::{EventEnvelope, Reducer};

use super::store::{ExecuteError, StatementExecutor};
use crate::event_store::{EventStore, EventStoreError};

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("reduce failed: {0}")]
    Reduce(#[from] DomainError),

    #[error("sequence gap for {aggregate_type}/{aggregate_id}: projection at {current}, event expects {expected}")]
    Gap {
        aggregate_type: String,
        aggregate_id: String,
        expected: u64,
        current: u64,
    },

    #[error(transparent)]
    Execute(#[from] ExecuteError),

    #[error(transparent)]
    EventStore(#[from] EventStoreError),
}

/// Outcome of feeding one event to a projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Applied,
    /// Already applied earlier (replay or concurrent writer).
    Duplicate,
    /// The projection does not handle this event.
    Skipped,
}

/// Attempts per event before its stream is quarantined.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// An aggregate stream the projection gave up on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QuarantinedStream {
    pub tenant_id: TenantId,
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
}

impl QuarantinedStream {
    fn of(envelope: &EventEnvelope<JsonValue>) -> Self {
        Self {
            tenant_id: envelope.tenant_id().clone(),
            aggregate_type: envelope.aggregate_type().to_string(),
            aggregate_id: envelope.aggregate_id().clone(),
        }
    }
}

#[derive(Debug, Default)]
struct FailureLedger {
    /// Failed attempts by global position.
    attempts: HashMap<u64, u32>,
    quarantined: BTreeSet<QuarantinedStream>,
}

pub struct ProjectionHandler<R, X> {
    reducer: R,
    executor: X,
    subscribed: fn(&str, &str) -> bool,
    max_attempts: u32,
    failures: Mutex<FailureLedger>,
}

impl<R, X> ProjectionHandler<R, X>
where
    R: Reducer,
    X: StatementExecutor,
{
    /// `subscribed` filters the events the reducer is asked about; everything
    /// else is skipped without touching the executor.
    pub fn new(reducer: R, executor: X, subscribed: fn(&str, &str) -> bool) -> Self {
        Self {
            reducer,
            executor,
            subscribed,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            failures: Mutex::default(),
        }
    }

    /// Override how often a failing event is tried before quarantine.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn executor(&self) -> &X {
        &self.executor
    }

    /// Streams skipped after exhausting their attempts.
    pub fn quarantined(&self) -> Vec<QuarantinedStream> {
        self.ledger().quarantined.iter().cloned().collect()
    }

    fn ledger(&self) -> MutexGuard<'_, FailureLedger> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn process(&self, envelope: &EventEnvelope<JsonValue>) -> Result<Applied, ProjectionError> {
        if !(self.subscribed)(envelope.aggregate_type(), envelope.event_type()) {
            return Ok(Applied::Skipped);
        }

        let projection = self.reducer.name();
        let current = self.executor.current_sequence(
            projection,
            envelope.tenant_id(),
            envelope.aggregate_type(),
            envelope.aggregate_id(),
        )?;
        if envelope.sequence_number() <= current {
            debug!(
                projection,
                aggregate_id = %envelope.aggregate_id(),
                sequence = envelope.sequence_number(),
                current,
                "event already projected"
            );
            return Ok(Applied::Duplicate);
        }
        if envelope.previous_sequence() != current {
            return Err(ProjectionError::Gap {
                aggregate_type: envelope.aggregate_type().to_string(),
                aggregate_id: envelope.aggregate_id().to_string(),
                expected: envelope.previous_sequence(),
                current,
            });
        }

        let statement = self.reducer.reduce(envelope)?;
        match self.executor.execute(projection, &statement) {
            Ok(()) => Ok(Applied::Applied),
            // Lost the race to a concurrent writer applying the same event.
            Err(ExecuteError::PreconditionFailed { current, .. }) if current >= statement.sequence => {
                Ok(Applied::Duplicate)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Feed every event after global `position` to the projection.
    ///
    /// Returns the last position processed; the caller passes it back in on
    /// the next call. Stops at the first error unless the failing event has
    /// used up its attempts, in which case its stream is quarantined and
    /// processing moves on.
    pub fn catch_up<S: EventStore>(&self, store: &S, position: u64) -> Result<u64, ProjectionError> {
        let mut last = position;
        let mut applied = 0usize;
        for stored in store.load_since(position)? {
            let envelope = stored.to_envelope();
            let stream = QuarantinedStream::of(&envelope);
            if self.ledger().quarantined.contains(&stream) {
                debug!(
                    projection = self.reducer.name(),
                    position = stored.position,
                    aggregate_id = %stream.aggregate_id,
                    "skipping event of quarantined stream"
                );
                last = stored.position;
                continue;
            }

            match self.process(&envelope) {
                Ok(_) => {
                    self.ledger().attempts.remove(&stored.position);
                    applied += 1;
                }
                Err(err) => {
                    let mut ledger = self.ledger();
                    let attempts = ledger.attempts.entry(stored.position).or_insert(0);
                    *attempts += 1;
                    if *attempts < self.max_attempts {
                        warn!(
                            projection = self.reducer.name(),
                            position = stored.position,
                            attempts = *attempts,
                            error = %err,
                            "projection failed"
                        );
                        return Err(err);
                    }
                    ledger.attempts.remove(&stored.position);
                    warn!(
                        projection = self.reducer.name(),
                        position = stored.position,
                        tenant_id = %stream.tenant_id,
                        aggregate_type = %stream.aggregate_type,
                        aggregate_id = %stream.aggregate_id,
                        error = %err,
                        "projection gave up on event, quarantining stream"
                    );
                    ledger.quarantined.insert(stream);
                }
            }
            last = stored.position;
        }
        if applied > 0 {
            debug!(projection = self.reducer.name(), applied, position = last, "projection caught up");
        }
        Ok(last)
    }

    /// Drop a tenant's projected state and replay its events from scratch.
    pub fn rebuild_tenant<S: EventStore>(
        &self,
        store: &S,
        tenant_id: &TenantId,
        tables: &[&str],
    ) -> Result<usize, ProjectionError> {
        self.executor
            .clear_tenant(self.reducer.name(), tables, tenant_id)?;
        self.ledger()
            .quarantined
            .retain(|stream| &stream.tenant_id != tenant_id);

        let mut replayed = 0usize;
        for stored in store.load_since(0)? {
            if &stored.tenant_id != tenant_id {
                continue;
            }
            if self.process(&stored.to_envelope())? == Applied::Applied {
                replayed += 1;
            }
        }
        info!(projection = self.reducer.name(), tenant_id = %tenant_id, replayed, "projection rebuilt");
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use chrono::Utc;
    use uuid::Uuid;

    use quotaflow_core::ExpectedVersion;

    use super::*;
    use crate::event_store::{InMemoryEventStore, UncommittedEvent};
    use crate::projections::quotas::{QUOTAS_TABLE, QuotaProjection};
    use crate::projections::store::InMemoryProjectionStore;

    fn handler() -> ProjectionHandler<QuotaProjection, Arc<InMemoryProjectionStore>> {
        ProjectionHandler::new(
            QuotaProjection,
            Arc::new(InMemoryProjectionStore::with_tables(QuotaProjection::tables())),
            QuotaProjection::subscribes_to,
        )
    }

    fn quota_event(tenant: &str, event_type: &str, payload: JsonValue) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            tenant_id: TenantId::new(tenant),
            aggregate_id: AggregateId::new(format!("{tenant}.quota.1")),
            aggregate_type: "quota".to_string(),
            event_type: event_type.to_string(),
            created_at: Utc::now(),
            payload,
        }
    }

    fn added_payload() -> JsonValue {
        json!({
            "unit": 1,
            "amount": 10,
            "limit": true,
            "from": "2023-01-01T00:00:00Z",
            "interval": 300000000000u64
        })
    }

    fn added(sequence: u64, previous: u64) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            TenantId::new("tenant"),
            AggregateId::new("tenant.quota.1"),
            "quota",
            "quota.added",
            json!({
                "unit": 1,
                "amount": 10,
                "limit": true,
                "from": "2023-01-01T00:00:00Z",
                "interval": 300000000000u64
            }),
        )
        .with_sequence(sequence, previous)
    }

    #[test]
    fn replayed_event_is_a_duplicate() {
        let handler = handler();
        assert_eq!(handler.process(&added(1, 0)).unwrap(), Applied::Applied);
        assert_eq!(handler.process(&added(1, 0)).unwrap(), Applied::Duplicate);
        assert_eq!(handler.executor().select(QUOTAS_TABLE, &[]).unwrap().len(), 1);
    }

    #[test]
    fn gap_is_surfaced() {
        let handler = handler();
        let err = handler.process(&added(3, 2)).unwrap_err();
        assert!(matches!(err, ProjectionError::Gap { expected: 2, current: 0, .. }));
    }

    #[test]
    fn unsubscribed_events_are_skipped() {
        let handler = handler();
        let env = EventEnvelope::new(
            TenantId::new("tenant"),
            AggregateId::new("user-1"),
            "user",
            "user.added",
            json!({}),
        );
        assert_eq!(handler.process(&env).unwrap(), Applied::Skipped);
    }

    #[test]
    fn failing_stream_is_quarantined_after_its_attempts() {
        let store = InMemoryEventStore::new();
        store
            .append(vec![quota_event("bad", "quota.added", json!({ "unit": "x" }))], ExpectedVersion::Exact(0))
            .unwrap();
        store
            .append(vec![quota_event("good", "quota.added", added_payload())], ExpectedVersion::Exact(0))
            .unwrap();

        let handler = handler();
        for _ in 1..DEFAULT_MAX_ATTEMPTS {
            assert!(matches!(handler.catch_up(&store, 0), Err(ProjectionError::Reduce(_))));
            assert!(handler.executor().select(QUOTAS_TABLE, &[]).unwrap().is_empty());
        }

        assert_eq!(handler.catch_up(&store, 0).unwrap(), 2);
        let rows = handler.executor().select(QUOTAS_TABLE, &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["instance_id"].as_text(), Some("good"));

        let quarantined = handler.quarantined();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].tenant_id, TenantId::new("bad"));

        // Later events of the quarantined stream are skipped right away.
        store
            .append(vec![quota_event("bad", "quota.removed", json!({}))], ExpectedVersion::Exact(1))
            .unwrap();
        assert_eq!(handler.catch_up(&store, 2).unwrap(), 3);
    }

    #[test]
    fn transient_failure_does_not_quarantine() {
        let store = InMemoryEventStore::new();
        store
            .append(vec![quota_event("tenant", "quota.added", json!({ "unit": "x" }))], ExpectedVersion::Exact(0))
            .unwrap();

        let handler = handler().with_max_attempts(5);
        assert!(handler.catch_up(&store, 0).is_err());
        assert!(handler.catch_up(&store, 0).is_err());
        assert!(handler.quarantined().is_empty());
    }
}
