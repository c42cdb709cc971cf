use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use quotaflow_core::{AggregateId, ExpectedVersion, TenantId};
use quotaflow_events::{Event, EventEnvelope};

/// An event ready to be appended to a stream (not yet assigned a sequence number).
///
/// Use [`UncommittedEvent::from_typed`] to build one from a typed domain event:
/// it serializes the payload and captures the event type needed to decode it
/// again later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub created_at: DateTime<Utc>,

    pub payload: JsonValue,
}

/// A stored event in an append-only stream (assigned a sequence number).
///
/// Sequence numbers are assigned by the event store during append and are:
/// - **Monotonically increasing** per stream (tenant + aggregate), starting at 1
/// - **Gapless**: `previous_sequence` is always `sequence_number - 1`
/// - **Immutable** once assigned
///
/// `position` is the global append order across all streams; projection
/// handlers use it to catch up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub sequence_number: u64,
    pub previous_sequence: u64,
    pub position: u64,

    pub event_type: String,
    pub created_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl StoredEvent {
    /// Convert a stored event into a tenant-scoped envelope for reducers.
    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.tenant_id.clone(),
            self.aggregate_id.clone(),
            self.aggregate_type.clone(),
            self.event_type.clone(),
            self.payload.clone(),
        )
        .with_event_id(self.event_id)
        .with_sequence(self.sequence_number, self.previous_sequence)
        .with_created_at(self.created_at)
    }
}

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency, isolation) as
/// opposed to domain errors (validation, invariants).
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),
}

/// Append-only, tenant-scoped event store.
///
/// Streams are keyed by `(tenant_id, aggregate_id)`; within a stream events
/// have gapless sequence numbers `1, 2, 3, ...`.
///
/// Implementations must:
/// - enforce tenant isolation (a batch targets exactly one tenant and aggregate)
/// - enforce optimistic concurrency against the current stream version
/// - assign sequence numbers starting at `current_version + 1`
/// - persist a batch atomically
pub trait EventStore: Send + Sync {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load the full stream for a tenant + aggregate, in sequence order.
    fn load_stream(
        &self,
        tenant_id: &TenantId,
        aggregate_id: &AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load every event appended after global `position`, in append order.
    fn load_since(&self, position: u64) -> Result<Vec<StoredEvent>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn load_stream(
        &self,
        tenant_id: &TenantId,
        aggregate_id: &AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(tenant_id, aggregate_id)
    }

    fn load_since(&self, position: u64) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_since(position)
    }
}

impl UncommittedEvent {
    /// Convenience constructor from a typed domain event.
    pub fn from_typed<E>(
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: Event,
    {
        let payload = event
            .to_payload()
            .map_err(|e| EventStoreError::InvalidAppend(e.to_string()))?;

        Ok(Self {
            event_id: Uuid::now_v7(),
            tenant_id,
            aggregate_id,
            aggregate_type: event.aggregate_type().to_string(),
            event_type: event.event_type().to_string(),
            created_at: Utc::now(),
            payload,
        })
    }
}
