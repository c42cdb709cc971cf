use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use quotaflow_core::{AggregateId, DomainError, DomainResult, TenantId};

/// Envelope for an event, containing multi-tenant + stream metadata.
///
/// This is the unit you persist/append to an event stream and the unit
/// reducers consume.
///
/// Notes:
/// - **Multi-tenancy** is enforced here via `tenant_id`.
/// - **Append-only**: `sequence_number` is monotonically increasing per stream and
///   `previous_sequence` is the sequence the stream was at before this event.
/// - `payload` is the domain-agnostic event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    tenant_id: TenantId,

    aggregate_id: AggregateId,
    aggregate_type: String,
    event_type: String,

    /// Monotonically increasing position in the aggregate stream.
    sequence_number: u64,
    /// Position of the stream before this event was appended.
    previous_sequence: u64,

    created_at: DateTime<Utc>,

    payload: E,
}

impl<E> EventEnvelope<E> {
    /// Create an envelope at the head of a fresh stream (`previous_sequence = 0`,
    /// `sequence_number = 1`). Use [`EventEnvelope::with_sequence`] to place it.
    pub fn new(
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        payload: E,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            sequence_number: 1,
            previous_sequence: 0,
            created_at: Utc::now(),
            payload,
        }
    }

    pub fn with_sequence(mut self, sequence_number: u64, previous_sequence: u64) -> Self {
        self.sequence_number = sequence_number;
        self.previous_sequence = previous_sequence;
        self
    }

    pub fn with_event_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn aggregate_id(&self) -> &AggregateId {
        &self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn previous_sequence(&self) -> u64 {
        self.previous_sequence
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }
}

impl EventEnvelope<JsonValue> {
    /// Parse the JSON payload into the expected shape.
    ///
    /// Wrong field types and missing required fields surface as
    /// [`DomainError::InvalidArgument`].
    pub fn decode_payload<T: DeserializeOwned>(&self) -> DomainResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            DomainError::invalid_argument(format!(
                "cannot parse {} payload (aggregate {}, sequence {}): {e}",
                self.event_type, self.aggregate_id, self.sequence_number
            ))
        })
    }
}
