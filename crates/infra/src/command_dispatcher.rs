//! Command execution pipeline for event-sourced aggregates.
//!
//! ```text
//! Command
//!   ↓
//! 1. Load events from store (tenant-scoped)
//!   ↓
//! 2. Rehydrate aggregate (apply historical events to rebuild state)
//!   ↓
//! 3. Handle command (pure decision logic, produces events)
//!   ↓
//! 4. Persist events to store (append-only, optimistic concurrency check)
//! ```
//!
//! Projections are fed separately from the store's global log (see
//! [`crate::projections::ProjectionHandler::catch_up`]), so the dispatcher
//! never publishes anything itself.

use thiserror::Error;

use quotaflow_core::{Aggregate, AggregateId, DomainError, ExpectedVersion, TenantId};
use quotaflow_events::Event;

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Optimistic concurrency failure (e.g. stale aggregate version).
    #[error("concurrency conflict: {0}")]
    Concurrency(String),
    /// Tenant isolation violation (cross-tenant or cross-aggregate stream mixing).
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),
    /// Domain validation failure (deterministic).
    #[error("validation failed: {0}")]
    Validation(String),
    /// Domain invariant failure (deterministic).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    /// Domain-level not found.
    #[error("not found")]
    NotFound,
    /// Failed to decode historical events into the aggregate event type.
    #[error("failed to decode stored event: {0}")]
    Deserialize(String),
    /// Persisting to the event store failed.
    #[error("event store failure: {0}")]
    Store(EventStoreError),
}

impl DispatchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DispatchError::NotFound)
    }
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            EventStoreError::TenantIsolation(msg) => DispatchError::TenantIsolation(msg),
            other => DispatchError::Store(other),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::InvalidArgument(msg) => DispatchError::Validation(msg),
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::Conflict(msg) => DispatchError::Concurrency(msg),
            DomainError::NotFound => DispatchError::NotFound,
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
        }
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// Sits between the command surfaces and the event store. Domain code stays
/// pure; the dispatcher owns loading, rehydration and the optimistic append.
///
/// ## Error Semantics
///
/// - **Domain errors**: validation failures, invariant violations → `Validation` / `InvariantViolation`
/// - **Concurrency errors**: version mismatch → `Concurrency`; callers reload and retry
/// - **Tenant errors**: cross-tenant data in a loaded stream → `TenantIsolation`
#[derive(Debug)]
pub struct CommandDispatcher<S> {
    store: S,
}

impl<S> CommandDispatcher<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S> CommandDispatcher<S>
where
    S: EventStore,
{
    /// Dispatch a command through the full event-sourcing pipeline.
    ///
    /// Returns the committed events (empty when the aggregate decided that
    /// nothing happened).
    pub fn dispatch<A>(
        &self,
        tenant_id: &TenantId,
        aggregate_id: &AggregateId,
        command: A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: Event,
    {
        // 1) Load history (tenant-scoped)
        let history = self.store.load_stream(tenant_id, aggregate_id)?;
        validate_loaded_stream(tenant_id, aggregate_id, &history)?;

        // 2) Rehydrate aggregate
        let mut aggregate = make_aggregate(aggregate_id.clone());
        apply_history(&mut aggregate, &history)?;
        let expected = ExpectedVersion::Exact(aggregate.version());

        // 3) Decide events (no mutation)
        let decided = aggregate.handle(&command)?;
        if decided.is_empty() {
            return Ok(vec![]);
        }

        // 4) Persist (append-only, optimistic)
        let uncommitted = decided
            .iter()
            .map(|ev| UncommittedEvent::from_typed(tenant_id.clone(), aggregate_id.clone(), ev))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(self.store.append(uncommitted, expected)?)
    }
}

fn validate_loaded_stream(
    tenant_id: &TenantId,
    aggregate_id: &AggregateId,
    stream: &[StoredEvent],
) -> Result<(), DispatchError> {
    // Enforce tenant isolation even if a buggy backend returns cross-tenant data.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if &e.tenant_id != tenant_id {
            return Err(DispatchError::TenantIsolation(format!(
                "loaded stream contains wrong tenant_id at index {idx}"
            )));
        }
        if &e.aggregate_id != aggregate_id {
            return Err(DispatchError::TenantIsolation(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Store(EventStoreError::InvalidAppend(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: Event,
{
    for stored in history {
        let ev = A::Event::from_envelope(&stored.to_envelope())
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev, stored.sequence_number);
    }
    Ok(())
}
