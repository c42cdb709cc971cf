use serde_json::Value as JsonValue;

use quotaflow_core::{DomainError, DomainResult};

use crate::{EventEnvelope, Statement};

/// Failure to reduce an event: always [`DomainError::InvalidArgument`].
pub type ReduceError = DomainError;

/// A reducer turns one event into one projection [`Statement`].
///
/// Reducers are pure: no IO, safe to call repeatedly on the same event. The
/// exactly-once *effect* comes from the executor checking
/// `Statement::previous_sequence`, not from the reducer.
///
/// An event the reducer does not handle is an error
/// ([`DomainError::InvalidArgument`]), never silently ignored.
pub trait Reducer: Send + Sync {
    /// Stable projection name (used for logging and sequence bookkeeping).
    fn name(&self) -> &'static str;

    fn reduce(&self, envelope: &EventEnvelope<JsonValue>) -> Result<Statement, ReduceError>;
}

/// Fail unless `envelope` is exactly `aggregate_type` / `event_type`.
pub fn ensure_event(
    envelope: &EventEnvelope<JsonValue>,
    aggregate_type: &str,
    event_type: &str,
) -> DomainResult<()> {
    if envelope.aggregate_type() != aggregate_type || envelope.event_type() != event_type {
        return Err(DomainError::invalid_argument(format!(
            "reduce.wrong.event: expected {aggregate_type}/{event_type}, got {}/{}",
            envelope.aggregate_type(),
            envelope.event_type()
        )));
    }
    Ok(())
}
