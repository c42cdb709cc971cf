use serde_json::Value as JsonValue;

use quotaflow_core::DomainResult;

use crate::EventEnvelope;

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - designed to be **append-only**
/// - tagged with a stable type name used to route them to reducers
///
/// The payload is stored untagged; the envelope's `event_type` selects the
/// variant when decoding.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "quota.added").
    fn event_type(&self) -> &'static str;

    /// Aggregate type this event belongs to (e.g. "quota").
    fn aggregate_type(&self) -> &'static str;

    /// Serialize the variant's payload.
    fn to_payload(&self) -> DomainResult<JsonValue>;

    /// Decode a stored envelope back into the typed event.
    fn from_envelope(envelope: &EventEnvelope<JsonValue>) -> DomainResult<Self>;
}
