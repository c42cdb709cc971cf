//! Activity record emission and quota admission.
//!
//! Records are normalized and fanned out to configured sinks. One sink may
//! also store records for usage queries, which the [`AdmissionService`] uses
//! to decide how much quota a tenant has left.

pub mod config;
pub mod emitter;
pub mod emitters;
pub mod record;
pub mod service;

pub use config::{ConfigError, DebounceConfig, EmitterConfig, LogStoreConfig};
pub use emitter::{EmitError, LogEmitter, Sink};
pub use emitters::{BulkWriter, Debouncer, RecordStore, StdoutEmitter};
pub use record::{AccessLog, ActivityRecord, ExecutionLog, LogRecord, Protocol, STREAM_ACTIVITY};
pub use service::{AdmissionService, HANDLE_THRESHOLD_TIMEOUT, SweepHandle, ThresholdError};
