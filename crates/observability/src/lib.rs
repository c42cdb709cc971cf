//! Tracing and log export (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

pub mod config;
pub mod decode;
pub mod hooks;

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use config::{LogConfig, LogConfigError, LogFormat};
pub use decode::{RawOptions, decode_raw_config};
pub use hooks::{
    BoxedLayer, HookError, HookFactory, HookRegistry, STREAM_EXPORT_HOOK, StreamExportLayer,
    StreamExportOptions,
};
