//! Tracing/logging initialization.

use crate::config::{LogConfig, LogConfigError};
use crate::hooks::HookRegistry;

/// Initialize tracing/logging for the process with defaults: JSON logs at
/// `info`, configurable via `RUST_LOG`, no export hooks.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let _ = LogConfig::default().set_logger(&HookRegistry::new());
}

/// Initialize tracing/logging from `config`, resolving its hooks against the
/// built-in registry.
pub fn init_with(config: &LogConfig) -> Result<(), LogConfigError> {
    config.set_logger(&HookRegistry::with_defaults())
}
