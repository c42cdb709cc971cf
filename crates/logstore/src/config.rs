//! Emission pipeline configuration.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::emitter::{LogEmitter, Sink};
use crate::emitters::{Debouncer, RecordStore, StdoutEmitter};
use crate::record::LogRecord;

pub const DEFAULT_EMIT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_BULK_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid log store configuration: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogStoreConfig {
    pub access: EmitterConfig,
    pub execution: EmitterConfig,
    /// Upper bound for a single sink to accept one record.
    pub emit_timeout_ms: u64,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            access: EmitterConfig::default(),
            execution: EmitterConfig::default(),
            emit_timeout_ms: DEFAULT_EMIT_TIMEOUT_MS,
        }
    }
}

impl LogStoreConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn emit_timeout(&self) -> Duration {
        Duration::from_millis(self.emit_timeout_ms)
    }
}

/// Sinks of one record kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    pub enabled: bool,
    pub stdout: bool,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub enabled: bool,
    /// Writes go straight to the store when unset.
    pub debounce: Option<DebounceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub max_bulk_size: usize,
    /// Zero disables the periodic flush.
    pub min_frequency_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            max_bulk_size: DEFAULT_MAX_BULK_SIZE,
            min_frequency_ms: 0,
        }
    }
}

impl DebounceConfig {
    pub fn min_frequency(&self) -> Option<Duration> {
        (self.min_frequency_ms > 0).then(|| Duration::from_millis(self.min_frequency_ms))
    }
}

impl EmitterConfig {
    /// Build the sinks for this record kind.
    ///
    /// The database sink comes first and answers usage queries from `store`.
    /// Must be called inside a tokio runtime when debouncing with a
    /// `min_frequency`.
    pub fn build_sinks<T: LogRecord>(&self, store: Arc<RecordStore<T>>) -> Vec<Sink<T>> {
        let database: Arc<dyn LogEmitter<T>> = match &self.database.debounce {
            Some(debounce) => Arc::new(Debouncer::new(debounce, store.clone())),
            None => store.clone(),
        };

        vec![
            Sink::with_usage(self.enabled && self.database.enabled, database, store),
            Sink::new(self.enabled && self.stdout, Arc::new(StdoutEmitter)),
        ]
    }
}
