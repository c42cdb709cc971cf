use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use quotaflow_infra::UsageQuerier;

use crate::record::LogRecord;

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("sink rejected record: {0}")]
    Rejected(String),

    #[error("sink timed out")]
    Timeout,
}

/// Destination of normalized records.
#[async_trait]
pub trait LogEmitter<T: LogRecord>: Send + Sync {
    async fn emit(&self, record: T) -> Result<(), EmitError>;
}

#[async_trait]
impl<T, E> LogEmitter<T> for Arc<E>
where
    T: LogRecord,
    E: LogEmitter<T> + ?Sized,
{
    async fn emit(&self, record: T) -> Result<(), EmitError> {
        (**self).emit(record).await
    }
}

/// A configured emitter, optionally doubling as a usage source.
///
/// The usage capability is fixed at construction: [`Sink::with_usage`] is the
/// only way to get one.
pub struct Sink<T: LogRecord> {
    enabled: bool,
    emitter: Arc<dyn LogEmitter<T>>,
    usage: Option<Arc<dyn UsageQuerier>>,
}

impl<T: LogRecord> Clone for Sink<T> {
    fn clone(&self) -> Self {
        Self {
            enabled: self.enabled,
            emitter: self.emitter.clone(),
            usage: self.usage.clone(),
        }
    }
}

impl<T: LogRecord> std::fmt::Debug for Sink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink")
            .field("enabled", &self.enabled)
            .field("usage", &self.usage.as_ref().map(|u| u.quota_unit()))
            .finish_non_exhaustive()
    }
}

impl<T: LogRecord> Sink<T> {
    pub fn new(enabled: bool, emitter: Arc<dyn LogEmitter<T>>) -> Self {
        Self {
            enabled,
            emitter,
            usage: None,
        }
    }

    /// Sink whose records also answer usage queries through `usage`.
    pub fn with_usage(
        enabled: bool,
        emitter: Arc<dyn LogEmitter<T>>,
        usage: Arc<dyn UsageQuerier>,
    ) -> Self {
        Self {
            enabled,
            emitter,
            usage: Some(usage),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn usage_querier(&self) -> Option<Arc<dyn UsageQuerier>> {
        self.usage.clone()
    }

    pub fn emitter(&self) -> Arc<dyn LogEmitter<T>> {
        self.emitter.clone()
    }
}
