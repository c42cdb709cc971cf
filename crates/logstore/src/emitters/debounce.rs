//! Batches records in front of a bulk writer.
//!
//! A batch is flushed when it reaches `max_bulk_size` records, or by the
//! background ticker every `min_frequency`, whichever comes first.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::DebounceConfig;
use crate::emitter::{EmitError, LogEmitter};
use crate::record::LogRecord;

/// Destination accepting records in batches.
#[async_trait]
pub trait BulkWriter<T: LogRecord>: Send + Sync {
    async fn write_bulk(&self, records: Vec<T>) -> Result<(), EmitError>;
}

struct Buffer<T: LogRecord> {
    max_bulk_size: usize,
    pending: Mutex<Vec<T>>,
    writer: Arc<dyn BulkWriter<T>>,
}

impl<T: LogRecord> Buffer<T> {
    async fn flush(&self) -> Result<(), EmitError> {
        let batch = std::mem::take(&mut *self.pending.lock().await);
        if batch.is_empty() {
            return Ok(());
        }
        let size = batch.len();
        self.writer.write_bulk(batch).await?;
        debug!(size, "flushed record batch");
        Ok(())
    }
}

pub struct Debouncer<T: LogRecord> {
    buffer: Arc<Buffer<T>>,
    ticker: Option<JoinHandle<()>>,
}

impl<T: LogRecord> Debouncer<T> {
    /// Must be called inside a tokio runtime when `min_frequency` is set.
    pub fn new(config: &DebounceConfig, writer: Arc<dyn BulkWriter<T>>) -> Self {
        let buffer = Arc::new(Buffer {
            max_bulk_size: config.max_bulk_size.max(1),
            pending: Mutex::new(Vec::new()),
            writer,
        });
        let ticker = config
            .min_frequency()
            .map(|every| spawn_ticker(Arc::downgrade(&buffer), every));
        Self { buffer, ticker }
    }

    /// Write out everything buffered so far.
    pub async fn flush(&self) -> Result<(), EmitError> {
        self.buffer.flush().await
    }

    pub async fn pending(&self) -> usize {
        self.buffer.pending.lock().await.len()
    }
}

fn spawn_ticker<T: LogRecord>(buffer: Weak<Buffer<T>>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(buffer) = buffer.upgrade() else {
                break;
            };
            if let Err(err) = buffer.flush().await {
                warn!(error = %err, "periodic flush of record batch failed");
            }
        }
    })
}

impl<T: LogRecord> Drop for Debouncer<T> {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

#[async_trait]
impl<T: LogRecord> LogEmitter<T> for Debouncer<T> {
    async fn emit(&self, record: T) -> Result<(), EmitError> {
        let full = {
            let mut pending = self.buffer.pending.lock().await;
            pending.push(record);
            pending.len() >= self.buffer.max_bulk_size
        };
        if full {
            self.buffer.flush().await?;
        }
        Ok(())
    }
}
