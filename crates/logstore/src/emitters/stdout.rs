use async_trait::async_trait;
use tracing::info;

use crate::emitter::{EmitError, LogEmitter};
use crate::record::{LogRecord, STREAM_ACTIVITY};

/// Writes records as JSON through `tracing`, tagged `stream = "activity"`.
///
/// Export hooks installed by the observability crate pick these events up.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutEmitter;

#[async_trait]
impl<T: LogRecord> LogEmitter<T> for StdoutEmitter {
    async fn emit(&self, record: T) -> Result<(), EmitError> {
        let json = serde_json::to_string(&record)?;
        info!(
            stream = STREAM_ACTIVITY,
            tenant_id = %record.tenant_id(),
            record = %json,
            "activity"
        );
        Ok(())
    }
}
