//! Reads activity records as JSON lines from stdin and admits or limits each
//! one against its tenant's quota.

use std::path::PathBuf;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use quotaflow_app::{Admission, App, AppConfig, CONFIG_ENV};
use quotaflow_logstore::{ActivityRecord, LogRecord};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
    let config = AppConfig::load(path.as_deref())?;
    quotaflow_observability::tracing::init_with(&config.log)?;

    let app = App::start(&config)?;
    tracing::info!(
        access = app.access.enabled(),
        execution = app.execution.enabled(),
        "quotaflow started"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0u64;
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let record: ActivityRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(line = line_no, error = %err, "skipping malformed record");
                continue;
            }
        };

        let tenant_id = record.tenant_id().clone();
        match app.admit(record).await {
            Admission::Admitted { remaining } => {
                tracing::debug!(line = line_no, tenant_id = %tenant_id, ?remaining, "admitted");
            }
            Admission::Limited => {
                tracing::warn!(line = line_no, tenant_id = %tenant_id, "quota exhausted, record limited");
            }
        }
    }

    app.shutdown().await;
    Ok(())
}
