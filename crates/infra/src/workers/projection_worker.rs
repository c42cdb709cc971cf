use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use quotaflow_events::Reducer;

use crate::event_store::EventStore;
use crate::projections::{ProjectionHandler, StatementExecutor};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<u64>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// Returns the last global position the worker projected.
    pub fn shutdown(mut self) -> u64 {
        let _ = self.shutdown.send(());
        self.join.take().and_then(|j| j.join().ok()).unwrap_or(0)
    }
}

/// Polls an event store and feeds new events to a projection.
///
/// - Resumes from the given global position
/// - Failed batches are retried from the last good position on the next poll
/// - Streams that keep failing are quarantined by the handler
/// - Supports graceful shutdown
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    pub fn spawn<R, X, S>(
        name: &'static str,
        handler: Arc<ProjectionHandler<R, X>>,
        store: S,
        start: u64,
        poll: Duration,
    ) -> std::io::Result<WorkerHandle>
    where
        R: Reducer + 'static,
        X: StatementExecutor + 'static,
        S: EventStore + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, &handler, &store, start, poll, &shutdown_rx))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn worker_loop<R, X, S>(
    name: &'static str,
    handler: &ProjectionHandler<R, X>,
    store: &S,
    start: u64,
    poll: Duration,
    shutdown_rx: &mpsc::Receiver<()>,
) -> u64
where
    R: Reducer,
    X: StatementExecutor,
    S: EventStore,
{
    let mut position = start;
    info!(worker = name, position, "projection worker started");

    loop {
        match handler.catch_up(store, position) {
            Ok(last) => position = last,
            Err(err) => warn!(worker = name, position, error = %err, "projection worker catch-up failed"),
        }

        match shutdown_rx.recv_timeout(poll) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(worker = name, position, "projection worker stopped");
    position
}

#[cfg(test)]
mod tests {
    use std::time::{Duration as StdDuration, Instant};

    use chrono::{TimeZone, Utc};

    use quotaflow_core::TenantId;
    use quotaflow_quota::{AddQuota, Unit};

    use super::*;
    use crate::commands::EventSourcedQuotaCommands;
    use crate::event_store::InMemoryEventStore;
    use crate::projections::{InMemoryProjectionStore, QuotaProjection, QUOTAS_TABLE};

    #[test]
    fn worker_projects_new_events_until_shutdown() {
        let store = Arc::new(InMemoryEventStore::new());
        let tables = Arc::new(InMemoryProjectionStore::with_tables(QuotaProjection::tables()));
        let handler = Arc::new(ProjectionHandler::new(
            QuotaProjection,
            tables.clone(),
            QuotaProjection::subscribes_to,
        ));

        let worker = ProjectionWorker::spawn(
            "quota-projection",
            handler,
            store.clone(),
            0,
            Duration::from_millis(10),
        )
        .unwrap();

        let commands = EventSourcedQuotaCommands::new(store.clone());
        commands
            .add_quota(
                &TenantId::new("tenant"),
                AddQuota {
                    unit: Unit::RequestsAllAuthenticated,
                    amount: 10,
                    limit: true,
                    from: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
                    interval: StdDuration::from_secs(60),
                    notifications: Vec::new(),
                },
            )
            .unwrap();

        let deadline = Instant::now() + StdDuration::from_secs(5);
        while tables.select(QUOTAS_TABLE, &[]).unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(StdDuration::from_millis(5));
        }

        assert_eq!(tables.select(QUOTAS_TABLE, &[]).unwrap().len(), 1);
        assert_eq!(worker.shutdown(), 1);
    }
}
