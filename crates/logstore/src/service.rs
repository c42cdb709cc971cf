//! Admission service: fans activity records out to sinks and answers how much
//! quota a tenant has left.
//!
//! Decision paths never fail the caller. Emission errors and read model
//! errors are logged and absorbed; `limit` fails open.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use quotaflow_core::TenantId;
use quotaflow_infra::{
    CommandError, QueryError, QuotaCommands, QuotaQueries, QuotaReadModel, UsageError,
    UsageQuerier,
};
use quotaflow_quota::Unit;

use crate::emitter::{EmitError, Sink};
use crate::record::LogRecord;

/// Upper bound for one detached threshold evaluation.
pub const HANDLE_THRESHOLD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ThresholdError {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("threshold evaluation timed out")]
    Timeout,
}

pub struct AdmissionService<T: LogRecord> {
    queries: Arc<dyn QuotaQueries>,
    commands: Arc<dyn QuotaCommands>,
    sinks: Vec<Sink<T>>,
    usage_source: Option<Arc<dyn UsageQuerier>>,
    emit_timeout: Duration,
}

impl<T: LogRecord> AdmissionService<T> {
    /// Disabled sinks are dropped here and never see a record.
    ///
    /// The first enabled sink able to answer usage queries becomes the usage
    /// source; without one, quota reporting is off.
    pub fn new(
        queries: Arc<dyn QuotaQueries>,
        commands: Arc<dyn QuotaCommands>,
        sinks: Vec<Sink<T>>,
        emit_timeout: Duration,
    ) -> Self {
        let sinks: Vec<Sink<T>> = sinks.into_iter().filter(Sink::is_enabled).collect();
        let usage_source = sinks.iter().find_map(Sink::usage_querier);

        debug!(
            sinks = sinks.len(),
            reporting = usage_source.is_some(),
            "admission service configured"
        );

        Self {
            queries,
            commands,
            sinks,
            usage_source,
            emit_timeout,
        }
    }

    /// True when at least one sink was enabled.
    pub fn enabled(&self) -> bool {
        !self.sinks.is_empty()
    }

    pub fn reporting_enabled(&self) -> bool {
        self.usage_source.is_some()
    }

    /// Unit metered by the usage source, if any.
    pub fn quota_unit(&self) -> Option<Unit> {
        self.usage_source.as_ref().map(|source| source.quota_unit())
    }

    /// Normalize `record` and emit it to every enabled sink concurrently.
    pub async fn handle(&self, record: T) {
        let record = record.normalize();
        let mut emissions = JoinSet::new();

        for (sink, target) in self.sinks.iter().enumerate() {
            let emitter = target.emitter();
            let copy = record.clone();
            let timeout = self.emit_timeout;
            emissions.spawn(async move {
                let result = tokio::time::timeout(timeout, emitter.emit(copy))
                    .await
                    .unwrap_or(Err(EmitError::Timeout));
                (sink, result)
            });
        }

        while let Some(joined) = emissions.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((sink, Err(err))) => {
                    warn!(sink, error = %err, record = ?record, "failed to emit log record");
                }
                Err(err) => {
                    warn!(error = %err, record = ?record, "log record emission task failed");
                }
            }
        }
    }

    /// Remaining quota of `tenant_id`; `None` means "do not limit".
    pub async fn limit(&self, tenant_id: &TenantId) -> Option<u64> {
        let source = self.usage_source.as_ref()?;
        if tenant_id.is_empty() {
            return None;
        }

        match self
            .queries
            .get_remaining_quota_usage(tenant_id, source.quota_unit())
            .await
        {
            Ok(remaining) => remaining,
            Err(err) => {
                warn!(
                    tenant_id = %tenant_id,
                    error = %err,
                    "failed to check if usage should be limited"
                );
                None
            }
        }
    }

    /// Report the notifications `usage` makes due, on a detached task.
    pub fn handle_thresholds(
        &self,
        tenant_id: TenantId,
        unit: Unit,
        quota: QuotaReadModel,
        usage: u64,
    ) -> JoinHandle<()> {
        let queries = self.queries.clone();
        let commands = self.commands.clone();

        tokio::spawn(async move {
            let evaluation = report_due_notifications(
                queries.as_ref(),
                commands.as_ref(),
                &tenant_id,
                unit,
                &quota,
                usage,
            );
            let result = tokio::time::timeout(HANDLE_THRESHOLD_TIMEOUT, evaluation)
                .await
                .unwrap_or(Err(ThresholdError::Timeout));

            match result {
                Ok(0) => {}
                Ok(reported) => info!(tenant_id = %tenant_id, ?unit, reported, "quota notifications reported"),
                Err(err) => warn!(tenant_id = %tenant_id, ?unit, error = %err, "handling quota thresholds failed"),
            }
        })
    }

    /// Look up quota and usage of `tenant_id` and hand them to
    /// [`AdmissionService::handle_thresholds`].
    ///
    /// Returns `Ok(None)` when reporting is off or the tenant has no quota.
    pub async fn evaluate_thresholds(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Option<JoinHandle<()>>, ThresholdError> {
        let Some(source) = self.usage_source.as_ref() else {
            return Ok(None);
        };
        let unit = source.quota_unit();

        let quota = match self.queries.get_quota(tenant_id, unit).await {
            Ok(quota) => quota,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let usage = source
            .query_usage(tenant_id, quota.current_period_start)
            .await?;

        Ok(Some(self.handle_thresholds(tenant_id.clone(), unit, quota, usage)))
    }
}

impl<T: LogRecord> AdmissionService<T> {
    /// Evaluate thresholds of `tenants` every `every` until shut down.
    pub fn spawn_threshold_sweep(self: &Arc<Self>, tenants: Vec<TenantId>, every: Duration) -> SweepHandle {
        let shutdown = Arc::new(Notify::new());
        let service = Arc::clone(self);
        let signal = shutdown.clone();

        let join = tokio::spawn(async move {
            info!(tenants = tenants.len(), "quota threshold sweep started");

            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = signal.notified() => break,
                    _ = interval.tick() => {
                        for tenant_id in &tenants {
                            match service.evaluate_thresholds(tenant_id).await {
                                Ok(Some(evaluation)) => {
                                    let _ = evaluation.await;
                                }
                                Ok(None) => {}
                                Err(err) => warn!(
                                    tenant_id = %tenant_id,
                                    error = %err,
                                    "quota threshold evaluation failed"
                                ),
                            }
                        }
                    }
                }
            }

            info!("quota threshold sweep stopped");
        });

        SweepHandle { shutdown, join }
    }
}

/// Running threshold sweep.
pub struct SweepHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl SweepHandle {
    /// Stop the sweep and wait for the current round to finish.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        let _ = self.join.await;
    }
}

async fn report_due_notifications(
    queries: &dyn QuotaQueries,
    commands: &dyn QuotaCommands,
    tenant_id: &TenantId,
    unit: Unit,
    quota: &QuotaReadModel,
    usage: u64,
) -> Result<usize, ThresholdError> {
    let due = queries
        .get_due_quota_notifications(tenant_id, unit, quota, quota.current_period_start, usage)
        .await?;
    if due.is_empty() {
        return Ok(0);
    }
    commands.report_quota_usage(&due).await?;
    Ok(due.len())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};

    use quotaflow_infra::projections::ExecuteError;
    use quotaflow_infra::read_model::{QuotaNotificationReadModel, due_notifications};
    use quotaflow_quota::NotificationDueEvent;

    use super::*;
    use crate::emitter::LogEmitter;
    use crate::emitters::RecordStore;
    use crate::record::{AccessLog, Headers, Protocol, REDACTED};

    fn period_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()
    }

    fn request(tenant: &str) -> AccessLog {
        let mut headers = Headers::new();
        headers.insert("Cookie".to_string(), vec!["sid=1".to_string()]);
        AccessLog {
            log_date: period_start(),
            protocol: Protocol::Http,
            request_url: "/v1/users".to_string(),
            response_status: 200,
            request_headers: headers,
            response_headers: Headers::new(),
            instance_id: TenantId::new(tenant),
            project_id: String::new(),
            requested_domain: String::new(),
            requested_host: String::new(),
        }
    }

    fn quota(amount: u64) -> QuotaReadModel {
        QuotaReadModel {
            tenant_id: TenantId::new("tenant"),
            unit: Unit::RequestsAllAuthenticated,
            amount,
            limit: true,
            from: period_start(),
            interval: Duration::from_secs(3_600),
            current_period_start: period_start(),
            notifications: vec![QuotaNotificationReadModel {
                id: "n1".to_string(),
                call_url: "https://hooks.test/quota".to_string(),
                percent: 50,
                repeat: false,
                latest_due_period_start: None,
                next_due_threshold: 0,
            }],
        }
    }

    /// Read model double answering from fixed values.
    struct FakeQueries {
        quota: Option<QuotaReadModel>,
        remaining: Result<Option<u64>, ()>,
    }

    #[async_trait]
    impl QuotaQueries for FakeQueries {
        async fn get_quota(&self, _tenant_id: &TenantId, _unit: Unit) -> Result<QuotaReadModel, QueryError> {
            self.quota.clone().ok_or(QueryError::NotFound)
        }

        async fn get_quota_usage(
            &self,
            _tenant_id: &TenantId,
            _unit: Unit,
            _period_start: DateTime<Utc>,
        ) -> Result<u64, QueryError> {
            Ok(0)
        }

        async fn get_remaining_quota_usage(
            &self,
            _tenant_id: &TenantId,
            _unit: Unit,
        ) -> Result<Option<u64>, QueryError> {
            self.remaining
                .map_err(|_| QueryError::Storage(ExecuteError::Storage("projection store unavailable".to_string())))
        }

        async fn get_due_quota_notifications(
            &self,
            _tenant_id: &TenantId,
            _unit: Unit,
            quota: &QuotaReadModel,
            period_start: DateTime<Utc>,
            used_abs: u64,
        ) -> Result<Vec<NotificationDueEvent>, QueryError> {
            Ok(due_notifications(quota, period_start, used_abs))
        }
    }

    #[derive(Default)]
    struct RecordingCommands {
        reported: Mutex<Vec<NotificationDueEvent>>,
    }

    #[async_trait]
    impl QuotaCommands for RecordingCommands {
        async fn report_quota_usage(&self, due: &[NotificationDueEvent]) -> Result<(), CommandError> {
            self.reported.lock().unwrap().extend_from_slice(due);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FailingEmitter(AtomicUsize);

    #[async_trait]
    impl LogEmitter<AccessLog> for FailingEmitter {
        async fn emit(&self, _record: AccessLog) -> Result<(), EmitError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(EmitError::Rejected("disk full".to_string()))
        }
    }

    struct StuckEmitter(AtomicUsize);

    #[async_trait]
    impl LogEmitter<AccessLog> for StuckEmitter {
        async fn emit(&self, _record: AccessLog) -> Result<(), EmitError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn fake_queries(quota: Option<QuotaReadModel>, remaining: Result<Option<u64>, ()>) -> Arc<dyn QuotaQueries> {
        Arc::new(FakeQueries { quota, remaining })
    }

    fn service(
        queries: Arc<dyn QuotaQueries>,
        commands: Arc<RecordingCommands>,
        sinks: Vec<Sink<AccessLog>>,
    ) -> AdmissionService<AccessLog> {
        AdmissionService::new(queries, commands, sinks, Duration::from_millis(200))
    }

    fn usage_sink(enabled: bool, store: &Arc<RecordStore<AccessLog>>) -> Sink<AccessLog> {
        Sink::with_usage(enabled, store.clone(), store.clone())
    }

    #[tokio::test]
    async fn disabled_sinks_never_receive_records() {
        let store = Arc::new(RecordStore::new(Unit::RequestsAllAuthenticated));
        let svc = service(
            fake_queries(None, Ok(None)),
            Arc::default(),
            vec![usage_sink(false, &store)],
        );

        assert!(!svc.enabled());
        assert!(!svc.reporting_enabled());
        svc.handle(request("tenant")).await;
        assert!(store.is_empty());
        assert_eq!(svc.limit(&TenantId::new("tenant")).await, None);
    }

    #[tokio::test]
    async fn handle_normalizes_and_isolates_failures() {
        let store = Arc::new(RecordStore::new(Unit::RequestsAllAuthenticated));
        let svc = service(
            fake_queries(None, Ok(None)),
            Arc::default(),
            vec![
                Sink::new(true, Arc::new(FailingEmitter::default())),
                usage_sink(true, &store),
            ],
        );

        svc.handle(request("tenant")).await;

        let stored = store.records_of(&TenantId::new("tenant"));
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].request_headers["cookie"], vec![REDACTED.to_string()]);
    }

    #[tokio::test]
    async fn sink_failures_never_change_enabled() {
        let store = Arc::new(RecordStore::new(Unit::RequestsAllAuthenticated));
        let first = Arc::new(FailingEmitter::default());
        let second = Arc::new(FailingEmitter::default());
        let svc = service(
            fake_queries(None, Ok(None)),
            Arc::default(),
            vec![
                Sink::new(true, first.clone()),
                Sink::new(false, Arc::new(FailingEmitter::default())),
                usage_sink(true, &store),
                Sink::new(true, second.clone()),
            ],
        );
        assert!(svc.enabled());

        for _ in 0..3 {
            svc.handle(request("tenant")).await;
        }

        assert!(svc.enabled());
        assert_eq!(first.0.load(Ordering::SeqCst), 3);
        assert_eq!(second.0.load(Ordering::SeqCst), 3);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_sink_times_out_without_blocking_others() {
        let store = Arc::new(RecordStore::new(Unit::RequestsAllAuthenticated));
        let stuck = Arc::new(StuckEmitter(AtomicUsize::new(0)));
        let svc = service(
            fake_queries(None, Ok(None)),
            Arc::default(),
            vec![Sink::new(true, stuck.clone()), usage_sink(true, &store)],
        );

        svc.handle(request("tenant")).await;

        assert_eq!(stuck.0.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn limit_returns_remaining_from_read_model() {
        let store = Arc::new(RecordStore::new(Unit::RequestsAllAuthenticated));
        let svc = service(
            fake_queries(Some(quota(10)), Ok(Some(7))),
            Arc::default(),
            vec![usage_sink(true, &store)],
        );

        assert_eq!(svc.quota_unit(), Some(Unit::RequestsAllAuthenticated));
        assert_eq!(svc.limit(&TenantId::new("tenant")).await, Some(7));
        assert_eq!(svc.limit(&TenantId::new("")).await, None);
    }

    #[tokio::test]
    async fn limit_fails_open() {
        let store = Arc::new(RecordStore::new(Unit::RequestsAllAuthenticated));
        let svc = service(
            fake_queries(Some(quota(10)), Err(())),
            Arc::default(),
            vec![usage_sink(true, &store)],
        );

        assert_eq!(svc.limit(&TenantId::new("tenant")).await, None);
    }

    #[tokio::test]
    async fn first_enabled_usage_sink_is_the_source() {
        let disabled = Arc::new(RecordStore::new(Unit::ActionsAllRunsSeconds));
        let enabled = Arc::new(RecordStore::new(Unit::RequestsAllAuthenticated));
        let svc = service(
            fake_queries(None, Ok(None)),
            Arc::default(),
            vec![usage_sink(false, &disabled), usage_sink(true, &enabled)],
        );

        assert_eq!(svc.quota_unit(), Some(Unit::RequestsAllAuthenticated));
    }

    #[tokio::test]
    async fn crossed_threshold_is_reported() {
        let store = Arc::new(RecordStore::new(Unit::RequestsAllAuthenticated));
        let commands = Arc::new(RecordingCommands::default());
        let svc = service(
            fake_queries(Some(quota(4)), Ok(Some(2))),
            commands.clone(),
            vec![usage_sink(true, &store)],
        );

        svc.handle(request("tenant")).await;
        svc.handle(request("tenant")).await;

        let evaluation = svc
            .evaluate_thresholds(&TenantId::new("tenant"))
            .await
            .unwrap()
            .expect("tenant has a quota");
        evaluation.await.unwrap();

        let reported = commands.reported.lock().unwrap();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].threshold, 50);
        assert_eq!(reported[0].usage, 2);
    }

    #[tokio::test]
    async fn below_threshold_reports_nothing() {
        let store = Arc::new(RecordStore::new(Unit::RequestsAllAuthenticated));
        let commands = Arc::new(RecordingCommands::default());
        let svc = service(
            fake_queries(Some(quota(10)), Ok(Some(9))),
            commands.clone(),
            vec![usage_sink(true, &store)],
        );

        svc.handle_thresholds(TenantId::new("tenant"), Unit::RequestsAllAuthenticated, quota(10), 1)
            .await
            .unwrap();

        assert!(commands.reported.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tenant_without_quota_is_not_evaluated() {
        let store = Arc::new(RecordStore::new(Unit::RequestsAllAuthenticated));
        let svc = service(
            fake_queries(None, Ok(None)),
            Arc::default(),
            vec![usage_sink(true, &store)],
        );

        let evaluation = svc.evaluate_thresholds(&TenantId::new("tenant")).await.unwrap();
        assert!(evaluation.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_reports_until_shut_down() {
        let store = Arc::new(RecordStore::new(Unit::RequestsAllAuthenticated));
        let commands = Arc::new(RecordingCommands::default());
        let svc = Arc::new(service(
            fake_queries(Some(quota(2)), Ok(Some(0))),
            commands.clone(),
            vec![usage_sink(true, &store)],
        ));
        svc.handle(request("tenant")).await;

        let sweep = svc.spawn_threshold_sweep(vec![TenantId::new("tenant")], Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(15)).await;
        sweep.shutdown().await;

        // The fake read model never folds reports back, so every round reports.
        let rounds = commands.reported.lock().unwrap().len();
        assert_eq!(rounds, 2);
    }
}
