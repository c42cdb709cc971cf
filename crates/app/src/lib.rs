//! Process wiring: event store, quota projection, read model and the two
//! admission services (API access and action execution).

pub mod config;

use std::sync::Arc;

use anyhow::Context;
use tracing::warn;

use quotaflow_core::TenantId;
use quotaflow_infra::event_store::InMemoryEventStore;
use quotaflow_infra::projections::{InMemoryProjectionStore, ProjectionHandler, QuotaProjection};
use quotaflow_infra::read_model::ProjectionQuotaQueries;
use quotaflow_infra::workers::{ProjectionWorker, WorkerHandle};
use quotaflow_infra::{CommandError, EventSourcedQuotaCommands};
use quotaflow_logstore::{
    AccessLog, ActivityRecord, AdmissionService, ExecutionLog, RecordStore, SweepHandle,
};
use quotaflow_quota::Unit;

pub use config::{AppConfig, CONFIG_ENV, QuotaSeed};

pub type Commands = EventSourcedQuotaCommands<Arc<InMemoryEventStore>>;
pub type Queries = ProjectionQuotaQueries<Arc<InMemoryProjectionStore>>;

/// Admission verdict for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted { remaining: Option<u64> },
    Limited,
}

pub struct App {
    pub events: Arc<InMemoryEventStore>,
    pub commands: Arc<Commands>,
    pub queries: Arc<Queries>,
    pub access: Arc<AdmissionService<AccessLog>>,
    pub execution: Arc<AdmissionService<ExecutionLog>>,
    projection: WorkerHandle,
    sweeps: Vec<SweepHandle>,
}

impl App {
    /// Wire everything and start the background workers.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(config: &AppConfig) -> anyhow::Result<Self> {
        let events = Arc::new(InMemoryEventStore::new());
        let tables = Arc::new(InMemoryProjectionStore::with_tables(QuotaProjection::tables()));

        let handler = Arc::new(ProjectionHandler::new(
            QuotaProjection,
            tables.clone(),
            QuotaProjection::subscribes_to,
        ));
        let projection = ProjectionWorker::spawn(
            "quota-projection",
            handler,
            events.clone(),
            0,
            config.projection_poll(),
        )
        .context("spawning projection worker")?;

        let commands = Arc::new(EventSourcedQuotaCommands::new(events.clone()));
        let queries = Arc::new(ProjectionQuotaQueries::new(tables));

        let access_records = Arc::new(RecordStore::<AccessLog>::new(Unit::RequestsAllAuthenticated));
        let execution_records = Arc::new(RecordStore::<ExecutionLog>::new(Unit::ActionsAllRunsSeconds));
        queries.register_usage_source(access_records.clone());
        queries.register_usage_source(execution_records.clone());

        let emit_timeout = config.logstore.emit_timeout();
        let access = Arc::new(AdmissionService::new(
            queries.clone(),
            commands.clone(),
            config.logstore.access.build_sinks(access_records),
            emit_timeout,
        ));
        let execution = Arc::new(AdmissionService::new(
            queries.clone(),
            commands.clone(),
            config.logstore.execution.build_sinks(execution_records),
            emit_timeout,
        ));

        for seed in &config.quotas {
            match commands.add_quota(&seed.tenant, seed.command()) {
                Ok(_) => {}
                Err(CommandError::Conflict(reason)) => {
                    warn!(tenant_id = %seed.tenant, unit = ?seed.quota.unit, reason = %reason, "quota already exists");
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("adding quota for {}", seed.tenant));
                }
            }
        }

        let mut sweeps = Vec::new();
        if let Some(every) = config.threshold_sweep() {
            let tenants = config.tenants();
            if access.reporting_enabled() {
                sweeps.push(access.spawn_threshold_sweep(tenants.clone(), every));
            }
            if execution.reporting_enabled() {
                sweeps.push(execution.spawn_threshold_sweep(tenants, every));
            }
        }

        Ok(Self {
            events,
            commands,
            queries,
            access,
            execution,
            projection,
            sweeps,
        })
    }

    /// Check the record's tenant against its quota and emit the record when
    /// admitted.
    pub async fn admit(&self, record: ActivityRecord) -> Admission {
        match record {
            ActivityRecord::Access(record) => {
                let tenant_id = record.instance_id.clone();
                admit_with(&self.access, &tenant_id, record).await
            }
            ActivityRecord::Execution(record) => {
                let tenant_id = record.instance_id.clone();
                admit_with(&self.execution, &tenant_id, record).await
            }
        }
    }

    /// Stop the sweeps and the projection worker.
    pub async fn shutdown(self) {
        for sweep in self.sweeps {
            sweep.shutdown().await;
        }
        let projection = self.projection;
        let _ = tokio::task::spawn_blocking(move || projection.shutdown()).await;
    }
}

async fn admit_with<T: quotaflow_logstore::LogRecord>(
    service: &AdmissionService<T>,
    tenant_id: &TenantId,
    record: T,
) -> Admission {
    let remaining = service.limit(tenant_id).await;
    if remaining == Some(0) {
        return Admission::Limited;
    }
    service.handle(record).await;
    Admission::Admitted { remaining }
}
