use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use quotaflow_core::TenantId;
use quotaflow_infra::{UsageError, UsageQuerier};
use quotaflow_quota::Unit;

use super::debounce::BulkWriter;
use crate::emitter::{EmitError, LogEmitter};
use crate::record::LogRecord;

/// In-memory record store metering one unit.
///
/// Usage of a tenant is the sum of [`LogRecord::usage`] over its records
/// logged at or after the period start.
#[derive(Debug)]
pub struct RecordStore<T> {
    unit: Unit,
    records: RwLock<Vec<T>>,
}

impl<T: LogRecord> RecordStore<T> {
    pub fn new(unit: Unit) -> Self {
        Self {
            unit,
            records: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored records of one tenant, in arrival order.
    pub fn records_of(&self, tenant_id: &TenantId) -> Vec<T> {
        self.records
            .read()
            .map(|r| r.iter().filter(|rec| rec.tenant_id() == tenant_id).cloned().collect())
            .unwrap_or_default()
    }

    fn push_all(&self, records: impl IntoIterator<Item = T>) -> Result<(), EmitError> {
        let mut stored = self
            .records
            .write()
            .map_err(|_| EmitError::Rejected("record store lock poisoned".to_string()))?;
        stored.extend(records);
        Ok(())
    }
}

#[async_trait]
impl<T: LogRecord> LogEmitter<T> for RecordStore<T> {
    async fn emit(&self, record: T) -> Result<(), EmitError> {
        self.push_all([record])
    }
}

#[async_trait]
impl<T: LogRecord> BulkWriter<T> for RecordStore<T> {
    async fn write_bulk(&self, records: Vec<T>) -> Result<(), EmitError> {
        self.push_all(records)
    }
}

#[async_trait]
impl<T: LogRecord> UsageQuerier for RecordStore<T> {
    fn quota_unit(&self) -> Unit {
        self.unit
    }

    async fn query_usage(&self, tenant_id: &TenantId, start: DateTime<Utc>) -> Result<u64, UsageError> {
        let records = self
            .records
            .read()
            .map_err(|_| UsageError::Query("record store lock poisoned".to_string()))?;
        Ok(records
            .iter()
            .filter(|r| r.tenant_id() == tenant_id && r.log_date() >= start)
            .map(|r| r.usage())
            .fold(0u64, u64::saturating_add))
    }
}
