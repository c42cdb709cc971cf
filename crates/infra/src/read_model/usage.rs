use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use quotaflow_core::TenantId;
use quotaflow_quota::Unit;

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("usage query failed: {0}")]
    Query(String),
}

/// Capability of a record sink to answer usage questions for one unit.
///
/// A sink exposing this becomes the canonical usage source of the
/// admission service and is registered with the quota read model.
#[async_trait]
pub trait UsageQuerier: Send + Sync {
    /// Accounting unit this source meters.
    fn quota_unit(&self) -> Unit;

    /// Usage of `tenant_id` since `start` (inclusive).
    async fn query_usage(&self, tenant_id: &TenantId, start: DateTime<Utc>) -> Result<u64, UsageError>;
}

#[async_trait]
impl<Q> UsageQuerier for Arc<Q>
where
    Q: UsageQuerier + ?Sized,
{
    fn quota_unit(&self) -> Unit {
        (**self).quota_unit()
    }

    async fn query_usage(&self, tenant_id: &TenantId, start: DateTime<Utc>) -> Result<u64, UsageError> {
        (**self).query_usage(tenant_id, start).await
    }
}
