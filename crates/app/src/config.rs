//! Process configuration.
//!
//! Loaded from a JSON file named by `QUOTAFLOW_CONFIG`; every section falls
//! back to its defaults.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use quotaflow_core::TenantId;
use quotaflow_logstore::LogStoreConfig;
use quotaflow_observability::LogConfig;
use quotaflow_quota::{AddQuota, QuotaAdded};

pub const CONFIG_ENV: &str = "QUOTAFLOW_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log: LogConfig,
    pub logstore: LogStoreConfig,
    /// How often the projection worker polls the event store.
    pub projection_poll_ms: u64,
    /// Threshold sweep period; zero disables the sweep.
    pub threshold_sweep_ms: u64,
    /// Quotas created at startup.
    pub quotas: Vec<QuotaSeed>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            logstore: LogStoreConfig::default(),
            projection_poll_ms: 250,
            threshold_sweep_ms: 60_000,
            quotas: Vec::new(),
        }
    }
}

/// A quota to create for `tenant`, in the quota-added wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSeed {
    pub tenant: TenantId,
    #[serde(flatten)]
    pub quota: QuotaAdded,
}

impl QuotaSeed {
    pub fn command(&self) -> AddQuota {
        AddQuota {
            unit: self.quota.unit,
            amount: self.quota.amount,
            limit: self.quota.limit,
            from: self.quota.from,
            interval: self.quota.interval,
            notifications: self.quota.notifications.clone(),
        }
    }
}

impl AppConfig {
    /// Read `path`, or use defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn projection_poll(&self) -> Duration {
        Duration::from_millis(self.projection_poll_ms.max(1))
    }

    pub fn threshold_sweep(&self) -> Option<Duration> {
        (self.threshold_sweep_ms > 0).then(|| Duration::from_millis(self.threshold_sweep_ms))
    }

    /// Tenants with a configured quota, without duplicates.
    pub fn tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self.quotas.iter().map(|q| q.tenant.clone()).collect();
        tenants.sort();
        tenants.dedup();
        tenants
    }
}

#[cfg(test)]
mod tests {
    use quotaflow_quota::Unit;

    use super::*;

    #[test]
    fn parses_quota_seeds() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "threshold_sweep_ms": 0,
                "quotas": [{
                    "tenant": "acme",
                    "unit": 1,
                    "amount": 1000,
                    "limit": true,
                    "from": "2023-01-01T00:00:00Z",
                    "interval": 3600000000000,
                    "notifications": [{ "id": "half", "percent": 50, "callURL": "https://hooks.test" }]
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(config.threshold_sweep(), None);
        assert_eq!(config.projection_poll(), Duration::from_millis(250));
        assert_eq!(config.tenants(), vec![TenantId::new("acme")]);

        let cmd = config.quotas[0].command();
        assert_eq!(cmd.unit, Unit::RequestsAllAuthenticated);
        assert_eq!(cmd.interval, Duration::from_secs(3_600));
        assert_eq!(cmd.notifications[0].percent, 50);
    }

    #[test]
    fn missing_path_means_defaults() {
        let config = AppConfig::load(None).unwrap();
        assert_eq!(config.threshold_sweep(), Some(Duration::from_secs(60)));
        assert!(config.quotas.is_empty());
    }
}
