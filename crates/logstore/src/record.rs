//! Activity records and their normalization.
//!
//! Records are normalized once before fan-out so every sink sees the same
//! canonical form: header names lower-cased, credentials redacted and long
//! free text cut.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use quotaflow_core::TenantId;
use quotaflow_quota::duration_nanos;

/// Value of the `stream` field activity records are logged with.
pub const STREAM_ACTIVITY: &str = "activity";

pub const REDACTED: &str = "[REDACTED]";
pub const MAX_REQUEST_URL_LEN: usize = 200;
pub const MAX_EXECUTION_MESSAGE_LEN: usize = 2000;

/// gRPC status code `RESOURCE_EXHAUSTED`.
pub const GRPC_RESOURCE_EXHAUSTED: u16 = 8;
/// HTTP status `429 Too Many Requests`.
pub const HTTP_TOO_MANY_REQUESTS: u16 = 429;

const SENSITIVE_HEADERS: [&str; 6] = [
    "authorization",
    "cookie",
    "set-cookie",
    "grpcgateway-authorization",
    "grpcgateway-cookie",
    "grpcgateway-set-cookie",
];

/// A loggable, meterable action.
///
/// `normalize` returns a canonicalized copy of the same record type.
pub trait LogRecord: Clone + Debug + Serialize + Send + Sync + 'static {
    fn normalize(&self) -> Self;

    fn tenant_id(&self) -> &TenantId;

    fn log_date(&self) -> DateTime<Utc>;

    /// Contribution of this record to its unit's usage.
    fn usage(&self) -> u64;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Grpc,
}

pub type Headers = BTreeMap<String, Vec<String>>;

/// One served API request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLog {
    pub log_date: DateTime<Utc>,
    pub protocol: Protocol,
    pub request_url: String,
    /// HTTP status or gRPC status code, depending on `protocol`.
    pub response_status: u16,
    #[serde(default)]
    pub request_headers: Headers,
    #[serde(default)]
    pub response_headers: Headers,
    pub instance_id: TenantId,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub requested_domain: String,
    #[serde(default)]
    pub requested_host: String,
}

impl AccessLog {
    /// Requests rejected for quota exhaustion do not count against the quota.
    pub fn is_quota_relevant(&self) -> bool {
        match self.protocol {
            Protocol::Http => self.response_status != HTTP_TOO_MANY_REQUESTS,
            Protocol::Grpc => self.response_status != GRPC_RESOURCE_EXHAUSTED,
        }
    }
}

impl LogRecord for AccessLog {
    fn normalize(&self) -> Self {
        Self {
            request_url: cut(&self.request_url, MAX_REQUEST_URL_LEN),
            request_headers: normalize_headers(&self.request_headers),
            response_headers: normalize_headers(&self.response_headers),
            ..self.clone()
        }
    }

    fn tenant_id(&self) -> &TenantId {
        &self.instance_id
    }

    fn log_date(&self) -> DateTime<Utc> {
        self.log_date
    }

    fn usage(&self) -> u64 {
        u64::from(self.is_quota_relevant())
    }
}

/// One custom action run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLog {
    pub log_date: DateTime<Utc>,
    #[serde(with = "duration_nanos")]
    pub took: Duration,
    pub message: String,
    #[serde(default)]
    pub level: String,
    pub instance_id: TenantId,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl LogRecord for ExecutionLog {
    fn normalize(&self) -> Self {
        Self {
            message: cut(&self.message, MAX_EXECUTION_MESSAGE_LEN),
            ..self.clone()
        }
    }

    fn tenant_id(&self) -> &TenantId {
        &self.instance_id
    }

    fn log_date(&self) -> DateTime<Utc> {
        self.log_date
    }

    /// Whole seconds of run time.
    fn usage(&self) -> u64 {
        self.took.as_secs()
    }
}

/// Closed set of activity record kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ActivityRecord {
    Access(AccessLog),
    Execution(ExecutionLog),
}

impl LogRecord for ActivityRecord {
    fn normalize(&self) -> Self {
        match self {
            ActivityRecord::Access(r) => ActivityRecord::Access(r.normalize()),
            ActivityRecord::Execution(r) => ActivityRecord::Execution(r.normalize()),
        }
    }

    fn tenant_id(&self) -> &TenantId {
        match self {
            ActivityRecord::Access(r) => r.tenant_id(),
            ActivityRecord::Execution(r) => r.tenant_id(),
        }
    }

    fn log_date(&self) -> DateTime<Utc> {
        match self {
            ActivityRecord::Access(r) => r.log_date(),
            ActivityRecord::Execution(r) => r.log_date(),
        }
    }

    fn usage(&self) -> u64 {
        match self {
            ActivityRecord::Access(r) => r.usage(),
            ActivityRecord::Execution(r) => r.usage(),
        }
    }
}

impl From<AccessLog> for ActivityRecord {
    fn from(value: AccessLog) -> Self {
        ActivityRecord::Access(value)
    }
}

impl From<ExecutionLog> for ActivityRecord {
    fn from(value: ExecutionLog) -> Self {
        ActivityRecord::Execution(value)
    }
}

fn normalize_headers(headers: &Headers) -> Headers {
    headers
        .iter()
        .map(|(name, values)| {
            let name = name.to_lowercase();
            let values = if SENSITIVE_HEADERS.contains(&name.as_str()) {
                vec![REDACTED.to_string()]
            } else {
                values.clone()
            };
            (name, values)
        })
        .collect()
}

/// First `max` characters of `value`.
fn cut(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    fn access(protocol: Protocol, status: u16) -> AccessLog {
        AccessLog {
            log_date: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            protocol,
            request_url: "https://api.test/v1/users".to_string(),
            response_status: status,
            request_headers: Headers::new(),
            response_headers: Headers::new(),
            instance_id: TenantId::new("tenant"),
            project_id: String::new(),
            requested_domain: String::new(),
            requested_host: String::new(),
        }
    }

    #[test]
    fn headers_are_lowercased_and_redacted() {
        let mut record = access(Protocol::Http, 200);
        record
            .request_headers
            .insert("Authorization".to_string(), vec!["Bearer secret".to_string()]);
        record
            .request_headers
            .insert("X-Request-Id".to_string(), vec!["abc".to_string()]);
        record
            .response_headers
            .insert("Grpcgateway-Set-Cookie".to_string(), vec!["sid=1".to_string()]);

        let normalized = record.normalize();
        assert_eq!(normalized.request_headers["authorization"], vec![REDACTED.to_string()]);
        assert_eq!(normalized.request_headers["x-request-id"], vec!["abc".to_string()]);
        assert_eq!(
            normalized.response_headers["grpcgateway-set-cookie"],
            vec![REDACTED.to_string()]
        );
        assert!(!normalized.request_headers.contains_key("Authorization"));
    }

    #[test]
    fn exhausted_requests_do_not_count() {
        assert_eq!(access(Protocol::Http, 200).usage(), 1);
        assert_eq!(access(Protocol::Http, 429).usage(), 0);
        assert_eq!(access(Protocol::Grpc, 0).usage(), 1);
        assert_eq!(access(Protocol::Grpc, GRPC_RESOURCE_EXHAUSTED).usage(), 0);
    }

    #[test]
    fn execution_usage_is_whole_seconds() {
        let record = ExecutionLog {
            log_date: Utc::now(),
            took: Duration::from_millis(2_900),
            message: "x".repeat(3_000),
            level: "info".to_string(),
            instance_id: TenantId::new("tenant"),
            project_id: String::new(),
            fields: BTreeMap::new(),
        };
        assert_eq!(record.usage(), 2);
        assert_eq!(record.normalize().message.len(), MAX_EXECUTION_MESSAGE_LEN);
    }

    #[test]
    fn activity_record_keeps_its_variant() {
        let record = ActivityRecord::from(access(Protocol::Grpc, 0));
        assert!(matches!(record.normalize(), ActivityRecord::Access(_)));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "access");
        assert_eq!(json["instanceId"], "tenant");
    }

    proptest! {
        /// Property: normalized URLs are a prefix of at most the limit.
        #[test]
        fn url_is_cut_on_char_boundaries(url in "\\PC{0,400}") {
            let mut record = access(Protocol::Http, 200);
            record.request_url = url.clone();
            let cut = record.normalize().request_url;
            prop_assert!(cut.chars().count() <= MAX_REQUEST_URL_LEN);
            prop_assert!(url.starts_with(&cut));
        }
    }
}
