use serde::{Deserialize, Serialize};

use quotaflow_core::DomainError;

/// Accounting dimension a quota meters.
///
/// Serialized as its integer code; unknown codes fail to parse.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Unit {
    /// Count of authenticated API requests.
    RequestsAllAuthenticated,
    /// Total run time of custom actions, in seconds.
    ActionsAllRunsSeconds,
}

impl Unit {
    pub const ALL: [Unit; 2] = [Unit::RequestsAllAuthenticated, Unit::ActionsAllRunsSeconds];

    pub fn code(self) -> u8 {
        match self {
            Unit::RequestsAllAuthenticated => 1,
            Unit::ActionsAllRunsSeconds => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Unit::RequestsAllAuthenticated => "requests.all.authenticated",
            Unit::ActionsAllRunsSeconds => "actions.all.runs.seconds",
        }
    }
}

impl TryFrom<u8> for Unit {
    type Error = DomainError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Unit::RequestsAllAuthenticated),
            2 => Ok(Unit::ActionsAllRunsSeconds),
            other => Err(DomainError::invalid_argument(format!("unknown quota unit {other}"))),
        }
    }
}

impl From<Unit> for u8 {
    fn from(value: Unit) -> Self {
        value.code()
    }
}

impl From<Unit> for quotaflow_events::ColumnValue {
    fn from(value: Unit) -> Self {
        quotaflow_events::ColumnValue::Integer(i64::from(value.code()))
    }
}

impl core::fmt::Display for Unit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_integer_code() {
        assert_eq!(serde_json::to_string(&Unit::RequestsAllAuthenticated).unwrap(), "1");
        let unit: Unit = serde_json::from_str("2").unwrap();
        assert_eq!(unit, Unit::ActionsAllRunsSeconds);
    }

    #[test]
    fn unknown_code_is_rejected() {
        assert!(serde_json::from_str::<Unit>("0").is_err());
        assert!(serde_json::from_str::<Unit>("7").is_err());
        assert!(Unit::try_from(9).unwrap_err().is_invalid_argument());
    }
}
