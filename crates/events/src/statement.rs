//! Projection statements (idempotent, order-checked write instructions).
//!
//! A [`Statement`] is produced by a reducer for exactly one event. It carries
//! the stream position the projection must be at (`previous_sequence`) and the
//! position it moves to (`sequence`); executors reject it otherwise.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use quotaflow_core::{AggregateId, ExpectedVersion, TenantId};

use crate::EventEnvelope;

/// A single typed column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    Null,
    Text(String),
    Integer(i64),
    Unsigned(u64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    Interval(Duration),
}

impl ColumnValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ColumnValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            ColumnValue::Unsigned(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ColumnValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            ColumnValue::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_interval(&self) -> Option<Duration> {
        match self {
            ColumnValue::Interval(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        ColumnValue::Text(value.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(value: String) -> Self {
        ColumnValue::Text(value)
    }
}

impl From<&TenantId> for ColumnValue {
    fn from(value: &TenantId) -> Self {
        ColumnValue::Text(value.as_str().to_string())
    }
}

impl From<&AggregateId> for ColumnValue {
    fn from(value: &AggregateId) -> Self {
        ColumnValue::Text(value.as_str().to_string())
    }
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        ColumnValue::Integer(value)
    }
}

impl From<u16> for ColumnValue {
    fn from(value: u16) -> Self {
        ColumnValue::Integer(i64::from(value))
    }
}

impl From<u64> for ColumnValue {
    fn from(value: u64) -> Self {
        ColumnValue::Unsigned(value)
    }
}

impl From<bool> for ColumnValue {
    fn from(value: bool) -> Self {
        ColumnValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for ColumnValue {
    fn from(value: DateTime<Utc>) -> Self {
        ColumnValue::Timestamp(value)
    }
}

impl From<Duration> for ColumnValue {
    fn from(value: Duration) -> Self {
        ColumnValue::Interval(value)
    }
}

impl<T: Into<ColumnValue>> From<Option<T>> for ColumnValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(ColumnValue::Null)
    }
}

/// A named column value, in the order it is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub value: ColumnValue,
}

impl Column {
    pub fn new(name: impl Into<String>, value: impl Into<ColumnValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Equality condition (`column = value`) restricting updates and deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub column: String,
    pub value: ColumnValue,
}

impl Condition {
    pub fn new(column: impl Into<String>, value: impl Into<ColumnValue>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Operation of an execution against one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Insert { columns: Vec<Column> },
    Update { values: Vec<Column>, conditions: Vec<Condition> },
    Delete { conditions: Vec<Condition> },
}

/// One write against one projection table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub table: String,
    pub operation: Operation,
}

impl Execution {
    pub fn insert(table: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            table: table.into(),
            operation: Operation::Insert { columns },
        }
    }

    pub fn update(table: impl Into<String>, values: Vec<Column>, conditions: Vec<Condition>) -> Self {
        Self {
            table: table.into(),
            operation: Operation::Update { values, conditions },
        }
    }

    pub fn delete(table: impl Into<String>, conditions: Vec<Condition>) -> Self {
        Self {
            table: table.into(),
            operation: Operation::Delete { conditions },
        }
    }

    /// Column names and values of an insert, in declaration order.
    pub fn insert_columns(&self) -> Option<&[Column]> {
        match &self.operation {
            Operation::Insert { columns } => Some(columns),
            _ => None,
        }
    }
}

/// Write instruction derived from one event for one projection.
///
/// `executions` are applied atomically, in order. An empty list is a no-op
/// statement: it still advances the projection to `sequence`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    pub tenant_id: TenantId,
    /// Sequence the projection moves to once applied.
    pub sequence: u64,
    /// Sequence the projection must currently be at.
    pub previous_sequence: u64,
    pub executions: Vec<Execution>,
}

impl Statement {
    /// Statement for `envelope` with the given executions.
    pub fn for_event(envelope: &EventEnvelope<JsonValue>, executions: Vec<Execution>) -> Self {
        Self {
            aggregate_type: envelope.aggregate_type().to_string(),
            aggregate_id: envelope.aggregate_id().clone(),
            tenant_id: envelope.tenant_id().clone(),
            sequence: envelope.sequence_number(),
            previous_sequence: envelope.previous_sequence(),
            executions,
        }
    }

    pub fn update(
        envelope: &EventEnvelope<JsonValue>,
        table: &str,
        values: Vec<Column>,
        conditions: Vec<Condition>,
    ) -> Self {
        Self::for_event(envelope, vec![Execution::update(table, values, conditions)])
    }

    pub fn no_op(envelope: &EventEnvelope<JsonValue>) -> Self {
        Self::for_event(envelope, Vec::new())
    }

    pub fn is_no_op(&self) -> bool {
        self.executions.is_empty()
    }

    /// Precondition the executor checks against the stream's recorded sequence.
    pub fn expected_version(&self) -> ExpectedVersion {
        ExpectedVersion::Exact(self.previous_sequence)
    }
}
