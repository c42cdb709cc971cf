//! In-memory projection tables and the statement executor.
//!
//! Tables are plain row lists keyed by name. Every statement is applied
//! atomically: the executions run against a staged copy of the touched
//! tables, which only replaces the live tables once all of them succeeded.
//! The sequence precondition is checked under the same write lock, so of two
//! writers racing for the same next sequence exactly one wins.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use thiserror::Error;

use quotaflow_core::{AggregateId, TenantId};
use quotaflow_events::{Column, ColumnValue, Condition, Execution, Operation, Statement};

/// Column every projection table carries for tenant scoping.
pub const INSTANCE_ID_COLUMN: &str = "instance_id";

/// A projected row (column name to value).
pub type Row = BTreeMap<String, ColumnValue>;

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(
        "precondition failed for {aggregate_type}/{aggregate_id}: expected sequence {expected}, current {current}"
    )]
    PreconditionFailed {
        aggregate_type: String,
        aggregate_id: AggregateId,
        expected: u64,
        current: u64,
    },

    #[error("unknown projection table: {0}")]
    UnknownTable(String),

    #[error("projection storage failure: {0}")]
    Storage(String),
}

/// Applies statements and answers reads over the projected tables.
pub trait StatementExecutor: Send + Sync {
    /// Apply `statement` for `projection`, checking its sequence precondition.
    fn execute(&self, projection: &str, statement: &Statement) -> Result<(), ExecuteError>;

    /// Sequence the projection has recorded for one aggregate stream (0 if none).
    fn current_sequence(
        &self,
        projection: &str,
        tenant_id: &TenantId,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
    ) -> Result<u64, ExecuteError>;

    /// Rows of `table` matching every condition.
    fn select(&self, table: &str, conditions: &[Condition]) -> Result<Vec<Row>, ExecuteError>;

    /// Drop a tenant's rows from `tables` and forget its recorded sequences.
    fn clear_tenant(
        &self,
        projection: &str,
        tables: &[&str],
        tenant_id: &TenantId,
    ) -> Result<(), ExecuteError>;
}

impl<X> StatementExecutor for Arc<X>
where
    X: StatementExecutor + ?Sized,
{
    fn execute(&self, projection: &str, statement: &Statement) -> Result<(), ExecuteError> {
        (**self).execute(projection, statement)
    }

    fn current_sequence(
        &self,
        projection: &str,
        tenant_id: &TenantId,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
    ) -> Result<u64, ExecuteError> {
        (**self).current_sequence(projection, tenant_id, aggregate_type, aggregate_id)
    }

    fn select(&self, table: &str, conditions: &[Condition]) -> Result<Vec<Row>, ExecuteError> {
        (**self).select(table, conditions)
    }

    fn clear_tenant(
        &self,
        projection: &str,
        tables: &[&str],
        tenant_id: &TenantId,
    ) -> Result<(), ExecuteError> {
        (**self).clear_tenant(projection, tables, tenant_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SequenceKey {
    projection: String,
    tenant_id: TenantId,
    aggregate_type: String,
    aggregate_id: AggregateId,
}

#[derive(Debug, Default)]
struct Tables {
    rows: HashMap<String, Vec<Row>>,
    sequences: HashMap<SequenceKey, u64>,
}

/// In-memory relational projection store.
///
/// Intended for tests/dev. Tables must be registered before statements can
/// target them; anything else is [`ExecuteError::UnknownTable`].
#[derive(Debug, Default)]
pub struct InMemoryProjectionStore {
    inner: RwLock<Tables>,
}

impl InMemoryProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with `tables` registered (and empty).
    pub fn with_tables<'a>(tables: impl IntoIterator<Item = &'a str>) -> Self {
        let store = Self::new();
        for table in tables {
            store.register_table(table);
        }
        store
    }

    pub fn register_table(&self, table: &str) {
        if let Ok(mut inner) = self.inner.write() {
            inner.rows.entry(table.to_string()).or_default();
        }
    }

    fn lock_err() -> ExecuteError {
        ExecuteError::Storage("lock poisoned".to_string())
    }
}

fn matches(row: &Row, conditions: &[Condition]) -> bool {
    conditions
        .iter()
        .all(|c| row.get(&c.column).unwrap_or(&ColumnValue::Null) == &c.value)
}

fn to_row(columns: &[Column]) -> Row {
    columns
        .iter()
        .map(|c| (c.name.clone(), c.value.clone()))
        .collect()
}

fn apply_execution(rows: &mut Vec<Row>, execution: &Execution) {
    match &execution.operation {
        Operation::Insert { columns } => rows.push(to_row(columns)),
        Operation::Update { values, conditions } => {
            for row in rows.iter_mut().filter(|r| matches(r, conditions)) {
                for v in values {
                    row.insert(v.name.clone(), v.value.clone());
                }
            }
        }
        Operation::Delete { conditions } => rows.retain(|r| !matches(r, conditions)),
    }
}

impl StatementExecutor for InMemoryProjectionStore {
    fn execute(&self, projection: &str, statement: &Statement) -> Result<(), ExecuteError> {
        let mut inner = self.inner.write().map_err(|_| Self::lock_err())?;

        let key = SequenceKey {
            projection: projection.to_string(),
            tenant_id: statement.tenant_id.clone(),
            aggregate_type: statement.aggregate_type.clone(),
            aggregate_id: statement.aggregate_id.clone(),
        };
        let current = inner.sequences.get(&key).copied().unwrap_or(0);
        if !statement.expected_version().matches(current) {
            return Err(ExecuteError::PreconditionFailed {
                aggregate_type: statement.aggregate_type.clone(),
                aggregate_id: statement.aggregate_id.clone(),
                expected: statement.previous_sequence,
                current,
            });
        }

        let mut staged: HashMap<String, Vec<Row>> = HashMap::new();
        for execution in &statement.executions {
            if !staged.contains_key(&execution.table) {
                let rows = inner
                    .rows
                    .get(&execution.table)
                    .ok_or_else(|| ExecuteError::UnknownTable(execution.table.clone()))?;
                staged.insert(execution.table.clone(), rows.clone());
            }
            if let Some(rows) = staged.get_mut(&execution.table) {
                apply_execution(rows, execution);
            }
        }

        inner.rows.extend(staged);
        inner.sequences.insert(key, statement.sequence);
        Ok(())
    }

    fn current_sequence(
        &self,
        projection: &str,
        tenant_id: &TenantId,
        aggregate_type: &str,
        aggregate_id: &AggregateId,
    ) -> Result<u64, ExecuteError> {
        let inner = self.inner.read().map_err(|_| Self::lock_err())?;
        let key = SequenceKey {
            projection: projection.to_string(),
            tenant_id: tenant_id.clone(),
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: aggregate_id.clone(),
        };
        Ok(inner.sequences.get(&key).copied().unwrap_or(0))
    }

    fn select(&self, table: &str, conditions: &[Condition]) -> Result<Vec<Row>, ExecuteError> {
        let inner = self.inner.read().map_err(|_| Self::lock_err())?;
        let rows = inner
            .rows
            .get(table)
            .ok_or_else(|| ExecuteError::UnknownTable(table.to_string()))?;
        Ok(rows.iter().filter(|r| matches(r, conditions)).cloned().collect())
    }

    fn clear_tenant(
        &self,
        projection: &str,
        tables: &[&str],
        tenant_id: &TenantId,
    ) -> Result<(), ExecuteError> {
        let mut inner = self.inner.write().map_err(|_| Self::lock_err())?;
        let tenant = Condition::new(INSTANCE_ID_COLUMN, tenant_id);
        for table in tables {
            let rows = inner
                .rows
                .get_mut(*table)
                .ok_or_else(|| ExecuteError::UnknownTable(table.to_string()))?;
            rows.retain(|r| !matches(r, std::slice::from_ref(&tenant)));
        }
        inner
            .sequences
            .retain(|k, _| !(k.projection == projection && &k.tenant_id == tenant_id));
        Ok(())
    }
}
