use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use super::{value_key, DatabaseOps, Filters, OpsError, Row};

#[derive(Debug, Clone)]
struct ForeignKey {
    column: String,
    parent_table: String,
    parent_column: String,
}

/// One recorded `update` call.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateCall {
    pub table: String,
    pub row: Row,
    pub filters: Filters,
}

/// In-process table store.
///
/// Keys are assigned as `new-1`, `new-2`, ... whenever an inserted row does
/// not carry its own primary key. There is no statement channel, so
/// [`DatabaseOps::execute`] reports [`OpsError::Unsupported`], which makes
/// this the reference DDL-incapable backend.
#[derive(Debug)]
pub struct MemoryOps {
    primary_key: String,
    tables: Mutex<BTreeMap<String, Vec<Row>>>,
    foreign_keys: BTreeMap<String, Vec<ForeignKey>>,
    updates: Mutex<Vec<UpdateCall>>,
    next_id: AtomicU64,
}

impl Default for MemoryOps {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOps {
    pub fn new() -> Self {
        Self::with_primary_key("id")
    }

    pub fn with_primary_key(column: impl Into<String>) -> Self {
        Self {
            primary_key: column.into(),
            tables: Mutex::new(BTreeMap::new()),
            foreign_keys: BTreeMap::new(),
            updates: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Enforce `table.column -> parent_table.parent_column` on insert and update.
    pub fn with_foreign_key(
        mut self,
        table: &str,
        column: &str,
        parent_table: &str,
        parent_column: &str,
    ) -> Self {
        self.foreign_keys
            .entry(table.to_string())
            .or_default()
            .push(ForeignKey {
                column: column.to_string(),
                parent_table: parent_table.to_string(),
                parent_column: parent_column.to_string(),
            });
        self
    }

    /// Register an empty table. Unknown tables already read as empty.
    pub fn create_table(&self, table: &str) -> Result<(), OpsError> {
        self.lock_tables()?.entry(table.to_string()).or_default();
        Ok(())
    }

    /// Load rows verbatim, bypassing key assignment and FK checks.
    pub fn seed<I>(&self, table: &str, rows: I) -> Result<(), OpsError>
    where
        I: IntoIterator<Item = Row>,
    {
        self.lock_tables()?
            .entry(table.to_string())
            .or_default()
            .extend(rows);
        Ok(())
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .map(|tables| tables.get(table).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn updates(&self) -> Vec<UpdateCall> {
        self.updates
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn lock_tables(&self) -> Result<MutexGuard<'_, BTreeMap<String, Vec<Row>>>, OpsError> {
        self.tables
            .lock()
            .map_err(|_| OpsError::Database("memory store lock poisoned".into()))
    }

    fn check_foreign_keys(
        &self,
        tables: &BTreeMap<String, Vec<Row>>,
        table: &str,
        row: &Row,
    ) -> Result<(), OpsError> {
        let Some(keys) = self.foreign_keys.get(table) else {
            return Ok(());
        };
        for fk in keys {
            let Some(value) = row.get(&fk.column).filter(|v| !v.is_null()) else {
                continue;
            };
            let present = tables
                .get(&fk.parent_table)
                .map(|parents| {
                    parents
                        .iter()
                        .any(|p| p.get(&fk.parent_column).is_some_and(|pv| values_equal(pv, value)))
                })
                .unwrap_or(false);
            if !present {
                return Err(OpsError::ForeignKeyViolation {
                    table: table.to_string(),
                    message: format!(
                        "{}.{} references missing {}.{}",
                        table, fk.column, fk.parent_table, fk.parent_column
                    ),
                });
            }
        }
        Ok(())
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (value_key(a), value_key(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

fn matches(row: &Row, filters: &Filters) -> bool {
    filters.iter().all(|(column, expected)| match row.get(column) {
        Some(actual) => values_equal(actual, expected),
        None => expected.is_null(),
    })
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

#[async_trait]
impl DatabaseOps for MemoryOps {
    async fn select(
        &self,
        table: &str,
        columns: &[&str],
        filters: &Filters,
        order_by: Option<&str>,
    ) -> Result<Vec<Row>, OpsError> {
        let tables = self.lock_tables()?;
        let Some(rows) = tables.get(table) else {
            return Ok(Vec::new());
        };
        let mut selected: Vec<Row> = rows.iter().filter(|r| matches(r, filters)).cloned().collect();
        if let Some(column) = order_by {
            selected.sort_by(|a, b| compare_values(a.get(column), b.get(column)));
        }
        if !columns.is_empty() {
            for row in &mut selected {
                row.retain(|k, _| columns.contains(&k.as_str()));
            }
        }
        Ok(selected)
    }

    async fn insert(&self, table: &str, mut row: Row) -> Result<Row, OpsError> {
        let mut tables = self.lock_tables()?;
        if row.get(&self.primary_key).map_or(true, Value::is_null) {
            let id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
            row.insert(self.primary_key.clone(), Value::String(format!("new-{id}")));
        }
        self.check_foreign_keys(&tables, table, &row)?;
        tables.entry(table.to_string()).or_default().push(row.clone());
        Ok(row)
    }

    async fn update(&self, table: &str, row: Row, filters: &Filters) -> Result<Row, OpsError> {
        let mut tables = self.lock_tables()?;
        self.check_foreign_keys(&tables, table, &row)?;
        let rows = tables.entry(table.to_string()).or_default();
        let mut first = None;
        for existing in rows.iter_mut().filter(|r| matches(r, filters)) {
            for (k, v) in &row {
                existing.insert(k.clone(), v.clone());
            }
            if first.is_none() {
                first = Some(existing.clone());
            }
        }
        let updated = first.ok_or_else(|| OpsError::NoRowsMatched {
            table: table.to_string(),
        })?;
        drop(tables);
        if let Ok(mut calls) = self.updates.lock() {
            calls.push(UpdateCall {
                table: table.to_string(),
                row,
                filters: filters.clone(),
            });
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filters: &Filters) -> Result<u64, OpsError> {
        let mut tables = self.lock_tables()?;
        let Some(rows) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| !matches(r, filters));
        Ok((before - rows.len()) as u64)
    }

    async fn execute(&self, _statement: &str, _params: &[Value]) -> Result<u64, OpsError> {
        Err(OpsError::Unsupported(
            "raw statements are not available on the in-memory backend".into(),
        ))
    }

    async fn close(&self) {}
}
