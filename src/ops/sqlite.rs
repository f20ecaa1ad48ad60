use std::path::Path;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Row as _, Sqlite, SqlitePool, TypeInfo, ValueRef};

use super::{quote_ident, validate_identifier, DatabaseOps, Filters, OpsError, Row};
use crate::{AppError, AppResult, LOG_TARGET};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

static CASCADE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s+CASCADE\s*(;?)\s*$").expect("cascade pattern to compile")
});

/// [`DatabaseOps`] over an sqlx SQLite pool. DDL-capable.
#[derive(Debug, Clone)]
pub struct SqliteOps {
    pool: SqlitePool,
}

impl SqliteOps {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &Path) -> AppResult<Self> {
        let pool = crate::db::open_sqlite_pool(db_path)
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "open_sqlite_ops"))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Name and declared type of the primary-key column, when there is exactly one.
    async fn primary_key(&self, table: &str) -> Result<Option<(String, String)>, OpsError> {
        let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(table)))
            .fetch_all(&self.pool)
            .await
            .map_err(|err| OpsError::from_sqlx(table, &err))?;
        let mut keys = Vec::new();
        for row in rows {
            let pk: i64 = row.try_get("pk").unwrap_or(0);
            if pk > 0 {
                let name: String = row
                    .try_get("name")
                    .map_err(|err| OpsError::from_sqlx(table, &err))?;
                let ty: String = row.try_get("type").unwrap_or_default();
                keys.push((name, ty));
            }
        }
        Ok(if keys.len() == 1 { keys.pop() } else { None })
    }

    /// Run one statement on a single connection with `foreign_keys` off,
    /// switching enforcement back on whether or not the statement succeeded.
    async fn execute_unchecked(&self, sql: &str) -> Result<u64, OpsError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|err| OpsError::from_sqlx("<statement>", &err))?;
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&mut *conn)
            .await
            .map_err(|err| OpsError::from_sqlx("<statement>", &err))?;
        let outcome = sqlx::query(sql).execute(&mut *conn).await;
        let restored = sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await;
        let result = outcome.map_err(|err| OpsError::from_sqlx("<statement>", &err))?;
        restored.map_err(|err| OpsError::from_sqlx("<statement>", &err))?;
        Ok(result.rows_affected())
    }
}

pub(crate) fn row_to_value(row: &SqliteRow) -> Row {
    let mut map = Row::new();
    for col in row.columns() {
        let idx = col.ordinal();
        let val = match row.try_get_raw(idx).ok() {
            Some(raw) if !raw.is_null() => match raw.type_info().name() {
                "INTEGER" => row
                    .try_get::<i64, _>(idx)
                    .map(Value::from)
                    .unwrap_or(Value::Null),
                "REAL" => row
                    .try_get::<f64, _>(idx)
                    .map(Value::from)
                    .unwrap_or(Value::Null),
                _ => row
                    .try_get::<String, _>(idx)
                    .map(Value::from)
                    .unwrap_or(Value::Null),
            },
            _ => Value::Null,
        };
        map.insert(col.name().to_string(), val);
    }
    map
}

fn bind_value<'q>(q: SqliteQuery<'q>, v: &Value) -> SqliteQuery<'q> {
    match v {
        Value::Null => q.bind(Option::<i64>::None),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                q.bind(i)
            } else if let Some(f) = n.as_f64() {
                q.bind(f)
            } else {
                q.bind(Option::<i64>::None)
            }
        }
        Value::Bool(b) => q.bind(*b as i64),
        Value::String(s) => q.bind(s.clone()),
        _ => q.bind(v.to_string()),
    }
}

/// Append a WHERE clause for `filters`, numbering placeholders from `next`.
fn where_clause(filters: &Filters, next: &mut usize) -> Result<(String, Vec<Value>), OpsError> {
    if filters.is_empty() {
        return Ok((String::new(), Vec::new()));
    }
    let mut parts = Vec::with_capacity(filters.len());
    let mut binds = Vec::new();
    for (column, value) in filters {
        let column = quote_ident(validate_identifier(column)?);
        if value.is_null() {
            parts.push(format!("{column} IS NULL"));
        } else {
            parts.push(format!("{column} = ?{}", *next));
            *next += 1;
            binds.push(value.clone());
        }
    }
    Ok((format!(" WHERE {}", parts.join(" AND ")), binds))
}

/// SQLite has no `DROP TABLE ... CASCADE`. The keyword is removed and the
/// flag tells the caller to run the drop with foreign-key enforcement off,
/// so dependent rows survive until the table is re-created.
fn normalize_statement(statement: &str) -> (String, bool) {
    let trimmed = statement.trim();
    if trimmed.to_ascii_uppercase().starts_with("DROP ") && CASCADE_RE.is_match(trimmed) {
        (CASCADE_RE.replace(trimmed, "$1").into_owned(), true)
    } else {
        (trimmed.to_string(), false)
    }
}

#[async_trait]
impl DatabaseOps for SqliteOps {
    async fn select(
        &self,
        table: &str,
        columns: &[&str],
        filters: &Filters,
        order_by: Option<&str>,
    ) -> Result<Vec<Row>, OpsError> {
        let table_sql = quote_ident(validate_identifier(table)?);
        let column_sql = if columns.is_empty() {
            "*".to_string()
        } else {
            columns
                .iter()
                .map(|c| validate_identifier(c).map(quote_ident))
                .collect::<Result<Vec<_>, _>>()?
                .join(", ")
        };
        let mut next = 1;
        let (where_sql, binds) = where_clause(filters, &mut next)?;
        let order_sql = match order_by {
            Some(col) => format!(" ORDER BY {}", quote_ident(validate_identifier(col)?)),
            None => String::new(),
        };
        let sql = format!("SELECT {column_sql} FROM {table_sql}{where_sql}{order_sql}");
        let mut query = sqlx::query(&sql);
        for value in &binds {
            query = bind_value(query, value);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|err| OpsError::from_sqlx(table, &err))?;
        Ok(rows.iter().map(row_to_value).collect())
    }

    async fn insert(&self, table: &str, mut row: Row) -> Result<Row, OpsError> {
        let table_sql = quote_ident(validate_identifier(table)?);
        if let Some((pk, ty)) = self.primary_key(table).await? {
            let missing = row.get(&pk).map_or(true, Value::is_null);
            if missing && !ty.to_ascii_uppercase().contains("INT") {
                row.insert(pk, Value::String(uuid::Uuid::now_v7().to_string()));
            }
        }

        let sql = if row.is_empty() {
            format!("INSERT INTO {table_sql} DEFAULT VALUES RETURNING *")
        } else {
            let cols = row
                .keys()
                .map(|c| validate_identifier(c).map(quote_ident))
                .collect::<Result<Vec<_>, _>>()?;
            let placeholders: Vec<String> = (1..=cols.len()).map(|i| format!("?{i}")).collect();
            format!(
                "INSERT INTO {table_sql} ({}) VALUES ({}) RETURNING *",
                cols.join(", "),
                placeholders.join(", ")
            )
        };
        let mut query = sqlx::query(&sql);
        for value in row.values() {
            query = bind_value(query, value);
        }
        let stored = query
            .fetch_one(&self.pool)
            .await
            .map_err(|err| OpsError::from_sqlx(table, &err))?;
        Ok(row_to_value(&stored))
    }

    async fn update(&self, table: &str, row: Row, filters: &Filters) -> Result<Row, OpsError> {
        if row.is_empty() {
            let existing = self.select(table, &[], filters, None).await?;
            return existing.into_iter().next().ok_or_else(|| OpsError::NoRowsMatched {
                table: table.to_string(),
            });
        }

        let table_sql = quote_ident(validate_identifier(table)?);
        let mut sets = Vec::with_capacity(row.len());
        for (idx, column) in row.keys().enumerate() {
            sets.push(format!("{} = ?{}", quote_ident(validate_identifier(column)?), idx + 1));
        }
        let mut next = row.len() + 1;
        let (where_sql, binds) = where_clause(filters, &mut next)?;
        let sql = format!(
            "UPDATE {table_sql} SET {}{where_sql} RETURNING *",
            sets.join(", ")
        );
        let mut query = sqlx::query(&sql);
        for value in row.values().chain(binds.iter()) {
            query = bind_value(query, value);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|err| OpsError::from_sqlx(table, &err))?;
        rows.first()
            .map(row_to_value)
            .ok_or_else(|| OpsError::NoRowsMatched {
                table: table.to_string(),
            })
    }

    async fn delete(&self, table: &str, filters: &Filters) -> Result<u64, OpsError> {
        let table_sql = quote_ident(validate_identifier(table)?);
        let mut next = 1;
        let (where_sql, binds) = where_clause(filters, &mut next)?;
        let sql = format!("DELETE FROM {table_sql}{where_sql}");
        let mut query = sqlx::query(&sql);
        for value in &binds {
            query = bind_value(query, value);
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|err| OpsError::from_sqlx(table, &err))?;
        Ok(result.rows_affected())
    }

    async fn execute(&self, statement: &str, params: &[Value]) -> Result<u64, OpsError> {
        let (sql, cascade) = normalize_statement(statement);
        tracing::debug!(target: LOG_TARGET, event = "sqlite_execute", statement = %sql, cascade);
        if cascade {
            return self.execute_unchecked(&sql).await;
        }
        let mut query = sqlx::query(&sql);
        for value in params {
            query = bind_value(query, value);
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|err| OpsError::from_sqlx("<statement>", &err))?;
        Ok(result.rows_affected())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
