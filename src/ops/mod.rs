//! The abstract database-operation interface every component consumes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::AppError;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryOps;
pub use sqlite::SqliteOps;

/// One row keyed by column name. Values stay open-ended so any column set
/// round-trips; typed access to known columns goes through [`RowExt`].
pub type Row = Map<String, Value>;

/// Equality filters, combined with AND. A `Value::Null` filter matches NULL.
pub type Filters = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum OpsError {
    /// The backend cannot perform this kind of operation at all (e.g. DDL
    /// through a REST-style backend). Callers must switch backends.
    #[error("operation not supported by this backend: {0}")]
    Unsupported(String),
    #[error("foreign key constraint failed on {table}: {message}")]
    ForeignKeyViolation { table: String, message: String },
    #[error("no rows in {table} matched the update filters")]
    NoRowsMatched { table: String },
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("database error: {0}")]
    Database(String),
}

impl OpsError {
    pub fn is_unsupported(&self) -> bool {
        matches!(self, OpsError::Unsupported(_))
    }

    pub fn is_foreign_key_violation(&self) -> bool {
        matches!(self, OpsError::ForeignKeyViolation { .. })
    }

    /// Classify a driver error raised while working on `table`.
    pub fn from_sqlx(table: &str, err: &sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db)
                if matches!(db.kind(), sqlx::error::ErrorKind::ForeignKeyViolation) =>
            {
                OpsError::ForeignKeyViolation {
                    table: table.to_string(),
                    message: db.message().to_string(),
                }
            }
            sqlx::Error::RowNotFound => OpsError::NoRowsMatched {
                table: table.to_string(),
            },
            other => OpsError::Database(other.to_string()),
        }
    }
}

impl From<OpsError> for AppError {
    fn from(error: OpsError) -> Self {
        let code = match &error {
            OpsError::Unsupported(_) => "OPS/UNSUPPORTED",
            OpsError::ForeignKeyViolation { .. } => "OPS/FOREIGN_KEY",
            OpsError::NoRowsMatched { .. } => "OPS/NO_ROWS_MATCHED",
            OpsError::InvalidIdentifier(_) => "OPS/INVALID_IDENTIFIER",
            OpsError::Database(_) => "OPS/DATABASE",
        };
        AppError::new(code, error.to_string())
    }
}

/// Row-level CRUD plus raw statement execution against one database.
///
/// Implementations must issue operations in call order; the restore engine
/// relies on a parent insert being visible to the very next child lookup.
#[async_trait]
pub trait DatabaseOps: Send + Sync {
    /// Select `columns` (all columns when empty) from rows matching `filters`.
    async fn select(
        &self,
        table: &str,
        columns: &[&str],
        filters: &Filters,
        order_by: Option<&str>,
    ) -> Result<Vec<Row>, OpsError>;

    /// Insert one row and return it as stored, including generated keys.
    async fn insert(&self, table: &str, row: Row) -> Result<Row, OpsError>;

    /// Update rows matching `filters`; errors with `NoRowsMatched` when none do.
    async fn update(&self, table: &str, row: Row, filters: &Filters) -> Result<Row, OpsError>;

    async fn delete(&self, table: &str, filters: &Filters) -> Result<u64, OpsError>;

    /// Run a raw statement (DDL included). Backends without a statement
    /// channel return [`OpsError::Unsupported`].
    async fn execute(&self, statement: &str, params: &[Value]) -> Result<u64, OpsError>;

    async fn close(&self);
}

/// Typed accessors over the open-ended row map.
pub trait RowExt {
    /// The value of `column` as a non-empty identity string, if present.
    fn key_of(&self, column: &str) -> Option<String>;
}

impl RowExt for Row {
    fn key_of(&self, column: &str) -> Option<String> {
        value_key(self.get(column)?)
    }
}

/// Canonical string form of a key value; numbers and strings both qualify.
pub fn value_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

static IDENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern to compile")
});

/// Reject table and column names that could not have come from a schema.
pub fn validate_identifier(name: &str) -> Result<&str, OpsError> {
    if IDENT_RE.is_match(name) {
        Ok(name)
    } else {
        Err(OpsError::InvalidIdentifier(name.to_string()))
    }
}

pub fn quote_ident(name: &str) -> String {
    let escaped = name.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Build a filter map from `(column, value)` pairs.
pub fn filters<I, K>(pairs: I) -> Filters
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_identifier("books").is_ok());
        assert!(validate_identifier("_author_id2").is_ok());
        assert!(validate_identifier("books; DROP TABLE x").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }

    #[test]
    fn key_of_accepts_numbers_and_rejects_empty() {
        let row: Row = json!({"id": 7, "slug": "", "other": null})
            .as_object()
            .cloned()
            .unwrap();
        assert_eq!(row.key_of("id").as_deref(), Some("7"));
        assert_eq!(row.key_of("slug"), None);
        assert_eq!(row.key_of("other"), None);
        assert_eq!(row.key_of("missing"), None);
    }

    #[test]
    fn ops_error_codes() {
        let err = AppError::from(OpsError::Unsupported("execute".into()));
        assert_eq!(err.code(), "OPS/UNSUPPORTED");
        assert!(OpsError::ForeignKeyViolation {
            table: "books".into(),
            message: "x".into()
        }
        .is_foreign_key_violation());
    }

    #[test]
    fn missing_rows_from_the_driver_name_the_table() {
        let err = OpsError::from_sqlx("books", &sqlx::Error::RowNotFound);
        assert!(matches!(err, OpsError::NoRowsMatched { ref table } if table == "books"));
        let err = OpsError::from_sqlx("books", &sqlx::Error::PoolClosed);
        assert_eq!(AppError::from(err).code(), "OPS/DATABASE");
    }
}
