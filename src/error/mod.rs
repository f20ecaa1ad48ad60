use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use anyhow::Error as AnyhowError;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use sqlx::Error as SqlxError;
use std::io::Error as IoError;

use crate::ops::OpsError;

/// Code for a chain link that carries no code of its own.
const UNCLASSIFIED: &str = "APP/UNCLASSIFIED";

/// A structured error carried out of every top-level operation and rendered by the CLI.
///
/// Codes are `AREA/REASON`. The area says which part of dbmend raised it
/// (`OPS`, `SCHEMA`, `FIX`, `RESTORE`, `SYNC`, `CONFIG`, `IO`, `JSON`); the
/// CLI keys its exit status off the area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    pub code: String,
    pub message: String,
    /// Where it happened: table, path, operation.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            let mut pairs: Vec<_> = self.context.iter().collect();
            pairs.sort();
            let rendered: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
            write!(f, "[{}] {} ({})", self.code, self.message, rendered.join(", "))
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

/// `anyhow` chains come out of the pool and runtime setup. An [`AppError`]
/// anywhere in the chain is kept as is; other links become unclassified.
impl From<AnyhowError> for AppError {
    fn from(error: AnyhowError) -> Self {
        fn convert(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }
            if let Some(sqlx) = err.downcast_ref::<SqlxError>() {
                return classify_sqlx(sqlx);
            }

            let mut root = AppError::new(UNCLASSIFIED, err.to_string());
            if let Some(source) = err.source() {
                root.cause = Some(Box::new(convert(source)));
            }
            root
        }

        convert(error.as_ref())
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let code = format!("IO/{:?}", error.kind());
        let mut app_error = AppError::new(code, error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

/// Snapshot and schema-set files are JSON; the position points at the bad byte.
impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_syntax() || error.is_eof() {
            "JSON/SYNTAX"
        } else if error.is_data() {
            "JSON/DATA"
        } else {
            "JSON/IO"
        };

        let mut app_error = AppError::new(code, error.to_string());
        if error.line() > 0 {
            app_error = app_error
                .with_context("line", error.line().to_string())
                .with_context("column", error.column().to_string());
        }
        app_error
    }
}

/// Driver errors outside a [`crate::DatabaseOps`] call (pool setup,
/// introspection) land in the same `OPS/*` codes as errors from inside one.
impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        match error {
            SqlxError::Io(err) => AppError::from(err).with_context("source", "sqlx"),
            other => classify_sqlx(&other),
        }
    }
}

fn classify_sqlx(error: &SqlxError) -> AppError {
    if matches!(error, SqlxError::PoolTimedOut | SqlxError::PoolClosed) {
        return AppError::new("OPS/UNAVAILABLE", error.to_string());
    }
    let mut app_error = AppError::from(OpsError::from_sqlx("<database>", error));
    if let Some(code) = error.as_database_error().and_then(|db| db.code()) {
        app_error = app_error.with_context("driver_code", code.into_owned());
    }
    app_error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use anyhow::Context;
    use sqlx::sqlite::SqliteConnectOptions;
    use sqlx::{Connection, SqliteConnection};
    use std::str::FromStr;

    async fn library_connection() -> anyhow::Result<SqliteConnection> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let mut conn = SqliteConnection::connect_with(&options).await?;
        sqlx::raw_sql(
            "CREATE TABLE authors (id TEXT PRIMARY KEY);
             CREATE TABLE books (id TEXT PRIMARY KEY, author_id TEXT REFERENCES authors(id));",
        )
        .execute(&mut conn)
        .await?;
        Ok(conn)
    }

    #[tokio::test]
    async fn driver_foreign_key_failures_share_the_ops_code() -> anyhow::Result<()> {
        let mut conn = library_connection().await?;
        let err = sqlx::query("INSERT INTO books (id, author_id) VALUES ('b1', 'ghost')")
            .execute(&mut conn)
            .await
            .unwrap_err();

        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "OPS/FOREIGN_KEY");
        assert!(app_error.message().contains("FOREIGN KEY"), "{app_error}");
        assert!(app_error.context().contains_key("driver_code"));
        Ok(())
    }

    #[tokio::test]
    async fn other_driver_failures_are_ops_database() -> anyhow::Result<()> {
        let mut conn = library_connection().await?;
        let err = sqlx::query("SELECT * FROM shelves")
            .execute(&mut conn)
            .await
            .unwrap_err();
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "OPS/DATABASE");
        assert!(app_error.message().contains("shelves"));

        assert_eq!(
            AppError::from(SqlxError::PoolClosed).code(),
            "OPS/UNAVAILABLE"
        );
        Ok(())
    }

    #[test]
    fn anyhow_context_over_a_config_error_keeps_the_config_code() {
        let inner = AppError::from(ConfigError::ProfileNotFound);
        let err = (|| -> anyhow::Result<()> {
            Err(inner.clone()).context("select profile for fix")
        })()
        .unwrap_err();

        let converted = AppError::from(err);
        assert_eq!(converted.code(), UNCLASSIFIED);
        assert_eq!(converted.message(), "select profile for fix");
        assert_eq!(converted.cause(), Some(&inner));
        assert!(converted.cause().is_some_and(|c| c.code().starts_with("CONFIG/")));
    }

    #[test]
    fn anyhow_wrapped_driver_errors_are_classified() {
        let err = AnyhowError::from(SqlxError::PoolTimedOut).context("open sqlite pool");
        let converted = AppError::from(err);
        assert_eq!(converted.message(), "open sqlite pool");
        assert_eq!(
            converted.cause().map(AppError::code),
            Some("OPS/UNAVAILABLE")
        );
    }

    #[test]
    fn display_lists_context_in_key_order() {
        let error = AppError::new("RESTORE/ABORTED", "restore aborted")
            .with_context("table", "books")
            .with_context("backup", "/tmp/b.json");
        assert_eq!(
            error.to_string(),
            "[RESTORE/ABORTED] restore aborted (backup=/tmp/b.json, table=books)"
        );
        let anyhow_error: AnyhowError = error.clone().into();
        assert_eq!(anyhow_error.to_string(), error.to_string());
    }

    #[test]
    fn truncated_snapshot_json_reports_position() {
        let err = serde_json::from_str::<serde_json::Value>("{\"metadata\": ")
            .expect_err("truncated snapshot");
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "JSON/SYNTAX");
        assert_eq!(app_error.context().get("line"), Some(&"1".to_string()));
    }

    #[test]
    fn missing_backup_file_keeps_os_code() {
        let app_error = AppError::from(IoError::from_raw_os_error(2));
        assert_eq!(app_error.code(), "IO/NotFound");
        assert_eq!(app_error.context().get("os_code"), Some(&"2".to_string()));
    }

    #[test]
    fn serialized_shape_omits_empty_parts() {
        let error = AppError::new("FIX/DDL_UNSUPPORTED", "no ddl")
            .with_cause(AppError::from(OpsError::Unsupported("execute".into())));
        let value = serde_json::to_value(&error).expect("serialize app error");
        assert_eq!(value["code"], "FIX/DDL_UNSUPPORTED");
        assert!(value.get("context").is_none());
        assert_eq!(value["cause"]["code"], "OPS/UNSUPPORTED");
    }
}
