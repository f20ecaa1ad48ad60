use serde::{Deserialize, Serialize};

use crate::config::{active_profile_name, write_profile_lock, DatabaseConfig};
use crate::ops::SqliteOps;
use crate::schema::{sqlite_column_sets, validate_schema, ColumnSets, SchemaValidationResult};
use crate::{AppError, AppResult, LOG_TARGET};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,
    /// `None` when validation was skipped.
    #[serde(default)]
    pub schema_valid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_report: Option<SchemaValidationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionResult {
    fn failed(profile_name: Option<String>, error: impl Into<String>) -> Self {
        Self {
            profile_name,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Open the named profile. Only SQLite profiles have a driver.
pub async fn open_profile(config: &DatabaseConfig, name: &str) -> AppResult<SqliteOps> {
    let path = config.sqlite_path(name)?;
    SqliteOps::open(&path)
        .await
        .map_err(|err| err.with_context("profile", name.to_string()))
}

/// Open a profile and compare its live schema with `expected`.
///
/// Without `expected` only the connection is checked. On success the
/// profile is recorded in the lock file unless `validate_only` is set; a
/// drifted schema never updates the lock.
pub async fn connect_and_validate(
    config: &DatabaseConfig,
    profile: Option<&str>,
    expected: Option<&ColumnSets>,
    validate_only: bool,
) -> ConnectionResult {
    let lock_path = config.lock_path();
    let name = match active_profile_name(profile, &lock_path) {
        Ok(name) => name,
        Err(err) => return ConnectionResult::failed(None, err.to_string()),
    };
    if let Err(err) = config.profile(&name) {
        return ConnectionResult::failed(Some(name), err.to_string());
    }

    let ops = match open_profile(config, &name).await {
        Ok(ops) => ops,
        Err(err) => {
            return ConnectionResult::failed(
                Some(name),
                format!("Failed to connect to database: {}", err.message()),
            )
        }
    };

    let report = match expected {
        None => None,
        Some(expected) => match sqlite_column_sets(ops.pool()).await {
            Ok(actual) => Some(validate_schema(&actual, expected)),
            Err(err) => {
                return ConnectionResult::failed(
                    Some(name),
                    format!("Failed to connect to database: {}", err.message()),
                )
            }
        },
    };
    ops.pool().close().await;

    let valid = report.as_ref().map_or(true, |r| r.valid);
    if valid && !validate_only {
        if let Err(err) = write_profile_lock(&lock_path, &name) {
            tracing::warn!(
                target: LOG_TARGET,
                event = "profile_lock_write_failed",
                profile = %name,
                error = %AppError::from(err)
            );
        }
    }

    tracing::info!(
        target: LOG_TARGET,
        event = "profile_connected",
        profile = %name,
        schema_valid = ?report.as_ref().map(|r| r.valid)
    );

    ConnectionResult {
        success: valid,
        schema_valid: report.as_ref().map(|r| r.valid),
        error: report
            .as_ref()
            .filter(|r| !r.valid)
            .map(|r| format!("Schema validation failed: {} errors", r.error_count())),
        schema_report: report,
        profile_name: Some(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::read_profile_lock;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> DatabaseConfig {
        let mut config = DatabaseConfig::parse(
            r#"
[profiles.local]
url = "sqlite://local.sqlite3"

[profiles.remote]
url = "postgresql://db.example/app"
provider = "postgres"
"#,
        )
        .unwrap();
        config.base_dir = dir.to_path_buf();
        config
    }

    #[tokio::test]
    async fn drift_is_reported_and_lock_left_alone() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let config = config(dir.path());
        let expected: ColumnSets = [(
            "authors".to_string(),
            ["id".to_string()].into_iter().collect(),
        )]
        .into_iter()
        .collect();

        let result = connect_and_validate(&config, Some("local"), Some(&expected), false).await;
        assert!(!result.success);
        assert_eq!(result.schema_valid, Some(false));
        assert_eq!(
            result.error.as_deref(),
            Some("Schema validation failed: 1 errors")
        );
        assert_eq!(read_profile_lock(&config.lock_path()), None);
        Ok(())
    }

    #[tokio::test]
    async fn connection_only_mode_records_profile() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let config = config(dir.path());
        let result = connect_and_validate(&config, Some("local"), None, false).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.schema_valid, None);
        assert_eq!(read_profile_lock(&config.lock_path()).as_deref(), Some("local"));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_and_unsupported_profiles_fail() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let config = config(dir.path());
        let missing = connect_and_validate(&config, Some("staging"), None, true).await;
        assert_eq!(
            missing.error.as_deref(),
            Some("Profile 'staging' not found. Available: local, remote")
        );

        let remote = connect_and_validate(&config, Some("remote"), None, true).await;
        assert!(!remote.success);
        assert!(remote
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("Failed to connect to database:")));
        Ok(())
    }
}
