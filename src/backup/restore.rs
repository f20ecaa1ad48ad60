use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::model::{BackupSchemaSet, TableDefinition};
use super::snapshot::Snapshot;
use super::validator::validate_backup;
use crate::ops::{value_key, DatabaseOps, Filters, OpsError, Row, RowExt};
use crate::{AppError, LOG_TARGET};

/// What to do when a snapshot row already exists in the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreMode {
    /// Leave the destination row alone.
    #[default]
    Skip,
    /// Replace the destination row's columns, keeping its key.
    Overwrite,
    /// Abort the whole restore on the first collision.
    Fail,
}

impl fmt::Display for RestoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestoreMode::Skip => "skip",
            RestoreMode::Overwrite => "overwrite",
            RestoreMode::Fail => "fail",
        })
    }
}

impl FromStr for RestoreMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(RestoreMode::Skip),
            "overwrite" => Ok(RestoreMode::Overwrite),
            "fail" => Ok(RestoreMode::Fail),
            other => Err(format!(
                "unknown restore mode '{other}' (expected skip, overwrite or fail)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRestoreCounts {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSummary {
    pub tables: BTreeMap<String, TableRestoreCounts>,
    pub dry_run: bool,
}

impl RestoreSummary {
    pub fn counts(&self, table: &str) -> TableRestoreCounts {
        self.tables.get(table).copied().unwrap_or_default()
    }

    pub fn total_inserted(&self) -> u64 {
        self.tables.values().map(|c| c.inserted).sum()
    }

    pub fn total_updated(&self) -> u64 {
        self.tables.values().map(|c| c.updated).sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.tables.values().map(|c| c.skipped).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.tables.values().map(|c| c.failed).sum()
    }
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("backup failed validation: {}", .errors.join("; "))]
    Validation { errors: Vec<String> },
    #[error("failed to load backup: {0}")]
    Load(AppError),
    /// A collision under [`RestoreMode::Fail`]. Rows restored before the
    /// collision stay in place; `summary` says which.
    #[error("{table} row '{slug}' already exists (mode=fail)")]
    Aborted {
        table: String,
        slug: String,
        summary: Box<RestoreSummary>,
    },
}

impl From<RestoreError> for AppError {
    fn from(error: RestoreError) -> Self {
        match error {
            RestoreError::Validation { ref errors } => {
                AppError::new("RESTORE/INVALID_BACKUP", error.to_string())
                    .with_context("error_count", errors.len().to_string())
            }
            RestoreError::Load(cause) => {
                AppError::new("RESTORE/LOAD", "failed to load backup").with_cause(cause)
            }
            RestoreError::Aborted {
                ref table,
                ref slug,
                ..
            } => AppError::new("RESTORE/ABORTED", error.to_string())
                .with_context("table", table.clone())
                .with_context("slug", slug.clone()),
        }
    }
}

/// Per-table `old key -> new key`, built parents first within one restore.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    tables: HashMap<String, HashMap<String, Value>>,
}

impl IdentityMap {
    pub fn record(&mut self, table: &str, old_key: String, new_key: Value) {
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(old_key, new_key);
    }

    pub fn resolve(&self, table: &str, old_key: &str) -> Option<&Value> {
        self.tables.get(table)?.get(old_key)
    }

    pub fn len(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, HashMap::len)
    }
}

enum RowOutcome {
    Inserted(Value),
    Updated(Value),
    Skipped(Value),
    /// Required parent did not restore; row dropped.
    Orphaned,
    Collision(String),
}

struct RestoreRun<'a> {
    ops: &'a dyn DatabaseOps,
    owner_id: &'a str,
    mode: RestoreMode,
    dry_run: bool,
    identities: IdentityMap,
}

impl RestoreRun<'_> {
    /// Rewrite owner and references in place. `false` when the required
    /// parent is unresolved.
    fn remap(&self, def: &TableDefinition, row: &mut Row) -> bool {
        row.insert(
            def.owner_column.clone(),
            Value::String(self.owner_id.to_string()),
        );

        if let Some(parent) = &def.parent_reference {
            let resolved = row
                .key_of(&parent.column)
                .and_then(|old| self.identities.resolve(&parent.table, &old))
                .cloned();
            match resolved {
                Some(new_key) => {
                    row.insert(parent.column.clone(), new_key);
                }
                None => return false,
            }
        }

        for reference in &def.optional_references {
            let Some(old) = row.key_of(&reference.column) else {
                continue;
            };
            let new_key = self
                .identities
                .resolve(&reference.table, &old)
                .cloned()
                .unwrap_or(Value::Null);
            row.insert(reference.column.clone(), new_key);
        }
        true
    }

    async fn restore_row(
        &self,
        def: &TableDefinition,
        mut row: Row,
        old_key: Option<&Value>,
    ) -> Result<RowOutcome, OpsError> {
        if !self.remap(def, &mut row) {
            return Ok(RowOutcome::Orphaned);
        }

        let slug = row.get(&def.slug_column).cloned().unwrap_or(Value::Null);
        let mut lookup = Filters::new();
        lookup.insert(def.slug_column.clone(), slug.clone());
        lookup.insert(
            def.owner_column.clone(),
            Value::String(self.owner_id.to_string()),
        );
        if let Some(parent) = &def.parent_reference {
            if let Some(value) = row.get(&parent.column) {
                lookup.insert(parent.column.clone(), value.clone());
            }
        }

        let existing = self
            .ops
            .select(&def.name, &[def.primary_key_column.as_str()], &lookup, None)
            .await?;

        let mut data = row;
        data.remove(&def.primary_key_column);

        if let Some(found) = existing.into_iter().next() {
            let existing_key = found
                .get(&def.primary_key_column)
                .cloned()
                .unwrap_or(Value::Null);
            return match self.mode {
                RestoreMode::Fail => Ok(RowOutcome::Collision(
                    value_key(&slug).unwrap_or_default(),
                )),
                RestoreMode::Skip => Ok(RowOutcome::Skipped(existing_key)),
                RestoreMode::Overwrite => {
                    if !self.dry_run {
                        let mut target = Filters::new();
                        target.insert(def.primary_key_column.clone(), existing_key.clone());
                        self.ops.update(&def.name, data, &target).await?;
                    }
                    Ok(RowOutcome::Updated(existing_key))
                }
            };
        }

        if self.dry_run {
            return Ok(RowOutcome::Inserted(
                old_key.cloned().unwrap_or(Value::Null),
            ));
        }
        let created = self.ops.insert(&def.name, data).await?;
        Ok(RowOutcome::Inserted(
            created
                .get(&def.primary_key_column)
                .cloned()
                .unwrap_or(Value::Null),
        ))
    }
}

/// Replay an in-memory snapshot into `ops`.
///
/// Tables go in schema order so parent keys are known before children
/// need them. Each row is best effort: failures are counted and the run
/// continues, except a collision under [`RestoreMode::Fail`], which stops
/// everything and returns [`RestoreError::Aborted`]. Nothing is rolled back.
pub async fn restore_snapshot(
    ops: &dyn DatabaseOps,
    schema: &BackupSchemaSet,
    snapshot: &Snapshot,
    owner_id: &str,
    mode: RestoreMode,
    dry_run: bool,
) -> Result<RestoreSummary, RestoreError> {
    if snapshot.metadata.owner_id != owner_id {
        tracing::warn!(
            target: LOG_TARGET,
            event = "restore_owner_mismatch",
            backup_owner = %snapshot.metadata.owner_id,
            owner_id,
            "restoring another owner's backup; rows are reassigned to the current owner"
        );
    }

    let mut run = RestoreRun {
        ops,
        owner_id,
        mode,
        dry_run,
        identities: IdentityMap::default(),
    };
    let mut summary = RestoreSummary {
        tables: BTreeMap::new(),
        dry_run,
    };

    for def in &schema.tables {
        let mut counts = TableRestoreCounts::default();

        for row in snapshot.rows(&def.name) {
            let old_key = row.get(&def.primary_key_column);
            let outcome = run.restore_row(def, row.clone(), old_key).await;
            let (recorded, new_key) = match outcome {
                Ok(RowOutcome::Inserted(key)) => {
                    counts.inserted += 1;
                    (true, key)
                }
                Ok(RowOutcome::Updated(key)) => {
                    counts.updated += 1;
                    (true, key)
                }
                Ok(RowOutcome::Skipped(key)) => {
                    counts.skipped += 1;
                    (true, key)
                }
                Ok(RowOutcome::Orphaned) => {
                    counts.skipped += 1;
                    tracing::debug!(
                        target: LOG_TARGET,
                        event = "restore_row_orphaned",
                        table = %def.name,
                        key = ?old_key
                    );
                    (false, Value::Null)
                }
                Ok(RowOutcome::Collision(slug)) => {
                    summary.tables.insert(def.name.clone(), counts);
                    tracing::warn!(
                        target: LOG_TARGET,
                        event = "restore_aborted",
                        table = %def.name,
                        slug = %slug
                    );
                    return Err(RestoreError::Aborted {
                        table: def.name.clone(),
                        slug,
                        summary: Box::new(summary),
                    });
                }
                Err(err) => {
                    counts.failed += 1;
                    tracing::warn!(
                        target: LOG_TARGET,
                        event = "restore_row_failed",
                        table = %def.name,
                        key = ?old_key,
                        error = %err
                    );
                    (false, Value::Null)
                }
            };

            if recorded {
                if let Some(old) = old_key.and_then(value_key) {
                    run.identities.record(&def.name, old, new_key);
                }
            }
        }

        tracing::info!(
            target: LOG_TARGET,
            event = "restore_table_done",
            table = %def.name,
            inserted = counts.inserted,
            updated = counts.updated,
            skipped = counts.skipped,
            failed = counts.failed,
            dry_run
        );
        summary.tables.insert(def.name.clone(), counts);
    }

    Ok(summary)
}

/// Validate, load and replay the snapshot at `backup_path`.
pub async fn restore_database(
    ops: &dyn DatabaseOps,
    schema: &BackupSchemaSet,
    backup_path: &Path,
    owner_id: &str,
    mode: RestoreMode,
    dry_run: bool,
) -> Result<RestoreSummary, RestoreError> {
    let report = validate_backup(backup_path, schema);
    for warning in &report.warnings {
        tracing::warn!(target: LOG_TARGET, event = "backup_validation_warning", warning = %warning);
    }
    if !report.valid {
        return Err(RestoreError::Validation {
            errors: report.errors,
        });
    }

    let snapshot = Snapshot::read(backup_path).map_err(RestoreError::Load)?;
    restore_snapshot(ops, schema, &snapshot, owner_id, mode, dry_run).await
}
