use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use super::model::BackupSchemaSet;
use super::snapshot::{Snapshot, SnapshotMetadata, REQUIRED_METADATA};
use crate::ops::{DatabaseOps, Filters, RowExt};
use crate::{AppError, AppResult, LOG_TARGET};

const BACKUP_DIR_NAME: &str = "backups";

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Where to write; defaults to `backups/backup-<timestamp>.json` under
    /// the working directory.
    pub output_path: Option<PathBuf>,
    /// Extra equality filters per table, ANDed with the owner filter.
    pub table_filters: BTreeMap<String, Filters>,
    pub extra_metadata: Map<String, Value>,
}

pub fn default_backup_path(base: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string();
    base.join(BACKUP_DIR_NAME)
        .join(format!("backup-{stamp}.json"))
}

/// Build an in-memory snapshot of `owner_id`'s rows.
///
/// Tables are read in schema order. A child row is kept only when its
/// parent key is among the parent rows already captured in this pass, so
/// the snapshot is referentially consistent even if the live data moved
/// between reads.
pub async fn build_snapshot(
    ops: &dyn DatabaseOps,
    schema: &BackupSchemaSet,
    owner_id: &str,
    options: &BackupOptions,
) -> AppResult<Snapshot> {
    let mut snapshot = Snapshot::new(SnapshotMetadata::new(owner_id));
    let mut captured: HashMap<&str, BTreeSet<String>> = HashMap::new();

    for def in &schema.tables {
        let mut filters = Filters::new();
        filters.insert(def.owner_column.clone(), Value::String(owner_id.to_string()));
        if let Some(extra) = options.table_filters.get(&def.name) {
            filters.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let mut rows = ops
            .select(&def.name, &[], &filters, Some(&def.primary_key_column))
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "backup_select")
                    .with_context("table", def.name.clone())
            })?;

        if let Some(parent) = &def.parent_reference {
            match captured.get(parent.table.as_str()) {
                Some(parent_keys) => {
                    let before = rows.len();
                    rows.retain(|row| {
                        row.key_of(&parent.column)
                            .is_some_and(|key| parent_keys.contains(&key))
                    });
                    let dropped = before - rows.len();
                    if dropped > 0 {
                        tracing::info!(
                            target: LOG_TARGET,
                            event = "backup_rows_without_parent",
                            table = %def.name,
                            parent = %parent.table,
                            dropped
                        );
                    }
                }
                None => tracing::warn!(
                    target: LOG_TARGET,
                    event = "backup_parent_not_captured",
                    table = %def.name,
                    parent = %parent.table
                ),
            }
        }

        let keys = rows
            .iter()
            .filter_map(|row| row.key_of(&def.primary_key_column))
            .collect();
        captured.insert(def.name.as_str(), keys);

        snapshot
            .metadata
            .extra
            .insert(format!("{}_count", def.name), Value::from(rows.len()));
        snapshot.tables.insert(def.name.clone(), rows);
    }

    for (key, value) in &options.extra_metadata {
        if REQUIRED_METADATA.contains(&key.as_str()) {
            continue;
        }
        snapshot.metadata.extra.insert(key.clone(), value.clone());
    }

    Ok(snapshot)
}

/// Export `owner_id`'s rows to a snapshot file and return its path.
pub async fn backup_database(
    ops: &dyn DatabaseOps,
    schema: &BackupSchemaSet,
    owner_id: &str,
    options: BackupOptions,
) -> AppResult<PathBuf> {
    let snapshot = build_snapshot(ops, schema, owner_id, &options).await?;

    let path = match &options.output_path {
        Some(path) => path.clone(),
        None => default_backup_path(&std::env::current_dir()?),
    };
    snapshot.write(&path)?;

    let counts: Vec<String> = schema
        .tables
        .iter()
        .map(|t| format!("{}={}", t.name, snapshot.rows(&t.name).len()))
        .collect();
    tracing::info!(
        target: LOG_TARGET,
        event = "backup_written",
        path = %path.display(),
        owner_id,
        counts = %counts.join(",")
    );

    Ok(path)
}
