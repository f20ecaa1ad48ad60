//! Copy one owner's rows between two databases, matched by slug.
//!
//! Two paths: with a [`BackupSchemaSet`] the rows travel through a
//! temporary snapshot and the restore engine remaps foreign keys; without
//! one, rows are inserted table by table as-is, which only suits flat tables.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backup::{backup_database, restore_database, BackupOptions, BackupSchemaSet, RestoreMode};
use crate::ops::{DatabaseOps, Filters, OpsError, Row, RowExt};
use crate::{AppError, LOG_TARGET};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(
        "FK constraint violation inserting into '{table}': {message}. Consider providing a backup schema for FK-aware sync"
    )]
    ForeignKey { table: String, message: String },
}

impl From<SyncError> for AppError {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::ForeignKey { ref table, .. } => {
                AppError::new("SYNC/FOREIGN_KEY", error.to_string())
                    .with_context("table", table.clone())
            }
        }
    }
}

/// One side of a sync: a display name plus its operation handle.
#[derive(Clone, Copy)]
pub struct SyncEndpoint<'a> {
    pub name: &'a str,
    pub ops: &'a dyn DatabaseOps,
}

impl<'a> SyncEndpoint<'a> {
    pub fn new(name: &'a str, ops: &'a dyn DatabaseOps) -> Self {
        Self { name, ops }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TablePlan {
    pub new: u64,
    pub update: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub source_profile: String,
    pub dest_profile: String,
    pub source_counts: BTreeMap<String, u64>,
    pub dest_counts: BTreeMap<String, u64>,
    pub sync_plan: BTreeMap<String, TablePlan>,
    pub synced_count: u64,
    pub skipped_count: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub tables: Vec<String>,
    pub owner_id: String,
    pub owner_column: String,
    pub slug_column: String,
    /// Present: FK-aware sync through backup and restore.
    pub schema: Option<BackupSchemaSet>,
    pub dry_run: bool,
    pub confirm: bool,
}

impl SyncOptions {
    /// Dry run over `tables` with the default `user_id`/`slug` columns.
    pub fn new<I, S>(tables: I, owner_id: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
            owner_id: owner_id.into(),
            owner_column: "user_id".to_string(),
            slug_column: "slug".to_string(),
            schema: None,
            dry_run: true,
            confirm: false,
        }
    }

    pub fn with_schema(mut self, schema: BackupSchemaSet) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn confirmed(mut self) -> Self {
        self.dry_run = false;
        self.confirm = true;
        self
    }
}

fn owner_filter(options: &SyncOptions) -> Filters {
    let mut filters = Filters::new();
    filters.insert(
        options.owner_column.clone(),
        serde_json::Value::String(options.owner_id.clone()),
    );
    filters
}

async fn owner_rows(
    ops: &dyn DatabaseOps,
    table: &str,
    columns: &[&str],
    options: &SyncOptions,
) -> Result<Vec<Row>, OpsError> {
    ops.select(table, columns, &owner_filter(options), None).await
}

/// Per table: how many rows the owner has, and their slugs.
async fn inventory(
    endpoint: SyncEndpoint<'_>,
    options: &SyncOptions,
) -> Result<BTreeMap<String, (u64, BTreeSet<String>)>, OpsError> {
    let mut out = BTreeMap::new();
    for table in &options.tables {
        let rows = owner_rows(endpoint.ops, table, &[options.slug_column.as_str()], options).await?;
        let slugs = rows
            .iter()
            .filter_map(|row| row.key_of(&options.slug_column))
            .collect();
        out.insert(table.clone(), (rows.len() as u64, slugs));
    }
    Ok(out)
}

/// Row counts and the new/update split per table. Read-only.
pub async fn compare_profiles(
    source: SyncEndpoint<'_>,
    dest: SyncEndpoint<'_>,
    options: &SyncOptions,
) -> SyncResult {
    let mut result = SyncResult {
        source_profile: source.name.to_string(),
        dest_profile: dest.name.to_string(),
        ..SyncResult::default()
    };

    let compared = async {
        let src = inventory(source, options).await?;
        let dst = inventory(dest, options).await?;
        Ok::<_, OpsError>((src, dst))
    }
    .await;

    match compared {
        Ok((src, dst)) => {
            let empty = (0, BTreeSet::new());
            for table in &options.tables {
                let (src_count, src_slugs) = src.get(table).unwrap_or(&empty);
                let (dst_count, dst_slugs) = dst.get(table).unwrap_or(&empty);
                result.source_counts.insert(table.clone(), *src_count);
                result.dest_counts.insert(table.clone(), *dst_count);
                result.sync_plan.insert(
                    table.clone(),
                    TablePlan {
                        new: src_slugs.difference(dst_slugs).count() as u64,
                        update: src_slugs.intersection(dst_slugs).count() as u64,
                    },
                );
            }
            result.success = true;
        }
        Err(err) => result
            .errors
            .push(format!("Failed to compare profiles: {err}")),
    }
    result
}

/// Compare, then copy when `confirm` is set and `dry_run` is not.
///
/// Returns `Err` only for a foreign-key violation on the direct path, the
/// signal that a backup schema is needed. Everything else lands in
/// [`SyncResult::errors`].
pub async fn sync_data(
    source: SyncEndpoint<'_>,
    dest: SyncEndpoint<'_>,
    options: &SyncOptions,
) -> Result<SyncResult, SyncError> {
    let mut result = compare_profiles(source, dest, options).await;
    if !result.success || options.dry_run {
        return Ok(result);
    }
    if !options.confirm {
        result.success = false;
        result
            .errors
            .push("Sync requires confirm=true to actually perform changes".to_string());
        return Ok(result);
    }

    match &options.schema {
        Some(schema) => sync_via_backup(&mut result, source, dest, schema, options).await,
        None => sync_direct(&mut result, source, dest, options).await?,
    }

    tracing::info!(
        target: LOG_TARGET,
        event = "sync_finished",
        source = %source.name,
        dest = %dest.name,
        success = result.success,
        synced = result.synced_count,
        skipped = result.skipped_count
    );
    Ok(result)
}

async fn sync_via_backup(
    result: &mut SyncResult,
    source: SyncEndpoint<'_>,
    dest: SyncEndpoint<'_>,
    schema: &BackupSchemaSet,
    options: &SyncOptions,
) {
    // The directory, and the snapshot in it, go away on drop.
    let outcome = async {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sync-snapshot.json");
        backup_database(
            source.ops,
            schema,
            &options.owner_id,
            BackupOptions {
                output_path: Some(path.clone()),
                ..BackupOptions::default()
            },
        )
        .await?;
        let summary = restore_database(
            dest.ops,
            schema,
            &path,
            &options.owner_id,
            RestoreMode::Overwrite,
            false,
        )
        .await?;
        Ok::<_, AppError>(summary)
    }
    .await;

    match outcome {
        Ok(summary) => {
            result.synced_count += summary.total_inserted() + summary.total_updated();
            result.skipped_count += summary.total_skipped();
            result.success = true;
        }
        Err(err) => {
            result.success = false;
            result
                .errors
                .push(format!("Sync via backup/restore failed: {}", err.message()));
        }
    }
}

async fn sync_direct(
    result: &mut SyncResult,
    source: SyncEndpoint<'_>,
    dest: SyncEndpoint<'_>,
    options: &SyncOptions,
) -> Result<(), SyncError> {
    let outcome: Result<(), OpsError> = async {
        for table in &options.tables {
            let rows = owner_rows(source.ops, table, &[], options).await?;
            let existing: BTreeSet<String> =
                owner_rows(dest.ops, table, &[options.slug_column.as_str()], options)
                    .await?
                    .iter()
                    .filter_map(|row| row.key_of(&options.slug_column))
                    .collect();

            for row in rows {
                if row
                    .key_of(&options.slug_column)
                    .is_some_and(|slug| existing.contains(&slug))
                {
                    result.skipped_count += 1;
                    continue;
                }
                dest.ops.insert(table, row).await?;
                result.synced_count += 1;
            }
            tracing::info!(
                target: LOG_TARGET,
                event = "sync_direct_insert",
                table = %table,
                synced = result.synced_count,
                skipped = result.skipped_count
            );
        }
        Ok(())
    }
    .await;

    match outcome {
        Ok(()) => {
            result.success = true;
            Ok(())
        }
        Err(OpsError::ForeignKeyViolation { table, message }) => {
            result.success = false;
            Err(SyncError::ForeignKey { table, message })
        }
        Err(err) => {
            result.success = false;
            result.errors.push(format!("Direct sync failed: {err}"));
            Ok(())
        }
    }
}
