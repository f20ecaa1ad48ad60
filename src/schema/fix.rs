use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::compare::SchemaValidationResult;
use super::ddl::SchemaSource;
use super::deps::topo_order;
use crate::backup::{Snapshot, SnapshotMetadata};
use crate::ops::{DatabaseOps, Filters, OpsError};
use crate::{AppError, AppResult, LOG_TARGET};

/// Tables missing at least this many columns are dropped and re-created
/// instead of altered column by column.
pub const RECREATE_THRESHOLD: usize = 2;

const ALL_OWNERS: &str = "*";

pub const DDL_UNSUPPORTED_MESSAGE: &str = "DDL operations not supported for this adapter type";

/// One `ALTER TABLE ... ADD COLUMN`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnFix {
    pub table: String,
    pub column: String,
    pub definition: String,
}

impl ColumnFix {
    /// `NOT NULL` is dropped unless the column is a foreign key, and
    /// `PRIMARY KEY` always is; neither can be added to a populated table.
    pub fn to_sql(&self) -> String {
        let mut definition = self.definition.clone();
        if !definition.contains("REFERENCES") {
            definition = definition.replace(" NOT NULL", "");
        }
        if definition.contains("PRIMARY KEY") {
            definition = definition.replace(" PRIMARY KEY", "");
        }
        let definition = definition.trim();
        if definition.is_empty() {
            format!("ALTER TABLE {} ADD COLUMN {};", self.table, self.column)
        } else {
            format!(
                "ALTER TABLE {} ADD COLUMN {} {};",
                self.table, self.column, definition
            )
        }
    }
}

/// A table created from its schema `CREATE` statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableFix {
    pub table: String,
    pub create_sql: String,
    /// Dropped first, then created.
    pub is_recreate: bool,
}

impl TableFix {
    pub fn to_sql(&self) -> &str {
        &self.create_sql
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {} CASCADE;", self.table)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixPlan {
    pub missing_tables: Vec<TableFix>,
    pub missing_columns: Vec<ColumnFix>,
    pub tables_to_recreate: Vec<TableFix>,
    /// Reverse of `create_order`.
    pub drop_order: Vec<String>,
    /// Every created or recreated table, parents first.
    pub create_order: Vec<String>,
    /// Set when the plan cannot be built; the caller decides what to do.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FixPlan {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn has_fixes(&self) -> bool {
        !(self.missing_tables.is_empty()
            && self.missing_columns.is_empty()
            && self.tables_to_recreate.is_empty())
    }

    pub fn fix_count(&self) -> usize {
        self.missing_tables.len() + self.missing_columns.len() + self.tables_to_recreate.len()
    }

    /// Every statement an apply would run, in execution order.
    pub fn statements(&self) -> Vec<String> {
        let mut out: Vec<String> = ordered(&self.missing_tables, &self.create_order)
            .into_iter()
            .map(|fix| fix.create_sql.clone())
            .collect();
        for fix in ordered(&self.tables_to_recreate, &self.drop_order) {
            out.push(fix.drop_sql());
        }
        for fix in ordered(&self.tables_to_recreate, &self.create_order) {
            out.push(fix.create_sql.clone());
        }
        out.extend(self.missing_columns.iter().map(ColumnFix::to_sql));
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
    pub tables_created: usize,
    pub tables_recreated: usize,
    pub columns_added: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Raised, rather than reported, because retrying cannot help: the backend
/// has no way to run DDL.
#[derive(Debug, Error)]
pub enum FixError {
    #[error("DDL operations not supported for this adapter type: {0}")]
    DdlUnsupported(String),
}

impl From<FixError> for AppError {
    fn from(error: FixError) -> Self {
        AppError::new("FIX/DDL_UNSUPPORTED", DDL_UNSUPPORTED_MESSAGE)
            .with_context("detail", error.to_string())
    }
}

type HookFuture<T> = Pin<Box<dyn Future<Output = AppResult<T>> + Send>>;

/// Called with the table about to be dropped; returns where its data went.
pub type BackupHook = Arc<dyn Fn(String) -> HookFuture<PathBuf> + Send + Sync + 'static>;
/// Called with the backup path and the table just re-created.
pub type RestoreHook = Arc<dyn Fn(PathBuf, String) -> HookFuture<()> + Send + Sync + 'static>;
/// Called once after all DDL; `false` marks the run failed.
pub type VerifyHook = Arc<dyn Fn() -> HookFuture<bool> + Send + Sync + 'static>;

#[derive(Clone, Default)]
pub struct FixHooks {
    pub backup: Option<BackupHook>,
    pub restore: Option<RestoreHook>,
    pub verify: Option<VerifyHook>,
}

impl FixHooks {
    /// Copy each recreated table's rows to a snapshot file under `dir` before
    /// the drop, and insert them back, keys included, once it is re-created.
    pub fn table_copies(ops: Arc<dyn DatabaseOps>, dir: PathBuf) -> Self {
        let backup_ops = ops.clone();
        let backup: BackupHook = Arc::new(move |table: String| {
            let ops = backup_ops.clone();
            let dir = dir.clone();
            Box::pin(async move {
                let rows = ops.select(&table, &[], &Filters::new(), None).await?;
                // Not owner-scoped: the whole table is at stake.
                let mut snapshot = Snapshot::new(SnapshotMetadata::new(ALL_OWNERS));
                snapshot
                    .metadata
                    .extra
                    .insert(format!("{table}_count"), rows.len().into());
                snapshot.tables.insert(table.clone(), rows);
                let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S%.3f");
                let path = dir.join(format!("fix-{table}-{stamp}.json"));
                snapshot.write(&path)?;
                tracing::info!(
                    target: LOG_TARGET,
                    event = "fix_table_backed_up",
                    table = %table,
                    path = %path.display()
                );
                Ok::<_, AppError>(path)
            })
        });

        let restore: RestoreHook = Arc::new(move |path: PathBuf, table: String| {
            let ops = ops.clone();
            Box::pin(async move {
                let snapshot = Snapshot::read(&path)?;
                let rows = snapshot.rows(&table);
                for row in rows {
                    ops.insert(&table, row.clone()).await.map_err(|err| {
                        AppError::from(err)
                            .with_context("operation", "fix_restore_row")
                            .with_context("backup", path.display().to_string())
                    })?;
                }
                tracing::info!(
                    target: LOG_TARGET,
                    event = "fix_table_restored",
                    table = %table,
                    rows = rows.len()
                );
                Ok::<_, AppError>(())
            })
        });

        Self {
            backup: Some(backup),
            restore: Some(restore),
            verify: None,
        }
    }

    pub fn with_verify(mut self, verify: VerifyHook) -> Self {
        self.verify = Some(verify);
        self
    }
}

/// Turn a schema diff into DDL fixes.
///
/// Never fails outright: a missing `CREATE` statement or an unknown column
/// definition comes back in [`FixPlan::error`].
pub fn generate_fix_plan(
    comparison: &SchemaValidationResult,
    column_definitions: &BTreeMap<String, String>,
    source: &SchemaSource,
) -> FixPlan {
    if comparison.missing_tables.is_empty() && comparison.missing_columns.is_empty() {
        return FixPlan::default();
    }

    let mut plan = FixPlan::default();
    for table in &comparison.missing_tables {
        match source.create_statement(table) {
            Ok(sql) => plan.missing_tables.push(TableFix {
                table: table.clone(),
                create_sql: sql.to_string(),
                is_recreate: false,
            }),
            Err(err) => return FixPlan::failed(err.to_string()),
        }
    }

    let mut by_table: BTreeMap<&str, Vec<(&str, &str)>> = BTreeMap::new();
    for diff in &comparison.missing_columns {
        let key = format!("{}.{}", diff.table, diff.column);
        let Some(definition) = column_definitions.get(&key) else {
            return FixPlan::failed(format!("Unknown column definition for {key}"));
        };
        by_table
            .entry(diff.table.as_str())
            .or_default()
            .push((diff.column.as_str(), definition.as_str()));
    }

    for (table, columns) in by_table {
        if columns.len() >= RECREATE_THRESHOLD {
            match source.create_statement(table) {
                Ok(sql) => plan.tables_to_recreate.push(TableFix {
                    table: table.to_string(),
                    create_sql: sql.to_string(),
                    is_recreate: true,
                }),
                Err(err) => return FixPlan::failed(err.to_string()),
            }
        } else {
            for (column, definition) in columns {
                plan.missing_columns.push(ColumnFix {
                    table: table.to_string(),
                    column: column.to_string(),
                    definition: definition.to_string(),
                });
            }
        }
    }

    let touched: Vec<String> = plan
        .missing_tables
        .iter()
        .chain(plan.tables_to_recreate.iter())
        .map(|fix| fix.table.clone())
        .collect();
    let order = topo_order(&touched, &source.fk_dependencies());
    plan.create_order = order.forward;
    plan.drop_order = order.reverse;

    tracing::info!(
        target: LOG_TARGET,
        event = "fix_plan_generated",
        missing_tables = plan.missing_tables.len(),
        missing_columns = plan.missing_columns.len(),
        tables_to_recreate = plan.tables_to_recreate.len()
    );
    plan
}

/// [`generate_fix_plan`] reading the schema from `schema_file`.
pub fn generate_fix_plan_from_file(
    comparison: &SchemaValidationResult,
    column_definitions: Option<&BTreeMap<String, String>>,
    schema_file: &Path,
) -> FixPlan {
    let source = match SchemaSource::load(schema_file) {
        Ok(source) => source,
        Err(err) => return FixPlan::failed(err.to_string()),
    };
    let parsed;
    let definitions = match column_definitions {
        Some(defs) => defs,
        None => {
            parsed = source.column_definitions();
            &parsed
        }
    };
    generate_fix_plan(comparison, definitions, &source)
}

/// `fixes` sorted by `order`; anything `order` misses goes last.
fn ordered<'a>(fixes: &'a [TableFix], order: &[String]) -> Vec<&'a TableFix> {
    let rank: HashMap<&str, usize> = order
        .iter()
        .enumerate()
        .map(|(i, t)| (t.as_str(), i))
        .collect();
    let mut sorted: Vec<&TableFix> = fixes.iter().collect();
    sorted.sort_by_key(|fix| rank.get(fix.table.as_str()).copied().unwrap_or(usize::MAX));
    sorted
}

enum Failure {
    Unsupported(String),
    Failed(String),
}

impl From<OpsError> for Failure {
    fn from(error: OpsError) -> Self {
        match error {
            OpsError::Unsupported(detail) => Failure::Unsupported(detail),
            other => Failure::Failed(other.to_string()),
        }
    }
}

impl From<AppError> for Failure {
    fn from(error: AppError) -> Self {
        Failure::Failed(error.to_string())
    }
}

async fn run_ddl(ops: &dyn DatabaseOps, sql: &str) -> Result<(), Failure> {
    ops.execute(sql, &[]).await?;
    Ok(())
}

async fn execute_plan(
    ops: &dyn DatabaseOps,
    plan: &FixPlan,
    hooks: &FixHooks,
    result: &mut FixResult,
) -> Result<bool, Failure> {
    for fix in ordered(&plan.missing_tables, &plan.create_order) {
        run_ddl(ops, fix.to_sql()).await?;
        result.tables_created += 1;
        tracing::info!(target: LOG_TARGET, event = "fix_table_created", table = %fix.table);
    }

    let mut backups: BTreeMap<&str, PathBuf> = BTreeMap::new();
    for fix in ordered(&plan.tables_to_recreate, &plan.drop_order) {
        if let Some(backup) = &hooks.backup {
            let path = backup(fix.table.clone()).await?;
            if result.backup_path.is_none() {
                result.backup_path = Some(path.display().to_string());
            }
            backups.insert(fix.table.as_str(), path);
        }
        run_ddl(ops, &fix.drop_sql()).await?;
        tracing::info!(target: LOG_TARGET, event = "fix_table_dropped", table = %fix.table);
    }

    for fix in ordered(&plan.tables_to_recreate, &plan.create_order) {
        run_ddl(ops, fix.to_sql()).await?;
        result.tables_recreated += 1;
        tracing::info!(target: LOG_TARGET, event = "fix_table_recreated", table = %fix.table);
        if let (Some(restore), Some(path)) = (&hooks.restore, backups.get(fix.table.as_str())) {
            restore(path.clone(), fix.table.clone()).await?;
        }
    }

    for fix in &plan.missing_columns {
        run_ddl(ops, &fix.to_sql()).await?;
        result.columns_added += 1;
        tracing::info!(
            target: LOG_TARGET,
            event = "fix_column_added",
            table = %fix.table,
            column = %fix.column
        );
    }

    match &hooks.verify {
        Some(verify) => Ok(verify().await?),
        None => Ok(true),
    }
}

/// Apply `plan` through `ops`.
///
/// Plan errors, dry runs and missing confirmation return without touching
/// the database. A failing statement stops the run; statements already
/// applied stay applied.
pub async fn apply_fixes(
    ops: &dyn DatabaseOps,
    plan: &FixPlan,
    hooks: &FixHooks,
    dry_run: bool,
    confirm: bool,
) -> Result<FixResult, FixError> {
    let mut result = FixResult::default();

    if let Some(error) = &plan.error {
        result.error = Some(error.clone());
        return Ok(result);
    }
    if !plan.has_fixes() {
        result.success = true;
        return Ok(result);
    }
    if dry_run {
        result.success = true;
        result.tables_created = plan.missing_tables.len();
        result.tables_recreated = plan.tables_to_recreate.len();
        result.columns_added = plan.missing_columns.len();
        return Ok(result);
    }
    if !confirm {
        result.error = Some("Fix requires confirm=true to apply changes".to_string());
        return Ok(result);
    }

    let unordered: BTreeSet<&str> = plan
        .missing_tables
        .iter()
        .chain(plan.tables_to_recreate.iter())
        .map(|fix| fix.table.as_str())
        .filter(|table| !plan.create_order.iter().any(|t| t == table))
        .collect();
    if !unordered.is_empty() {
        tracing::warn!(
            target: LOG_TARGET,
            event = "fix_tables_outside_order",
            tables = ?unordered
        );
    }

    match execute_plan(ops, plan, hooks, &mut result).await {
        Ok(true) => result.success = true,
        Ok(false) => {
            result.error = Some("Fix applied but verification failed".to_string());
        }
        Err(Failure::Unsupported(detail)) => {
            tracing::error!(target: LOG_TARGET, event = "fix_ddl_unsupported", detail = %detail);
            return Err(FixError::DdlUnsupported(detail));
        }
        Err(Failure::Failed(message)) => {
            tracing::error!(target: LOG_TARGET, event = "fix_failed", error = %message);
            result.error = Some(format!("Failed to apply fixes: {message}"));
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::compare::{validate_schema, ColumnSets};

    const SCHEMA: &str = "
        CREATE TABLE authors (id TEXT PRIMARY KEY, slug TEXT NOT NULL, bio TEXT, name TEXT);
        CREATE TABLE books (
            id TEXT PRIMARY KEY,
            author_id TEXT NOT NULL REFERENCES authors(id),
            slug TEXT NOT NULL
        );
        CREATE TABLE reviews (id TEXT PRIMARY KEY, book_id TEXT REFERENCES books(id));
    ";

    fn sets(entries: &[(&str, &[&str])]) -> ColumnSets {
        entries
            .iter()
            .map(|(t, c)| (t.to_string(), c.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    fn source() -> SchemaSource {
        SchemaSource::from_sql("schema.sql", SCHEMA)
    }

    #[test]
    fn column_fix_strips_not_null_and_primary_key() {
        let fix = ColumnFix {
            table: "authors".into(),
            column: "bio".into(),
            definition: "TEXT NOT NULL".into(),
        };
        assert_eq!(fix.to_sql(), "ALTER TABLE authors ADD COLUMN bio TEXT;");

        let pk = ColumnFix {
            table: "authors".into(),
            column: "uid".into(),
            definition: "TEXT PRIMARY KEY".into(),
        };
        assert_eq!(pk.to_sql(), "ALTER TABLE authors ADD COLUMN uid TEXT;");

        let fk = ColumnFix {
            table: "books".into(),
            column: "author_id".into(),
            definition: "TEXT NOT NULL REFERENCES authors(id)".into(),
        };
        assert_eq!(
            fk.to_sql(),
            "ALTER TABLE books ADD COLUMN author_id TEXT NOT NULL REFERENCES authors(id);"
        );
    }

    #[test]
    fn one_missing_column_alters_two_recreate() {
        let actual = sets(&[
            ("authors", &["id", "slug"]),
            ("books", &["id", "author_id"]),
            ("reviews", &["id", "book_id"]),
        ]);
        let expected = source().expected_columns().unwrap();
        let comparison = validate_schema(&actual, &expected);
        let plan = generate_fix_plan(&comparison, &source().column_definitions(), &source());

        assert_eq!(plan.error, None);
        assert_eq!(plan.tables_to_recreate.len(), 1);
        assert_eq!(plan.tables_to_recreate[0].table, "authors");
        assert!(plan.tables_to_recreate[0].is_recreate);
        assert_eq!(plan.missing_columns.len(), 1);
        assert_eq!(plan.missing_columns[0].table, "books");
        assert!(plan.missing_columns.iter().all(|c| c.table != "authors"));
        assert_eq!(plan.fix_count(), 2);
    }

    #[test]
    fn orders_cover_created_and_recreated_tables() {
        let actual = sets(&[("authors", &["id", "slug"])]);
        let expected = source().expected_columns().unwrap();
        let comparison = validate_schema(&actual, &expected);
        let plan = generate_fix_plan(&comparison, &source().column_definitions(), &source());

        assert_eq!(plan.create_order, vec!["authors", "books", "reviews"]);
        let mut reversed = plan.create_order.clone();
        reversed.reverse();
        assert_eq!(plan.drop_order, reversed);
    }

    #[test]
    fn unknown_column_definition_is_a_plan_error() {
        let actual = sets(&[("authors", &["id", "slug", "bio"])]);
        let expected = sets(&[("authors", &["id", "slug", "bio", "name"])]);
        let comparison = validate_schema(&actual, &expected);
        let plan = generate_fix_plan(&comparison, &BTreeMap::new(), &source());
        assert_eq!(
            plan.error.as_deref(),
            Some("Unknown column definition for authors.name")
        );
        assert!(!plan.has_fixes());
    }

    #[test]
    fn missing_create_statement_is_a_plan_error() {
        let comparison = validate_schema(&ColumnSets::new(), &sets(&[("ghosts", &["id"])]));
        let plan = generate_fix_plan(&comparison, &BTreeMap::new(), &source());
        assert_eq!(
            plan.error.as_deref(),
            Some("CREATE TABLE for ghosts not found in schema.sql")
        );
    }

    #[test]
    fn valid_comparison_yields_empty_plan() {
        let expected = source().expected_columns().unwrap();
        let comparison = validate_schema(&expected, &expected);
        let plan = generate_fix_plan(&comparison, &BTreeMap::new(), &source());
        assert_eq!(plan, FixPlan::default());
    }

    #[test]
    fn missing_schema_file_is_a_plan_error() {
        let comparison = validate_schema(&ColumnSets::new(), &sets(&[("authors", &["id"])]));
        let plan =
            generate_fix_plan_from_file(&comparison, None, Path::new("/no/such/schema.sql"));
        assert!(plan
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("Schema file not found:")));
    }

    #[test]
    fn statements_follow_execution_order() {
        let actual = sets(&[("books", &["id"]), ("reviews", &["id"])]);
        let expected = source().expected_columns().unwrap();
        let comparison = validate_schema(&actual, &expected);
        let plan = generate_fix_plan(&comparison, &source().column_definitions(), &source());
        let statements = plan.statements();
        assert!(statements[0].starts_with("CREATE TABLE authors"));
        assert_eq!(statements[1], "DROP TABLE IF EXISTS books CASCADE;");
        assert!(statements[2].starts_with("CREATE TABLE books"));
        assert_eq!(
            statements[3],
            "ALTER TABLE reviews ADD COLUMN book_id TEXT REFERENCES books(id);"
        );
    }
}
