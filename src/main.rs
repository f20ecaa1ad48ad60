use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use dbmend_lib::backup::{
    backup_database, restore_database, validate_backup, BackupOptions, BackupSchemaSet,
    RestoreError, RestoreMode, RestoreSummary,
};
use dbmend_lib::config::{active_profile_name, DatabaseConfig, CONFIG_FILE_NAME};
use dbmend_lib::connect::{connect_and_validate, open_profile, ConnectionResult};
use dbmend_lib::ops::DatabaseOps;
use dbmend_lib::schema::{
    apply_fixes, generate_fix_plan, sqlite_column_sets, validate_schema, FixError, FixHooks,
    FixPlan, FixResult, SchemaSource,
};
use dbmend_lib::sync::{sync_data, SyncEndpoint, SyncOptions, SyncResult};
use dbmend_lib::AppError;

const EXIT_OK: i32 = 0;
const EXIT_FAILED: i32 = 1;
const EXIT_USAGE: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "dbmend",
    about = "Repair schema drift and move data between databases",
    version
)]
struct Cli {
    /// Profile file.
    #[arg(long, global = true, default_value = CONFIG_FILE_NAME)]
    config: PathBuf,
    /// Profile to use instead of DBMEND_DB_PROFILE or the .db-profile lock.
    #[arg(long, global = true)]
    profile: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Open a profile, validate it and remember it as the active profile.
    Connect,
    /// Show the active profile and whether its schema matches.
    Status,
    /// List configured profiles.
    Profiles,
    /// Compare the live schema with the schema file; exits 1 on drift.
    Validate,
    /// Plan schema fixes and, with --confirm, apply them.
    Fix(FixArgs),
    /// Owner-scoped snapshots.
    #[command(subcommand)]
    Backup(BackupCommand),
    /// Copy one owner's rows from another profile into the active one.
    Sync(SyncArgs),
}

#[derive(Debug, Args)]
struct FixArgs {
    /// Schema file to read CREATE statements from; defaults to the config's.
    #[arg(long)]
    schema_file: Option<PathBuf>,
    /// JSON object of "table.column" -> column definition.
    #[arg(long)]
    column_defs: Option<PathBuf>,
    /// Apply the plan. Without it the plan is only previewed.
    #[arg(long)]
    confirm: bool,
    /// Do not copy recreated tables' rows aside and back.
    #[arg(long)]
    no_backup: bool,
}

#[derive(Debug, Subcommand)]
enum BackupCommand {
    /// Write a snapshot of one owner's rows.
    Create {
        /// JSON array of table definitions, parents first.
        #[arg(long)]
        schema: PathBuf,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Replay a snapshot into the active profile.
    Restore {
        path: PathBuf,
        #[arg(long)]
        schema: PathBuf,
        #[arg(long)]
        owner: String,
        #[arg(long, default_value_t = RestoreMode::Skip)]
        mode: RestoreMode,
        #[arg(long)]
        dry_run: bool,
        /// Required to write; use --dry-run to preview instead.
        #[arg(long)]
        yes: bool,
    },
    /// Check a snapshot file without touching any database.
    Validate {
        path: PathBuf,
        #[arg(long)]
        schema: PathBuf,
    },
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Source profile.
    #[arg(long = "from")]
    from: String,
    /// Comma-separated table names.
    #[arg(long, value_delimiter = ',', required = true)]
    tables: Vec<String>,
    #[arg(long)]
    owner: String,
    /// Table definitions for FK-aware sync through backup and restore.
    #[arg(long)]
    schema: Option<PathBuf>,
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    confirm: bool,
}

fn main() {
    let _guard = dbmend_lib::init_logging();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(exit_code_for(&err));
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<AppError>() {
        Some(app) if app.code().starts_with("CONFIG/") => EXIT_USAGE,
        _ => EXIT_FAILED,
    }
}

fn load_config(path: &Path) -> Result<DatabaseConfig> {
    Ok(DatabaseConfig::load(path).map_err(AppError::from)?)
}

fn run(cli: Cli) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    let Cli {
        config,
        profile,
        command,
    } = cli;
    let profile = profile.as_deref();

    runtime.block_on(async {
        match command {
            Commands::Connect => handle_connect(&load_config(&config)?, profile, false).await,
            Commands::Status => handle_status(&load_config(&config)?, profile).await,
            Commands::Profiles => handle_profiles(&load_config(&config)?, profile),
            Commands::Validate => handle_connect(&load_config(&config)?, profile, true).await,
            Commands::Fix(args) => handle_fix(&load_config(&config)?, profile, args).await,
            // `backup validate` only reads files; the rest load the config themselves.
            Commands::Backup(command) => handle_backup(&config, profile, command).await,
            Commands::Sync(args) => handle_sync(&load_config(&config)?, profile, args).await,
        }
    })
}

fn resolve_profile(config: &DatabaseConfig, profile: Option<&str>) -> Result<String> {
    let name = active_profile_name(profile, &config.lock_path()).map_err(AppError::from)?;
    config.profile(&name).map_err(AppError::from)?;
    Ok(name)
}

fn expected_columns(config: &DatabaseConfig) -> Result<Option<dbmend_lib::schema::ColumnSets>> {
    if !config.schema.validate_on_connect {
        return Ok(None);
    }
    let source = SchemaSource::load(&config.schema_file()).map_err(AppError::from)?;
    Ok(Some(source.expected_columns().map_err(AppError::from)?))
}

fn print_connection(result: &ConnectionResult) {
    match (&result.profile_name, result.success) {
        (Some(name), true) => println!("Connected to profile '{name}'"),
        (Some(name), false) => println!("Profile '{name}' failed"),
        (None, _) => println!("No profile"),
    }
    if let Some(report) = &result.schema_report {
        println!("{}", report.format_report());
    }
    if let Some(error) = &result.error {
        println!("Error: {error}");
    }
}

async fn handle_connect(
    config: &DatabaseConfig,
    profile: Option<&str>,
    validate_only: bool,
) -> Result<i32> {
    let expected = if validate_only {
        let source = SchemaSource::load(&config.schema_file()).map_err(AppError::from)?;
        Some(source.expected_columns().map_err(AppError::from)?)
    } else {
        expected_columns(config)?
    };
    let result = connect_and_validate(config, profile, expected.as_ref(), validate_only).await;
    print_connection(&result);
    Ok(if result.success { EXIT_OK } else { EXIT_FAILED })
}

async fn handle_status(config: &DatabaseConfig, profile: Option<&str>) -> Result<i32> {
    let name = resolve_profile(config, profile)?;
    let description = config
        .profile(&name)
        .map(|p| p.description.clone())
        .unwrap_or_default();
    println!("Active profile : {name}");
    if !description.is_empty() {
        println!("Description    : {description}");
    }
    println!("Schema file    : {}", config.schema_file().display());

    let expected = expected_columns(config)?;
    let result = connect_and_validate(config, Some(&name), expected.as_ref(), true).await;
    print_connection(&result);
    Ok(if result.success { EXIT_OK } else { EXIT_FAILED })
}

fn handle_profiles(config: &DatabaseConfig, profile: Option<&str>) -> Result<i32> {
    let active = active_profile_name(profile, &config.lock_path()).ok();
    if config.profiles.is_empty() {
        println!("No profiles configured in {}", CONFIG_FILE_NAME);
        return Ok(EXIT_OK);
    }
    for (name, entry) in &config.profiles {
        let marker = if active.as_deref() == Some(name.as_str()) {
            "*"
        } else {
            " "
        };
        println!("{marker} {name:<16} {:<8} {}", entry.provider, entry.description);
    }
    Ok(EXIT_OK)
}

fn load_column_defs(path: &Path) -> Result<BTreeMap<String, String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read column definitions {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("parse column definitions {}", path.display()))
}

fn print_plan(plan: &FixPlan) {
    println!("Fix plan ({} fixes):", plan.fix_count());
    for statement in plan.statements() {
        println!("  {}", statement.replace('\n', " "));
    }
}

fn print_fix_result(result: &FixResult, dry_run: bool) {
    let verb = if dry_run { "Would" } else { "Did" };
    println!(
        "{verb} create {} tables, recreate {} tables, add {} columns",
        result.tables_created, result.tables_recreated, result.columns_added
    );
    if let Some(path) = &result.backup_path {
        println!("Backup: {path}");
    }
    if let Some(error) = &result.error {
        println!("Error: {error}");
    }
}

async fn handle_fix(config: &DatabaseConfig, profile: Option<&str>, args: FixArgs) -> Result<i32> {
    let name = resolve_profile(config, profile)?;
    let schema_file = args.schema_file.unwrap_or_else(|| config.schema_file());
    let source = SchemaSource::load(&schema_file).map_err(AppError::from)?;
    let expected = source.expected_columns().map_err(AppError::from)?;

    let ops = open_profile(config, &name).await?;
    let actual = sqlite_column_sets(ops.pool()).await?;
    let comparison = validate_schema(&actual, &expected);
    if comparison.valid {
        println!("{}", comparison.format_report());
        ops.close().await;
        return Ok(EXIT_OK);
    }

    let column_defs = match &args.column_defs {
        Some(path) => load_column_defs(path)?,
        None => source.column_definitions(),
    };
    let plan = generate_fix_plan(&comparison, &column_defs, &source);
    if let Some(error) = &plan.error {
        println!("Error: {error}");
        ops.close().await;
        return Ok(EXIT_FAILED);
    }
    print_plan(&plan);

    let shared: Arc<dyn DatabaseOps> = Arc::new(ops.clone());
    let mut hooks = if args.no_backup {
        FixHooks::default()
    } else {
        FixHooks::table_copies(shared, std::env::current_dir()?.join("backups"))
    };
    let verify_pool = ops.pool().clone();
    let verify_expected = expected.clone();
    hooks.verify = Some(Arc::new(move || {
        let pool = verify_pool.clone();
        let expected = verify_expected.clone();
        Box::pin(async move {
            let actual = sqlite_column_sets(&pool).await?;
            Ok::<_, AppError>(validate_schema(&actual, &expected).valid)
        })
    }));

    let dry_run = !args.confirm;
    let outcome = apply_fixes(&ops, &plan, &hooks, dry_run, args.confirm).await;
    ops.close().await;
    match outcome {
        Ok(result) => {
            print_fix_result(&result, dry_run);
            if dry_run {
                println!("Re-run with --confirm to apply.");
            }
            Ok(if result.success { EXIT_OK } else { EXIT_FAILED })
        }
        Err(err @ FixError::DdlUnsupported(_)) => {
            println!("Error: {err}");
            Ok(EXIT_FAILED)
        }
    }
}

fn load_backup_schema(path: &Path) -> Result<BackupSchemaSet> {
    let schema = BackupSchemaSet::load(path)?;
    let violations = schema.ordering_violations();
    for (child, parent) in &violations {
        eprintln!("Warning: table '{child}' is listed before its parent '{parent}'");
    }
    if !violations.is_empty() {
        eprintln!(
            "Suggested order: {}",
            schema.dependency_order().forward.join(", ")
        );
    }
    Ok(schema)
}

fn print_restore_summary(summary: &RestoreSummary) {
    let header = if summary.dry_run {
        "Restore preview (dry run)"
    } else {
        "Restore summary"
    };
    println!("{header}");
    println!(
        "{:<20} {:>8} {:>8} {:>8} {:>8}",
        "Table", "Inserted", "Updated", "Skipped", "Failed"
    );
    for (table, counts) in &summary.tables {
        println!(
            "{:<20} {:>8} {:>8} {:>8} {:>8}",
            table, counts.inserted, counts.updated, counts.skipped, counts.failed
        );
    }
}

async fn handle_backup(
    config_path: &Path,
    profile: Option<&str>,
    command: BackupCommand,
) -> Result<i32> {
    match command {
        BackupCommand::Create {
            schema,
            owner,
            output,
        } => {
            let schema = load_backup_schema(&schema)?;
            let config = load_config(config_path)?;
            let name = resolve_profile(&config, profile)?;
            let ops = open_profile(&config, &name).await?;
            let result = backup_database(
                &ops,
                &schema,
                &owner,
                BackupOptions {
                    output_path: output,
                    ..BackupOptions::default()
                },
            )
            .await;
            ops.close().await;
            let path = result?;
            println!("Backup written to {}", path.display());
            Ok(EXIT_OK)
        }
        BackupCommand::Restore {
            path,
            schema,
            owner,
            mode,
            dry_run,
            yes,
        } => {
            if !dry_run && !yes {
                println!("Restore writes to the database. Pass --yes to proceed or --dry-run to preview.");
                return Ok(EXIT_FAILED);
            }
            let schema = load_backup_schema(&schema)?;
            let config = load_config(config_path)?;
            let name = resolve_profile(&config, profile)?;
            let ops = open_profile(&config, &name).await?;
            let result = restore_database(&ops, &schema, &path, &owner, mode, dry_run).await;
            ops.close().await;
            match result {
                Ok(summary) => {
                    print_restore_summary(&summary);
                    Ok(if summary.total_failed() == 0 {
                        EXIT_OK
                    } else {
                        EXIT_FAILED
                    })
                }
                Err(RestoreError::Validation { errors }) => {
                    println!("Backup is invalid:");
                    for error in errors {
                        println!("  - {error}");
                    }
                    Ok(EXIT_FAILED)
                }
                Err(RestoreError::Aborted {
                    table,
                    slug,
                    summary,
                }) => {
                    print_restore_summary(&summary);
                    println!("Aborted: {table} row '{slug}' already exists (mode=fail)");
                    Ok(EXIT_FAILED)
                }
                Err(err) => Err(AppError::from(err).into()),
            }
        }
        BackupCommand::Validate { path, schema } => {
            let schema = load_backup_schema(&schema)?;
            let report = validate_backup(&path, &schema);
            for warning in &report.warnings {
                println!("Warning: {warning}");
            }
            for error in &report.errors {
                println!("Error: {error}");
            }
            if report.valid {
                println!("Backup is valid");
                Ok(EXIT_OK)
            } else {
                Ok(EXIT_FAILED)
            }
        }
    }
}

fn print_sync_result(result: &SyncResult) {
    println!(
        "Sync {} -> {}",
        result.source_profile, result.dest_profile
    );
    println!(
        "{:<20} {:>8} {:>8} {:>8} {:>8}",
        "Table", "Source", "Dest", "New", "Update"
    );
    for (table, plan) in &result.sync_plan {
        println!(
            "{:<20} {:>8} {:>8} {:>8} {:>8}",
            table,
            result.source_counts.get(table).copied().unwrap_or(0),
            result.dest_counts.get(table).copied().unwrap_or(0),
            plan.new,
            plan.update
        );
    }
    if result.synced_count > 0 || result.skipped_count > 0 {
        println!(
            "Synced {} rows, skipped {}",
            result.synced_count, result.skipped_count
        );
    }
    for error in &result.errors {
        println!("Error: {error}");
    }
}

async fn handle_sync(config: &DatabaseConfig, profile: Option<&str>, args: SyncArgs) -> Result<i32> {
    let dest_name = resolve_profile(config, profile)?;
    let schema = args.schema.as_deref().map(load_backup_schema).transpose()?;

    let source_ops = open_profile(config, &args.from).await?;
    let dest_ops = open_profile(config, &dest_name).await?;

    let mut options = SyncOptions::new(args.tables, args.owner);
    options.schema = schema;
    options.dry_run = args.dry_run || !args.confirm;
    options.confirm = args.confirm;

    let outcome = sync_data(
        SyncEndpoint::new(&args.from, &source_ops),
        SyncEndpoint::new(&dest_name, &dest_ops),
        &options,
    )
    .await;
    source_ops.close().await;
    dest_ops.close().await;

    match outcome {
        Ok(result) => {
            print_sync_result(&result);
            if options.dry_run {
                println!("Dry run. Re-run with --confirm to copy rows.");
            }
            Ok(if result.success { EXIT_OK } else { EXIT_FAILED })
        }
        Err(err) => {
            println!("Error: {err}");
            Ok(EXIT_FAILED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sync_tables_split_on_commas() {
        let cli = Cli::parse_from([
            "dbmend", "sync", "--from", "prod", "--tables", "authors,books", "--owner", "u1",
        ]);
        match cli.command {
            Commands::Sync(args) => assert_eq!(args.tables, vec!["authors", "books"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn restore_mode_defaults_to_skip() {
        let cli = Cli::parse_from([
            "dbmend", "backup", "restore", "b.json", "--schema", "s.json", "--owner", "u1",
        ]);
        match cli.command {
            Commands::Backup(BackupCommand::Restore { mode, .. }) => {
                assert_eq!(mode, RestoreMode::Skip)
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn config_errors_map_to_usage_exit_code() {
        let err: anyhow::Error = AppError::new("CONFIG/NOT_FOUND", "missing").into();
        assert_eq!(exit_code_for(&err), EXIT_USAGE);
        let err: anyhow::Error = AppError::new("OPS/DATABASE", "boom").into();
        assert_eq!(exit_code_for(&err), EXIT_FAILED);
    }
}
