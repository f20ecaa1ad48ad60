#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::process::Output;

use anyhow::Result;
use assert_cmd::Command;
use dbmend_lib::ops::DatabaseOps;
use serde_json::json;
use tempfile::tempdir;

mod util;
use util::{row, sqlite_ops};

const SCHEMA: &str = "
CREATE TABLE authors (id TEXT PRIMARY KEY, slug TEXT NOT NULL, user_id TEXT NOT NULL);
CREATE TABLE books (
    id TEXT PRIMARY KEY,
    slug TEXT NOT NULL,
    user_id TEXT NOT NULL,
    author_id TEXT NOT NULL REFERENCES authors(id),
    title TEXT,
    published_year INTEGER
);
";

const CONFIG: &str = r#"
[profiles.local]
url = "sqlite://local.sqlite3"
description = "dev copy"

[profiles.prod]
url = "sqlite://prod.sqlite3"

[schema]
file = "schema.sql"
"#;

const BACKUP_SCHEMA: &str = r#"[
    {"name": "authors"},
    {"name": "books", "parentReference": {"table": "authors", "column": "author_id"}}
]"#;

fn write_project(dir: &Path) -> Result<()> {
    std::fs::write(dir.join("db.toml"), CONFIG)?;
    std::fs::write(dir.join("schema.sql"), SCHEMA)?;
    std::fs::write(dir.join("tables.json"), BACKUP_SCHEMA)?;
    Ok(())
}

fn dbmend(dir: &Path, args: &[&str]) -> Result<Output> {
    Ok(Command::cargo_bin("dbmend")?
        .current_dir(dir)
        .env_remove("DBMEND_DB_PROFILE")
        .env("DBMEND_LOG", "off")
        .args(args)
        .output()?)
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[tokio::test]
async fn validate_reports_drift_and_fix_repairs_it() -> Result<()> {
    let tmp = tempdir()?;
    write_project(tmp.path())?;
    let ops = sqlite_ops(
        &tmp.path().join("local.sqlite3"),
        &[
            "CREATE TABLE authors (id TEXT PRIMARY KEY, slug TEXT NOT NULL, user_id TEXT NOT NULL)",
            "CREATE TABLE books (id TEXT PRIMARY KEY, slug TEXT NOT NULL, user_id TEXT NOT NULL, \
             author_id TEXT NOT NULL REFERENCES authors(id))",
        ],
    )
    .await;
    ops.insert("authors", row(json!({"id": "a1", "slug": "ann", "user_id": "u1"})))
        .await?;
    ops.insert(
        "books",
        row(json!({"id": "b1", "slug": "dune", "user_id": "u1", "author_id": "a1"})),
    )
    .await?;
    ops.close().await;

    let drift = dbmend(tmp.path(), &["--profile", "local", "validate"])?;
    assert_eq!(drift.status.code(), Some(1), "{}", stdout(&drift));
    assert!(stdout(&drift).contains("books.published_year"));
    assert!(!tmp.path().join(".db-profile").exists());

    let preview = dbmend(tmp.path(), &["--profile", "local", "fix"])?;
    assert!(preview.status.success(), "{}", stdout(&preview));
    assert!(stdout(&preview).contains("Would create 0 tables, recreate 1 tables"));

    let applied = dbmend(tmp.path(), &["--profile", "local", "fix", "--confirm"])?;
    assert!(applied.status.success(), "{}", stdout(&applied));
    assert!(stdout(&applied).contains("Backup: "));
    assert!(tmp.path().join("backups").is_dir());

    let clean = dbmend(tmp.path(), &["--profile", "local", "validate"])?;
    assert!(clean.status.success(), "{}", stdout(&clean));
    assert!(stdout(&clean).contains("Schema valid"));
    Ok(())
}

#[tokio::test]
async fn connect_records_profile_for_later_commands() -> Result<()> {
    let tmp = tempdir()?;
    write_project(tmp.path())?;
    sqlite_ops(&tmp.path().join("local.sqlite3"), &[SCHEMA])
        .await
        .close()
        .await;

    let connected = dbmend(tmp.path(), &["--profile", "local", "connect"])?;
    assert!(connected.status.success(), "{}", stdout(&connected));
    assert!(stdout(&connected).contains("Connected to profile 'local'"));
    assert_eq!(
        std::fs::read_to_string(tmp.path().join(".db-profile"))?.trim(),
        "local"
    );

    let profiles = dbmend(tmp.path(), &["profiles"])?;
    assert!(profiles.status.success());
    let listing = stdout(&profiles);
    assert!(listing.lines().any(|l| l.starts_with("* local")));
    assert!(listing.lines().any(|l| l.starts_with("  prod")));

    let status = dbmend(tmp.path(), &["status"])?;
    assert!(status.status.success(), "{}", stdout(&status));
    assert!(stdout(&status).contains("Active profile : local"));
    Ok(())
}

#[tokio::test]
async fn backup_round_trip_through_cli() -> Result<()> {
    let tmp = tempdir()?;
    write_project(tmp.path())?;
    let prod = sqlite_ops(&tmp.path().join("prod.sqlite3"), &[SCHEMA]).await;
    prod.insert("authors", row(json!({"id": "a1", "slug": "ann", "user_id": "u1"})))
        .await?;
    prod.insert(
        "books",
        row(json!({"id": "b1", "slug": "dune", "user_id": "u1", "author_id": "a1"})),
    )
    .await?;
    prod.close().await;
    sqlite_ops(&tmp.path().join("local.sqlite3"), &[SCHEMA])
        .await
        .close()
        .await;

    let created = dbmend(
        tmp.path(),
        &[
            "--profile", "prod", "backup", "create", "--schema", "tables.json", "--owner", "u1",
            "--output", "snap.json",
        ],
    )?;
    assert!(created.status.success(), "{}", stdout(&created));

    let valid = dbmend(
        tmp.path(),
        &["--profile", "local", "backup", "validate", "snap.json", "--schema", "tables.json"],
    )?;
    assert!(valid.status.success(), "{}", stdout(&valid));
    assert!(stdout(&valid).contains("Backup is valid"));

    let refused = dbmend(
        tmp.path(),
        &[
            "--profile", "local", "backup", "restore", "snap.json", "--schema", "tables.json",
            "--owner", "u1",
        ],
    )?;
    assert_eq!(refused.status.code(), Some(1));

    let restored = dbmend(
        tmp.path(),
        &[
            "--profile", "local", "backup", "restore", "snap.json", "--schema", "tables.json",
            "--owner", "u1", "--yes",
        ],
    )?;
    assert!(restored.status.success(), "{}", stdout(&restored));
    assert!(stdout(&restored).contains("Restore summary"));

    let local = sqlite_ops(&tmp.path().join("local.sqlite3"), &[]).await;
    let books = local.select("books", &[], &Default::default(), None).await?;
    assert_eq!(books.len(), 1);
    local.close().await;
    Ok(())
}

#[tokio::test]
async fn sync_previews_unless_confirmed() -> Result<()> {
    let tmp = tempdir()?;
    write_project(tmp.path())?;
    let prod = sqlite_ops(&tmp.path().join("prod.sqlite3"), &[SCHEMA]).await;
    prod.insert("authors", row(json!({"id": "a1", "slug": "ann", "user_id": "u1"})))
        .await?;
    prod.close().await;
    sqlite_ops(&tmp.path().join("local.sqlite3"), &[SCHEMA])
        .await
        .close()
        .await;

    let args = [
        "--profile", "local", "sync", "--from", "prod", "--tables", "authors", "--owner", "u1",
    ];
    let preview = dbmend(tmp.path(), &args)?;
    assert!(preview.status.success(), "{}", stdout(&preview));
    assert!(stdout(&preview).contains("Dry run"));

    let mut confirmed = args.to_vec();
    confirmed.push("--confirm");
    let synced = dbmend(tmp.path(), &confirmed)?;
    assert!(synced.status.success(), "{}", stdout(&synced));
    assert!(stdout(&synced).contains("Synced 1 rows, skipped 0"));
    Ok(())
}

#[test]
fn missing_config_is_a_usage_error() -> Result<()> {
    let tmp = tempdir()?;
    let output = dbmend(tmp.path(), &["profiles"])?;
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Database config not found"));
    Ok(())
}

#[test]
fn unknown_profile_is_a_usage_error() -> Result<()> {
    let tmp = tempdir()?;
    write_project(tmp.path())?;
    let output = dbmend(tmp.path(), &["--profile", "staging", "status"])?;
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr)
        .contains("Profile 'staging' not found. Available: local, prod"));
    Ok(())
}

#[test]
fn backup_validate_needs_no_config_file() -> Result<()> {
    let tmp = tempdir()?;
    std::fs::write(tmp.path().join("tables.json"), BACKUP_SCHEMA)?;
    let snapshot = json!({
        "metadata": {
            "createdAt": "2026-01-01T00:00:00Z",
            "ownerId": "u1",
            "backupType": "full",
            "formatVersion": "1.1"
        },
        "authors": [{"id": "a1", "slug": "ann", "user_id": "u1"}],
        "books": [{"id": "b1", "slug": "dune", "user_id": "u1", "author_id": "a1"}]
    });
    std::fs::write(tmp.path().join("snap.json"), serde_json::to_vec(&snapshot)?)?;

    let output = dbmend(
        tmp.path(),
        &["backup", "validate", "snap.json", "--schema", "tables.json"],
    )?;
    assert!(!tmp.path().join("db.toml").exists());
    assert_eq!(output.status.code(), Some(0), "{}", stdout(&output));
    assert!(stdout(&output).contains("Backup is valid"));
    Ok(())
}
