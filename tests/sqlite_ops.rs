#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;
use dbmend_lib::ops::{filters, DatabaseOps, OpsError};
use serde_json::json;
use tempfile::tempdir;

mod util;
use util::{row, sqlite_ops};

const DDL: [&str; 2] = [
    "CREATE TABLE authors (id TEXT PRIMARY KEY, slug TEXT NOT NULL, user_id TEXT NOT NULL, bio TEXT)",
    "CREATE TABLE counters (id INTEGER PRIMARY KEY, label TEXT, author_id TEXT REFERENCES authors(id))",
];

#[tokio::test]
async fn crud_round_trip_with_generated_keys() -> Result<()> {
    let dir = tempdir()?;
    let ops = sqlite_ops(&dir.path().join("ops.sqlite3"), &DDL).await;

    let author = ops
        .insert("authors", row(json!({"slug": "ann", "user_id": "u1"})))
        .await?;
    let key = author["id"].as_str().expect("text key generated").to_string();
    assert!(uuid::Uuid::parse_str(&key).is_ok());

    let counter = ops
        .insert("counters", row(json!({"label": "first", "author_id": key})))
        .await?;
    assert_eq!(counter["id"], json!(1));

    let updated = ops
        .update(
            "authors",
            row(json!({"bio": "writer"})),
            &filters([("id", json!(key))]),
        )
        .await?;
    assert_eq!(updated["bio"], json!("writer"));

    let selected = ops
        .select(
            "authors",
            &["slug", "bio"],
            &filters([("user_id", json!("u1")), ("bio", json!("writer"))]),
            Some("slug"),
        )
        .await?;
    assert_eq!(selected, vec![row(json!({"slug": "ann", "bio": "writer"}))]);

    let nulls = ops
        .select("authors", &["slug"], &filters([("bio", json!(null))]), None)
        .await?;
    assert!(nulls.is_empty());

    assert_eq!(ops.delete("counters", &filters([("label", json!("first"))])).await?, 1);
    ops.close().await;
    Ok(())
}

#[tokio::test]
async fn constraint_and_identifier_errors_are_typed() -> Result<()> {
    let dir = tempdir()?;
    let ops = sqlite_ops(&dir.path().join("ops.sqlite3"), &DDL).await;

    let err = ops
        .insert("counters", row(json!({"label": "orphan", "author_id": "ghost"})))
        .await
        .unwrap_err();
    assert!(err.is_foreign_key_violation(), "{err}");

    let err = ops
        .update(
            "authors",
            row(json!({"bio": "x"})),
            &filters([("id", json!("missing"))]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OpsError::NoRowsMatched { .. }));

    let err = ops
        .select("authors; DROP TABLE authors", &[], &Default::default(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, OpsError::InvalidIdentifier(_)));
    ops.close().await;
    Ok(())
}

#[tokio::test]
async fn execute_runs_ddl_and_drops_cascade_keyword() -> Result<()> {
    let dir = tempdir()?;
    let ops = sqlite_ops(&dir.path().join("ops.sqlite3"), &[]).await;

    ops.execute("CREATE TABLE scratch (id TEXT PRIMARY KEY, note TEXT);", &[])
        .await?;
    ops.execute(
        "INSERT INTO scratch (id, note) VALUES (?1, ?2)",
        &[json!("s1"), json!("hello")],
    )
    .await?;
    assert_eq!(
        ops.select("scratch", &[], &Default::default(), None).await?.len(),
        1
    );

    ops.execute("DROP TABLE IF EXISTS scratch CASCADE;", &[]).await?;
    let tables = dbmend_lib::schema::sqlite_column_sets(ops.pool()).await?;
    assert!(!tables.contains_key("scratch"));
    ops.close().await;
    Ok(())
}

#[tokio::test]
async fn cascading_drop_of_a_referenced_table_keeps_children() -> Result<()> {
    let dir = tempdir()?;
    let ops = sqlite_ops(&dir.path().join("ops.sqlite3"), &DDL).await;
    ops.insert("authors", row(json!({"id": "a1", "slug": "ann", "user_id": "u1"})))
        .await?;
    ops.insert("counters", row(json!({"label": "first", "author_id": "a1"})))
        .await?;

    let err = ops.execute("DROP TABLE authors;", &[]).await.unwrap_err();
    assert!(err.is_foreign_key_violation(), "{err}");

    ops.execute("DROP TABLE authors CASCADE;", &[]).await?;
    assert_eq!(
        ops.select("counters", &[], &Default::default(), None).await?.len(),
        1
    );

    ops.execute(DDL[0], &[]).await?;
    let err = ops
        .insert("counters", row(json!({"label": "orphan", "author_id": "ghost"})))
        .await
        .unwrap_err();
    assert!(err.is_foreign_key_violation(), "enforcement restored: {err}");
    ops.close().await;
    Ok(())
}
