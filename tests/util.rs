#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;

use dbmend_lib::backup::{BackupSchemaSet, ForeignKey, TableDefinition};
use dbmend_lib::ops::{Row, SqliteOps};
use serde_json::Value;

pub fn row(value: Value) -> Row {
    value.as_object().cloned().expect("row literal must be an object")
}

pub async fn sqlite_ops(path: &Path, ddl: &[&str]) -> SqliteOps {
    let ops = SqliteOps::open(path).await.expect("open sqlite ops");
    for &statement in ddl {
        sqlx::raw_sql(statement)
            .execute(ops.pool())
            .await
            .unwrap_or_else(|err| panic!("run {statement}: {err}"));
    }
    ops
}

/// authors <- books, with books optionally pointing at an editor author.
pub fn library_schema() -> BackupSchemaSet {
    BackupSchemaSet::new(vec![
        TableDefinition::new("authors"),
        TableDefinition::new("books")
            .with_parent(ForeignKey::new("authors", "author_id"))
            .with_optional(ForeignKey::new("authors", "editor_id")),
    ])
}
