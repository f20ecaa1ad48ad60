use sqlx::{Row as _, SqlitePool};

use super::compare::ColumnSets;
use crate::ops::quote_ident;
use crate::{AppError, AppResult};

/// Live `{table -> {columns}}` of an SQLite database, internal tables excluded.
pub async fn sqlite_column_sets(pool: &SqlitePool) -> AppResult<ColumnSets> {
    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .map_err(|err| AppError::from(err).with_context("operation", "introspect_tables"))?;

    let mut sets = ColumnSets::new();
    for table in tables {
        let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(&table)))
            .fetch_all(pool)
            .await
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "introspect_columns")
                    .with_context("table", table.clone())
            })?;
        let mut columns = std::collections::BTreeSet::new();
        for row in rows {
            columns.insert(row.try_get::<String, _>("name")?);
        }
        sets.insert(table, columns);
    }
    Ok(sets)
}
