use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// `{table -> {columns}}`, ordered so every report is deterministic.
pub type ColumnSets = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDiff {
    pub table: String,
    pub column: String,
    pub message: String,
}

impl ColumnDiff {
    fn missing(table: &str, column: &str) -> Self {
        Self {
            table: table.to_string(),
            column: column.to_string(),
            message: format!("Column '{column}' missing from table '{table}'"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaValidationResult {
    pub valid: bool,
    pub missing_tables: Vec<String>,
    pub missing_columns: Vec<ColumnDiff>,
    /// Present live but not expected. Reported, never invalidating.
    pub extra_tables: Vec<String>,
}

impl SchemaValidationResult {
    pub fn error_count(&self) -> usize {
        self.missing_tables.len() + self.missing_columns.len()
    }

    pub fn format_report(&self) -> String {
        let mut lines = Vec::new();
        if self.valid {
            lines.push("Schema valid".to_string());
        } else {
            lines.push("Schema validation failed:".to_string());
            if !self.missing_tables.is_empty() {
                lines.push(format!("  Missing tables ({}):", self.missing_tables.len()));
                for table in &self.missing_tables {
                    lines.push(format!("    - {table}"));
                }
            }
            if !self.missing_columns.is_empty() {
                lines.push(format!("  Missing columns ({}):", self.missing_columns.len()));
                for diff in &self.missing_columns {
                    lines.push(format!("    - {}.{}", diff.table, diff.column));
                }
            }
        }
        if !self.extra_tables.is_empty() {
            lines.push(format!(
                "  Extra tables (warning): {}",
                self.extra_tables.join(", ")
            ));
        }
        lines.join("\n")
    }
}

/// Diff `actual` against `expected`. Pure set algebra.
pub fn validate_schema(actual: &ColumnSets, expected: &ColumnSets) -> SchemaValidationResult {
    let missing_tables: Vec<String> = expected
        .keys()
        .filter(|t| !actual.contains_key(*t))
        .cloned()
        .collect();
    let extra_tables: Vec<String> = actual
        .keys()
        .filter(|t| !expected.contains_key(*t))
        .cloned()
        .collect();

    let mut missing_columns = Vec::new();
    for (table, wanted) in expected {
        let Some(present) = actual.get(table) else {
            continue;
        };
        for column in wanted.difference(present) {
            missing_columns.push(ColumnDiff::missing(table, column));
        }
    }

    SchemaValidationResult {
        valid: missing_tables.is_empty() && missing_columns.is_empty(),
        missing_tables,
        missing_columns,
        extra_tables,
    }
}
