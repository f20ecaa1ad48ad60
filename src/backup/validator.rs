use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::model::BackupSchemaSet;
use super::snapshot::{FORMAT_VERSION, REQUIRED_METADATA};
use crate::ops::value_key;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    /// Usable-but-suspicious findings, such as orphans in a partial backup.
    pub warnings: Vec<String>,
}

impl BackupValidation {
    fn finish(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

fn row_label(row: &serde_json::Map<String, Value>, slug_column: &str, index: usize) -> String {
    row.get(slug_column)
        .and_then(value_key)
        .unwrap_or_else(|| format!("#{index}"))
}

/// Check a snapshot file against `schema` without touching any database.
pub fn validate_backup(path: &Path, schema: &BackupSchemaSet) -> BackupValidation {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            errors.push(format!("Backup file not found: {}", path.display()));
            return BackupValidation::finish(errors, warnings);
        }
        Err(err) => {
            errors.push(format!("Failed to read backup {}: {err}", path.display()));
            return BackupValidation::finish(errors, warnings);
        }
    };
    let data: Value = match serde_json::from_str(&text) {
        Ok(data) => data,
        Err(err) => {
            errors.push(format!("Invalid JSON: {err}"));
            return BackupValidation::finish(errors, warnings);
        }
    };
    let Some(doc) = data.as_object() else {
        errors.push("Backup root must be a JSON object".to_string());
        return BackupValidation::finish(errors, warnings);
    };

    if !doc.contains_key("metadata") {
        errors.push("Missing required key: metadata".to_string());
    }
    for def in &schema.tables {
        match doc.get(&def.name) {
            None => errors.push(format!("Missing required key: {}", def.name)),
            Some(value) if !value.is_array() => {
                errors.push(format!("Table '{}' must be an array of rows", def.name))
            }
            Some(_) => {}
        }
    }
    if !errors.is_empty() {
        return BackupValidation::finish(errors, warnings);
    }

    match doc.get("metadata").and_then(Value::as_object) {
        Some(metadata) => {
            for field in REQUIRED_METADATA {
                if !metadata.contains_key(field) {
                    errors.push(format!("Missing metadata field: {field}"));
                }
            }
            if let Some(found) = metadata.get("formatVersion") {
                if found.as_str() != Some(FORMAT_VERSION) {
                    errors.push(format!(
                        "Unsupported backup format version {found} (expected {FORMAT_VERSION})"
                    ));
                }
            }
        }
        None => errors.push("Metadata must be a JSON object".to_string()),
    }

    let mut keys_by_table: HashMap<&str, BTreeSet<String>> = HashMap::new();
    for def in &schema.tables {
        let rows = doc
            .get(&def.name)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let mut keys = BTreeSet::new();

        for (index, value) in rows.iter().enumerate() {
            let Some(row) = value.as_object() else {
                errors.push(format!("{} row #{index} is not an object", def.name));
                continue;
            };
            let label = row_label(row, &def.slug_column, index);
            match row.get(&def.primary_key_column) {
                None => errors.push(format!(
                    "{} row {label} missing '{}' field",
                    def.name, def.primary_key_column
                )),
                Some(pk) => match value_key(pk) {
                    Some(key) => {
                        keys.insert(key);
                    }
                    None => errors.push(format!(
                        "{} row {label} has empty '{}'",
                        def.name, def.primary_key_column
                    )),
                },
            }
            if !row.contains_key(&def.slug_column) {
                errors.push(format!(
                    "{} row {label} missing '{}' field",
                    def.name, def.slug_column
                ));
            }

            if let Some(parent) = &def.parent_reference {
                let Some(parent_keys) = keys_by_table.get(parent.table.as_str()) else {
                    continue;
                };
                let resolved = row
                    .get(&parent.column)
                    .and_then(value_key)
                    .is_some_and(|key| parent_keys.contains(&key));
                if !resolved {
                    warnings.push(format!(
                        "Orphaned {} row {label}: {} not in backup",
                        def.name, parent.column
                    ));
                }
            }
        }
        keys_by_table.insert(def.name.as_str(), keys);
    }

    BackupValidation::finish(errors, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::model::{ForeignKey, TableDefinition};
    use serde_json::json;
    use tempfile::tempdir;

    fn schema() -> BackupSchemaSet {
        BackupSchemaSet::new(vec![
            TableDefinition::new("authors"),
            TableDefinition::new("books").with_parent(ForeignKey::new("authors", "author_id")),
        ])
    }

    fn write(dir: &Path, value: &Value) -> std::path::PathBuf {
        let path = dir.join("backup.json");
        std::fs::write(&path, serde_json::to_vec(value).unwrap()).unwrap();
        path
    }

    fn metadata(version: &str) -> Value {
        json!({
            "createdAt": "2026-01-01T00:00:00Z",
            "ownerId": "u1",
            "backupType": "full",
            "formatVersion": version
        })
    }

    #[test]
    fn accepts_well_formed_snapshot() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            &json!({
                "metadata": metadata("1.1"),
                "authors": [{"id": "a1", "slug": "ann"}],
                "books": [{"id": "b1", "slug": "book", "author_id": "a1"}]
            }),
        );
        let result = validate_backup(&path, &schema());
        assert!(result.valid, "{:?}", result.errors);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn rejects_old_format_version() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            &json!({"metadata": metadata("1.0"), "authors": [], "books": []}),
        );
        let result = validate_backup(&path, &schema());
        assert!(!result.valid);
        assert_eq!(
            result.errors,
            vec!["Unsupported backup format version \"1.0\" (expected 1.1)".to_string()]
        );
    }

    #[test]
    fn orphans_warn_but_missing_keys_fail() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            &json!({
                "metadata": metadata("1.1"),
                "authors": [{"id": "", "slug": "ann"}],
                "books": [{"id": "b1", "author_id": "ghost"}]
            }),
        );
        let result = validate_backup(&path, &schema());
        assert!(!result.valid);
        assert_eq!(
            result.errors,
            vec![
                "authors row ann has empty 'id'".to_string(),
                "books row #0 missing 'slug' field".to_string(),
            ]
        );
        assert_eq!(
            result.warnings,
            vec!["Orphaned books row #0: author_id not in backup".to_string()]
        );
    }

    #[test]
    fn missing_table_and_file_are_errors() {
        let dir = tempdir().unwrap();
        let missing = validate_backup(&dir.path().join("nope.json"), &schema());
        assert!(!missing.valid);
        assert!(missing.errors[0].starts_with("Backup file not found:"));

        let path = write(dir.path(), &json!({"metadata": metadata("1.1"), "authors": []}));
        let result = validate_backup(&path, &schema());
        assert_eq!(result.errors, vec!["Missing required key: books".to_string()]);
    }

    #[test]
    fn invalid_json_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        let result = validate_backup(&path, &schema());
        assert!(!result.valid);
        assert!(result.errors[0].starts_with("Invalid JSON:"));
    }
}
