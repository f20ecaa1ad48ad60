use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ops::Row;
use crate::{AppError, AppResult};

/// The only snapshot format this engine reads or writes.
pub const FORMAT_VERSION: &str = "1.1";
pub const BACKUP_TYPE_FULL: &str = "full";

/// Metadata keys every snapshot must carry.
pub const REQUIRED_METADATA: [&str; 4] = ["createdAt", "ownerId", "backupType", "formatVersion"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub created_at: String,
    pub owner_id: String,
    pub backup_type: String,
    pub format_version: String,
    /// `<table>_count` entries plus caller-supplied metadata.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SnapshotMetadata {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            created_at: chrono::Utc::now().to_rfc3339(),
            owner_id: owner_id.into(),
            backup_type: BACKUP_TYPE_FULL.to_string(),
            format_version: FORMAT_VERSION.to_string(),
            extra: Map::new(),
        }
    }
}

/// `{ "metadata": {...}, "<table>": [rows...], ... }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    #[serde(flatten)]
    pub tables: BTreeMap<String, Vec<Row>>,
}

impl Snapshot {
    pub fn new(metadata: SnapshotMetadata) -> Self {
        Self {
            metadata,
            tables: BTreeMap::new(),
        }
    }

    pub fn rows(&self, table: &str) -> &[Row] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn read(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_snapshot")
                .with_context("path", path.display().to_string())
        })?;
        serde_json::from_str(&text).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "parse_snapshot")
                .with_context("path", path.display().to_string())
        })
    }

    pub fn write(&self, path: &Path) -> AppResult<()> {
        let payload = serde_json::to_vec_pretty(self)?;
        crate::db::write_atomic(path, &payload).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "write_snapshot")
                .with_context("path", path.display().to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tables_sit_beside_metadata_at_top_level() {
        let mut snapshot = Snapshot::new(SnapshotMetadata::new("u1"));
        snapshot
            .metadata
            .extra
            .insert("authors_count".into(), json!(1));
        snapshot.tables.insert(
            "authors".into(),
            vec![json!({"id": "a1", "slug": "ann"}).as_object().cloned().unwrap()],
        );

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["metadata"]["formatVersion"], json!("1.1"));
        assert_eq!(value["metadata"]["backupType"], json!("full"));
        assert_eq!(value["metadata"]["ownerId"], json!("u1"));
        assert_eq!(value["metadata"]["authors_count"], json!(1));
        assert_eq!(value["authors"][0]["slug"], json!("ann"));

        let parsed: Snapshot = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, snapshot);
        assert!(parsed.rows("missing").is_empty());
    }
}
