use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::schema::deps::{dependencies_from_definitions, topo_order, TableOrder};
use crate::{AppError, AppResult};

/// A foreign key held by a child row: `column` stores a key of `table`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
}

impl ForeignKey {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

fn default_primary_key() -> String {
    "id".into()
}

fn default_slug() -> String {
    "slug".into()
}

fn default_owner() -> String {
    "user_id".into()
}

/// One row-bearing table and how its rows relate to others.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDefinition {
    pub name: String,
    #[serde(default = "default_primary_key")]
    pub primary_key_column: String,
    /// Cross-environment identity, unique per owner.
    #[serde(default = "default_slug")]
    pub slug_column: String,
    #[serde(default = "default_owner")]
    pub owner_column: String,
    /// Required parent. Rows whose parent did not restore are dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_reference: Option<ForeignKey>,
    /// References nulled, rather than dropped, when unresolved.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub optional_references: Vec<ForeignKey>,
}

impl TableDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key_column: default_primary_key(),
            slug_column: default_slug(),
            owner_column: default_owner(),
            parent_reference: None,
            optional_references: Vec::new(),
        }
    }

    pub fn with_keys(
        mut self,
        primary_key: impl Into<String>,
        slug: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        self.primary_key_column = primary_key.into();
        self.slug_column = slug.into();
        self.owner_column = owner.into();
        self
    }

    pub fn with_parent(mut self, parent: ForeignKey) -> Self {
        self.parent_reference = Some(parent);
        self
    }

    pub fn with_optional(mut self, reference: ForeignKey) -> Self {
        self.optional_references.push(reference);
        self
    }
}

/// Table definitions in dependency order: parents before children.
///
/// The order is trusted as given; nothing here reorders it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupSchemaSet {
    pub tables: Vec<TableDefinition>,
}

impl BackupSchemaSet {
    pub fn new(tables: Vec<TableDefinition>) -> Self {
        Self { tables }
    }

    /// Load a JSON array of table definitions.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_backup_schema")
                .with_context("path", path.display().to_string())
        })?;
        serde_json::from_str(&text).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "parse_backup_schema")
                .with_context("path", path.display().to_string())
        })
    }

    pub fn table(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    /// The listed tables re-ordered so every table follows the tables its
    /// required and optional references point at. Reference cycles are
    /// broken, never reported.
    pub fn dependency_order(&self) -> TableOrder {
        topo_order(&self.names(), &dependencies_from_definitions(&self.tables))
    }

    /// Children listed before their required parent, as `(child, parent)`.
    pub fn ordering_violations(&self) -> Vec<(String, String)> {
        let position: BTreeMap<&str, usize> = self
            .tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.as_str(), i))
            .collect();
        self.tables
            .iter()
            .enumerate()
            .filter_map(|(i, t)| {
                let parent = t.parent_reference.as_ref()?;
                match position.get(parent.table.as_str()) {
                    Some(p) if *p > i => Some((t.name.clone(), parent.table.clone())),
                    _ => None,
                }
            })
            .collect()
    }
}
