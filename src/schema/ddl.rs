//! Reads `CREATE TABLE` statements out of a schema file.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use super::compare::ColumnSets;
use crate::AppError;

static CREATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)CREATE\s+TABLE(?:\s+IF\s+NOT\s+EXISTS)?\s+["`\[]?(\w+)["`\]]?\s*\("#)
        .expect("create table pattern to compile")
});

static REFERENCES_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bREFERENCES\s+["`\[]?(\w+)["`\]]?"#).expect("references pattern to compile")
});

const CONSTRAINT_KEYWORDS: [&str; 5] = ["PRIMARY", "FOREIGN", "UNIQUE", "CHECK", "CONSTRAINT"];

#[derive(Debug, Error)]
pub enum DdlError {
    #[error("Schema file not found: {0}")]
    SchemaFileNotFound(String),
    #[error("failed to read schema file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("CREATE TABLE for {table} not found in {file}")]
    CreateNotFound { table: String, file: String },
    #[error("No CREATE TABLE statements found in {0}")]
    NoTables(String),
}

impl From<DdlError> for AppError {
    fn from(error: DdlError) -> Self {
        let code = match &error {
            DdlError::SchemaFileNotFound(_) => "SCHEMA/FILE_NOT_FOUND",
            DdlError::Io { .. } => "SCHEMA/IO",
            DdlError::CreateNotFound { .. } => "SCHEMA/CREATE_NOT_FOUND",
            DdlError::NoTables(_) => "SCHEMA/NO_TABLES",
        };
        AppError::new(code, error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    /// Everything after the column name, e.g. `TEXT NOT NULL REFERENCES authors(id)`.
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTable {
    pub table: String,
    /// The full statement, terminated with `;`.
    pub sql: String,
    pub columns: Vec<ColumnDef>,
    /// Tables this one references, excluding itself.
    pub references: BTreeSet<String>,
}

/// Parsed schema text plus the name it was loaded from.
#[derive(Debug, Clone)]
pub struct SchemaSource {
    origin: String,
    tables: Vec<CreateTable>,
}

impl SchemaSource {
    pub fn load(path: &Path) -> Result<Self, DdlError> {
        if !path.exists() {
            return Err(DdlError::SchemaFileNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path).map_err(|source| DdlError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::from_sql(path.display().to_string(), &text))
    }

    pub fn from_sql(origin: impl Into<String>, sql: &str) -> Self {
        Self {
            origin: origin.into(),
            tables: parse_create_tables(sql),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn tables(&self) -> &[CreateTable] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&CreateTable> {
        self.tables.iter().find(|t| t.table.eq_ignore_ascii_case(name))
    }

    pub fn create_statement(&self, table: &str) -> Result<&str, DdlError> {
        self.table(table)
            .map(|t| t.sql.as_str())
            .ok_or_else(|| DdlError::CreateNotFound {
                table: table.to_string(),
                file: self.origin.clone(),
            })
    }

    /// The expected `{table -> {columns}}`; errors when no table is declared.
    pub fn expected_columns(&self) -> Result<ColumnSets, DdlError> {
        if self.tables.is_empty() {
            return Err(DdlError::NoTables(self.origin.clone()));
        }
        Ok(self
            .tables
            .iter()
            .map(|t| {
                (
                    t.table.clone(),
                    t.columns.iter().map(|c| c.name.clone()).collect(),
                )
            })
            .collect())
    }

    /// `"table.column" -> definition` for every declared column.
    pub fn column_definitions(&self) -> BTreeMap<String, String> {
        self.tables
            .iter()
            .flat_map(|t| {
                t.columns
                    .iter()
                    .map(move |c| (format!("{}.{}", t.table, c.name), c.definition.clone()))
            })
            .collect()
    }

    /// Foreign-key edges between declared tables. Every table has an entry.
    pub fn fk_dependencies(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.tables
            .iter()
            .map(|t| (t.table.clone(), t.references.clone()))
            .collect()
    }
}

/// Expected `{table -> {columns}}` declared by `schema_sql`.
pub fn parse_expected_columns(schema_sql: &str) -> Result<ColumnSets, DdlError> {
    SchemaSource::from_sql("<inline>", schema_sql).expected_columns()
}

/// `"table.column" -> definition` declared by `schema_sql`.
pub fn parse_column_definitions(schema_sql: &str) -> BTreeMap<String, String> {
    SchemaSource::from_sql("<inline>", schema_sql).column_definitions()
}

/// Index just past the `)` matching the `(` at `open`, ignoring quoted text.
fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (offset, ch) in text[open..].char_indices() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None => match ch {
                '\'' | '"' | '`' => quote = Some(ch),
                '(' => depth += 1,
                ')' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Some(open + offset + 1);
                    }
                }
                _ => {}
            },
        }
    }
    None
}

/// Split on commas that sit outside parentheses and quotes.
fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (idx, ch) in body.char_indices() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => {}
            None => match ch {
                '\'' | '"' | '`' => quote = Some(ch),
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    parts.push(&body[start..idx]);
                    start = idx + 1;
                }
                _ => {}
            },
        }
    }
    parts.push(&body[start..]);
    parts
}

/// Drop `--` comments up to the end of their line. Dashes inside quoted
/// text are data.
fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();
    while let Some(ch) = chars.next() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                }
                out.push(ch);
            }
            None if ch == '-' && chars.peek() == Some(&'-') => {
                while chars.next_if(|&c| c != '\n').is_some() {}
            }
            None => {
                if matches!(ch, '\'' | '"' | '`') {
                    quote = Some(ch);
                }
                out.push(ch);
            }
        }
    }
    out
}

fn unquote(name: &str) -> &str {
    name.trim_matches(|c| matches!(c, '"' | '`' | '[' | ']'))
}

pub fn parse_create_tables(sql: &str) -> Vec<CreateTable> {
    let sql = strip_comments(sql);
    let mut tables = Vec::new();
    let mut cursor = 0;
    while let Some(caps) = CREATE_RE.captures_at(&sql, cursor) {
        let Some(whole) = caps.get(0) else { break };
        let table = caps[1].to_string();
        let open = whole.end() - 1;
        let Some(close) = matching_paren(&sql, open) else {
            break;
        };
        let body = &sql[open + 1..close - 1];

        let mut columns = Vec::new();
        let mut references = BTreeSet::new();
        for item in split_top_level(body) {
            let item = item.split_whitespace().collect::<Vec<_>>().join(" ");
            if item.is_empty() {
                continue;
            }
            for caps in REFERENCES_RE.captures_iter(&item) {
                let target = caps[1].to_string();
                if !target.eq_ignore_ascii_case(&table) {
                    references.insert(target);
                }
            }
            let first = item.split(' ').next().unwrap_or_default();
            if CONSTRAINT_KEYWORDS
                .iter()
                .any(|kw| first.eq_ignore_ascii_case(kw))
            {
                continue;
            }
            let (name, definition) = match item.split_once(' ') {
                Some((name, rest)) => (unquote(name).to_string(), rest.trim().to_string()),
                None => (unquote(&item).to_string(), String::new()),
            };
            columns.push(ColumnDef { name, definition });
        }

        let end = sql[close..]
            .find(|c: char| !c.is_whitespace())
            .filter(|offset| sql[close + offset..].starts_with(';'))
            .map(|offset| close + offset + 1);
        let statement = match end {
            Some(end) => sql[whole.start()..end].to_string(),
            None => format!("{};", &sql[whole.start()..close]),
        };

        tables.push(CreateTable {
            table,
            sql: statement,
            columns,
            references,
        });
        cursor = close;
    }
    tables
}
