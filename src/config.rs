//! `db.toml` profiles and the `.db-profile` lock file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::AppError;

pub const CONFIG_FILE_NAME: &str = "db.toml";
pub const PROFILE_LOCK_FILE: &str = ".db-profile";
pub const PROFILE_ENV: &str = "DBMEND_DB_PROFILE";
pub const PASSWORD_PLACEHOLDER: &str = "[YOUR-PASSWORD]";
pub const SQLITE_PROVIDER: &str = "sqlite";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Database config not found: {0}")]
    NotFound(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {message}")]
    Parse { path: String, message: String },
    #[error("No database profile configured. Pass --profile, set DBMEND_DB_PROFILE, or run `dbmend connect`.")]
    ProfileNotFound,
    #[error("Profile '{name}' not found. Available: {available}")]
    UnknownProfile { name: String, available: String },
    #[error("Profile '{profile}' uses provider '{provider}', which has no driver")]
    UnsupportedProvider { profile: String, provider: String },
}

impl From<ConfigError> for AppError {
    fn from(error: ConfigError) -> Self {
        let code = match &error {
            ConfigError::NotFound(_) => "CONFIG/NOT_FOUND",
            ConfigError::Io { .. } => "CONFIG/IO",
            ConfigError::Parse { .. } => "CONFIG/PARSE",
            ConfigError::ProfileNotFound => "CONFIG/NO_PROFILE",
            ConfigError::UnknownProfile { .. } => "CONFIG/UNKNOWN_PROFILE",
            ConfigError::UnsupportedProvider { .. } => "CONFIG/UNSUPPORTED_PROVIDER",
        };
        AppError::new(code, error.to_string())
    }
}

fn default_provider() -> String {
    SQLITE_PROVIDER.to_string()
}

fn default_schema_file() -> String {
    "schema.sql".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseProfile {
    pub url: String,
    #[serde(default)]
    pub description: String,
    /// Substituted for `[YOUR-PASSWORD]` in `url`.
    #[serde(default)]
    pub db_password: Option<String>,
    #[serde(default = "default_provider")]
    pub provider: String,
}

impl DatabaseProfile {
    /// `url` with the password placeholder filled in, URL-encoded.
    pub fn resolve_url(&self) -> String {
        match &self.db_password {
            Some(password) if !password.is_empty() && self.url.contains(PASSWORD_PLACEHOLDER) => {
                self.url
                    .replace(PASSWORD_PLACEHOLDER, &urlencoding::encode(password))
            }
            _ => self.url.clone(),
        }
    }

    /// Filesystem path of an SQLite profile. Relative paths are taken
    /// relative to `base`.
    pub fn sqlite_path(&self, base: &Path) -> PathBuf {
        let url = self.resolve_url();
        let raw = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(&url);
        let raw = raw.split('?').next().unwrap_or(raw);
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base.join(path)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSettings {
    #[serde(default = "default_schema_file")]
    pub file: String,
    #[serde(default = "default_true")]
    pub validate_on_connect: bool,
}

impl Default for SchemaSettings {
    fn default() -> Self {
        Self {
            file: default_schema_file(),
            validate_on_connect: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub profiles: BTreeMap<String, DatabaseProfile>,
    #[serde(default)]
    pub schema: SchemaSettings,
    /// Directory the config was read from; relative paths resolve here.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl DatabaseConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.display().to_string())
            } else {
                ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                }
            }
        })?;
        let mut config = Self::parse(&content).map_err(|message| ConfigError::Parse {
            path: path.display().to_string(),
            message,
        })?;
        config.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    pub fn profile(&self, name: &str) -> Result<&DatabaseProfile, ConfigError> {
        self.profiles
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProfile {
                name: name.to_string(),
                available: self
                    .profiles
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    /// The profile's SQLite path; other providers are rejected.
    pub fn sqlite_path(&self, name: &str) -> Result<PathBuf, ConfigError> {
        let profile = self.profile(name)?;
        if !profile.provider.eq_ignore_ascii_case(SQLITE_PROVIDER) {
            return Err(ConfigError::UnsupportedProvider {
                profile: name.to_string(),
                provider: profile.provider.clone(),
            });
        }
        Ok(profile.sqlite_path(&self.base_dir))
    }

    pub fn schema_file(&self) -> PathBuf {
        self.base_dir.join(&self.schema.file)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base_dir.join(PROFILE_LOCK_FILE)
    }
}

pub fn read_profile_lock(lock_path: &Path) -> Option<String> {
    std::fs::read_to_string(lock_path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn write_profile_lock(lock_path: &Path, profile: &str) -> std::io::Result<()> {
    crate::db::write_atomic(lock_path, profile.as_bytes())
}

pub fn clear_profile_lock(lock_path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(lock_path) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn pick_profile(
    explicit: Option<&str>,
    from_env: Option<String>,
    from_lock: Option<String>,
) -> Result<String, ConfigError> {
    explicit
        .map(str::to_string)
        .or(from_env.filter(|s| !s.is_empty()))
        .or(from_lock)
        .ok_or(ConfigError::ProfileNotFound)
}

/// Explicit name, then `DBMEND_DB_PROFILE`, then the lock file.
pub fn active_profile_name(explicit: Option<&str>, lock_path: &Path) -> Result<String, ConfigError> {
    pick_profile(
        explicit,
        std::env::var(PROFILE_ENV).ok(),
        read_profile_lock(lock_path),
    )
}
