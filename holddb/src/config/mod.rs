use crate::error::{HoldError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Path value that opens a private in-memory SQLite database.
pub const IN_MEMORY: &str = ":memory:";

/// SQLite journal mode for both stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    #[default]
    Wal,
    Delete,
}

impl JournalMode {
    pub fn pragma_value(self) -> &'static str {
        match self {
            JournalMode::Wal => "wal",
            JournalMode::Delete => "delete",
        }
    }
}

/// Connection settings shared by the catalog store and the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOptions {
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default)]
    pub journal_mode: JournalMode,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            busy_timeout_ms: default_busy_timeout_ms(),
            journal_mode: JournalMode::default(),
        }
    }
}

/// Engine configuration, usually read from a `holddb.yaml` file.
///
/// ```yaml
/// catalog_path: data/catalog.db
/// records_path: data/records.db
/// busy_timeout_ms: 5000
/// journal_mode: wal
/// statement_timeout_ms: 2000
/// reconcile_on_open: true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_catalog_path")]
    pub catalog_path: String,
    #[serde(default = "default_records_path")]
    pub records_path: String,
    #[serde(flatten)]
    pub store: StoreOptions,
    /// Default deadline applied to engine calls that are not given an
    /// explicit context. `None` means no deadline.
    #[serde(default)]
    pub statement_timeout_ms: Option<u64>,
    #[serde(default = "default_true")]
    pub reconcile_on_open: bool,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_catalog_path() -> String {
    "catalog.db".to_string()
}

fn default_records_path() -> String {
    "records.db".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            catalog_path: default_catalog_path(),
            records_path: default_records_path(),
            store: StoreOptions::default(),
            statement_timeout_ms: None,
            reconcile_on_open: true,
        }
    }
}

impl EngineConfig {
    /// Both stores in memory (for tests and throwaway sessions).
    pub fn in_memory() -> Self {
        EngineConfig {
            catalog_path: IN_MEMORY.to_string(),
            records_path: IN_MEMORY.to_string(),
            ..EngineConfig::default()
        }
    }

    /// `catalog.db` and `records.db` inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        EngineConfig {
            catalog_path: dir.join("catalog.db").to_string_lossy().into_owned(),
            records_path: dir.join("records.db").to_string_lossy().into_owned(),
            ..EngineConfig::default()
        }
    }

    /// Parse a YAML config file. Relative store paths are resolved against
    /// the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&content)?;
        if let Some(base) = path.parent() {
            config.catalog_path = resolve_path(base, &config.catalog_path);
            config.records_path = resolve_path(base, &config.records_path);
        }
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.catalog_path.trim().is_empty() || self.records_path.trim().is_empty() {
            return Err(HoldError::Config(
                "catalog_path and records_path must not be empty".into(),
            ));
        }
        if self.catalog_path != IN_MEMORY && self.catalog_path == self.records_path {
            return Err(HoldError::Config(format!(
                "catalog_path and records_path must differ (both are '{}')",
                self.catalog_path
            )));
        }
        if self.statement_timeout_ms == Some(0) {
            return Err(HoldError::Config(
                "statement_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_ms.map(Duration::from_millis)
    }
}

fn resolve_path(base: &Path, path: &str) -> String {
    if path == IN_MEMORY || Path::new(path).is_absolute() {
        return path.to_string();
    }
    let mut resolved = PathBuf::from(base);
    resolved.push(path);
    resolved.to_string_lossy().into_owned()
}
