//! Engine configuration, read from TOML
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(toml::de::Error),
    #[error("failed to serialise config: {0}")]
    Serialize(toml::ser::Error),
    #[error("failed to open store at configured path: {0}")]
    Store(sled::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory of the sled database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Flush the database after every committed transition.
    #[serde(default)]
    pub flush_on_commit: bool,

    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("nfa-approval.db")
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            flush_on_commit: false,
            log_filter: default_log_filter(),
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    pub fn open_db(&self) -> Result<Arc<sled::Db>, ConfigError> {
        let db = sled::open(&self.db_path).map_err(ConfigError::Store)?;
        Ok(Arc::new(db))
    }
}
