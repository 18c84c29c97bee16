//! Backend selection and connection settings.
//!
//! ```toml
//! backend = "sql"
//!
//! [connection]
//! url = "/var/lib/nestconf/store.db"
//!
//! [cache]
//! max_entries = 4096
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::backend::BackendKind;
use crate::error::{Result, StoreError};

/// Which backend to open and how to reach it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    #[serde(default)]
    pub connection: ConnectionDetails,
    #[serde(default)]
    pub cache: CacheConfig,
}

fn default_backend() -> BackendKind {
    BackendKind::FlatFile
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            connection: ConnectionDetails::default(),
            cache: CacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionDetails {
    /// Root directory for the flat-file and hash-bucket backends
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    /// SQLite path (or `:memory:`), MongoDB URI, or Redis URL
    #[serde(default)]
    pub url: Option<String>,
    /// MongoDB database name
    #[serde(default = "default_database")]
    pub database: String,
    /// Number of bucket files per namespace instance (hash-bucket backend)
    #[serde(default = "default_bucket_count")]
    pub bucket_count: u32,
}

fn default_data_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_database() -> String {
    "nestconf".to_string()
}

fn default_bucket_count() -> u32 {
    256
}

impl Default for ConnectionDetails {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            url: None,
            database: default_database(),
            bucket_count: default_bucket_count(),
        }
    }
}

/// Read cache settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_entries() -> usize {
    1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_max_entries(),
        }
    }
}

impl StorageConfig {
    /// Flat-file store rooted at `path`.
    pub fn flat_file(path: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.connection.data_path = path.into();
        config
    }

    /// Hash-bucket store rooted at `path`.
    pub fn hash_bucket(path: impl Into<PathBuf>, bucket_count: u32) -> Self {
        let mut config = Self::flat_file(path);
        config.backend = BackendKind::HashBucket;
        config.connection.bucket_count = bucket_count;
        config
    }

    /// Relational store at `url` (`:memory:` for a private in-memory database).
    pub fn sql(url: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.backend = BackendKind::Relational;
        config.connection.url = Some(url.into());
        config
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: StorageConfig =
            toml::from_str(content).map_err(|e| StoreError::Config(e.to_string()))?;
        config.connection.data_path = expand_tilde(&config.connection.data_path)?;
        Ok(config)
    }

    /// Load a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            StoreError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| StoreError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Connection URL, or a config error naming the backend that needs it.
    pub fn require_url(&self) -> Result<&str> {
        self.connection.url.as_deref().ok_or_else(|| {
            StoreError::Config(format!("backend `{}` requires connection.url", self.backend))
        })
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> Result<PathBuf> {
    let Ok(rest) = path.strip_prefix("~") else {
        return Ok(path.to_path_buf());
    };
    let home = dirs::home_dir()
        .ok_or_else(|| StoreError::Config("cannot determine home directory".to_string()))?;
    Ok(home.join(rest))
}
