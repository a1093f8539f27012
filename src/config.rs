//! TOML configuration for the ingestion service.
//!
//! Every section is optional; missing values fall back to built-in defaults.
//!
//! ```toml
//! database_path = "data/images.db"
//!
//! [storage]
//! root = "data/blobs"
//! key_prefix = "hidoc2/images/"
//! public_base_url = "https://cdn.example.org"
//!
//! [ingest]
//! upload_concurrency = 8
//! scratch_dir = "/var/tmp"
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    ingest::{DEFAULT_UPLOAD_CONCURRENCY, IngestSettings},
    storage::DEFAULT_KEY_PREFIX,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// SQLite database holding image records
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Directory backing the filesystem blob store
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Prefix joined with storage keys to build public URLs
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,

    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins when set
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/images.db")
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("data/blobs")
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_upload_concurrency() -> usize {
    DEFAULT_UPLOAD_CONCURRENCY
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            storage: StorageConfig::default(),
            ingest: IngestConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            key_prefix: default_key_prefix(),
            public_base_url: default_public_base_url(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            upload_concurrency: default_upload_concurrency(),
            scratch_dir: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ingest.upload_concurrency == 0 {
            return Err(ConfigError::Invalid("ingest.upload_concurrency must be at least 1".into()));
        }
        if self.storage.key_prefix.starts_with('/') || self.storage.key_prefix.contains("..") {
            return Err(ConfigError::Invalid(format!(
                "storage.key_prefix {:?} must be a relative key prefix",
                self.storage.key_prefix
            )));
        }
        Ok(())
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            upload_concurrency: self.ingest.upload_concurrency,
            scratch_dir: self.ingest.scratch_dir.clone(),
        }
    }
}
