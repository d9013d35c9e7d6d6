//! Store configuration with layered loading
//!
//! Precedence (low to high):
//! 1. Built-in defaults
//! 2. YAML file (when a path is given and the file exists)
//! 3. Environment variables (`CREDSTORE_*` prefix)

use crate::error::{Error, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::time::Duration;
use tracing::debug;

/// Top-level store configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StoreConfig {
    pub database: DatabaseConfig,
    pub encryption: EncryptionConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

/// SQLite connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Must be 1 for in-memory databases; each connection would otherwise
    /// see its own empty database.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,

    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// Whether `url` names an in-memory SQLite database
    pub fn is_in_memory(&self) -> bool {
        let url = self.url.trim();
        url.contains(":memory:") || url.contains("mode=memory")
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::invalid_config("database.url must not be empty"));
        }
        if self.max_connections == 0 {
            return Err(Error::invalid_config(
                "database.max-connections must be at least 1",
            ));
        }
        if self.is_in_memory() && self.max_connections > 1 {
            return Err(Error::invalid_config(format!(
                "database.max-connections must be 1 for in-memory database {}, got {}",
                self.url, self.max_connections
            )));
        }
        Ok(())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            busy_timeout_secs: default_busy_timeout_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite::memory:".to_string()
}

fn default_max_connections() -> u32 {
    1
}

fn default_busy_timeout_secs() -> u64 {
    5
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

/// Where the cipher reads its age identity from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeySource {
    #[default]
    File,
    Env,
}

/// Key material settings for the envelope cipher
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EncryptionConfig {
    #[serde(default)]
    pub key_source: KeySource,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<Utf8PathBuf>,

    /// Name of the environment variable holding the identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_env: Option<String>,
}

impl EncryptionConfig {
    pub fn from_file(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            key_source: KeySource::File,
            key_file: Some(path.into()),
            key_env: None,
        }
    }

    pub fn from_env(var: impl Into<String>) -> Self {
        Self {
            key_source: KeySource::Env,
            key_file: None,
            key_env: Some(var.into()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.key_source {
            KeySource::File if self.key_file.is_none() => Err(Error::invalid_config(
                "encryption.key-file is required when key-source is 'file'",
            )),
            KeySource::Env if self.key_env.as_deref().map_or(true, str::is_empty) => {
                Err(Error::invalid_config(
                    "encryption.key-env is required when key-source is 'env'",
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Decryption cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

/// Tracing output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoggingConfig {
    /// `EnvFilter` directive string
    #[serde(default = "default_log_filter")]
    pub filter: String,

    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_log_filter() -> String {
    "credstore=info".to_string()
}

impl StoreConfig {
    /// Check settings that would otherwise fail later at connect or
    /// cipher construction time
    pub fn validate(&self) -> Result<()> {
        self.database.validate()?;
        self.encryption.validate()
    }
}

/// Loads [`StoreConfig`] from defaults, an optional YAML file and the
/// environment
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    path: Option<Utf8PathBuf>,
}

impl ConfigLoader {
    /// Loader that only applies defaults and environment overrides
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    pub fn load(&self) -> Result<StoreConfig> {
        let mut config = StoreConfig::default();

        if let Some(path) = self.path.as_deref() {
            if path.exists() {
                debug!(%path, "Loading store config");
                config = Self::load_yaml_file(path)?;
            } else {
                debug!(%path, "Config file not found, using defaults");
            }
        }

        Self::apply_env_overrides(config)
    }

    fn load_yaml_file<T: DeserializeOwned>(path: &Utf8Path) -> Result<T> {
        let content = fs::read_to_string(path)?;
        serde_yaml_ng::from_str(&content)
            .map_err(|e| Error::invalid_config(format!("Failed to parse {}: {}", path, e)))
    }

    fn apply_env_overrides(mut config: StoreConfig) -> Result<StoreConfig> {
        if let Ok(val) = env::var("CREDSTORE_DATABASE_URL") {
            config.database.url = val;
        }

        if let Ok(val) = env::var("CREDSTORE_DB_MAX_CONNECTIONS") {
            config.database.max_connections = val.parse().map_err(|_| {
                Error::invalid_config("CREDSTORE_DB_MAX_CONNECTIONS must be a valid number")
            })?;
        }

        if let Ok(val) = env::var("CREDSTORE_DB_BUSY_TIMEOUT_SECS") {
            config.database.busy_timeout_secs = val.parse().map_err(|_| {
                Error::invalid_config("CREDSTORE_DB_BUSY_TIMEOUT_SECS must be a valid number")
            })?;
        }

        // Key material
        if let Ok(val) = env::var("CREDSTORE_KEY_FILE") {
            config.encryption.key_source = KeySource::File;
            config.encryption.key_file = Some(Utf8PathBuf::from(val));
        }

        if let Ok(val) = env::var("CREDSTORE_KEY_ENV") {
            config.encryption.key_source = KeySource::Env;
            config.encryption.key_env = Some(val);
        }

        if let Ok(val) = env::var("CREDSTORE_CACHE_ENABLED") {
            config.cache.enabled = parse_bool("CREDSTORE_CACHE_ENABLED", &val)?;
        }

        // Logging
        if let Ok(val) = env::var("CREDSTORE_LOG") {
            config.logging.filter = val;
        }

        if let Ok(val) = env::var("CREDSTORE_LOG_JSON") {
            config.logging.json = parse_bool("CREDSTORE_LOG_JSON", &val)?;
        }

        Ok(config)
    }
}

fn parse_bool(var: &str, val: &str) -> Result<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::invalid_config(format!("{} must be true or false", var))),
    }
}
