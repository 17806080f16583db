//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use fsmonitor_common::{Error, Result};
use fsmonitor_intercept::InterceptConfig;
use fsmonitor_storage::BackendRegistry;
use fsmonitor_sync::{Endpoints, RequeuePolicy, SyncConfig};

/// Configuration file name in the data directory.
pub const CONFIG_FILENAME: &str = "config.json";

/// Database file name in the data directory.
pub const DATABASE_FILENAME: &str = "offline.db";

/// Environment variable overriding `server.base_url`.
pub const ENV_BASE_URL: &str = "FSMONITOR_BASE_URL";
/// Environment variable overriding `storage.path`.
pub const ENV_DB_PATH: &str = "FSMONITOR_DB_PATH";
/// Environment variable overriding `data_dir`.
pub const ENV_DATA_DIR: &str = "FSMONITOR_DATA_DIR";

/// Remote server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub endpoints: Endpoints,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            timeout_secs: 30,
            endpoints: Endpoints::default(),
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Local database settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend name: "sqlite" or "memory".
    pub backend: String,
    /// Database file; defaults to `offline.db` in the data directory.
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            path: None,
        }
    }
}

/// Background worker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    pub enabled: bool,
    /// Seconds between periodic passes; none disables periodic passes.
    pub interval_secs: Option<u64>,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: Some(300),
        }
    }
}

impl BackgroundConfig {
    pub fn interval(&self) -> Option<Duration> {
        self.interval_secs.map(Duration::from_secs)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: Option<PathBuf>,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub requeue: RequeuePolicy,
    pub background: BackgroundConfig,
    pub intercept: InterceptConfig,
}

impl AppConfig {
    /// Platform data directory, e.g. `~/.local/share/fsmonitor`.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fsmonitor")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(Self::default_data_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir().join(DATABASE_FILENAME))
    }

    /// Load configuration.
    ///
    /// Reads `path` when given, otherwise `config.json` in the data
    /// directory if present, then applies environment overrides and
    /// validates the result.
    ///
    /// # Errors
    /// - Config file unreadable or malformed
    /// - Validation failure
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::read_file(path)?,
            None => {
                let data_dir = std::env::var_os(ENV_DATA_DIR)
                    .map(PathBuf::from)
                    .unwrap_or_else(Self::default_data_dir);
                let default_path = data_dir.join(CONFIG_FILENAME);
                if default_path.exists() {
                    Self::read_file(&default_path)?
                } else {
                    debug!("No config file at {}, using defaults", default_path.display());
                    Self::default()
                }
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json(&json)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base_url) = lookup(ENV_BASE_URL).filter(|v| !v.is_empty()) {
            self.server.base_url = base_url;
        }
        if let Some(path) = lookup(ENV_DB_PATH).filter(|v| !v.is_empty()) {
            self.storage.path = Some(PathBuf::from(path));
        }
        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|v| !v.is_empty()) {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.server.base_url).map_err(|e| {
            Error::Config(format!("Invalid base URL '{}': {}", self.server.base_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "Base URL must be http or https, got '{}'",
                url.scheme()
            )));
        }
        if self.server.timeout_secs == 0 {
            return Err(Error::Config("server.timeout_secs must be > 0".to_string()));
        }
        if !BackendRegistry::builtin().supports(&self.storage.backend) {
            return Err(Error::Config(format!(
                "Unknown storage backend '{}'",
                self.storage.backend
            )));
        }
        if self.background.interval_secs == Some(0) {
            return Err(Error::Config("background.interval_secs must be > 0".to_string()));
        }
        if self.intercept.version == 0 {
            return Err(Error::Config("intercept.version must be >= 1".to_string()));
        }
        if let Some(prefix) = self
            .intercept
            .api_prefixes
            .iter()
            .find(|p| !p.starts_with('/'))
        {
            return Err(Error::Config(format!(
                "API prefix '{}' must start with '/'",
                prefix
            )));
        }
        Ok(())
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Write the configuration to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
