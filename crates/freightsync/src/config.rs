//! Configuration management for freightsync.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "freightsync";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "freightsync.db";

/// Default key-value store file name.
const KV_FILE_NAME: &str = "freightsync-web.json";

/// Default session file name.
const SESSION_FILE_NAME: &str = "session.json";

/// Environment variable prefix.
const ENV_PREFIX: &str = "FREIGHTSYNC_";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `FREIGHTSYNC_`, nested keys split on `__`)
/// 2. TOML config file at `~/.config/freightsync/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote API configuration.
    pub api: ApiConfig,
    /// Queue processing configuration.
    pub sync: SyncConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Connectivity configuration.
    pub network: NetworkConfig,
    /// Session configuration.
    pub session: SessionConfig,
}

/// Remote API configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL every endpoint is resolved against.
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Path requested by the reachability probe.
    pub probe_path: String,
}

/// Queue processing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum operations sent per pass.
    pub batch_size: usize,
    /// Failed attempts after which an operation is marked failed.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any retry delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Interval between periodic passes, in seconds.
    pub interval_secs: u64,
    /// How long completed operations are kept, in hours.
    pub completed_retention_hours: u64,
}

/// Which target the app runs as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Native target with an embedded database.
    #[default]
    Mobile,
    /// Browser target with key-value storage only.
    Web,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mobile => write!(f, "mobile"),
            Self::Web => write!(f, "web"),
        }
    }
}

/// Storage-related configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Target platform; selects the store implementation.
    pub platform: Platform,
    /// Path to the database file.
    /// Defaults to `~/.local/share/freightsync/freightsync.db`
    pub database_path: Option<PathBuf>,
    /// Path to the key-value store file.
    /// Defaults to `~/.local/share/freightsync/freightsync-web.json`
    pub kv_path: Option<PathBuf>,
}

/// Connectivity configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interval between connectivity re-evaluations, in seconds.
    pub probe_interval_secs: u64,
    /// Timeout of the reachability probe, in milliseconds.
    pub probe_timeout_ms: u64,
    /// Start in forced offline mode.
    pub forced_offline: bool,
}

/// Session configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Path to the session file.
    /// Defaults to `~/.local/share/freightsync/session.json`
    pub path: Option<PathBuf>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            timeout_secs: 15,
            probe_path: "/health".to_string(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            interval_secs: 30,
            completed_retention_hours: 24,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 15,
            probe_timeout_ms: 3_000,
            forced_offline: false,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. TOML config file (if exists)
    /// 3. Environment variables (prefixed with `FREIGHTSYNC_`)
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);
        let config: Config = Self::figment(&config_file).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The layered provider chain, exposed for inspection.
    #[must_use]
    pub fn figment(config_file: &std::path::Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(Error::ConfigValidation { message });

        if !(self.api.base_url.starts_with("http://") || self.api.base_url.starts_with("https://"))
        {
            return invalid(format!(
                "api.base_url must start with http:// or https:// (got {})",
                self.api.base_url
            ));
        }

        if self.api.timeout_secs == 0 {
            return invalid("api.timeout_secs must be greater than 0".to_string());
        }

        if self.sync.batch_size == 0 {
            return invalid("sync.batch_size must be greater than 0".to_string());
        }

        if self.sync.max_retries == 0 {
            return invalid("sync.max_retries must be greater than 0".to_string());
        }

        if self.sync.max_delay_ms < self.sync.base_delay_ms {
            return invalid(format!(
                "sync.max_delay_ms ({}) cannot be less than sync.base_delay_ms ({})",
                self.sync.max_delay_ms, self.sync.base_delay_ms
            ));
        }

        if self.sync.interval_secs == 0 {
            return invalid("sync.interval_secs must be greater than 0".to_string());
        }

        if self.network.probe_interval_secs == 0 {
            return invalid("network.probe_interval_secs must be greater than 0".to_string());
        }

        if self.network.probe_timeout_ms == 0 {
            return invalid("network.probe_timeout_ms must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the key-value store path, resolving defaults if not set.
    #[must_use]
    pub fn kv_path(&self) -> PathBuf {
        self.storage
            .kv_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(KV_FILE_NAME))
    }

    /// Get the session file path, resolving defaults if not set.
    #[must_use]
    pub fn session_path(&self) -> PathBuf {
        self.session
            .path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(SESSION_FILE_NAME))
    }

    /// Get the request timeout as a Duration.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    /// Get the periodic sync interval as a Duration.
    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }

    /// Get the completed-operation retention as a Duration.
    #[must_use]
    pub fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.sync.completed_retention_hours * 60 * 60)
    }

    /// Get the connectivity re-evaluation interval as a Duration.
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.network.probe_interval_secs)
    }

    /// Get the reachability probe timeout as a Duration.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.network.probe_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.storage.platform, Platform::Mobile);
        assert!(!config.network.forced_offline);
        assert!(config.api.base_url.starts_with("http"));
    }

    #[test]
    fn test_default_sync_config() {
        let sync = SyncConfig::default();

        assert_eq!(sync.batch_size, 10);
        assert_eq!(sync.max_retries, 3);
        assert_eq!(sync.base_delay_ms, 1_000);
        assert_eq!(sync.max_delay_ms, 300_000);
        assert_eq!(sync.interval_secs, 30);
        assert_eq!(sync.completed_retention_hours, 24);
    }

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_base_url() {
        let mut config = Config::default();
        config.api.base_url = "ftp://example.com".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("api.base_url"));
    }

    #[test]
    fn test_validate_zero_batch_size() {
        let mut config = Config::default();
        config.sync.batch_size = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("batch_size"));
    }

    #[test]
    fn test_validate_zero_retries() {
        let mut config = Config::default();
        config.sync.max_retries = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_retries"));
    }

    #[test]
    fn test_validate_delay_bounds() {
        let mut config = Config::default();
        config.sync.base_delay_ms = 10_000;
        config.sync.max_delay_ms = 5_000;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_delay_ms"));
    }

    #[test]
    fn test_validate_zero_intervals() {
        let mut config = Config::default();
        config.sync.interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.network.probe_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_paths_default() {
        let config = Config::default();

        assert!(config
            .database_path()
            .to_string_lossy()
            .contains("freightsync.db"));
        assert!(config
            .kv_path()
            .to_string_lossy()
            .contains("freightsync-web.json"));
        assert!(config
            .session_path()
            .to_string_lossy()
            .contains("session.json"));
    }

    #[test]
    fn test_database_path_custom() {
        let mut config = Config::default();
        config.storage.database_path = Some(PathBuf::from("/custom/path/db.sqlite"));

        assert_eq!(
            config.database_path(),
            PathBuf::from("/custom/path/db.sqlite")
        );
    }

    #[test]
    fn test_durations() {
        let config = Config::default();

        assert_eq!(config.request_timeout(), Duration::from_secs(15));
        assert_eq!(config.sync_interval(), Duration::from_secs(30));
        assert_eq!(config.completed_retention(), Duration::from_secs(24 * 3600));
        assert_eq!(config.probe_timeout(), Duration::from_millis(3_000));
    }

    #[test]
    fn test_default_config_path() {
        let path = Config::default_config_path();
        assert!(path.to_string_lossy().contains("freightsync"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_load_nonexistent_config() {
        let result = Config::load_from(Some(PathBuf::from("/nonexistent/config.toml")));
        assert!(result.is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[api]
base_url = "https://fleet.example.com/api"

[sync]
batch_size = 25
max_retries = 5

[storage]
platform = "web"
"#,
        )
        .unwrap();

        let config: Config = Config::figment(&path).extract().unwrap();
        assert_eq!(config.api.base_url, "https://fleet.example.com/api");
        assert_eq!(config.sync.batch_size, 25);
        assert_eq!(config.sync.max_retries, 5);
        assert_eq!(config.sync.interval_secs, 30);
        assert_eq!(config.storage.platform, Platform::Web);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sync]\nbatch_size = 0\n").unwrap();

        let err = Config::load_from(Some(path)).unwrap_err();
        assert!(matches!(err, Error::ConfigValidation { .. }));
    }

    #[test]
    fn test_platform_serialize() {
        assert_eq!(serde_json::to_string(&Platform::Web).unwrap(), "\"web\"");
        assert_eq!(Platform::Mobile.to_string(), "mobile");
    }

    #[test]
    fn test_storage_config_deserialize() {
        let json = r#"{"platform": "web", "kv_path": "/tmp/kv.json"}"#;
        let storage: StorageConfig = serde_json::from_str(json).unwrap();
        assert_eq!(storage.platform, Platform::Web);
        assert_eq!(storage.kv_path, Some(PathBuf::from("/tmp/kv.json")));
        assert!(storage.database_path.is_none());
    }

    #[test]
    fn test_config_clone() {
        let config = Config::default();
        let cloned = config.clone();
        assert_eq!(config, cloned);
    }
}
