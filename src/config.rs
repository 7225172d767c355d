use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE_NAME: &str = "config.toml";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
}

/// Marketplace backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// API base URL; favorites live under `{base_url}/favorites/...`
    pub base_url: String,
    /// Request timeout in seconds (0 = transport default)
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000/api".to_string(),
            request_timeout_secs: 0,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

/// Background consistency timers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Identity re-resolution interval in seconds
    pub identity_interval_secs: u64,
    /// Logout detection interval in seconds
    pub logout_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            identity_interval_secs: 5,
            logout_interval_secs: 30,
        }
    }
}

impl SyncConfig {
    pub fn identity_interval(&self) -> Duration {
        Duration::from_secs(self.identity_interval_secs.max(1))
    }

    pub fn logout_interval(&self) -> Duration {
        Duration::from_secs(self.logout_interval_secs.max(1))
    }
}

/// Local storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database path (empty = default data dir)
    pub db_path: Option<String>,
    /// Storage key of the bearer credential
    pub credential_key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            credential_key: "token".to_string(),
        }
    }
}

impl Config {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("favsync");

        fs::create_dir_all(&config_dir)
            .context("Failed to create config directory")?;

        Ok(config_dir.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from the default path, creating it if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, or write defaults there if it doesn't exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .context("Failed to read config file")?;

            let config: Config = toml::from_str(&contents)
                .context("Failed to parse config file")?;

            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Resolved database path
    pub fn db_path(&self) -> Result<PathBuf> {
        match self.storage.db_path.as_deref().filter(|p| !p.is_empty()) {
            Some(path) => Ok(PathBuf::from(path)),
            None => crate::storage::RedbStorage::default_path(),
        }
    }

    /// Generate example config content for documentation
    pub fn example_config() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.backend.base_url, "http://localhost:5000/api");
        assert!(config.backend.request_timeout().is_none());
        assert_eq!(config.sync.identity_interval(), Duration::from_secs(5));
        assert_eq!(config.sync.logout_interval(), Duration::from_secs(30));
        assert_eq!(config.storage.credential_key, "token");
        assert!(config.storage.db_path.is_none());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial_toml = r#"
[backend]
base_url = "https://api.staynest.example/api"
"#;

        let config: Config = toml::from_str(partial_toml).unwrap();

        assert_eq!(config.backend.base_url, "https://api.staynest.example/api");
        assert_eq!(config.sync.identity_interval_secs, 5);
        assert_eq!(config.storage.credential_key, "token");
    }

    #[test]
    fn test_full_config_parsing() {
        let full_toml = r#"
[backend]
base_url = "https://backend"
request_timeout_secs = 15

[sync]
identity_interval_secs = 2
logout_interval_secs = 60

[storage]
db_path = "/tmp/favs.redb"
credential_key = "authToken"
"#;

        let config: Config = toml::from_str(full_toml).unwrap();

        assert_eq!(config.backend.request_timeout(), Some(Duration::from_secs(15)));
        assert_eq!(config.sync.identity_interval(), Duration::from_secs(2));
        assert_eq!(config.sync.logout_interval(), Duration::from_secs(60));
        assert_eq!(config.db_path().unwrap(), PathBuf::from("/tmp/favs.redb"));
        assert_eq!(config.storage.credential_key, "authToken");
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config: Config = toml::from_str("[sync]\nidentity_interval_secs = 0\nlogout_interval_secs = 0\n").unwrap();
        assert_eq!(config.sync.identity_interval(), Duration::from_secs(1));
        assert_eq!(config.sync.logout_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_example_config_is_valid() {
        let example = Config::example_config();
        let parsed: Result<Config, _> = toml::from_str(&example);
        assert!(parsed.is_ok(), "Example config should be valid TOML");
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let invalid_toml = "this is not valid [[ toml";
        let result: Result<Config, _> = toml::from_str(invalid_toml);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.sync.identity_interval_secs, 5);

        fs::write(&path, "[sync]\nlogout_interval_secs = 45\n").unwrap();
        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.sync.logout_interval_secs, 45);
    }
}
