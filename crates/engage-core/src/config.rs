//! Engage configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EngageError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngageConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub whatsapp: Option<WhatsAppChannelConfig>,
    #[serde(default)]
    pub webhook: Option<WebhookChannelConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngageConfig {
    /// Load config from the default path (~/.engage/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngageError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| EngageError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| EngageError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Engage home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".engage")
    }
}

/// SQLite store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.engage/engage.db".into() }

impl DatabaseConfig {
    /// Database path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Delayed job queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How often an idle topic consumer looks for ready jobs.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Attempts before a failing job is parked as dead.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff between attempts (multiplied by the attempt number).
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

fn default_poll_interval_ms() -> u64 { 1000 }
fn default_max_attempts() -> u32 { 3 }
fn default_retry_delay_secs() -> u64 { 30 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

/// Campaign delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Fixed pause between two successive sends inside a batch.
    #[serde(default = "default_send_interval_ms")]
    pub send_interval_ms: u64,
    #[serde(default = "default_locale")]
    pub default_locale: String,
}

fn default_send_interval_ms() -> u64 { 1000 }
fn default_locale() -> String { "en".into() }

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            send_interval_ms: default_send_interval_ms(),
            default_locale: default_locale(),
        }
    }
}

/// WhatsApp Business Cloud API channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppChannelConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    pub access_token: String,
    pub phone_number_id: String,
    #[serde(default = "default_graph_version")]
    pub api_version: String,
}

fn bool_true() -> bool { true }
fn default_graph_version() -> String { "v21.0".into() }

/// Generic outbound webhook channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookChannelConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngageConfig::default();
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.delivery.send_interval_ms, 1000);
        assert_eq!(config.delivery.default_locale, "en");
        assert!(config.whatsapp.is_none());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [database]
            path = "/tmp/engage-test.db"

            [delivery]
            send_interval_ms = 250

            [whatsapp]
            access_token = "tok"
            phone_number_id = "123"
        "#;

        let config: EngageConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database.resolved_path(), PathBuf::from("/tmp/engage-test.db"));
        assert_eq!(config.delivery.send_interval_ms, 250);
        assert_eq!(config.delivery.default_locale, "en");
        let wa = config.whatsapp.unwrap();
        assert!(wa.enabled);
        assert_eq!(wa.api_version, "v21.0");
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: EngageConfig = toml::from_str("").unwrap();
        assert_eq!(config.queue.poll_interval_ms, 1000);
        assert!(!config.logging.json);
    }

    #[test]
    fn test_home_dir() {
        let home = EngageConfig::home_dir();
        assert!(home.to_string_lossy().contains(".engage"));
    }
}
