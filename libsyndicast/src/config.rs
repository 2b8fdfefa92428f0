//! Configuration management for Syndicast
//!
//! All runtime knobs live in one TOML file. Secrets (the token encryption
//! key, OAuth client secrets) may be supplied through environment variables
//! instead of the file; resolution happens once at startup so a missing key
//! fails the process before any job is claimed.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{ConfigError, Result};

/// Minimum accepted length for the token encryption key.
pub const MIN_MASTER_KEY_LEN: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub limits: HashMap<String, PlatformLimits>,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Seconds between scheduler ticks.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Maximum jobs claimed per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_poll_interval() -> u64 {
    60
}

fn default_batch_size() -> i64 {
    50
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Passphrase protecting stored OAuth tokens. `SYNDICAST_MASTER_KEY`
    /// takes precedence over the file value.
    pub master_key: Option<String>,
}

impl EncryptionConfig {
    /// Resolve the master key, preferring the environment.
    ///
    /// Called once at startup; a missing or too-short key is a
    /// configuration error, not a first-use surprise.
    pub fn resolve_master_key(&self) -> Result<SecretString> {
        let key = std::env::var("SYNDICAST_MASTER_KEY")
            .ok()
            .or_else(|| self.master_key.clone())
            .ok_or_else(|| {
                ConfigError::MissingField(
                    "encryption.master_key (or SYNDICAST_MASTER_KEY)".to_string(),
                )
            })?;

        if key.len() < MIN_MASTER_KEY_LEN {
            return Err(ConfigError::InvalidValue {
                field: "encryption.master_key".to_string(),
                reason: format!("must be at least {} characters", MIN_MASTER_KEY_LEN),
            }
            .into());
        }

        Ok(SecretString::from(key))
    }
}

/// OAuth token-endpoint coordinates for one platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

/// Per-platform posting ceilings for admission control.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlatformLimits {
    pub daily_posts: u32,
    pub min_interval_minutes: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Webhook receiving credential-revocation notices; unset disables them.
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
}

/// Relay webhook handling platforms without a native client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    /// Platform names routed through the relay.
    #[serde(default = "default_relay_platforms")]
    pub platforms: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_secret: None,
            platforms: default_relay_platforms(),
        }
    }
}

fn default_relay_platforms() -> Vec<String> {
    vec!["rss".to_string(), "manual".to_string()]
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/syndicast/jobs.db".to_string(),
            },
            worker: WorkerConfig::default(),
            encryption: EncryptionConfig::default(),
            providers: HashMap::new(),
            limits: default_limits(),
            notifications: NotificationConfig::default(),
            relay: RelayConfig::default(),
        }
    }

    /// Effective rate limits: built-in defaults overridden by the config file.
    pub fn effective_limits(&self) -> HashMap<String, PlatformLimits> {
        let mut limits = default_limits();
        for (platform, value) in &self.limits {
            limits.insert(platform.to_lowercase(), *value);
        }
        limits
    }
}

/// Built-in posting ceilings, conservative enough to avoid spam flags.
pub fn default_limits() -> HashMap<String, PlatformLimits> {
    let mut limits = HashMap::new();
    limits.insert(
        "linkedin".to_string(),
        PlatformLimits {
            daily_posts: 25,
            min_interval_minutes: 15,
        },
    );
    limits.insert(
        "x".to_string(),
        PlatformLimits {
            daily_posts: 25,
            min_interval_minutes: 5,
        },
    );
    limits.insert(
        "reddit".to_string(),
        PlatformLimits {
            daily_posts: 10,
            min_interval_minutes: 5,
        },
    );
    limits
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("SYNDICAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("syndicast").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;

    #[test]
    fn test_default_limits_cover_known_platforms() {
        let limits = default_limits();
        assert_eq!(limits["linkedin"].daily_posts, 25);
        assert_eq!(limits["linkedin"].min_interval_minutes, 15);
        assert_eq!(limits["reddit"].daily_posts, 10);
    }

    #[test]
    fn test_effective_limits_override() {
        let mut config = Config::default_config();
        config.limits.insert(
            "LinkedIn".to_string(),
            PlatformLimits {
                daily_posts: 5,
                min_interval_minutes: 60,
            },
        );

        let limits = config.effective_limits();
        assert_eq!(limits["linkedin"].daily_posts, 5);
        assert_eq!(limits["linkedin"].min_interval_minutes, 60);
        // Untouched defaults survive
        assert_eq!(limits["x"].daily_posts, 25);
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml_str = r#"
            [database]
            path = "/tmp/syndicast-test.db"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database.path, "/tmp/syndicast-test.db");
        assert_eq!(config.worker.poll_interval, 60);
        assert_eq!(config.worker.batch_size, 50);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
            [database]
            path = "/tmp/syndicast.db"

            [worker]
            poll_interval = 30
            batch_size = 10

            [encryption]
            master_key = "a-long-enough-master-key"

            [providers.linkedin]
            client_id = "abc"
            client_secret = "def"
            token_url = "https://www.linkedin.com/oauth/v2/accessToken"

            [limits.linkedin]
            daily_posts = 12
            min_interval_minutes = 30

            [notifications]
            webhook_url = "https://hooks.example.com/revoked"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.worker.poll_interval, 30);
        assert_eq!(config.providers["linkedin"].client_id, "abc");
        assert_eq!(config.limits["linkedin"].daily_posts, 12);
        assert_eq!(
            config.notifications.webhook_url.as_deref(),
            Some("https://hooks.example.com/revoked")
        );
    }

    #[test]
    #[serial]
    fn test_master_key_missing_fails_fast() {
        std::env::remove_var("SYNDICAST_MASTER_KEY");
        let config = EncryptionConfig { master_key: None };
        assert!(config.resolve_master_key().is_err());
    }

    #[test]
    #[serial]
    fn test_master_key_too_short_rejected() {
        std::env::remove_var("SYNDICAST_MASTER_KEY");
        let config = EncryptionConfig {
            master_key: Some("short".to_string()),
        };
        assert!(config.resolve_master_key().is_err());
    }

    #[test]
    #[serial]
    fn test_master_key_env_overrides_file() {
        std::env::set_var("SYNDICAST_MASTER_KEY", "environment-master-key");
        let config = EncryptionConfig {
            master_key: Some("file-master-key-value".to_string()),
        };
        let key = config.resolve_master_key().unwrap();
        assert_eq!(key.expose_secret(), "environment-master-key");
        std::env::remove_var("SYNDICAST_MASTER_KEY");
    }
}
