//! Configuration system for gitswitch
//!
//! Loads configuration from a TOML file. Every key is optional.

mod types;

pub use types::*;

use crate::coordinator::CoordinatorSettings;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main gitswitch configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub coordinator: CoordinatorConfig,
    pub helper: HelperConfig,
    pub storage: StorageConfig,
    pub secrets: SecretsConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Load from `path`, or from the default location if it exists
    ///
    /// `GITSWITCH_SOCKET` overrides the configured socket path.
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path).await?,
            None => {
                let default_path = Self::default_path();
                if default_path.exists() {
                    Self::load(&default_path).await?
                } else {
                    Self::default()
                }
            }
        };

        if let Some(socket) = std::env::var_os("GITSWITCH_SOCKET").filter(|s| !s.is_empty()) {
            config.coordinator.socket_path = PathBuf::from(socket);
        }

        Ok(config)
    }

    /// Load configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        Self::from_raw(raw)
    }

    /// Convert from raw TOML config to validated config
    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            coordinator: raw.coordinator.unwrap_or_default().try_into()?,
            helper: raw.helper.unwrap_or_default().try_into()?,
            storage: raw.storage.unwrap_or_default().into(),
            secrets: raw.secrets.unwrap_or_default().try_into()?,
            logging: raw.logging.unwrap_or_default().try_into()?,
        })
    }

    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gitswitch")
            .join("config.toml")
    }

    /// Directory for persistent state
    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("gitswitch")
    }

    /// Default coordinator socket, in the user's runtime directory when there is one
    pub fn default_socket_path() -> PathBuf {
        let dir = match dirs::runtime_dir() {
            Some(dir) => dir.join("gitswitch"),
            None => {
                let user = std::env::var("USER").unwrap_or_else(|_| "user".to_string());
                std::env::temp_dir().join(format!("gitswitch-{}", user))
            }
        };
        dir.join("coordinator.sock")
    }
}

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub socket_path: PathBuf,
    /// Longest time a pending selection stays open
    pub pending_timeout: Duration,
    pub single_account_shortcut: bool,
    pub interactive: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            socket_path: Config::default_socket_path(),
            pending_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            single_account_shortcut: true,
            interactive: true,
        }
    }
}

impl CoordinatorConfig {
    pub fn settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            pending_timeout: self.pending_timeout,
            single_account_shortcut: self.single_account_shortcut,
            interactive: self.interactive,
        }
    }
}

/// Credential helper configuration
#[derive(Debug, Clone)]
pub struct HelperConfig {
    /// How long `get` waits for the coordinator
    pub wait_timeout: Duration,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// Account and mapping storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: Config::data_dir().join("state.json"),
        }
    }
}

/// Secret store configuration
#[derive(Debug, Clone)]
pub struct SecretsConfig {
    pub backend: SecretBackendType,
    /// Path for the encrypted file backend
    pub path: PathBuf,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            backend: SecretBackendType::Memory,
            path: Config::data_dir().join("secrets.enc"),
        }
    }
}

/// Secret store backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretBackendType {
    /// Process memory; tokens are lost when the coordinator exits
    Memory,
    /// AES-256-GCM sealed file unlocked with a passphrase
    EncryptedFile,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    pub level: String,
    pub format: LogFormat,
    /// Activity log, written as JSON lines
    pub audit_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            audit_file: None,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format
    Pretty,
    /// JSON format
    Json,
}

pub(crate) const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Commented configuration written by `gitswitch init`
pub const DEFAULT_CONFIG: &str = r#"# gitswitch configuration

[coordinator]
# socket_path = "/run/user/1000/gitswitch/coordinator.sock"
# Longest time a request waits for you to pick an account
pending_timeout_secs = 30
# Use the only account for unmapped remotes without asking
single_account_shortcut = true
# When false, ambiguous requests fail instead of waiting for a choice
interactive = true

[helper]
wait_timeout_secs = 30

[storage]
path = "~/.local/share/gitswitch/state.json"

[secrets]
# "memory" forgets tokens when the coordinator stops; "encrypted_file" keeps
# them sealed on disk, unlocked with GITSWITCH_PASSWORD or a prompt
backend = "memory"
path = "~/.local/share/gitswitch/secrets.enc"

[logging]
level = "info"
format = "pretty"
# audit_file = "~/.local/share/gitswitch/activity.log"
"#;
