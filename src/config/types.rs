//! Raw configuration types for TOML parsing

use super::*;
use crate::coordinator::MAX_SELECTION_WAIT;
use serde::Deserialize;

/// Raw configuration as parsed from TOML
#[derive(Debug, Deserialize)]
pub struct RawConfig {
    pub coordinator: Option<RawCoordinatorConfig>,
    pub helper: Option<RawHelperConfig>,
    pub storage: Option<RawStorageConfig>,
    pub secrets: Option<RawSecretsConfig>,
    pub logging: Option<RawLoggingConfig>,
}

/// Expand a leading `~/` to the home directory
pub(crate) fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

fn positive_secs(key: &str, value: Option<u64>) -> Result<Duration, ConfigError> {
    let max = MAX_SELECTION_WAIT.as_secs();
    match value {
        Some(0) => Err(ConfigError::Invalid(format!("{} must be greater than zero", key))),
        Some(secs) if secs > max => Err(ConfigError::Invalid(format!(
            "{} must be at most {} seconds",
            key, max
        ))),
        Some(secs) => Ok(Duration::from_secs(secs)),
        None => Ok(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RawCoordinatorConfig {
    pub socket_path: Option<String>,
    pub pending_timeout_secs: Option<u64>,
    pub single_account_shortcut: Option<bool>,
    pub interactive: Option<bool>,
}

impl TryFrom<RawCoordinatorConfig> for CoordinatorConfig {
    type Error = ConfigError;

    fn try_from(raw: RawCoordinatorConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            socket_path: raw
                .socket_path
                .map(|p| expand_home(&p))
                .unwrap_or_else(Config::default_socket_path),
            pending_timeout: positive_secs("coordinator.pending_timeout_secs", raw.pending_timeout_secs)?,
            single_account_shortcut: raw.single_account_shortcut.unwrap_or(true),
            interactive: raw.interactive.unwrap_or(true),
        })
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RawHelperConfig {
    pub wait_timeout_secs: Option<u64>,
}

impl TryFrom<RawHelperConfig> for HelperConfig {
    type Error = ConfigError;

    fn try_from(raw: RawHelperConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            wait_timeout: positive_secs("helper.wait_timeout_secs", raw.wait_timeout_secs)?,
        })
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RawStorageConfig {
    pub path: Option<String>,
}

impl From<RawStorageConfig> for StorageConfig {
    fn from(raw: RawStorageConfig) -> Self {
        match raw.path {
            Some(path) => Self {
                path: expand_home(&path),
            },
            None => Self::default(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RawSecretsConfig {
    pub backend: Option<String>,
    pub path: Option<String>,
}

impl TryFrom<RawSecretsConfig> for SecretsConfig {
    type Error = ConfigError;

    fn try_from(raw: RawSecretsConfig) -> Result<Self, Self::Error> {
        let backend = match raw.backend.as_deref() {
            Some("memory") | None => SecretBackendType::Memory,
            Some("encrypted_file") => SecretBackendType::EncryptedFile,
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "Unknown secrets backend: {}",
                    other
                )))
            }
        };

        Ok(Self {
            backend,
            path: raw
                .path
                .map(|p| expand_home(&p))
                .unwrap_or_else(|| SecretsConfig::default().path),
        })
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct RawLoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
    pub audit_file: Option<String>,
}

impl TryFrom<RawLoggingConfig> for LoggingConfig {
    type Error = ConfigError;

    fn try_from(raw: RawLoggingConfig) -> Result<Self, Self::Error> {
        let format = match raw.format.as_deref() {
            Some("pretty") | None => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::Invalid(format!("Unknown log format: {}", other)))
            }
        };

        Ok(Self {
            level: raw.level.unwrap_or_else(|| "info".to_string()),
            format,
            audit_file: raw.audit_file.map(|p| expand_home(&p)),
        })
    }
}
