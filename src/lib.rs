//! gitswitch - per-repository git identity selection
//!
//! gitswitch lets several git identities live on one machine. A credential
//! helper, spawned by git for every credential request, asks a long-lived
//! coordinator which identity applies to the remote being accessed. When the
//! answer is unknown the request is parked until a human picks an account,
//! and the choice can be remembered as a mapping for next time.

pub mod activity;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod helper;
pub mod ipc;
pub mod router;
pub mod secrets;
pub mod storage;

use chrono::{DateTime, Utc};
use router::RemoteIdentity;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

/// Core error types for gitswitch
#[derive(Error, Debug)]
pub enum GitSwitchError {
    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Secret store error: {0}")]
    Secrets(#[from] secrets::SecretError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error(transparent)]
    Coordinator(#[from] coordinator::CoordinatorError),

    #[error(transparent)]
    Ipc(#[from] ipc::IpcError),

    #[error(transparent)]
    Helper(#[from] helper::HelperError),

    #[error("Invalid remote: {0}")]
    Remote(#[from] router::RemoteError),
}

/// A git identity that can answer credential requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Stable identifier, never changes after creation
    pub id: String,
    /// Display name, handed to git as `username`
    pub name: String,
    /// Key of this account's token in the secret store
    pub secret_handle: String,
    /// When the account was created
    pub created_at: DateTime<Utc>,
    /// Last time git reported using this account's credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Account {
    /// Create a new account with generated ID and secret handle
    pub fn new(name: impl Into<String>) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            secret_handle: format!("account:{}", id),
            id,
            name: name.into(),
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    /// Whether `reference` names this account by id or display name
    pub fn is_referenced_by(&self, reference: &str) -> bool {
        self.id == reference || self.name == reference
    }
}

/// What remotes a mapping applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MatchRule {
    /// A single normalized remote identity, compared verbatim
    Exact(String),
    /// A glob (`*`, `?`, `[...]`) or a plain path-segment prefix
    Pattern(String),
}

impl MatchRule {
    /// Exact rule for a remote identity
    pub fn exact(remote: &RemoteIdentity) -> Self {
        MatchRule::Exact(remote.as_str().to_string())
    }

    /// Whether this is an exact rule
    pub fn is_exact(&self) -> bool {
        matches!(self, MatchRule::Exact(_))
    }

    /// The rule text
    pub fn text(&self) -> &str {
        match self {
            MatchRule::Exact(text) | MatchRule::Pattern(text) => text,
        }
    }
}

impl std::fmt::Display for MatchRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchRule::Exact(text) => write!(f, "exact:{}", text),
            MatchRule::Pattern(text) => write!(f, "pattern:{}", text),
        }
    }
}

/// A remote-to-account rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    /// Unique identifier
    pub id: String,
    /// Remotes this mapping applies to
    pub rule: MatchRule,
    /// Account used for matching remotes
    pub account_id: String,
    /// Created from an interactive choice with "remember" set
    #[serde(default)]
    pub remember: bool,
    /// When the mapping was created; breaks ties between equally specific patterns
    pub created_at: DateTime<Utc>,
}

impl Mapping {
    /// Create a new mapping with generated ID and timestamp
    pub fn new(rule: MatchRule, account_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            rule,
            account_id: account_id.into(),
            remember: false,
            created_at: Utc::now(),
        }
    }

    /// Mark the mapping as remembered from an interactive choice
    pub fn remembered(mut self) -> Self {
        self.remember = true;
        self
    }
}

/// A serializable secret string wrapper
#[derive(Debug, Clone)]
pub struct Secret(SecretString);

impl Secret {
    /// Create a new secret from a string
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    /// Expose the secret value
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl From<String> for Secret {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for Secret {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl Serialize for Secret {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.expose_secret().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self::new(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_creation() {
        let account = Account::new("octocat");

        assert_eq!(account.name, "octocat");
        assert!(!account.id.is_empty());
        assert_eq!(account.secret_handle, format!("account:{}", account.id));
        assert!(account.last_used_at.is_none());
    }

    #[test]
    fn test_account_reference() {
        let account = Account::new("work");
        assert!(account.is_referenced_by("work"));
        assert!(account.is_referenced_by(&account.id.clone()));
        assert!(!account.is_referenced_by("personal"));
    }

    #[test]
    fn test_mapping_serialization() {
        let mapping = Mapping::new(MatchRule::Pattern("github.com/org/*".into()), "acc-1").remembered();

        let json = serde_json::to_string(&mapping).unwrap();
        assert!(json.contains(r#""kind":"pattern""#));

        let parsed: Mapping = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, mapping);
        assert!(parsed.remember);
    }

    #[test]
    fn test_secret_serialization() {
        let secret = Secret::new("ghp_token");
        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, r#""ghp_token""#);

        let parsed: Secret = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.expose(), "ghp_token");
    }
}
