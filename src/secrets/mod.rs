//! Secret storage for account tokens
//!
//! The coordinator only sees the `SecretStore` trait. The default backend
//! keeps tokens in process memory, so they are lost when the coordinator
//! exits; the encrypted file backend persists them sealed under a passphrase.

mod file;
mod memory;

pub use file::EncryptedFileSecretStore;
pub use memory::MemorySecretStore;

use crate::Secret;
use async_trait::async_trait;
use thiserror::Error;

/// Secret store errors
#[derive(Error, Debug)]
pub enum SecretError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Encryption error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("Secret store unavailable: {0}")]
    Unavailable(String),
}

/// Trait for secret storage backends, keyed by an account's secret handle
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret; `None` means the secret is unavailable
    async fn get(&self, handle: &str) -> Result<Option<Secret>, SecretError>;

    /// Store or replace a secret
    async fn set(&self, handle: &str, secret: &Secret) -> Result<(), SecretError>;

    /// Delete a secret; deleting a missing secret is not an error
    async fn delete(&self, handle: &str) -> Result<(), SecretError>;
}
