//! Account and mapping persistence
//!
//! Provides the store contract shared with the management surface and two
//! implementations: a JSON file on disk and a process-memory store.

mod cache;
mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::{Account, Mapping};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Storage-related errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Account already exists: {0}")]
    AccountExists(String),

    #[error("Mapping not found: {0}")]
    MappingNotFound(String),

    #[error("Remote {remote} is already mapped to account {existing_account}")]
    MappingConflict {
        remote: String,
        existing_account: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Trait for account and mapping storage backends
///
/// Writes are atomic per call: a failed write leaves no trace. Exact rules are unique per remote: creating a
/// second exact rule for the same remote fails with `MappingConflict` unless
/// `overwrite` is set or it targets the same account.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// List all accounts, oldest first
    async fn list_accounts(&self) -> Result<Vec<Account>, StorageError>;

    /// Store a new account; display names are unique
    async fn create_account(&self, account: &Account) -> Result<(), StorageError>;

    /// Delete an account and every mapping that targets it, returning the removed mappings
    async fn delete_account(&self, id: &str) -> Result<Vec<Mapping>, StorageError>;

    /// Record that an account's credentials were used
    async fn touch_account(&self, id: &str, at: DateTime<Utc>) -> Result<(), StorageError>;

    /// List all mappings, oldest first
    async fn list_mappings(&self) -> Result<Vec<Mapping>, StorageError>;

    /// Store a mapping, returning the mapping now in effect
    async fn create_mapping(&self, mapping: &Mapping, overwrite: bool) -> Result<Mapping, StorageError>;

    /// Delete a mapping by ID
    async fn delete_mapping(&self, id: &str) -> Result<(), StorageError>;

    /// Check if the storage backend is available and healthy
    async fn health_check(&self) -> Result<(), StorageError>;
}
