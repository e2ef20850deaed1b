//! Process-memory storage backend, used for tests and ephemeral coordinators

use super::cache::StorageCache;
use super::{StorageBackend, StorageError};
use crate::{Account, Mapping};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Account and mapping storage that lives only as long as the process
#[derive(Default)]
pub struct MemoryStorage {
    cache: RwLock<StorageCache>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn list_accounts(&self) -> Result<Vec<Account>, StorageError> {
        Ok(self.cache.read().accounts())
    }

    async fn create_account(&self, account: &Account) -> Result<(), StorageError> {
        self.cache.write().insert_account(account)
    }

    async fn delete_account(&self, id: &str) -> Result<Vec<Mapping>, StorageError> {
        self.cache.write().remove_account(id)
    }

    async fn touch_account(&self, id: &str, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.cache.write().touch_account(id, at)
    }

    async fn list_mappings(&self) -> Result<Vec<Mapping>, StorageError> {
        Ok(self.cache.read().mappings())
    }

    async fn create_mapping(&self, mapping: &Mapping, overwrite: bool) -> Result<Mapping, StorageError> {
        self.cache.write().insert_mapping(mapping, overwrite)
    }

    async fn delete_mapping(&self, id: &str) -> Result<(), StorageError> {
        self.cache
            .write()
            .remove_mapping(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::MappingNotFound(id.to_string()))
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
