//! JSON file storage backend
//!
//! Accounts and mappings hold no secrets, so the table is stored as plain
//! JSON. Every write rewrites the file atomically.

use super::cache::StorageCache;
use super::{StorageBackend, StorageError};
use crate::{Account, Mapping};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// Current on-disk format version
const FORMAT_VERSION: u32 = 1;

/// File-based account and mapping storage
pub struct FileStorage {
    /// Path to the storage file
    path: PathBuf,
    /// In-memory copy of the file, replaced only after a successful write
    cache: RwLock<StorageCache>,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

/// On-disk format for the storage file
#[derive(Debug, Serialize, Deserialize)]
struct StorageFile {
    /// Version for future migrations
    version: u32,
    #[serde(flatten)]
    data: StorageCache,
}

impl FileStorage {
    /// Open the storage file, creating it if absent
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let exists = path.exists();
        let cache = if exists {
            Self::read(&path).await?
        } else {
            StorageCache::default()
        };

        if !exists {
            Self::write(&path, &cache).await?;
        }

        Ok(Self {
            path,
            cache: RwLock::new(cache),
            write_lock: Mutex::new(()),
        })
    }

    async fn read(path: &Path) -> Result<StorageCache, StorageError> {
        let content = fs::read_to_string(path).await?;
        let file: StorageFile =
            serde_json::from_str(&content).map_err(|e| StorageError::Serialization(e.to_string()))?;

        if file.version > FORMAT_VERSION {
            return Err(StorageError::Serialization(format!(
                "Unsupported storage version {} (expected <= {})",
                file.version, FORMAT_VERSION
            )));
        }

        let mut cache = file.data;
        cache.rebuild_indexes();
        Ok(cache)
    }

    /// Write a table to disk, owner-only
    async fn write(path: &Path, cache: &StorageCache) -> Result<(), StorageError> {
        let file = StorageFileRef {
            version: FORMAT_VERSION,
            data: cache,
        };
        let content =
            serde_json::to_string_pretty(&file).map_err(|e| StorageError::Serialization(e.to_string()))?;

        // Write atomically by writing to temp file first
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &content).await?;
        restrict_permissions(&temp_path).await?;
        fs::rename(&temp_path, path).await?;

        Ok(())
    }

    /// Apply `change` to a copy of the table, persist it, then publish it
    ///
    /// If the change or the write fails, the in-memory table is untouched.
    async fn commit<T>(
        &self,
        change: impl FnOnce(&mut StorageCache) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let _guard = self.write_lock.lock().await;

        let mut next = self.cache.read().clone();
        let result = change(&mut next)?;
        Self::write(&self.path, &next).await?;
        *self.cache.write() = next;

        Ok(result)
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}

/// Borrowed form of `StorageFile` for serialization without cloning
#[derive(Serialize)]
struct StorageFileRef<'a> {
    version: u32,
    #[serde(flatten)]
    data: &'a StorageCache,
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn list_accounts(&self) -> Result<Vec<Account>, StorageError> {
        Ok(self.cache.read().accounts())
    }

    async fn create_account(&self, account: &Account) -> Result<(), StorageError> {
        self.commit(|cache| cache.insert_account(account)).await
    }

    async fn delete_account(&self, id: &str) -> Result<Vec<Mapping>, StorageError> {
        self.commit(|cache| cache.remove_account(id)).await
    }

    async fn touch_account(&self, id: &str, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.commit(|cache| cache.touch_account(id, at)).await
    }

    async fn list_mappings(&self) -> Result<Vec<Mapping>, StorageError> {
        Ok(self.cache.read().mappings())
    }

    async fn create_mapping(&self, mapping: &Mapping, overwrite: bool) -> Result<Mapping, StorageError> {
        self.commit(|cache| cache.insert_mapping(mapping, overwrite)).await
    }

    async fn delete_mapping(&self, id: &str) -> Result<(), StorageError> {
        self.commit(|cache| {
            cache
                .remove_mapping(id)
                .map(|_| ())
                .ok_or_else(|| StorageError::MappingNotFound(id.to_string()))
        })
        .await
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        if !self.path.exists() {
            return Err(StorageError::Unavailable(
                "Storage file does not exist".to_string(),
            ));
        }

        fs::metadata(&self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MatchRule;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_create_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let account = Account::new("work");
        let mapping = Mapping::new(MatchRule::Exact("github.com/org/repo".into()), &account.id);

        {
            let storage = FileStorage::new(&path).await.unwrap();
            storage.create_account(&account).await.unwrap();
            storage.create_mapping(&mapping, false).await.unwrap();
        }

        let storage = FileStorage::new(&path).await.unwrap();
        assert_eq!(storage.list_accounts().await.unwrap(), vec![account.clone()]);
        assert_eq!(storage.list_mappings().await.unwrap(), vec![mapping]);
        assert!(storage.health_check().await.is_ok());

        // Exact index was rebuilt on load
        let other = Account::new("personal");
        storage.create_account(&other).await.unwrap();
        let conflict = Mapping::new(MatchRule::Exact("github.com/org/repo".into()), &other.id);
        assert!(matches!(
            storage.create_mapping(&conflict, false).await,
            Err(StorageError::MappingConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_account_persists_cascade() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let storage = FileStorage::new(&path).await.unwrap();
        let account = Account::new("work");
        storage.create_account(&account).await.unwrap();
        storage
            .create_mapping(&Mapping::new(MatchRule::Pattern("github.com/org/*".into()), &account.id), false)
            .await
            .unwrap();

        let removed = storage.delete_account(&account.id).await.unwrap();
        assert_eq!(removed.len(), 1);

        let storage = FileStorage::new(&path).await.unwrap();
        assert!(storage.list_accounts().await.unwrap().is_empty());
        assert!(storage.list_mappings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_touch_account() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("state.json")).await.unwrap();

        let account = Account::new("work");
        storage.create_account(&account).await.unwrap();

        let now = Utc::now();
        storage.touch_account(&account.id, now).await.unwrap();
        let loaded = storage.list_accounts().await.unwrap();
        assert_eq!(loaded[0].last_used_at, Some(now));

        assert!(matches!(
            storage.touch_account("missing", now).await,
            Err(StorageError::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_mapping() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("state.json")).await.unwrap();

        assert!(matches!(
            storage.delete_mapping("nope").await,
            Err(StorageError::MappingNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_table_unchanged() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let storage = FileStorage::new(&path).await.unwrap();

        let work = Account::new("work");
        storage.create_account(&work).await.unwrap();

        // A directory where the temp file goes makes every write fail
        let blocker = dir.path().join("state.tmp");
        std::fs::create_dir(&blocker).unwrap();

        assert!(matches!(
            storage.create_account(&Account::new("ghost")).await,
            Err(StorageError::Io(_))
        ));
        let mapping = Mapping::new(MatchRule::Exact("github.com/org/repo".into()), &work.id);
        assert!(storage.create_mapping(&mapping, false).await.is_err());
        assert!(storage.touch_account(&work.id, Utc::now()).await.is_err());
        assert!(storage.delete_account(&work.id).await.is_err());

        assert_eq!(storage.list_accounts().await.unwrap(), vec![work.clone()]);
        assert!(storage.list_mappings().await.unwrap().is_empty());

        std::fs::remove_dir(&blocker).unwrap();
        storage.create_account(&Account::new("real")).await.unwrap();

        let names: Vec<String> = storage
            .list_accounts()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["work".to_string(), "real".to_string()]);

        let reopened = FileStorage::new(&path).await.unwrap();
        assert_eq!(reopened.list_accounts().await.unwrap().len(), 2);
        assert!(reopened.list_mappings().await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_state_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let storage = FileStorage::new(&path).await.unwrap();
        storage.create_account(&Account::new("work")).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
