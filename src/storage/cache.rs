//! In-memory table shared by the storage backends

use super::StorageError;
use crate::{Account, MatchRule, Mapping};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Accounts and mappings with their secondary indexes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StorageCache {
    /// Accounts by ID
    accounts: HashMap<String, Account>,
    /// Mappings by ID
    mappings: HashMap<String, Mapping>,

    // Secondary indexes (not serialized, rebuilt on load)
    /// Index: account name -> account ID
    #[serde(skip)]
    name_index: HashMap<String, String>,
    /// Index: exact remote -> mapping ID
    #[serde(skip)]
    exact_index: HashMap<String, String>,
}

impl StorageCache {
    /// Rebuild all secondary indexes from primary data
    pub(crate) fn rebuild_indexes(&mut self) {
        self.name_index.clear();
        self.exact_index.clear();

        for (id, account) in &self.accounts {
            self.name_index.insert(account.name.clone(), id.clone());
        }

        for (id, mapping) in &self.mappings {
            if let MatchRule::Exact(remote) = &mapping.rule {
                self.exact_index.insert(remote.clone(), id.clone());
            }
        }
    }

    pub(crate) fn accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        accounts
    }

    pub(crate) fn insert_account(&mut self, account: &Account) -> Result<(), StorageError> {
        if self.accounts.contains_key(&account.id) || self.name_index.contains_key(&account.name) {
            return Err(StorageError::AccountExists(account.name.clone()));
        }

        self.name_index.insert(account.name.clone(), account.id.clone());
        self.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    /// Remove an account and cascade to its mappings
    pub(crate) fn remove_account(&mut self, id: &str) -> Result<Vec<Mapping>, StorageError> {
        let account = self
            .accounts
            .remove(id)
            .ok_or_else(|| StorageError::AccountNotFound(id.to_string()))?;
        self.name_index.remove(&account.name);

        let orphaned: Vec<String> = self
            .mappings
            .values()
            .filter(|m| m.account_id == id)
            .map(|m| m.id.clone())
            .collect();

        let mut removed = Vec::with_capacity(orphaned.len());
        for mapping_id in orphaned {
            if let Some(mapping) = self.remove_mapping(&mapping_id) {
                removed.push(mapping);
            }
        }
        Ok(removed)
    }

    pub(crate) fn touch_account(&mut self, id: &str, at: DateTime<Utc>) -> Result<(), StorageError> {
        let account = self
            .accounts
            .get_mut(id)
            .ok_or_else(|| StorageError::AccountNotFound(id.to_string()))?;
        account.last_used_at = Some(at);
        Ok(())
    }

    pub(crate) fn mappings(&self) -> Vec<Mapping> {
        let mut mappings: Vec<Mapping> = self.mappings.values().cloned().collect();
        mappings.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        mappings
    }

    pub(crate) fn insert_mapping(&mut self, mapping: &Mapping, overwrite: bool) -> Result<Mapping, StorageError> {
        if !self.accounts.contains_key(&mapping.account_id) {
            return Err(StorageError::AccountNotFound(mapping.account_id.clone()));
        }

        if let MatchRule::Exact(remote) = &mapping.rule {
            if let Some(existing_id) = self.exact_index.get(remote).cloned() {
                let existing = self.mappings.get(&existing_id).cloned();
                match existing {
                    Some(existing) if existing.account_id == mapping.account_id => return Ok(existing),
                    Some(existing) if !overwrite => {
                        let existing_account = self
                            .accounts
                            .get(&existing.account_id)
                            .map(|a| a.name.clone())
                            .unwrap_or(existing.account_id);
                        return Err(StorageError::MappingConflict {
                            remote: remote.clone(),
                            existing_account,
                        });
                    }
                    _ => {
                        self.remove_mapping(&existing_id);
                    }
                }
            }
            self.exact_index.insert(remote.clone(), mapping.id.clone());
        }

        self.mappings.insert(mapping.id.clone(), mapping.clone());
        Ok(mapping.clone())
    }

    pub(crate) fn remove_mapping(&mut self, id: &str) -> Option<Mapping> {
        let mapping = self.mappings.remove(id)?;
        if let MatchRule::Exact(remote) = &mapping.rule {
            if self.exact_index.get(remote).map(String::as_str) == Some(id) {
                self.exact_index.remove(remote);
            }
        }
        Some(mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(remote: &str, account: &Account) -> Mapping {
        Mapping::new(MatchRule::Exact(remote.to_string()), &account.id)
    }

    #[test]
    fn test_duplicate_account_name() {
        let mut cache = StorageCache::default();
        cache.insert_account(&Account::new("work")).unwrap();

        let err = cache.insert_account(&Account::new("work")).unwrap_err();
        assert!(matches!(err, StorageError::AccountExists(name) if name == "work"));
    }

    #[test]
    fn test_exact_mapping_conflict() {
        let mut cache = StorageCache::default();
        let a = Account::new("a");
        let b = Account::new("b");
        cache.insert_account(&a).unwrap();
        cache.insert_account(&b).unwrap();

        let first = cache.insert_mapping(&exact("github.com/org/repo", &a), false).unwrap();

        // Same account is idempotent and keeps the original mapping
        let again = cache.insert_mapping(&exact("github.com/org/repo", &a), false).unwrap();
        assert_eq!(again.id, first.id);

        let err = cache.insert_mapping(&exact("github.com/org/repo", &b), false).unwrap_err();
        assert!(matches!(err, StorageError::MappingConflict { existing_account, .. } if existing_account == "a"));
        assert_eq!(cache.mappings().len(), 1);
        assert_eq!(cache.mappings()[0].account_id, a.id);

        let replaced = cache.insert_mapping(&exact("github.com/org/repo", &b), true).unwrap();
        assert_eq!(cache.mappings(), vec![replaced]);
    }

    #[test]
    fn test_mapping_requires_account() {
        let mut cache = StorageCache::default();
        let ghost = Account::new("ghost");

        let err = cache.insert_mapping(&exact("github.com/org/repo", &ghost), false).unwrap_err();
        assert!(matches!(err, StorageError::AccountNotFound(_)));
    }

    #[test]
    fn test_remove_account_cascades() {
        let mut cache = StorageCache::default();
        let a = Account::new("a");
        let b = Account::new("b");
        cache.insert_account(&a).unwrap();
        cache.insert_account(&b).unwrap();
        cache.insert_mapping(&exact("github.com/org/one", &a), false).unwrap();
        cache
            .insert_mapping(&Mapping::new(MatchRule::Pattern("github.com/org/*".into()), &a.id), false)
            .unwrap();
        let kept = cache.insert_mapping(&exact("github.com/org/two", &b), false).unwrap();

        let removed = cache.remove_account(&a.id).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(cache.mappings(), vec![kept]);

        // The exact index no longer blocks the remote
        cache.insert_mapping(&exact("github.com/org/one", &b), false).unwrap();
    }
}
