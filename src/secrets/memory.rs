use super::{SecretError, SecretStore};
use crate::Secret;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Secrets held in process memory only
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<String, Secret>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, handle: &str) -> Result<Option<Secret>, SecretError> {
        Ok(self.secrets.read().get(handle).cloned())
    }

    async fn set(&self, handle: &str, secret: &Secret) -> Result<(), SecretError> {
        self.secrets.write().insert(handle.to_string(), secret.clone());
        Ok(())
    }

    async fn delete(&self, handle: &str) -> Result<(), SecretError> {
        self.secrets.write().remove(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemorySecretStore::new();
        assert!(store.get("account:1").await.unwrap().is_none());

        store.set("account:1", &Secret::new("token")).await.unwrap();
        assert_eq!(store.get("account:1").await.unwrap().unwrap().expose(), "token");

        store.delete("account:1").await.unwrap();
        store.delete("account:1").await.unwrap();
        assert!(store.get("account:1").await.unwrap().is_none());
    }
}
