//! Encrypted file secret store
//!
//! All secrets are serialized together, sealed with AES-256-GCM, and
//! written next to the Argon2 salt in a small JSON envelope.

use super::{SecretError, SecretStore};
use crate::crypto::{generate_salt, open, seal, MasterKey, SealedBlob};
use crate::Secret;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::RwLock;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// Secret store persisted as a sealed file
pub struct EncryptedFileSecretStore {
    path: PathBuf,
    master_key: MasterKey,
    salt: Vec<u8>,
    /// Replaced only after the sealed file is written
    secrets: RwLock<HashMap<String, Secret>>,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

/// On-disk envelope
#[derive(Debug, Serialize, Deserialize)]
struct SecretFile {
    version: u32,
    salt: String,
    data: SealedBlob,
}

impl EncryptedFileSecretStore {
    /// Open the store, creating it if absent; fails on a wrong passphrase
    pub async fn open(path: impl AsRef<Path>, passphrase: &SecretString) -> Result<Self, SecretError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if path.exists() {
            let content = fs::read_to_string(&path).await?;
            let file: SecretFile =
                serde_json::from_str(&content).map_err(|e| SecretError::Serialization(e.to_string()))?;

            let salt = STANDARD
                .decode(&file.salt)
                .map_err(|e| SecretError::Serialization(format!("Invalid salt: {}", e)))?;
            let master_key = MasterKey::derive(passphrase, &salt)?;

            let plaintext = open(&file.data, &master_key)?;
            let secrets: HashMap<String, Secret> =
                serde_json::from_slice(&plaintext).map_err(|e| SecretError::Serialization(e.to_string()))?;

            Ok(Self {
                path,
                master_key,
                salt,
                secrets: RwLock::new(secrets),
                write_lock: Mutex::new(()),
            })
        } else {
            let salt = generate_salt();
            let master_key = MasterKey::derive(passphrase, &salt)?;
            let store = Self {
                path,
                master_key,
                salt,
                secrets: RwLock::new(HashMap::new()),
                write_lock: Mutex::new(()),
            };
            store.save(&HashMap::new()).await?;
            Ok(store)
        }
    }

    /// Apply `change` to a copy of the secrets, seal and write it, then publish it
    async fn commit(&self, change: impl FnOnce(&mut HashMap<String, Secret>) -> bool) -> Result<(), SecretError> {
        let _guard = self.write_lock.lock().await;

        let mut next = self.secrets.read().clone();
        if !change(&mut next) {
            return Ok(());
        }
        self.save(&next).await?;
        *self.secrets.write() = next;
        Ok(())
    }

    async fn save(&self, secrets: &HashMap<String, Secret>) -> Result<(), SecretError> {
        let plaintext = serde_json::to_vec(secrets).map_err(|e| SecretError::Serialization(e.to_string()))?;

        let file = SecretFile {
            version: 1,
            salt: STANDARD.encode(&self.salt),
            data: seal(&plaintext, &self.master_key)?,
        };
        let content =
            serde_json::to_string_pretty(&file).map_err(|e| SecretError::Serialization(e.to_string()))?;

        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, &content).await?;
        restrict_permissions(&temp_path).await?;
        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), SecretError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), SecretError> {
    Ok(())
}

#[async_trait]
impl SecretStore for EncryptedFileSecretStore {
    async fn get(&self, handle: &str) -> Result<Option<Secret>, SecretError> {
        Ok(self.secrets.read().get(handle).cloned())
    }

    async fn set(&self, handle: &str, secret: &Secret) -> Result<(), SecretError> {
        self.commit(|secrets| {
            secrets.insert(handle.to_string(), secret.clone());
            true
        })
        .await
    }

    async fn delete(&self, handle: &str) -> Result<(), SecretError> {
        self.commit(|secrets| secrets.remove(handle).is_some()).await
    }
}
