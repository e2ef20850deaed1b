//! Authenticated encryption of secret blobs

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{password_hash::SaltString, Argon2, PasswordHasher};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretBox, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cryptographic errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),
}

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const SALT_SIZE: usize = 16;

/// A passphrase-derived key for sealing and opening blobs
pub struct MasterKey {
    key: SecretBox<[u8; KEY_SIZE]>,
}

impl MasterKey {
    /// Derive a key from a passphrase and salt with Argon2
    pub fn derive(passphrase: &SecretString, salt: &[u8]) -> Result<Self, CryptoError> {
        let salt_string = SaltString::encode_b64(salt)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

        let hash = Argon2::default()
            .hash_password(passphrase.expose_secret().as_bytes(), &salt_string)
            .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

        let output = hash
            .hash
            .ok_or_else(|| CryptoError::KeyDerivationFailed("No hash output".to_string()))?;
        let bytes = output.as_bytes();
        if bytes.len() < KEY_SIZE {
            return Err(CryptoError::KeyDerivationFailed(format!(
                "Hash output too short: {} bytes",
                bytes.len()
            )));
        }

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes[..KEY_SIZE]);
        Ok(Self {
            key: SecretBox::new(Box::new(key)),
        })
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(self.key.expose_secret().as_slice())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }
}

/// Ciphertext and its nonce, base64-encoded for JSON storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedBlob {
    pub nonce: String,
    pub ciphertext: String,
}

/// Generate a random salt for key derivation
pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Encrypt `plaintext` under a fresh random nonce
pub fn seal(plaintext: &[u8], key: &MasterKey) -> Result<SealedBlob, CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = key
        .cipher()?
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    Ok(SealedBlob {
        nonce: STANDARD.encode(nonce_bytes),
        ciphertext: STANDARD.encode(ciphertext),
    })
}

/// Decrypt a blob; fails on a wrong key or tampered data
pub fn open(blob: &SealedBlob, key: &MasterKey) -> Result<Vec<u8>, CryptoError> {
    let nonce_bytes = STANDARD
        .decode(&blob.nonce)
        .map_err(|e| CryptoError::DecryptionFailed(format!("Invalid nonce: {}", e)))?;

    if nonce_bytes.len() != NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed(format!(
            "Invalid nonce length: expected {}, got {}",
            NONCE_SIZE,
            nonce_bytes.len()
        )));
    }

    let ciphertext = STANDARD
        .decode(&blob.ciphertext)
        .map_err(|e| CryptoError::DecryptionFailed(format!("Invalid ciphertext: {}", e)))?;

    key.cipher()?
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed("wrong passphrase or corrupted data".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_and_open() {
        let salt = generate_salt();
        let key = MasterKey::derive(&SecretString::from("passphrase"), &salt).unwrap();

        let blob = seal(b"ghp_token", &key).unwrap();
        assert_ne!(blob.ciphertext, STANDARD.encode(b"ghp_token"));
        assert_eq!(open(&blob, &key).unwrap(), b"ghp_token");
    }

    #[test]
    fn test_wrong_key_fails() {
        let salt = generate_salt();
        let right = MasterKey::derive(&SecretString::from("right"), &salt).unwrap();
        let wrong = MasterKey::derive(&SecretString::from("wrong"), &salt).unwrap();

        let blob = seal(b"secret", &right).unwrap();
        assert!(matches!(open(&blob, &wrong), Err(CryptoError::DecryptionFailed(_))));
    }

    #[test]
    fn test_bad_nonce_rejected() {
        let key = MasterKey::derive(&SecretString::from("k"), &generate_salt()).unwrap();
        let mut blob = seal(b"secret", &key).unwrap();
        blob.nonce = STANDARD.encode([0u8; 4]);

        assert!(open(&blob, &key).is_err());
    }
}
