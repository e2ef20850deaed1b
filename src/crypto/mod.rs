//! Encryption at rest for the secret store
//!
//! AES-256-GCM with a key derived from a passphrase by Argon2.

mod seal;

pub use seal::{generate_salt, open, seal, CryptoError, MasterKey, SealedBlob};
