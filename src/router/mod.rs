//! Remote normalization and account resolution
//!
//! Handles:
//! - Normalizing git remotes into a matching key
//! - Exact and pattern rule matching
//! - Deciding which account applies to a remote

mod matcher;
mod remote;
mod resolver;

pub use matcher::{literal_prefix_len, PatternRule};
pub use remote::{normalize_pattern, RemoteError, RemoteIdentity};
pub use resolver::{resolve, Ambiguity, Resolution};
