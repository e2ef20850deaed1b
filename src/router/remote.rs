//! Normalized remote identities
//!
//! A remote identity is `host[:port][/path]`: no scheme, no userinfo, host
//! lower-cased, path without leading or trailing slashes, `.git` suffix,
//! query or fragment. It is the key mappings are matched against.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Remote normalization errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote has no host")]
    MissingHost,

    #[error("invalid host: {0}")]
    InvalidHost(String),
}

/// Canonical, credential-free key for a git remote
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteIdentity(String);

impl RemoteIdentity {
    /// Build an identity from the `host` and `path` fields git sends
    pub fn from_parts(host: &str, path: Option<&str>) -> Result<Self, RemoteError> {
        let host = normalize_host(host)?;
        let path = path.map(normalize_path).unwrap_or_default();

        if path.is_empty() {
            Ok(Self(host))
        } else {
            Ok(Self(format!("{}/{}", host, path)))
        }
    }

    /// Parse a URL (`https://user@host/org/repo.git`), scp-style remote
    /// (`git@host:org/repo.git`) or an already bare identity (`host/org/repo`)
    pub fn parse(input: &str) -> Result<Self, RemoteError> {
        let input = input.trim();

        let rest = match input.split_once("://") {
            Some((_, rest)) => rest,
            None => {
                if let Some((host, path)) = split_scp(input) {
                    return Self::from_parts(host, Some(path));
                }
                input
            }
        };

        match rest.split_once('/') {
            Some((authority, path)) => Self::from_parts(authority, Some(path)),
            None => Self::from_parts(rest, None),
        }
    }

    /// The identity as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The host part, including any port
    pub fn host(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }
}

impl std::fmt::Display for RemoteIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize the remote part of a pattern rule like a remote identity
///
/// The scheme and userinfo are dropped and the host is lower-cased. Glob
/// metacharacters are left in place.
pub fn normalize_pattern(input: &str) -> Result<String, RemoteError> {
    let input = input.trim();

    let (authority, path) = match input.split_once("://") {
        Some((_, rest)) => rest.split_once('/').unwrap_or((rest, "")),
        None => split_scp(input).unwrap_or_else(|| input.split_once('/').unwrap_or((input, ""))),
    };

    let host = normalize_host(authority)?;
    let path = path
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    if path.is_empty() {
        Ok(host)
    } else {
        Ok(format!("{}/{}", host, path))
    }
}

/// Split `user@host:path` into host and path; `host:8080/path` is not scp-style
fn split_scp(input: &str) -> Option<(&str, &str)> {
    let (authority, path) = input.split_once(':')?;
    if authority.contains('/') {
        return None;
    }
    let port = path.split('/').next().unwrap_or_default();
    if port.contains('@') || (!port.is_empty() && port.chars().all(|c| c.is_ascii_digit())) {
        return None;
    }
    Some((authority, path))
}

fn strip_userinfo(value: &str) -> &str {
    match value.rsplit_once('@') {
        Some((_, rest)) => rest,
        None => value,
    }
}

fn normalize_host(host: &str) -> Result<String, RemoteError> {
    let host = strip_userinfo(host.trim()).trim_end_matches('.').to_lowercase();

    if host.is_empty() {
        return Err(RemoteError::MissingHost);
    }
    if host.contains(char::is_whitespace) || host.contains('/') {
        return Err(RemoteError::InvalidHost(host));
    }

    Ok(host)
}

fn normalize_path(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();

    let segments: Vec<&str> = path
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let mut joined = segments.join("/");
    if let Some(stripped) = joined.strip_suffix(".git") {
        joined = stripped.to_string();
    }
    joined
}
