//! git credential helper wire format
//!
//! git writes `key=value` lines to the helper's stdin and ends the request
//! with a blank line or EOF. For `get` the helper answers with
//! `username=...` and `password=...` lines on stdout.

use super::ProtocolError;
use crate::router::RemoteIdentity;
use std::io::{BufRead, Write};
use std::str::FromStr;

/// The operation git asked the helper to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialAction {
    Get,
    Store,
    Erase,
}

impl FromStr for CredentialAction {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get" => Ok(CredentialAction::Get),
            "store" => Ok(CredentialAction::Store),
            "erase" => Ok(CredentialAction::Erase),
            other => Err(ProtocolError::UnknownAction(other.to_string())),
        }
    }
}

impl std::fmt::Display for CredentialAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialAction::Get => write!(f, "get"),
            CredentialAction::Store => write!(f, "store"),
            CredentialAction::Erase => write!(f, "erase"),
        }
    }
}

/// Attributes of a credential request
///
/// Keys the helper has no use for (`password`, `capability[]`, `wwwauth[]`,
/// ...) are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialInput {
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub path: Option<String>,
    pub username: Option<String>,
    pub url: Option<String>,
}

impl CredentialInput {
    /// Read attributes up to the first blank line
    pub fn parse<R: BufRead>(reader: R) -> Result<Self, ProtocolError> {
        let mut input = Self::default();

        for line in reader.lines() {
            let line = line?;
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                break;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| ProtocolError::Malformed(line.to_string()))?;
            let value = Some(value.to_string());

            match key {
                "protocol" => input.protocol = value,
                "host" => input.host = value,
                "path" => input.path = value,
                "username" => input.username = value,
                "url" => input.url = value,
                _ => {}
            }
        }

        Ok(input)
    }

    /// The protocol hint, from `protocol` or the scheme of `url`
    pub fn protocol(&self) -> Option<&str> {
        self.protocol
            .as_deref()
            .or_else(|| self.url.as_deref().and_then(|url| split_url(url).0))
            .filter(|p| !p.is_empty())
    }

    /// Normalized remote; explicit `host`/`path` override parts of `url`
    pub fn remote(&self) -> Result<RemoteIdentity, ProtocolError> {
        let (_, url_host, url_path) = self
            .url
            .as_deref()
            .map(split_url)
            .unwrap_or((None, None, None));

        let host = self
            .host
            .as_deref()
            .or(url_host)
            .filter(|h| !h.trim().is_empty())
            .ok_or(ProtocolError::Incomplete("host"))?;
        let path = self.path.as_deref().or(url_path);

        Ok(RemoteIdentity::from_parts(host, path)?)
    }
}

/// Split a URL into scheme, authority and path
fn split_url(url: &str) -> (Option<&str>, Option<&str>, Option<&str>) {
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, url),
    };
    match rest.split_once('/') {
        Some((host, path)) => (scheme, Some(host), Some(path)),
        None => (scheme, Some(rest), None),
    }
}

/// Write the answer to a `get` request
pub fn write_credentials<W: Write>(out: &mut W, username: &str, password: &str) -> Result<(), ProtocolError> {
    if username.contains(['\n', '\0']) {
        return Err(ProtocolError::InvalidValue("username"));
    }
    if password.contains(['\n', '\0']) {
        return Err(ProtocolError::InvalidValue("password"));
    }

    writeln!(out, "username={}", username)?;
    writeln!(out, "password={}", password)?;
    out.flush()?;
    Ok(())
}
