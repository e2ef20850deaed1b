//! git credential helper endpoint
//!
//! git spawns `gitswitch credential-helper <action>` for every credential
//! request. The endpoint parses the request, asks the coordinator, and
//! answers on stdout. It never blocks longer than its configured wait.

mod endpoint;
mod install;
mod protocol;

pub use endpoint::Endpoint;
pub use install::{helper_command, HelperInstaller, InstallError, InstallStatus};
pub use protocol::{write_credentials, CredentialAction, CredentialInput};

use crate::ipc::IpcError;
use crate::router::RemoteError;
use thiserror::Error;

/// Malformed or incomplete credential requests
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown credential action: {0}")]
    UnknownAction(String),

    #[error("malformed credential line: {0}")]
    Malformed(String),

    #[error("credential request has no {0}")]
    Incomplete(&'static str),

    #[error("invalid remote: {0}")]
    Remote(#[from] RemoteError),

    #[error("{0} contains a newline")]
    InvalidValue(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Credential helper errors
#[derive(Error, Debug)]
pub enum HelperError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Install(#[from] InstallError),
}
