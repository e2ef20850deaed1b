//! Local IPC between credential helpers, management commands and the coordinator
//!
//! The coordinator listens on a Unix domain socket that only its own user
//! can reach. Each connection carries newline-delimited JSON requests.

mod client;
mod protocol;
mod server;

pub use client::{EventStream, IpcClient};
pub use protocol::{FailureReason, IpcRequest, IpcResponse, WatchEvent};
pub use server::IpcServer;

use std::path::PathBuf;
use thiserror::Error;

/// IPC errors
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("coordinator is not running (no socket at {0})")]
    NotRunning(PathBuf),

    #[error("another coordinator is already listening on {0}")]
    AlreadyRunning(PathBuf),

    #[error("IPC I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed IPC message: {0}")]
    Protocol(String),

    #[error("coordinator closed the connection")]
    Closed,

    #[error("timed out waiting for the coordinator")]
    Timeout,

    #[error("{message}")]
    Failed {
        reason: FailureReason,
        message: String,
    },

    #[error("{0}")]
    Remote(String),

    #[error("unexpected response from coordinator")]
    UnexpectedResponse,
}
