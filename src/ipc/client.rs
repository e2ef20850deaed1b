//! Client side of the coordinator socket

use super::protocol::{IpcRequest, IpcResponse, WatchEvent};
use super::IpcError;
use crate::activity::ActivityEvent;
use crate::coordinator::{PendingEntry, ResolvedCredential};
use crate::router::RemoteIdentity;
use crate::{Account, Mapping, MatchRule, Secret};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::UnixStream;

/// Extra time a resolving client waits beyond the coordinator-side bound
const RESOLVE_GRACE: Duration = Duration::from_secs(1);

/// Connects to a running coordinator
#[derive(Debug, Clone)]
pub struct IpcClient {
    path: PathBuf,
    timeout: Duration,
}

impl IpcClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Bound for requests that do not wait on a human
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    async fn connect(&self) -> Result<UnixStream, IpcError> {
        UnixStream::connect(&self.path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound | ErrorKind::ConnectionRefused => IpcError::NotRunning(self.path.clone()),
            _ => IpcError::Io(e),
        })
    }

    /// Send one request and wait for its response
    pub async fn request(&self, request: &IpcRequest) -> Result<IpcResponse, IpcError> {
        self.request_within(request, self.timeout).await
    }

    async fn request_within(&self, request: &IpcRequest, limit: Duration) -> Result<IpcResponse, IpcError> {
        let exchange = async {
            let stream = self.connect().await?;
            let (reader, mut writer) = stream.into_split();

            let mut line = serde_json::to_string(request).map_err(|e| IpcError::Protocol(e.to_string()))?;
            line.push('\n');
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;

            let mut reader = BufReader::new(reader);
            let mut response = String::new();
            if reader.read_line(&mut response).await? == 0 {
                return Err(IpcError::Closed);
            }
            serde_json::from_str(response.trim()).map_err(|e| IpcError::Protocol(e.to_string()))
        };

        tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| IpcError::Timeout)?
    }

    /// Ask the coordinator for credentials, blocking up to `wait`
    pub async fn resolve(
        &self,
        remote: &RemoteIdentity,
        protocol: Option<&str>,
        wait: Duration,
    ) -> Result<ResolvedCredential, IpcError> {
        let request = IpcRequest::Resolve {
            remote: remote.to_string(),
            protocol: protocol.map(str::to_string),
            wait_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
        };

        match self.request_within(&request, wait.saturating_add(RESOLVE_GRACE)).await? {
            IpcResponse::Resolved {
                account_id,
                username,
                secret,
            } => Ok(ResolvedCredential {
                account_id,
                username,
                secret,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Check that the coordinator answers; returns its version and pending count
    pub async fn ping(&self) -> Result<(String, usize), IpcError> {
        match self.request(&IpcRequest::Ping).await? {
            IpcResponse::Pong { version, pending } => Ok((version, pending)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_pending(&self) -> Result<Vec<PendingEntry>, IpcError> {
        match self.request(&IpcRequest::ListPending).await? {
            IpcResponse::Pending { entries } => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    pub async fn choose(&self, remote: &str, account: &str, remember: bool) -> Result<Account, IpcError> {
        let request = IpcRequest::Choose {
            remote: remote.to_string(),
            account: account.to_string(),
            remember,
        };
        match self.request(&request).await? {
            IpcResponse::Chosen { account } => Ok(account),
            other => Err(unexpected(other)),
        }
    }

    pub async fn cancel(&self, remote: &str) -> Result<usize, IpcError> {
        let request = IpcRequest::Cancel {
            remote: remote.to_string(),
        };
        match self.request(&request).await? {
            IpcResponse::Cancelled { released } => Ok(released),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>, IpcError> {
        match self.request(&IpcRequest::ListAccounts).await? {
            IpcResponse::Accounts { accounts } => Ok(accounts),
            other => Err(unexpected(other)),
        }
    }

    pub async fn add_account(&self, name: &str, secret: Secret) -> Result<Account, IpcError> {
        let request = IpcRequest::AddAccount {
            name: name.to_string(),
            secret,
        };
        match self.request(&request).await? {
            IpcResponse::AccountAdded { account } => Ok(account),
            other => Err(unexpected(other)),
        }
    }

    /// Remove an account; returns it and the number of mappings removed with it
    pub async fn remove_account(&self, account: &str) -> Result<(Account, usize), IpcError> {
        let request = IpcRequest::RemoveAccount {
            account: account.to_string(),
        };
        match self.request(&request).await? {
            IpcResponse::AccountRemoved {
                account,
                mappings_removed,
            } => Ok((account, mappings_removed)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_mappings(&self) -> Result<Vec<Mapping>, IpcError> {
        match self.request(&IpcRequest::ListMappings).await? {
            IpcResponse::Mappings { mappings } => Ok(mappings),
            other => Err(unexpected(other)),
        }
    }

    pub async fn add_mapping(&self, rule: MatchRule, account: &str, overwrite: bool) -> Result<Mapping, IpcError> {
        let request = IpcRequest::AddMapping {
            rule,
            account: account.to_string(),
            overwrite,
        };
        match self.request(&request).await? {
            IpcResponse::MappingAdded { mapping } => Ok(mapping),
            other => Err(unexpected(other)),
        }
    }

    pub async fn remove_mapping(&self, id: &str) -> Result<(), IpcError> {
        let request = IpcRequest::RemoveMapping { id: id.to_string() };
        match self.request(&request).await? {
            IpcResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn mark_used(&self, remote: &RemoteIdentity, username: Option<&str>) -> Result<Option<String>, IpcError> {
        let request = IpcRequest::MarkUsed {
            remote: remote.to_string(),
            username: username.map(str::to_string),
        };
        match self.request(&request).await? {
            IpcResponse::MarkedUsed { account_id } => Ok(account_id),
            other => Err(unexpected(other)),
        }
    }

    pub async fn report_activity(&self, event: ActivityEvent) -> Result<(), IpcError> {
        match self.request(&IpcRequest::Activity { event }).await? {
            IpcResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn shutdown(&self) -> Result<(), IpcError> {
        match self.request(&IpcRequest::Shutdown).await? {
            IpcResponse::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Open an event stream
    pub async fn subscribe(&self) -> Result<EventStream, IpcError> {
        let stream = self.connect().await?;
        let (reader, mut writer) = stream.into_split();

        let mut line = serde_json::to_string(&IpcRequest::Subscribe).map_err(|e| IpcError::Protocol(e.to_string()))?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;

        let mut events = EventStream {
            reader: BufReader::new(reader),
            _writer: writer,
            line: String::new(),
        };
        match events.read().await? {
            Some(IpcResponse::Subscribed) => Ok(events),
            Some(other) => Err(unexpected(other)),
            None => Err(IpcError::Closed),
        }
    }
}

/// Events pushed by the coordinator after `subscribe`
pub struct EventStream {
    reader: BufReader<OwnedReadHalf>,
    // Dropping the write half would end the subscription
    _writer: tokio::net::unix::OwnedWriteHalf,
    line: String,
}

impl EventStream {
    async fn read(&mut self) -> Result<Option<IpcResponse>, IpcError> {
        self.line.clear();
        if self.reader.read_line(&mut self.line).await? == 0 {
            return Ok(None);
        }
        serde_json::from_str(self.line.trim())
            .map(Some)
            .map_err(|e| IpcError::Protocol(e.to_string()))
    }

    /// Next event; `None` once the coordinator closes the stream
    pub async fn next(&mut self) -> Result<Option<WatchEvent>, IpcError> {
        loop {
            match self.read().await? {
                Some(IpcResponse::Event { event }) => return Ok(Some(event)),
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }
}

fn unexpected(response: IpcResponse) -> IpcError {
    match response {
        IpcResponse::Failed { reason, message } => IpcError::Failed { reason, message },
        IpcResponse::Error { message } => IpcError::Remote(message),
        _ => IpcError::UnexpectedResponse,
    }
}
