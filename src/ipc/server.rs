//! Unix socket server in front of the coordinator

use super::protocol::{FailureReason, IpcRequest, IpcResponse, WatchEvent};
use super::IpcError;
use crate::activity::ActivityFeed;
use crate::coordinator::{Coordinator, CoordinatorError};
use crate::router::RemoteIdentity;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};

/// Serves coordinator requests on a Unix socket
#[derive(Clone)]
pub struct IpcServer {
    coordinator: Arc<Coordinator>,
    activity: ActivityFeed,
    path: PathBuf,
    shutdown: Arc<Notify>,
}

impl IpcServer {
    pub fn new(coordinator: Arc<Coordinator>, activity: ActivityFeed, path: impl Into<PathBuf>) -> Self {
        Self {
            coordinator,
            activity,
            path: path.into(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Notify to stop the accept loop
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Create the socket, owner-only, replacing a stale one
    pub fn bind(&self) -> Result<UnixListener, IpcError> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| IpcError::Protocol(format!("invalid socket path: {}", self.path.display())))?;
        std::fs::create_dir_all(dir)?;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;

        if self.path.exists() {
            if std::os::unix::net::UnixStream::connect(&self.path).is_ok() {
                return Err(IpcError::AlreadyRunning(self.path.clone()));
            }
            debug!(path = %self.path.display(), "Removing stale socket");
            std::fs::remove_file(&self.path)?;
        }

        let listener = UnixListener::bind(&self.path)?;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        Ok(listener)
    }

    /// Bind and serve until shut down
    pub async fn run(self) -> Result<(), IpcError> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Accept connections until shut down, then cancel all pending selections
    pub async fn serve(self, listener: UnixListener) -> Result<(), IpcError> {
        let owner = std::fs::metadata(self.path.parent().unwrap_or(Path::new("/")))?.uid();
        info!(path = %self.path.display(), "Coordinator listening");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                accepted = listener.accept() => {
                    let stream = match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    match stream.peer_cred() {
                        Ok(cred) if cred.uid() == owner => {}
                        Ok(cred) => {
                            warn!(peer_uid = cred.uid(), "Rejected connection from another user");
                            continue;
                        }
                        Err(e) => {
                            warn!(error = %e, "Could not read peer credentials");
                            continue;
                        }
                    }

                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            debug!(error = %e, "Connection ended with error");
                        }
                    });
                }
            }
        }

        info!("Coordinator shutting down");
        self.coordinator.shutdown();
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove socket");
        }
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream) -> Result<(), IpcError> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                break;
            }

            let message = line.trim();
            if message.is_empty() {
                continue;
            }

            let request: IpcRequest = match serde_json::from_str(message) {
                Ok(request) => request,
                Err(e) => {
                    error!(error = %e, "Failed to parse IPC request");
                    let response = IpcResponse::Error {
                        message: format!("Parse error: {}", e),
                    };
                    write_message(&mut writer, &response).await?;
                    continue;
                }
            };

            match request {
                IpcRequest::Subscribe => {
                    write_message(&mut writer, &IpcResponse::Subscribed).await?;
                    return self.stream_events(reader, writer).await;
                }
                request => {
                    let response = self.dispatch(request).await;
                    write_message(&mut writer, &response).await?;
                }
            }
        }

        Ok(())
    }

    /// Forward coordinator and activity events until the peer hangs up
    async fn stream_events<R, W>(&self, mut reader: BufReader<R>, mut writer: W) -> Result<(), IpcError>
    where
        R: tokio::io::AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut coordinator_events = self.coordinator.subscribe();
        let mut activity_events = self.activity.subscribe();
        let mut sink = String::new();

        loop {
            let event = tokio::select! {
                received = coordinator_events.recv() => match received {
                    Ok(event) => WatchEvent::Coordinator(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                received = activity_events.recv() => match received {
                    Ok(event) => WatchEvent::Activity(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                read = reader.read_line(&mut sink) => {
                    // Subscribers do not send anything; EOF or an error ends the stream
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            sink.clear();
                            continue;
                        }
                    }
                }
            };

            write_message(&mut writer, &IpcResponse::Event { event }).await?;
        }

        Ok(())
    }

    async fn dispatch(&self, request: IpcRequest) -> IpcResponse {
        debug!(request = ?request, "Handling IPC request");

        match request {
            IpcRequest::Resolve {
                remote,
                protocol,
                wait_ms,
            } => {
                let remote = match RemoteIdentity::parse(&remote) {
                    Ok(remote) => remote,
                    Err(e) => return error_response(e),
                };
                let wait = Duration::from_millis(wait_ms);
                match self.coordinator.resolve(&remote, protocol.as_deref(), wait).await {
                    Ok(credential) => IpcResponse::Resolved {
                        account_id: credential.account_id,
                        username: credential.username,
                        secret: credential.secret,
                    },
                    Err(e) => {
                        info!(remote = %remote, error = %e, "Resolution failed");
                        IpcResponse::Failed {
                            reason: FailureReason::of(&e),
                            message: e.to_string(),
                        }
                    }
                }
            }
            IpcRequest::ListPending => IpcResponse::Pending {
                entries: self.coordinator.list_pending(),
            },
            IpcRequest::Choose {
                remote,
                account,
                remember,
            } => match RemoteIdentity::parse(&remote) {
                Ok(remote) => respond(
                    self.coordinator
                        .submit_selection(&remote, &account, remember)
                        .await
                        .map(|account| IpcResponse::Chosen { account }),
                ),
                Err(e) => error_response(e),
            },
            IpcRequest::Cancel { remote } => match RemoteIdentity::parse(&remote) {
                Ok(remote) => respond(
                    self.coordinator
                        .cancel(&remote)
                        .map(|released| IpcResponse::Cancelled { released }),
                ),
                Err(e) => error_response(e),
            },
            IpcRequest::ListAccounts => IpcResponse::Accounts {
                accounts: self.coordinator.list_accounts(),
            },
            IpcRequest::AddAccount { name, secret } => respond(
                self.coordinator
                    .add_account(&name, secret)
                    .await
                    .map(|account| IpcResponse::AccountAdded { account }),
            ),
            IpcRequest::RemoveAccount { account } => respond(
                self.coordinator
                    .remove_account(&account)
                    .await
                    .map(|(account, removed)| IpcResponse::AccountRemoved {
                        account,
                        mappings_removed: removed.len(),
                    }),
            ),
            IpcRequest::ListMappings => IpcResponse::Mappings {
                mappings: self.coordinator.list_mappings(),
            },
            IpcRequest::AddMapping {
                rule,
                account,
                overwrite,
            } => respond(
                self.coordinator
                    .add_mapping(rule, &account, overwrite)
                    .await
                    .map(|mapping| IpcResponse::MappingAdded { mapping }),
            ),
            IpcRequest::RemoveMapping { id } => {
                respond(self.coordinator.remove_mapping(&id).await.map(|_| IpcResponse::Ok))
            }
            IpcRequest::MarkUsed { remote, username } => match RemoteIdentity::parse(&remote) {
                Ok(remote) => respond(
                    self.coordinator
                        .mark_used(&remote, username.as_deref())
                        .await
                        .map(|account_id| IpcResponse::MarkedUsed { account_id }),
                ),
                Err(e) => error_response(e),
            },
            IpcRequest::Activity { event } => {
                self.activity.publish(event);
                IpcResponse::Ok
            }
            // Handled by the connection loop
            IpcRequest::Subscribe => IpcResponse::Subscribed,
            IpcRequest::Ping => match self.coordinator.health_check().await {
                Ok(()) => IpcResponse::Pong {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    pending: self.coordinator.list_pending().len(),
                },
                Err(e) => error_response(e),
            },
            IpcRequest::Shutdown => {
                self.shutdown.notify_one();
                IpcResponse::Ok
            }
        }
    }
}

fn respond(result: Result<IpcResponse, CoordinatorError>) -> IpcResponse {
    result.unwrap_or_else(error_response)
}

fn error_response(err: impl std::fmt::Display) -> IpcResponse {
    IpcResponse::Error {
        message: err.to_string(),
    }
}

async fn write_message<W>(writer: &mut W, response: &IpcResponse) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(response).map_err(|e| IpcError::Protocol(e.to_string()))?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
