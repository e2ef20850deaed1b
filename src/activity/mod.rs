//! Activity notices for display surfaces
//!
//! Credential helpers report what git asked for; the coordinator republishes
//! those notices to watchers and, optionally, appends them to an audit file.
//! Nothing here sits on the resolution path: publishing never blocks and a
//! failing sink only logs a warning.

use crate::router::RemoteIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What git was doing when it called the helper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// git asked for credentials
    Lookup,
    /// git reported the credentials worked
    Accepted,
    /// git reported the credentials were rejected
    Rejected,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Lookup => write!(f, "lookup"),
            Operation::Accepted => write!(f, "accepted"),
            Operation::Rejected => write!(f, "rejected"),
        }
    }
}

/// A display-only activity notice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub at: DateTime<Utc>,
    /// Working directory of the git process, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<PathBuf>,
    pub operation: Operation,
    pub remote: RemoteIdentity,
}

impl ActivityEvent {
    pub fn new(operation: Operation, remote: RemoteIdentity) -> Self {
        Self {
            at: Utc::now(),
            repository: None,
            operation,
            remote,
        }
    }

    pub fn with_repository(mut self, repository: impl Into<PathBuf>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    /// One human-readable line
    pub fn describe(&self) -> String {
        match &self.repository {
            Some(repo) => format!("{} {} ({})", self.operation, self.remote, repo.display()),
            None => format!("{} {}", self.operation, self.remote),
        }
    }
}

/// Fan-out of activity notices to any number of watchers
#[derive(Clone)]
pub struct ActivityFeed {
    tx: broadcast::Sender<ActivityEvent>,
}

impl ActivityFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish a notice; dropped silently when nobody listens
    pub fn publish(&self, event: ActivityEvent) {
        debug!(operation = %event.operation, remote = %event.remote, "Activity");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEvent> {
        self.tx.subscribe()
    }
}

impl Default for ActivityFeed {
    fn default() -> Self {
        Self::new(128)
    }
}

/// Appends activity notices to an audit file as JSON lines
pub struct ActivityObserver {
    stop: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl ActivityObserver {
    /// Start recording notices published on `feed` from now on
    pub fn start(feed: &ActivityFeed, audit_file: impl Into<PathBuf>) -> Self {
        let audit_file = audit_file.into();
        let stop = Arc::new(Notify::new());
        let mut rx = feed.subscribe();

        let handle = tokio::spawn({
            let stop = stop.clone();
            async move {
                info!(path = %audit_file.display(), "Activity observer started");
                loop {
                    tokio::select! {
                        _ = stop.notified() => break,
                        received = rx.recv() => match received {
                            Ok(event) => {
                                if let Err(e) = append(&audit_file, &event).await {
                                    warn!(path = %audit_file.display(), error = %e, "Failed to record activity");
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "Activity observer fell behind");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
                debug!("Activity observer stopped");
            }
        });

        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop recording and wait for the writer to finish
    pub async fn stop(mut self) {
        self.stop.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ActivityObserver {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn append(path: &Path, event: &ActivityEvent) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut line = serde_json::to_string(event).map_err(std::io::Error::other)?;
    line.push('\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}
