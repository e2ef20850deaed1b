//! Credential resolution coordinator
//!
//! The coordinator owns the in-memory view of accounts and mappings, the
//! pending selection table, and the only write path to both stores.
//! Credential requests are resolved against a snapshot; requests that need a
//! human are parked until a choice arrives, the deadline passes, or the
//! coordinator shuts down.

mod pending;

pub use pending::{CredentialRequest, Release, SelectionView};

use crate::router::{normalize_pattern, resolve, Ambiguity, PatternRule, RemoteIdentity, Resolution};
use crate::secrets::{SecretError, SecretStore};
use crate::storage::{StorageBackend, StorageError};
use crate::{Account, Mapping, MatchRule, Secret};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use pending::PendingTable;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Coordinator errors
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("no accounts configured; add one with `gitswitch account add`")]
    NoAccountsConfigured,

    #[error("no account was chosen for {0} in time")]
    ResolutionTimeout(RemoteIdentity),

    #[error("account selection for {0} was cancelled")]
    ResolutionCancelled(RemoteIdentity),

    #[error("no token stored for account {0}; re-authenticate it")]
    TokenUnavailable(String),

    #[error("{remote} is already mapped to account {existing_account}")]
    MappingConflict {
        remote: String,
        existing_account: String,
    },

    #[error("several accounts apply to {0} and interactive selection is disabled")]
    ResolverAmbiguous(RemoteIdentity),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("mapping not found: {0}")]
    MappingNotFound(String),

    #[error("no pending selection for {0}")]
    NoPendingSelection(RemoteIdentity),

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("account name must not be empty")]
    InvalidAccountName,

    #[error("coordinator is shutting down")]
    ShuttingDown,

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("secret store error: {0}")]
    Secrets(#[from] SecretError),
}

impl From<StorageError> for CoordinatorError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::MappingConflict {
                remote,
                existing_account,
            } => CoordinatorError::MappingConflict {
                remote,
                existing_account,
            },
            StorageError::AccountNotFound(id) => CoordinatorError::AccountNotFound(id),
            StorageError::MappingNotFound(id) => CoordinatorError::MappingNotFound(id),
            other => CoordinatorError::Storage(other),
        }
    }
}

/// Longest any selection may stay open, whatever the caller asks for
pub const MAX_SELECTION_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Policy knobs for resolution
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Upper bound on how long a selection stays open
    pub pending_timeout: Duration,
    /// Use the only configured account for unmapped remotes without asking
    pub single_account_shortcut: bool,
    /// Park ambiguous requests for a human; when false they fail at once
    pub interactive: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            pending_timeout: Duration::from_secs(30),
            single_account_shortcut: true,
            interactive: true,
        }
    }
}

/// Credentials handed back to a credential helper
#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub account_id: String,
    pub username: String,
    pub secret: Secret,
}

/// An account offered for a pending selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub account_id: String,
    pub name: String,
    /// The resolver pointed at this account
    pub suggested: bool,
}

/// A remote waiting for a human choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEntry {
    pub remote: RemoteIdentity,
    pub protocol: Option<String>,
    pub earliest_arrival: DateTime<Utc>,
    /// Number of coalesced credential requests
    pub waiting: usize,
    pub candidates: Vec<Candidate>,
}

/// State changes published to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    SelectionOpened {
        remote: RemoteIdentity,
        protocol: Option<String>,
    },
    SelectionResolved {
        remote: RemoteIdentity,
        account_id: String,
        remembered: bool,
        released: usize,
    },
    SelectionTimedOut {
        remote: RemoteIdentity,
        released: usize,
    },
    SelectionCancelled {
        remote: RemoteIdentity,
        released: usize,
    },
    AccountAdded {
        account_id: String,
        name: String,
    },
    AccountRemoved {
        account_id: String,
        mappings_removed: usize,
    },
    MappingAdded {
        mapping: Mapping,
    },
    MappingRemoved {
        mapping_id: String,
    },
}

#[derive(Default)]
struct Snapshot {
    accounts: Vec<Account>,
    mappings: Vec<Mapping>,
}

impl Snapshot {
    fn find_account(&self, reference: &str) -> Option<&Account> {
        self.accounts
            .iter()
            .find(|a| a.id == reference)
            .or_else(|| self.accounts.iter().find(|a| a.name == reference))
    }
}

enum Decision {
    Immediate(Account),
    Prompt(Vec<String>),
}

/// The long-lived resolution coordinator
pub struct Coordinator {
    storage: Arc<dyn StorageBackend>,
    secrets: Arc<dyn SecretStore>,
    settings: CoordinatorSettings,
    snapshot: RwLock<Arc<Snapshot>>,
    pending: Mutex<PendingTable>,
    /// Single mutation path for both stores
    writer: tokio::sync::Mutex<()>,
    events: broadcast::Sender<CoordinatorEvent>,
    shutting_down: AtomicBool,
}

impl Coordinator {
    /// Create a coordinator and load the initial snapshot from storage
    pub async fn load(
        storage: Arc<dyn StorageBackend>,
        secrets: Arc<dyn SecretStore>,
        settings: CoordinatorSettings,
    ) -> Result<Self, CoordinatorError> {
        let (events, _) = broadcast::channel(64);
        let coordinator = Self {
            storage,
            secrets,
            settings,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            pending: Mutex::new(PendingTable::default()),
            writer: tokio::sync::Mutex::new(()),
            events,
            shutting_down: AtomicBool::new(false),
        };
        coordinator.refresh().await?;
        Ok(coordinator)
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CoordinatorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    /// Reload accounts and mappings from storage; callers hold the writer lock
    async fn refresh(&self) -> Result<(), CoordinatorError> {
        let accounts = self.storage.list_accounts().await?;
        let mappings = self.storage.list_mappings().await?;
        *self.snapshot.write() = Arc::new(Snapshot { accounts, mappings });
        Ok(())
    }

    /// Resolve the credentials for a remote, waiting for a human if needed
    ///
    /// `wait` bounds how long this caller is willing to block. A selection
    /// opened by this call closes at `min(wait, pending_timeout)`; requests
    /// joining an open selection share its deadline.
    pub async fn resolve(
        &self,
        remote: &RemoteIdentity,
        protocol: Option<&str>,
        wait: Duration,
    ) -> Result<ResolvedCredential, CoordinatorError> {
        let request = CredentialRequest::new(remote.clone(), protocol.map(str::to_string));
        let bound = wait.min(self.settings.pending_timeout).min(MAX_SELECTION_WAIT);
        let deadline = Instant::now() + bound;

        // Decide and park under the table lock so a concurrent choice is
        // either visible in the snapshot or releases this request
        let parked = {
            let mut table = self.pending.lock();
            // Checked under the table lock so nothing joins after shutdown drains it
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(CoordinatorError::ShuttingDown);
            }
            match self.decide(remote, &self.current())? {
                Decision::Immediate(account) => Err(account),
                Decision::Prompt(suggested) => Ok(table.join(request, deadline, suggested)),
            }
        };
        let ticket = match parked {
            Ok(ticket) => ticket,
            Err(account) => {
                debug!(remote = %remote, account = %account.id, "Resolved without prompting");
                return self.credential_for(&account).await;
            }
        };

        if ticket.opened {
            info!(remote = %remote, request = %ticket.request_id, "Waiting for account selection");
            self.emit(CoordinatorEvent::SelectionOpened {
                remote: remote.clone(),
                protocol: protocol.map(str::to_string),
            });
        } else {
            debug!(remote = %remote, request = %ticket.request_id, "Joined pending selection");
        }

        let mut rx = ticket.rx;
        let release = match tokio::time::timeout_at(ticket.deadline, &mut rx).await {
            Ok(release) => release,
            Err(_) => {
                let expired = self.pending.lock().expire(remote, ticket.selection_id, Instant::now());
                if let Some(released) = expired {
                    info!(remote = %remote, released, "Account selection timed out");
                    self.emit(CoordinatorEvent::SelectionTimedOut {
                        remote: remote.clone(),
                        released,
                    });
                }
                // Either expired above, already released, or being committed
                rx.await
            }
        };

        match release {
            Ok(Release::Resolved(account)) => self.credential_for(&account).await,
            Ok(Release::TimedOut) => Err(CoordinatorError::ResolutionTimeout(remote.clone())),
            Ok(Release::Cancelled) | Err(_) => Err(CoordinatorError::ResolutionCancelled(remote.clone())),
        }
    }

    fn decide(&self, remote: &RemoteIdentity, snapshot: &Snapshot) -> Result<Decision, CoordinatorError> {
        let outcome = resolve(remote, &snapshot.mappings, &snapshot.accounts);

        let suggested = match outcome {
            Resolution::Unique(account) => return Ok(Decision::Immediate(account.clone())),
            _ if snapshot.accounts.is_empty() => return Err(CoordinatorError::NoAccountsConfigured),
            Resolution::Ambiguous {
                candidates,
                reason: Ambiguity::SoleAccountUnmapped,
            } => {
                if let ([only], true) = (candidates.as_slice(), self.settings.single_account_shortcut) {
                    return Ok(Decision::Immediate((*only).clone()));
                }
                candidates.iter().map(|a| a.id.clone()).collect()
            }
            Resolution::Ambiguous { candidates, .. } => candidates.iter().map(|a| a.id.clone()).collect(),
            Resolution::NotFound => Vec::new(),
        };

        if !self.settings.interactive {
            return Err(CoordinatorError::ResolverAmbiguous(remote.clone()));
        }
        Ok(Decision::Prompt(suggested))
    }

    async fn credential_for(&self, account: &Account) -> Result<ResolvedCredential, CoordinatorError> {
        let secret = match self.secrets.get(&account.secret_handle).await {
            Ok(Some(secret)) => secret,
            Ok(None) => return Err(CoordinatorError::TokenUnavailable(account.name.clone())),
            Err(e) => {
                warn!(account = %account.id, error = %e, "Secret store lookup failed");
                return Err(CoordinatorError::TokenUnavailable(account.name.clone()));
            }
        };

        Ok(ResolvedCredential {
            account_id: account.id.clone(),
            username: account.name.clone(),
            secret,
        })
    }

    /// Answer a pending selection
    ///
    /// With `remember`, an exact mapping for the remote is written first
    /// (replacing any exact mapping to another account); if that write fails
    /// the selection stays open and the error is returned.
    pub async fn submit_selection(
        &self,
        remote: &RemoteIdentity,
        account_ref: &str,
        remember: bool,
    ) -> Result<Account, CoordinatorError> {
        let _writer = self.writer.lock().await;

        let account = self
            .current()
            .find_account(account_ref)
            .cloned()
            .ok_or_else(|| CoordinatorError::AccountNotFound(account_ref.to_string()))?;

        let selection_id = self
            .pending
            .lock()
            .begin_commit(remote)
            .ok_or_else(|| CoordinatorError::NoPendingSelection(remote.clone()))?;

        let mut remembered = None;
        if remember {
            let mapping = Mapping::new(MatchRule::exact(remote), &account.id).remembered();
            let written = match self.storage.create_mapping(&mapping, true).await {
                Ok(written) => self.refresh().await.map(|_| written),
                Err(e) => Err(e.into()),
            };

            match written {
                Ok(written) => remembered = Some(written),
                Err(e) => {
                    let expired = self.pending.lock().abort_commit(remote, selection_id, Instant::now());
                    if let Some(released) = expired {
                        self.emit(CoordinatorEvent::SelectionTimedOut {
                            remote: remote.clone(),
                            released,
                        });
                    }
                    warn!(remote = %remote, error = %e, "Failed to remember account choice");
                    return Err(e);
                }
            }
        }

        let released = self.pending.lock().finish(remote, selection_id, &account);
        info!(
            remote = %remote,
            account = %account.id,
            remember,
            released,
            "Account selected"
        );

        if let Some(mapping) = remembered {
            self.emit(CoordinatorEvent::MappingAdded { mapping });
        }
        self.emit(CoordinatorEvent::SelectionResolved {
            remote: remote.clone(),
            account_id: account.id.clone(),
            remembered: remember,
            released,
        });

        Ok(account)
    }

    /// Fail every request waiting on a remote; no mapping is written
    pub fn cancel(&self, remote: &RemoteIdentity) -> Result<usize, CoordinatorError> {
        let released = self
            .pending
            .lock()
            .cancel(remote)
            .ok_or_else(|| CoordinatorError::NoPendingSelection(remote.clone()))?;

        info!(remote = %remote, released, "Account selection cancelled");
        self.emit(CoordinatorEvent::SelectionCancelled {
            remote: remote.clone(),
            released,
        });
        Ok(released)
    }

    /// Cancel every open selection and refuse new requests
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let drained = self.pending.lock().drain();
        for (remote, released) in drained {
            info!(remote = %remote, released, "Cancelled pending selection on shutdown");
            self.emit(CoordinatorEvent::SelectionCancelled { remote, released });
        }
    }

    /// Remotes waiting for a choice, earliest first, with every known account
    pub fn list_pending(&self) -> Vec<PendingEntry> {
        let (views, swept) = {
            let mut table = self.pending.lock();
            let swept = table.sweep(Instant::now());
            (table.views(), swept)
        };
        for (remote, released) in swept {
            self.emit(CoordinatorEvent::SelectionTimedOut { remote, released });
        }

        let snapshot = self.current();
        views
            .into_iter()
            .map(|view| {
                let candidates: Vec<Candidate> = view
                    .suggested
                    .iter()
                    .filter_map(|id| snapshot.accounts.iter().find(|a| &a.id == id))
                    .chain(snapshot.accounts.iter().filter(|a| !view.suggested.contains(&a.id)))
                    .map(|account| Candidate {
                        account_id: account.id.clone(),
                        name: account.name.clone(),
                        suggested: view.suggested.contains(&account.id),
                    })
                    .collect();

                PendingEntry {
                    remote: view.remote,
                    protocol: view.protocol,
                    earliest_arrival: view.earliest_arrival,
                    waiting: view.waiting,
                    candidates,
                }
            })
            .collect()
    }

    /// Accounts, oldest first
    pub fn list_accounts(&self) -> Vec<Account> {
        self.current().accounts.clone()
    }

    /// Look up an account by id or display name
    pub fn find_account(&self, reference: &str) -> Option<Account> {
        self.current().find_account(reference).cloned()
    }

    /// Create an account and store its token
    pub async fn add_account(&self, name: &str, secret: Secret) -> Result<Account, CoordinatorError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoordinatorError::InvalidAccountName);
        }

        let _writer = self.writer.lock().await;
        let account = Account::new(name);

        self.secrets.set(&account.secret_handle, &secret).await?;
        if let Err(e) = self.storage.create_account(&account).await {
            if let Err(cleanup) = self.secrets.delete(&account.secret_handle).await {
                warn!(account = %account.id, error = %cleanup, "Failed to discard token of unsaved account");
            }
            return Err(e.into());
        }
        self.refresh().await?;

        info!(account = %account.id, name = %account.name, "Account added");
        self.emit(CoordinatorEvent::AccountAdded {
            account_id: account.id.clone(),
            name: account.name.clone(),
        });
        Ok(account)
    }

    /// Remove an account, its mappings and its token
    pub async fn remove_account(&self, reference: &str) -> Result<(Account, Vec<Mapping>), CoordinatorError> {
        let _writer = self.writer.lock().await;

        let account = self
            .current()
            .find_account(reference)
            .cloned()
            .ok_or_else(|| CoordinatorError::AccountNotFound(reference.to_string()))?;

        let removed = self.storage.delete_account(&account.id).await?;
        if let Err(e) = self.secrets.delete(&account.secret_handle).await {
            warn!(account = %account.id, error = %e, "Failed to delete account token");
        }
        self.refresh().await?;

        info!(account = %account.id, mappings = removed.len(), "Account removed");
        self.emit(CoordinatorEvent::AccountRemoved {
            account_id: account.id.clone(),
            mappings_removed: removed.len(),
        });
        Ok((account, removed))
    }

    /// Mappings, oldest first
    pub fn list_mappings(&self) -> Vec<Mapping> {
        self.current().mappings.clone()
    }

    /// Create a mapping to an account referenced by id or display name
    ///
    /// Exact rules are normalized before storing; pattern rules get the same
    /// treatment for their host and scheme. An exact rule for a remote
    /// that already maps to another account fails with `MappingConflict`
    /// unless `overwrite` is set.
    pub async fn add_mapping(
        &self,
        rule: MatchRule,
        account_ref: &str,
        overwrite: bool,
    ) -> Result<Mapping, CoordinatorError> {
        let rule = validate_rule(rule)?;
        let _writer = self.writer.lock().await;

        let account = self
            .current()
            .find_account(account_ref)
            .cloned()
            .ok_or_else(|| CoordinatorError::AccountNotFound(account_ref.to_string()))?;

        let mapping = self
            .storage
            .create_mapping(&Mapping::new(rule, &account.id), overwrite)
            .await?;
        self.refresh().await?;

        info!(mapping = %mapping.id, rule = %mapping.rule, account = %account.id, "Mapping added");
        self.emit(CoordinatorEvent::MappingAdded {
            mapping: mapping.clone(),
        });
        Ok(mapping)
    }

    /// Delete a mapping
    pub async fn remove_mapping(&self, id: &str) -> Result<(), CoordinatorError> {
        let _writer = self.writer.lock().await;

        self.storage.delete_mapping(id).await?;
        self.refresh().await?;

        info!(mapping = %id, "Mapping removed");
        self.emit(CoordinatorEvent::MappingRemoved {
            mapping_id: id.to_string(),
        });
        Ok(())
    }

    /// Stamp `last_used_at` on the account git reported using for a remote
    ///
    /// The account is picked by display name when git sent a username,
    /// otherwise by an unambiguous mapping. Returns the stamped account id.
    pub async fn mark_used(
        &self,
        remote: &RemoteIdentity,
        username: Option<&str>,
    ) -> Result<Option<String>, CoordinatorError> {
        let snapshot = self.current();
        let account = match username {
            Some(name) => snapshot.accounts.iter().find(|a| a.name == name),
            None => match resolve(remote, &snapshot.mappings, &snapshot.accounts) {
                Resolution::Unique(account) => Some(account),
                _ => None,
            },
        };
        let Some(account) = account else {
            return Ok(None);
        };
        let account_id = account.id.clone();

        let _writer = self.writer.lock().await;
        self.storage.touch_account(&account_id, Utc::now()).await?;
        self.refresh().await?;

        debug!(remote = %remote, account = %account_id, "Marked account as used");
        Ok(Some(account_id))
    }

    /// Check that the stores are reachable; answered on `Ping`
    pub async fn health_check(&self) -> Result<(), CoordinatorError> {
        self.storage.health_check().await?;
        Ok(())
    }
}

fn validate_rule(rule: MatchRule) -> Result<MatchRule, CoordinatorError> {
    match rule {
        MatchRule::Exact(text) => RemoteIdentity::parse(&text)
            .map(|remote| MatchRule::exact(&remote))
            .map_err(|e| CoordinatorError::InvalidRule(format!("{}: {}", text, e))),
        MatchRule::Pattern(raw) => {
            if raw.trim().is_empty() {
                return Err(CoordinatorError::InvalidRule("empty pattern".to_string()));
            }
            let text = normalize_pattern(&raw).map_err(|e| CoordinatorError::InvalidRule(format!("{}: {}", raw, e)))?;
            PatternRule::new(&text)
                .map(|_| MatchRule::Pattern(text.clone()))
                .map_err(|e| CoordinatorError::InvalidRule(format!("{}: {}", text, e)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::MemorySecretStore;
    use crate::storage::{FileStorage, MemoryStorage};

    fn remote(s: &str) -> RemoteIdentity {
        RemoteIdentity::parse(s).unwrap()
    }

    async fn coordinator(settings: CoordinatorSettings) -> Arc<Coordinator> {
        let storage = Arc::new(MemoryStorage::new());
        let secrets = Arc::new(MemorySecretStore::new());
        Arc::new(Coordinator::load(storage, secrets, settings).await.unwrap())
    }

    fn quick(timeout: Duration) -> CoordinatorSettings {
        CoordinatorSettings {
            pending_timeout: timeout,
            ..CoordinatorSettings::default()
        }
    }

    async fn wait_for_waiters(coordinator: &Coordinator, remote: &RemoteIdentity, n: usize) {
        for _ in 0..500 {
            let waiting = coordinator
                .list_pending()
                .iter()
                .find(|e| &e.remote == remote)
                .map(|e| e.waiting)
                .unwrap_or(0);
            if waiting == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} waiters never arrived for {}", n, remote);
    }

    #[tokio::test]
    async fn test_unique_mapping_resolves_immediately() {
        let c = coordinator(CoordinatorSettings::default()).await;
        let a = c.add_account("alice", Secret::new("tok-a")).await.unwrap();
        c.add_account("bob", Secret::new("tok-b")).await.unwrap();
        c.add_mapping(MatchRule::Exact("https://github.com/org/repo.git".into()), "alice", false)
            .await
            .unwrap();

        let cred = c
            .resolve(&remote("github.com/org/repo"), Some("https"), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(cred.account_id, a.id);
        assert_eq!(cred.username, "alice");
        assert_eq!(cred.secret.expose(), "tok-a");
        assert!(c.list_pending().is_empty());
    }

    #[tokio::test]
    async fn test_no_accounts_fails_fast() {
        let c = coordinator(CoordinatorSettings::default()).await;
        let result = c
            .resolve(&remote("github.com/org/repo"), None, Duration::from_secs(5))
            .await;

        assert!(matches!(result, Err(CoordinatorError::NoAccountsConfigured)));
        assert!(c.list_pending().is_empty());
    }

    #[tokio::test]
    async fn test_single_account_shortcut() {
        let c = coordinator(CoordinatorSettings::default()).await;
        let only = c.add_account("solo", Secret::new("tok")).await.unwrap();

        let cred = c
            .resolve(&remote("gitlab.com/any/repo"), None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(cred.account_id, only.id);
        assert!(c.list_pending().is_empty());
    }

    #[tokio::test]
    async fn test_single_account_shortcut_disabled_prompts() {
        let c = coordinator(CoordinatorSettings {
            single_account_shortcut: false,
            ..quick(Duration::from_secs(30))
        })
        .await;
        let only = c.add_account("solo", Secret::new("tok")).await.unwrap();
        let key = remote("gitlab.com/any/repo");

        let waiter = {
            let c = c.clone();
            let key = key.clone();
            tokio::spawn(async move { c.resolve(&key, None, Duration::from_secs(30)).await })
        };
        wait_for_waiters(&c, &key, 1).await;

        let pending = c.list_pending();
        assert_eq!(pending[0].candidates.len(), 1);
        assert!(pending[0].candidates[0].suggested);

        c.submit_selection(&key, &only.id, false).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap().account_id, only.id);
    }

    #[tokio::test]
    async fn test_non_interactive_reports_ambiguity() {
        let c = coordinator(CoordinatorSettings {
            interactive: false,
            ..CoordinatorSettings::default()
        })
        .await;
        c.add_account("alice", Secret::new("a")).await.unwrap();
        c.add_account("bob", Secret::new("b")).await.unwrap();

        let result = c
            .resolve(&remote("github.com/org/repo"), None, Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(CoordinatorError::ResolverAmbiguous(_))));
    }

    #[tokio::test]
    async fn test_concurrent_requests_coalesce() {
        let c = coordinator(quick(Duration::from_secs(30))).await;
        c.add_account("alice", Secret::new("a")).await.unwrap();
        let bob = c.add_account("bob", Secret::new("b")).await.unwrap();
        let key = remote("github.com/org/repo");

        let mut handles = Vec::new();
        for _ in 0..5 {
            let c = c.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                c.resolve(&key, Some("https"), Duration::from_secs(30)).await
            }));
        }
        wait_for_waiters(&c, &key, 5).await;

        let pending = c.list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].candidates.len(), 2);

        c.submit_selection(&key, "bob", false).await.unwrap();
        for handle in handles {
            let cred = handle.await.unwrap().unwrap();
            assert_eq!(cred.account_id, bob.id);
            assert_eq!(cred.secret.expose(), "b");
        }
        assert!(c.list_pending().is_empty());
        assert!(c.list_mappings().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_releases_all_waiters_without_mapping() {
        let c = coordinator(quick(Duration::from_millis(150))).await;
        c.add_account("alice", Secret::new("a")).await.unwrap();
        c.add_account("bob", Secret::new("b")).await.unwrap();
        let key = remote("github.com/org/repo");
        let mut events = c.subscribe();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let c = c.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { c.resolve(&key, None, Duration::from_secs(30)).await }));
        }

        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(result, Err(CoordinatorError::ResolutionTimeout(_))));
        }
        assert!(c.list_pending().is_empty());
        assert!(c.list_mappings().is_empty());

        let mut timed_out = 0;
        while let Ok(event) = events.try_recv() {
            if let CoordinatorEvent::SelectionTimedOut { released, .. } = event {
                timed_out += released;
            }
        }
        assert_eq!(timed_out, 3);
    }

    #[tokio::test]
    async fn test_caller_wait_bounds_new_selection() {
        let c = coordinator(quick(Duration::from_secs(60))).await;
        c.add_account("alice", Secret::new("a")).await.unwrap();
        c.add_account("bob", Secret::new("b")).await.unwrap();

        let started = std::time::Instant::now();
        let result = c
            .resolve(&remote("github.com/org/repo"), None, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(CoordinatorError::ResolutionTimeout(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_remember_creates_exact_mapping() {
        let c = coordinator(quick(Duration::from_secs(30))).await;
        let alice = c.add_account("alice", Secret::new("a")).await.unwrap();
        c.add_account("bob", Secret::new("b")).await.unwrap();
        let key = remote("github.com/org/repo");

        let waiter = {
            let c = c.clone();
            let key = key.clone();
            tokio::spawn(async move { c.resolve(&key, None, Duration::from_secs(30)).await })
        };
        wait_for_waiters(&c, &key, 1).await;

        c.submit_selection(&key, &alice.id, true).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap().account_id, alice.id);

        let mappings = c.list_mappings();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].rule, MatchRule::Exact("github.com/org/repo".into()));
        assert!(mappings[0].remember);

        let cred = c.resolve(&key, None, Duration::from_secs(5)).await.unwrap();
        assert_eq!(cred.account_id, alice.id);
        assert!(c.list_pending().is_empty());
    }

    #[tokio::test]
    async fn test_remember_overrides_existing_exact_rule() {
        let c = coordinator(quick(Duration::from_secs(30))).await;
        let alice = c.add_account("alice", Secret::new("a")).await.unwrap();
        let bob = c.add_account("bob", Secret::new("b")).await.unwrap();
        let key = remote("github.com/org/repo");

        // Park a request, then map the remote behind its back
        let waiter = {
            let c = c.clone();
            let key = key.clone();
            tokio::spawn(async move { c.resolve(&key, None, Duration::from_secs(30)).await })
        };
        wait_for_waiters(&c, &key, 1).await;
        c.add_mapping(MatchRule::Exact(key.to_string()), "alice", false)
            .await
            .unwrap();

        c.submit_selection(&key, "bob", true).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap().account_id, bob.id);

        let mappings = c.list_mappings();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].account_id, bob.id);
        assert_ne!(mappings[0].account_id, alice.id);
    }

    #[tokio::test]
    async fn test_submit_without_pending_selection() {
        let c = coordinator(CoordinatorSettings::default()).await;
        c.add_account("alice", Secret::new("a")).await.unwrap();

        let result = c.submit_selection(&remote("github.com/org/repo"), "alice", true).await;
        assert!(matches!(result, Err(CoordinatorError::NoPendingSelection(_))));
        assert!(c.list_mappings().is_empty());

        let result = c.submit_selection(&remote("github.com/org/repo"), "nobody", false).await;
        assert!(matches!(result, Err(CoordinatorError::AccountNotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_fails_waiters() {
        let c = coordinator(quick(Duration::from_secs(30))).await;
        c.add_account("alice", Secret::new("a")).await.unwrap();
        c.add_account("bob", Secret::new("b")).await.unwrap();
        let key = remote("github.com/org/repo");

        let waiter = {
            let c = c.clone();
            let key = key.clone();
            tokio::spawn(async move { c.resolve(&key, None, Duration::from_secs(30)).await })
        };
        wait_for_waiters(&c, &key, 1).await;

        assert_eq!(c.cancel(&key).unwrap(), 1);
        assert!(matches!(
            waiter.await.unwrap(),
            Err(CoordinatorError::ResolutionCancelled(_))
        ));
        assert!(c.list_mappings().is_empty());
        assert!(matches!(c.cancel(&key), Err(CoordinatorError::NoPendingSelection(_))));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let c = coordinator(quick(Duration::from_secs(30))).await;
        c.add_account("alice", Secret::new("a")).await.unwrap();
        c.add_account("bob", Secret::new("b")).await.unwrap();

        let mut handles = Vec::new();
        for repo in ["github.com/org/a", "github.com/org/b"] {
            let c = c.clone();
            let key = remote(repo);
            handles.push(tokio::spawn(async move { c.resolve(&key, None, Duration::from_secs(30)).await }));
        }
        wait_for_waiters(&c, &remote("github.com/org/a"), 1).await;
        wait_for_waiters(&c, &remote("github.com/org/b"), 1).await;

        c.shutdown();
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                Err(CoordinatorError::ResolutionCancelled(_))
            ));
        }

        let result = c
            .resolve(&remote("github.com/org/a"), None, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(CoordinatorError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_missing_token_is_reported() {
        let storage = Arc::new(MemoryStorage::new());
        let secrets = Arc::new(MemorySecretStore::new());
        let c = Coordinator::load(storage, secrets.clone(), CoordinatorSettings::default())
            .await
            .unwrap();
        let account = c.add_account("alice", Secret::new("a")).await.unwrap();
        secrets.delete(&account.secret_handle).await.unwrap();

        let result = c
            .resolve(&remote("github.com/org/repo"), None, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(CoordinatorError::TokenUnavailable(name)) if name == "alice"));
    }

    #[tokio::test]
    async fn test_mapping_conflict_keeps_existing() {
        let c = coordinator(CoordinatorSettings::default()).await;
        let alice = c.add_account("alice", Secret::new("a")).await.unwrap();
        let bob = c.add_account("bob", Secret::new("b")).await.unwrap();

        c.add_mapping(MatchRule::Exact("github.com/org/repo".into()), "alice", false)
            .await
            .unwrap();
        let result = c
            .add_mapping(MatchRule::Exact("git@github.com:org/repo.git".into()), "bob", false)
            .await;
        assert!(matches!(result, Err(CoordinatorError::MappingConflict { .. })));
        assert_eq!(c.list_mappings()[0].account_id, alice.id);

        c.add_mapping(MatchRule::Exact("github.com/org/repo".into()), "bob", true)
            .await
            .unwrap();
        assert_eq!(c.list_mappings().len(), 1);
        assert_eq!(c.list_mappings()[0].account_id, bob.id);
    }

    #[tokio::test]
    async fn test_invalid_rules_rejected() {
        let c = coordinator(CoordinatorSettings::default()).await;
        c.add_account("alice", Secret::new("a")).await.unwrap();

        let result = c.add_mapping(MatchRule::Pattern("github.com/[".into()), "alice", false).await;
        assert!(matches!(result, Err(CoordinatorError::InvalidRule(_))));

        let result = c.add_mapping(MatchRule::Exact("".into()), "alice", false).await;
        assert!(matches!(result, Err(CoordinatorError::InvalidRule(_))));
    }

    #[tokio::test]
    async fn test_removed_mapping_leads_to_pending_selection() {
        let c = coordinator(quick(Duration::from_secs(30))).await;
        let alice = c.add_account("A", Secret::new("a")).await.unwrap();
        c.add_account("B", Secret::new("b")).await.unwrap();
        let key = remote("github.com/org/repo");

        let mapping = c
            .add_mapping(MatchRule::Exact(key.to_string()), "A", false)
            .await
            .unwrap();
        let cred = c.resolve(&key, None, Duration::from_secs(1)).await.unwrap();
        assert_eq!(cred.account_id, alice.id);

        c.remove_mapping(&mapping.id).await.unwrap();

        let waiter = {
            let c = c.clone();
            let key = key.clone();
            tokio::spawn(async move { c.resolve(&key, None, Duration::from_secs(30)).await })
        };
        wait_for_waiters(&c, &key, 1).await;
        assert_eq!(c.list_pending().len(), 1);

        c.cancel(&key).unwrap();
        assert!(waiter.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_remove_account_cascades() {
        let storage = Arc::new(MemoryStorage::new());
        let secrets = Arc::new(MemorySecretStore::new());
        let c = Coordinator::load(storage, secrets.clone(), CoordinatorSettings::default())
            .await
            .unwrap();
        let alice = c.add_account("alice", Secret::new("a")).await.unwrap();
        c.add_account("bob", Secret::new("b")).await.unwrap();
        c.add_mapping(MatchRule::Pattern("github.com/org/*".into()), "alice", false)
            .await
            .unwrap();

        let (removed, mappings) = c.remove_account("alice").await.unwrap();
        assert_eq!(removed.id, alice.id);
        assert_eq!(mappings.len(), 1);
        assert!(c.list_mappings().is_empty());
        assert!(secrets.get(&alice.secret_handle).await.unwrap().is_none());
        assert!(matches!(
            c.remove_account("alice").await,
            Err(CoordinatorError::AccountNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_used_by_username() {
        let c = coordinator(CoordinatorSettings::default()).await;
        let alice = c.add_account("alice", Secret::new("a")).await.unwrap();

        let marked = c
            .mark_used(&remote("github.com/org/repo"), Some("alice"))
            .await
            .unwrap();
        assert_eq!(marked, Some(alice.id.clone()));
        assert!(c.find_account("alice").unwrap().last_used_at.is_some());

        let marked = c
            .mark_used(&remote("github.com/org/repo"), Some("nobody"))
            .await
            .unwrap();
        assert_eq!(marked, None);
    }

    #[tokio::test]
    async fn test_pattern_rules_are_normalized() {
        let c = coordinator(CoordinatorSettings {
            interactive: false,
            ..CoordinatorSettings::default()
        })
        .await;
        let alice = c.add_account("alice", Secret::new("a")).await.unwrap();
        let bob = c.add_account("bob", Secret::new("b")).await.unwrap();

        let mapping = c
            .add_mapping(MatchRule::Pattern("GitHub.com/org/*".into()), "alice", false)
            .await
            .unwrap();
        assert_eq!(mapping.rule, MatchRule::Pattern("github.com/org/*".into()));
        c.add_mapping(MatchRule::Pattern("https://me@github.com/team/*".into()), "bob", false)
            .await
            .unwrap();

        let cred = c
            .resolve(&remote("https://github.com/org/repo"), None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(cred.account_id, alice.id);

        let cred = c
            .resolve(&remote("github.com/team/x"), None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(cred.account_id, bob.id);

        let result = c.add_mapping(MatchRule::Pattern("https:///org/*".into()), "bob", false).await;
        assert!(matches!(result, Err(CoordinatorError::InvalidRule(_))));
    }

    async fn file_backed(dir: &std::path::Path) -> (Arc<Coordinator>, Arc<MemorySecretStore>) {
        let storage = Arc::new(FileStorage::new(dir.join("state.json")).await.unwrap());
        let secrets = Arc::new(MemorySecretStore::new());
        let c = Coordinator::load(storage, secrets.clone(), quick(Duration::from_secs(30)))
            .await
            .unwrap();
        (Arc::new(c), secrets)
    }

    #[tokio::test]
    async fn test_failed_account_write_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let (c, _) = file_backed(dir.path()).await;
        let only = c.add_account("solo", Secret::new("tok")).await.unwrap();

        let blocker = dir.path().join("state.tmp");
        std::fs::create_dir(&blocker).unwrap();
        let result = c.add_account("ghost", Secret::new("boo")).await;
        assert!(matches!(result, Err(CoordinatorError::Storage(_))));
        std::fs::remove_dir(&blocker).unwrap();

        // An unrelated write must not bring the failed account back
        c.mark_used(&remote("github.com/org/repo"), Some("solo")).await.unwrap();
        assert_eq!(c.list_accounts().len(), 1);

        let cred = c
            .resolve(&remote("gitlab.com/any/repo"), None, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(cred.account_id, only.id);
    }

    #[tokio::test]
    async fn test_failed_remember_keeps_selection_open_without_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let (c, _) = file_backed(dir.path()).await;
        c.add_account("alice", Secret::new("a")).await.unwrap();
        let bob = c.add_account("bob", Secret::new("b")).await.unwrap();

        let key = remote("github.com/org/repo");
        let waiter = {
            let c = c.clone();
            let key = key.clone();
            tokio::spawn(async move { c.resolve(&key, None, Duration::from_secs(30)).await })
        };
        wait_for_waiters(&c, &key, 1).await;

        let blocker = dir.path().join("state.tmp");
        std::fs::create_dir(&blocker).unwrap();
        let result = c.submit_selection(&key, "bob", true).await;
        assert!(matches!(result, Err(CoordinatorError::Storage(_))));
        assert_eq!(c.list_pending().len(), 1);
        std::fs::remove_dir(&blocker).unwrap();

        // Another write succeeds; the failed mapping must not surface with it
        c.mark_used(&key, Some("alice")).await.unwrap();
        assert!(c.list_mappings().is_empty());

        c.submit_selection(&key, "bob", false).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap().account_id, bob.id);
        assert!(c.list_mappings().is_empty());
    }

    #[tokio::test]
    async fn test_selection_wait_is_capped() {
        let c = coordinator(quick(Duration::MAX)).await;
        c.add_account("alice", Secret::new("a")).await.unwrap();
        c.add_account("bob", Secret::new("b")).await.unwrap();

        let key = remote("github.com/org/repo");
        let waiter = {
            let c = c.clone();
            let key = key.clone();
            tokio::spawn(async move { c.resolve(&key, None, Duration::MAX).await })
        };
        wait_for_waiters(&c, &key, 1).await;
        assert_eq!(c.cancel(&key).unwrap(), 1);
        assert!(matches!(
            waiter.await.unwrap(),
            Err(CoordinatorError::ResolutionCancelled(_))
        ));
    }
}
