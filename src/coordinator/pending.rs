//! Pending selection table
//!
//! One `PendingSelection` exists per remote that is waiting on a human. Every
//! credential request for that remote joins it and is released, in arrival
//! order, with the same outcome. The table is plain data guarded by the
//! coordinator's lock; it never awaits.

use crate::router::RemoteIdentity;
use crate::Account;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

/// A credential request parked on a pending selection
#[derive(Debug, Clone)]
pub struct CredentialRequest {
    /// Correlation id, used in logs
    pub id: Uuid,
    pub remote: RemoteIdentity,
    /// Protocol hint sent by git (`https`, `ssh`, ...)
    pub protocol: Option<String>,
    pub arrived_at: DateTime<Utc>,
}

impl CredentialRequest {
    pub fn new(remote: RemoteIdentity, protocol: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote,
            protocol,
            arrived_at: Utc::now(),
        }
    }
}

/// What a parked request is woken with
#[derive(Debug, Clone)]
pub enum Release {
    Resolved(Account),
    TimedOut,
    Cancelled,
}

impl Release {
    fn outcome(&self) -> &'static str {
        match self {
            Release::Resolved(_) => "resolved",
            Release::TimedOut => "timed_out",
            Release::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectionState {
    AwaitingHuman,
    /// A choice is being written; the deadline no longer applies
    Committing,
}

struct Waiter {
    request: CredentialRequest,
    tx: oneshot::Sender<Release>,
}

/// Requests for one remote waiting on the same human decision
pub struct PendingSelection {
    id: Uuid,
    protocol: Option<String>,
    opened_at: DateTime<Utc>,
    deadline: Instant,
    state: SelectionState,
    /// Account ids the resolver suggested, best first
    suggested: Vec<String>,
    waiters: Vec<Waiter>,
}

impl PendingSelection {
    fn release(self, outcome: Release) -> usize {
        let count = self.waiters.len();
        let now = Utc::now();

        for waiter in self.waiters {
            tracing::debug!(
                request = %waiter.request.id,
                remote = %waiter.request.remote,
                outcome = outcome.outcome(),
                waited_ms = (now - waiter.request.arrived_at).num_milliseconds(),
                "Releasing credential request"
            );
            // A caller that went away no longer needs an answer
            let _ = waiter.tx.send(outcome.clone());
        }

        count
    }
}

/// Handle returned to a request that joined a selection
pub struct Ticket {
    pub selection_id: Uuid,
    pub request_id: Uuid,
    pub deadline: Instant,
    pub rx: oneshot::Receiver<Release>,
    /// Whether this request opened the selection
    pub opened: bool,
}

/// Read-only view of a pending selection
#[derive(Debug, Clone)]
pub struct SelectionView {
    pub remote: RemoteIdentity,
    pub protocol: Option<String>,
    pub earliest_arrival: DateTime<Utc>,
    pub waiting: usize,
    pub suggested: Vec<String>,
}

#[derive(Default)]
pub struct PendingTable {
    selections: HashMap<RemoteIdentity, PendingSelection>,
}

impl PendingTable {
    /// Park a request, opening a selection for its remote if none exists
    ///
    /// `deadline` and `suggested` only apply when a selection is opened;
    /// joiners share the existing selection's deadline.
    pub fn join(&mut self, request: CredentialRequest, deadline: Instant, suggested: Vec<String>) -> Ticket {
        let (tx, rx) = oneshot::channel();
        let request_id = request.id;
        let mut opened = false;

        let selection = self
            .selections
            .entry(request.remote.clone())
            .or_insert_with(|| {
                opened = true;
                PendingSelection {
                    id: Uuid::new_v4(),
                    protocol: request.protocol.clone(),
                    opened_at: request.arrived_at,
                    deadline,
                    state: SelectionState::AwaitingHuman,
                    suggested,
                    waiters: Vec::new(),
                }
            });
        selection.waiters.push(Waiter { request, tx });

        Ticket {
            selection_id: selection.id,
            request_id,
            deadline: selection.deadline,
            rx,
            opened,
        }
    }

    /// Time out a selection whose deadline has passed
    ///
    /// Returns the number of released requests, or `None` if the selection
    /// is gone, was replaced, is being committed or is not yet due.
    pub fn expire(&mut self, remote: &RemoteIdentity, selection_id: Uuid, now: Instant) -> Option<usize> {
        let due = self.selections.get(remote).is_some_and(|s| {
            s.id == selection_id && s.state == SelectionState::AwaitingHuman && now >= s.deadline
        });
        if !due {
            return None;
        }
        self.selections
            .remove(remote)
            .map(|selection| selection.release(Release::TimedOut))
    }

    /// Time out every overdue selection, returning the affected remotes
    pub fn sweep(&mut self, now: Instant) -> Vec<(RemoteIdentity, usize)> {
        let overdue: Vec<(RemoteIdentity, Uuid)> = self
            .selections
            .iter()
            .filter(|(_, s)| s.state == SelectionState::AwaitingHuman && now >= s.deadline)
            .map(|(remote, s)| (remote.clone(), s.id))
            .collect();

        overdue
            .into_iter()
            .filter_map(|(remote, id)| self.expire(&remote, id, now).map(|n| (remote, n)))
            .collect()
    }

    /// Claim a selection for a human choice; it can no longer time out
    pub fn begin_commit(&mut self, remote: &RemoteIdentity) -> Option<Uuid> {
        let selection = self.selections.get_mut(remote)?;
        if selection.state == SelectionState::Committing {
            return None;
        }
        selection.state = SelectionState::Committing;
        Some(selection.id)
    }

    /// Return a claimed selection to waiting; expires it at once if overdue
    pub fn abort_commit(&mut self, remote: &RemoteIdentity, selection_id: Uuid, now: Instant) -> Option<usize> {
        match self.selections.get_mut(remote) {
            Some(selection) if selection.id == selection_id => {
                selection.state = SelectionState::AwaitingHuman;
            }
            _ => return None,
        }
        self.expire(remote, selection_id, now)
    }

    /// Release every request of a claimed selection with the chosen account
    pub fn finish(&mut self, remote: &RemoteIdentity, selection_id: Uuid, account: &Account) -> usize {
        match self.selections.get(remote) {
            Some(selection) if selection.id == selection_id => {}
            _ => return 0,
        }
        self.selections
            .remove(remote)
            .map(|selection| selection.release(Release::Resolved(account.clone())))
            .unwrap_or(0)
    }

    /// Cancel the selection for a remote
    pub fn cancel(&mut self, remote: &RemoteIdentity) -> Option<usize> {
        self.selections
            .remove(remote)
            .map(|selection| selection.release(Release::Cancelled))
    }

    /// Cancel every selection
    pub fn drain(&mut self) -> Vec<(RemoteIdentity, usize)> {
        self.selections
            .drain()
            .map(|(remote, selection)| (remote, selection.release(Release::Cancelled)))
            .collect()
    }

    /// Open selections, earliest first
    pub fn views(&self) -> Vec<SelectionView> {
        let mut views: Vec<SelectionView> = self
            .selections
            .iter()
            .map(|(remote, s)| SelectionView {
                remote: remote.clone(),
                protocol: s.protocol.clone(),
                earliest_arrival: s.opened_at,
                waiting: s.waiters.len(),
                suggested: s.suggested.clone(),
            })
            .collect();
        views.sort_by(|a, b| {
            a.earliest_arrival
                .cmp(&b.earliest_arrival)
                .then_with(|| a.remote.cmp(&b.remote))
        });
        views
    }
}
