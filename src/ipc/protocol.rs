//! Coordinator IPC message types
//!
//! One JSON object per line in each direction. Every message carries a
//! `type` tag; field names are snake_case.

use crate::activity::ActivityEvent;
use crate::coordinator::{CoordinatorError, CoordinatorEvent, PendingEntry};
use crate::{Account, Mapping, MatchRule, Secret};
use serde::{Deserialize, Serialize};

/// Requests accepted by the coordinator
///
/// Remotes are sent as text and normalized by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Resolve credentials, blocking up to `wait_ms`
    Resolve {
        remote: String,
        #[serde(default)]
        protocol: Option<String>,
        wait_ms: u64,
    },
    ListPending,
    Choose {
        remote: String,
        account: String,
        #[serde(default)]
        remember: bool,
    },
    Cancel {
        remote: String,
    },
    ListAccounts,
    AddAccount {
        name: String,
        secret: Secret,
    },
    RemoveAccount {
        account: String,
    },
    ListMappings,
    AddMapping {
        rule: MatchRule,
        account: String,
        #[serde(default)]
        overwrite: bool,
    },
    RemoveMapping {
        id: String,
    },
    MarkUsed {
        remote: String,
        #[serde(default)]
        username: Option<String>,
    },
    /// Activity notice from a credential helper
    Activity {
        event: ActivityEvent,
    },
    /// Turn the connection into an event stream
    Subscribe,
    Ping,
    Shutdown,
}

/// Why a `Resolve` failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NoAccountsConfigured,
    Timeout,
    Cancelled,
    ResolverAmbiguous,
    TokenUnavailable,
}

impl FailureReason {
    /// The reason reported for a failed resolution
    pub fn of(err: &CoordinatorError) -> Self {
        match err {
            CoordinatorError::NoAccountsConfigured => FailureReason::NoAccountsConfigured,
            CoordinatorError::ResolutionTimeout(_) => FailureReason::Timeout,
            CoordinatorError::ResolverAmbiguous(_) => FailureReason::ResolverAmbiguous,
            CoordinatorError::TokenUnavailable(_) | CoordinatorError::Secrets(_) => FailureReason::TokenUnavailable,
            _ => FailureReason::Cancelled,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FailureReason::NoAccountsConfigured => "no_accounts_configured",
            FailureReason::Timeout => "timeout",
            FailureReason::Cancelled => "cancelled",
            FailureReason::ResolverAmbiguous => "resolver_ambiguous",
            FailureReason::TokenUnavailable => "token_unavailable",
        };
        f.write_str(text)
    }
}

/// Something a watcher can see
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum WatchEvent {
    Coordinator(CoordinatorEvent),
    Activity(ActivityEvent),
}

/// Responses sent by the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    Resolved {
        account_id: String,
        username: String,
        secret: Secret,
    },
    Failed {
        reason: FailureReason,
        message: String,
    },
    Pending {
        entries: Vec<PendingEntry>,
    },
    Chosen {
        account: Account,
    },
    Cancelled {
        released: usize,
    },
    Accounts {
        accounts: Vec<Account>,
    },
    AccountAdded {
        account: Account,
    },
    AccountRemoved {
        account: Account,
        mappings_removed: usize,
    },
    Mappings {
        mappings: Vec<Mapping>,
    },
    MappingAdded {
        mapping: Mapping,
    },
    MarkedUsed {
        #[serde(default)]
        account_id: Option<String>,
    },
    Subscribed,
    Event {
        event: WatchEvent,
    },
    Pong {
        version: String,
        pending: usize,
    },
    Ok,
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RemoteIdentity;

    #[test]
    fn test_resolve_request_wire_format() {
        let json = r#"{"type":"resolve","remote":"github.com/org/repo","protocol":"https","wait_ms":30000}"#;
        let request: IpcRequest = serde_json::from_str(json).unwrap();

        match request {
            IpcRequest::Resolve {
                remote,
                protocol,
                wait_ms,
            } => {
                assert_eq!(remote, "github.com/org/repo");
                assert_eq!(protocol.as_deref(), Some("https"));
                assert_eq!(wait_ms, 30000);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_optional_fields_default() {
        let request: IpcRequest =
            serde_json::from_str(r#"{"type":"choose","remote":"github.com/org/repo","account":"work"}"#).unwrap();
        assert!(matches!(request, IpcRequest::Choose { remember: false, .. }));

        let request: IpcRequest = serde_json::from_str(r#"{"type":"list_pending"}"#).unwrap();
        assert!(matches!(request, IpcRequest::ListPending));
    }

    #[test]
    fn test_failure_wire_format() {
        let response = IpcResponse::Failed {
            reason: FailureReason::NoAccountsConfigured,
            message: "no accounts".into(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""type":"failed""#));
        assert!(json.contains(r#""reason":"no_accounts_configured""#));
    }

    #[test]
    fn test_failure_reason_mapping() {
        let remote = RemoteIdentity::parse("github.com/org/repo").unwrap();
        assert_eq!(
            FailureReason::of(&CoordinatorError::ResolutionTimeout(remote.clone())),
            FailureReason::Timeout
        );
        assert_eq!(
            FailureReason::of(&CoordinatorError::ShuttingDown),
            FailureReason::Cancelled
        );
        assert_eq!(
            FailureReason::of(&CoordinatorError::TokenUnavailable("work".into())),
            FailureReason::TokenUnavailable
        );
        assert_eq!(FailureReason::Timeout.to_string(), "timeout");
    }

    #[test]
    fn test_watch_event_roundtrip() {
        let remote = RemoteIdentity::parse("github.com/org/repo").unwrap();
        let response = IpcResponse::Event {
            event: WatchEvent::Coordinator(CoordinatorEvent::SelectionOpened {
                remote,
                protocol: None,
            }),
        };

        let json = serde_json::to_string(&response).unwrap();
        let parsed: IpcResponse = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            parsed,
            IpcResponse::Event {
                event: WatchEvent::Coordinator(CoordinatorEvent::SelectionOpened { .. })
            }
        ));
    }
}
