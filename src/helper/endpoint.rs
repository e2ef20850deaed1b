use super::{write_credentials, CredentialAction, CredentialInput, HelperError};
use crate::activity::{ActivityEvent, Operation};
use crate::ipc::IpcClient;
use crate::router::RemoteIdentity;
use std::io::Write;
use std::time::Duration;
use tracing::debug;

/// Bound for the best-effort notices sent alongside a request
const NOTICE_TIMEOUT: Duration = Duration::from_millis(500);

/// Answers one credential request from git
pub struct Endpoint {
    client: IpcClient,
    wait: Duration,
}

impl Endpoint {
    /// `wait` bounds how long a `get` blocks on the coordinator
    pub fn new(client: IpcClient, wait: Duration) -> Self {
        Self { client, wait }
    }

    /// Handle a request, writing any answer to `out`
    ///
    /// A malformed request fails before the coordinator is contacted.
    /// `store` and `erase` never fail once the request parses.
    pub async fn run<W: Write>(
        &self,
        action: CredentialAction,
        input: &CredentialInput,
        out: &mut W,
    ) -> Result<(), HelperError> {
        let remote = input.remote()?;
        debug!(action = %action, remote = %remote, "Credential request");

        match action {
            CredentialAction::Get => {
                let (resolved, _) = tokio::join!(
                    self.client.resolve(&remote, input.protocol(), self.wait),
                    self.notify(Operation::Lookup, &remote),
                );
                let credential = resolved?;
                write_credentials(out, &credential.username, credential.secret.expose())?;
            }
            CredentialAction::Store | CredentialAction::Erase => {
                let operation = if action == CredentialAction::Store {
                    Operation::Accepted
                } else {
                    Operation::Rejected
                };

                let notices = self.client.clone().with_timeout(NOTICE_TIMEOUT);
                if let Err(e) = notices.mark_used(&remote, input.username.as_deref()).await {
                    debug!(error = %e, "Could not record last use");
                }
                self.notify(operation, &remote).await;
            }
        }

        Ok(())
    }

    async fn notify(&self, operation: Operation, remote: &RemoteIdentity) {
        let mut event = ActivityEvent::new(operation, remote.clone());
        if let Ok(dir) = std::env::current_dir() {
            event = event.with_repository(dir);
        }

        let client = self.client.clone().with_timeout(NOTICE_TIMEOUT);
        if let Err(e) = client.report_activity(event).await {
            debug!(error = %e, "Could not report activity");
        }
    }
}
