//! Notification subscriptions.
//!
//! One task per notification kind forwards engine events to the reconciler.
//! All tasks share the session's cancellation token and are joined on
//! disconnect.

use futures_util::StreamExt;
use std::time::Duration;
use sushi_console_types::NotificationKind;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ReconnectPolicy;
use crate::error::RemoteError;
use crate::remote::{with_deadline, SharedRemote};
use crate::state::{ReconcilerHandle, SyncInput};

#[derive(Clone)]
pub(crate) struct Subscriptions {
    pub(crate) remote: SharedRemote,
    pub(crate) inbox: ReconcilerHandle,
    pub(crate) policy: ReconnectPolicy,
    pub(crate) deadline: Option<Duration>,
    pub(crate) token: CancellationToken,
}

impl Subscriptions {
    /// Start one forwarding task per notification kind.
    pub(crate) fn spawn_all(&self, runtime: &Handle) -> Vec<JoinHandle<()>> {
        NotificationKind::ALL
            .iter()
            .map(|&kind| runtime.spawn(self.clone().run(kind)))
            .collect()
    }

    async fn run(self, kind: NotificationKind) {
        // Consecutive failures since the stream was last healthy
        let mut failures = 0u32;
        loop {
            let error = tokio::select! {
                _ = self.token.cancelled() => return,
                error = self.forward(kind, &mut failures) => error,
            };

            failures += 1;
            if failures == 1 {
                self.inbox.send(SyncInput::StreamLost {
                    kind,
                    error: error.clone(),
                });
            }

            if !self.policy.allows(failures) {
                if self.policy.enabled {
                    warn!(
                        "Giving up on {} after {} attempts: {}",
                        kind.name(),
                        failures,
                        error
                    );
                }
                return;
            }

            let delay = self.policy.delay_for(failures);
            info!(
                "Resubscribing to {} in {}ms (attempt {})",
                kind.name(),
                delay.as_millis(),
                failures
            );
            tokio::select! {
                _ = self.token.cancelled() => return,
                _ = sleep(delay) => {}
            }
        }
    }

    /// Subscribe and forward events until the stream fails. Returns the error
    /// that ended it.
    async fn forward(&self, kind: NotificationKind, failures: &mut u32) -> RemoteError {
        let mut stream = match with_deadline(self.deadline, self.remote.subscribe(kind)).await {
            Ok(stream) => stream,
            Err(e) => return e,
        };
        debug!("Subscribed to {}", kind.name());
        if *failures > 0 {
            *failures = 0;
            self.inbox.send(SyncInput::StreamRestored(kind));
        }

        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => {
                    trace!("{}", event.description());
                    self.inbox.send(SyncInput::Push(event));
                }
                Err(e) => return e,
            }
        }
        RemoteError::StreamClosed(format!("{} ended", kind.name()))
    }
}
