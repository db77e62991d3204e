//! Error types for the synchronization core.

use sushi_console_types::NotificationKind;
use thiserror::Error;

/// Errors returned by a `RemoteControl` implementation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    /// The transport could not reach the engine
    #[error("Transport error: {0}")]
    Transport(String),

    /// The engine answered with an error status
    #[error("Engine returned status {code}: {message}")]
    Status { code: i32, message: String },

    /// The addressed entity does not exist on the engine
    #[error("Not found: {0}")]
    NotFound(String),

    /// The call did not complete within the configured deadline
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// A notification stream ended or failed
    #[error("Notification stream closed: {0}")]
    StreamClosed(String),
}

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Error taxonomy of the synchronization core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    /// The initial handshake or topology load failed; no state was created
    #[error("Connection failed: {0}")]
    Connection(RemoteError),

    /// A single query or poll failed; previous state is retained
    #[error("Query failed ({context}): {source}")]
    TransientQuery {
        context: String,
        #[source]
        source: RemoteError,
    },

    /// A write or topology mutation was refused
    #[error("Write rejected ({context}): {reason}")]
    WriteRejected { context: String, reason: String },

    /// A notification subscription failed; the capability is lost
    #[error("Notification stream for {} failed: {source}", .kind.name())]
    NotificationStream {
        kind: NotificationKind,
        #[source]
        source: RemoteError,
    },

    /// An update referenced an entity the store does not know
    #[error("Update references unknown {0}")]
    MalformedUpdate(String),

    /// The session is not connected
    #[error("Not connected to the engine")]
    NotConnected,
}

impl SyncError {
    pub(crate) fn rejected(context: impl Into<String>, reason: impl ToString) -> Self {
        SyncError::WriteRejected {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn transient(context: impl Into<String>, source: RemoteError) -> Self {
        SyncError::TransientQuery {
            context: context.into(),
            source,
        }
    }

    /// Whether this error should be shown to the user.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            SyncError::Connection(_)
                | SyncError::WriteRejected { .. }
                | SyncError::NotificationStream { .. }
                | SyncError::NotConnected
        )
    }
}

/// Result type for synchronization core operations.
pub type SyncResult<T> = Result<T, SyncError>;
