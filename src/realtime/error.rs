//! Error types for the synchronization layer.

use thiserror::Error;

use super::transport::TransportError;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced to callers of [`SyncClient`](super::client::SyncClient).
///
/// Pushed updates that fail to decode never reach a caller; they are logged and the
/// offending update is dropped. Everything here is per-command, nothing is
/// fatal to the client.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The command needs a logged-in session and none is set.
    #[error("not authenticated")]
    NotAuthenticated,

    /// No acknowledgment arrived within the bound. The command may still
    /// have been applied by the server.
    #[error("no acknowledgment for {command} within {timeout_ms} ms")]
    AckTimeout { command: &'static str, timeout_ms: u64 },

    /// The client was dropped while a command was waiting on it.
    #[error("sync client shut down")]
    Closed,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to decode {event}: {source}")]
    Decode {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SyncError {
    pub(crate) fn decode(event: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Decode {
            event: event.into(),
            source,
        }
    }
}
