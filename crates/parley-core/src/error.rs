//! Error types for the relay core.

use thiserror::Error;

use crate::session::SessionState;

/// Presence store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or rejected the command.
    #[error("Presence store unavailable: {0}")]
    Unavailable(String),

    /// The store connection was closed by the relay.
    #[error("Presence store closed")]
    Closed,
}

/// Errors that abort a session before it becomes active.
#[derive(Debug, Error)]
pub enum SessionError {
    /// User or channel name failed validation.
    #[error("Invalid name: {0}")]
    InvalidName(&'static str),

    /// A presence store call failed during the join protocol.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The username is in use and the relay rejects duplicates.
    #[error("Username already taken: {0}")]
    UsernameTaken(String),

    /// The relay is shutting down and admits no new sessions.
    #[error("Relay is shutting down")]
    ShuttingDown,

    /// The operation is not valid in the session's current state.
    #[error("Invalid session state: {0:?}")]
    InvalidState(SessionState),
}
