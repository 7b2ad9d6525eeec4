//! Error types for the sync client.

use crate::subscriptions::State;
use flexsync_protocol::ProtocolError;
use flexsync_storage::StorageError;
use thiserror::Error;

/// Result type for sync client operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Contract violations by the caller.
///
/// These are reported synchronously and are never the consequence of network
/// or server behavior.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogicError {
    /// The session has not been bound yet.
    #[error("session is not bound")]
    NotBound,

    /// The session was already bound.
    #[error("session is already bound")]
    AlreadyBound,

    /// The session has been detached.
    #[error("session has been detached")]
    Detached,

    /// The subscription set is not in a state that permits the operation.
    #[error("subscription set is in state {state}, expected {expected}")]
    WrongSubscriptionState {
        /// Current state.
        state: State,
        /// State the operation requires.
        expected: State,
    },

    /// A subscription set state change that is not allowed.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: State,
        /// Attempted target state.
        to: State,
    },

    /// An error message was given with a non-error state, or omitted with the
    /// error state.
    #[error("an error message must be given exactly when the target state is Error")]
    ErrorMessageMismatch,

    /// A subscription set version that was never created.
    #[error("no subscription set with version {0}")]
    NoSuchSubscriptionSet(i64),

    /// `Client::run` is already running or has already returned.
    #[error("the client event loop is already running or has stopped")]
    ClientAlreadyRunning,

    /// The session configuration is invalid.
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
}

/// Errors returned by the sync client API.
#[derive(Error, Debug)]
pub enum SyncError {
    /// API misuse.
    #[error(transparent)]
    Logic(#[from] LogicError),

    /// Local database error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Encoding or decoding error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A server URL could not be parsed.
    #[error("bad server URL: {0}")]
    BadServerUrl(String),

    /// The event loop could not be started.
    #[error("event loop error: {0}")]
    EventLoop(#[from] std::io::Error),

    /// The subscription store has been dropped.
    #[error("subscription store is gone")]
    StoreGone,
}

impl SyncError {
    /// Returns true for API misuse.
    pub fn is_logic_error(&self) -> bool {
        matches!(self, SyncError::Logic(_))
    }

    /// The logic error, if this is one.
    pub fn as_logic_error(&self) -> Option<&LogicError> {
        match self {
            SyncError::Logic(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logic_errors_are_distinct() {
        let err = SyncError::from(LogicError::AlreadyBound);
        assert!(err.is_logic_error());
        assert_eq!(err.as_logic_error(), Some(&LogicError::AlreadyBound));
        assert_eq!(err.to_string(), "session is already bound");
        assert!(!SyncError::BadServerUrl("x".into()).is_logic_error());
    }

    #[test]
    fn error_display() {
        let err = LogicError::InvalidStateTransition {
            from: State::Complete,
            to: State::Pending,
        };
        assert_eq!(err.to_string(), "invalid state transition from Complete to Pending");
    }
}
