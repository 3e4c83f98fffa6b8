//! Error definitions for the broker session

use thiserror::Error;

/// Failure to establish a broker connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// No `ConnAck` arrived within the configured connect timeout
    #[error("connect timed out")]
    Timeout,

    /// The broker (or the host) actively refused the connection
    #[error("connection refused: {0}")]
    Refused(String),

    /// The broker could not be reached at all
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// Another connect attempt is still in flight
    #[error("a connect attempt is already in progress")]
    AlreadyInProgress,

    /// The session worker has shut down
    #[error("session worker is gone")]
    SessionClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    #[error("not connected")]
    NotConnected,

    #[error("broker rejected subscription to {0}")]
    BrokerRejected(String),

    #[error("session worker is gone")]
    SessionClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("not connected")]
    NotConnected,

    /// The command does not fit the target device
    #[error("command does not match device: {0}")]
    KindMismatch(String),

    #[error("session worker is gone")]
    SessionClosed,
}

/// A refresh cycle could not (re)establish the session
///
/// Partial subscribe failures are not a refresh failure; they are listed in
/// the [`RefreshReport`](crate::telemetry::refresh::RefreshReport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshFailed {
    #[error("could not refresh telemetry: {0}")]
    Connect(#[from] ConnectError),

    #[error("could not refresh telemetry: registry unavailable: {0}")]
    Registry(String),

    #[error("could not refresh telemetry: bus is shut down")]
    SessionClosed,
}

impl RefreshFailed {
    pub fn connect_error(&self) -> Option<&ConnectError> {
        match self {
            RefreshFailed::Connect(e) => Some(e),
            _ => None,
        }
    }
}
