//! Error types for the local transport.

use std::io;

use syncevo_protocol::{ProtocolError, RemoteError, SyncStatus};
use syncevo_runtime::SuspendError;
use syncevo_shm::ShmError;
use thiserror::Error;

/// Result type for RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, LocalTransportError>;

/// Errors of the RPC connection between parent and helper.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The peer went away or the connection was closed.
    #[error("connection to peer lost")]
    ConnectionLost,

    /// The peer answered with an error.
    #[error("{0}")]
    Remote(RemoteError),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Socket I/O failed.
    #[error("RPC I/O error: {0}")]
    Io(#[from] io::Error),

    /// The reply does not fit the call.
    #[error("unexpected reply to {method}")]
    UnexpectedReply {
        /// Method that was called.
        method: &'static str,
    },

    /// Nobody handles calls on this side.
    #[error("no handler for {0}")]
    NoHandler(&'static str),
}

impl RpcError {
    /// Status code to report for this error.
    pub fn status(&self) -> SyncStatus {
        match self {
            RpcError::ConnectionLost => SyncStatus::TRANSPORT_FAILURE,
            RpcError::Remote(err) => err.status.unwrap_or(SyncStatus::FATAL),
            _ => SyncStatus::FATAL,
        }
    }

    /// Converts into the error sent back to a caller.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            RpcError::Remote(err) => err.clone(),
            other => RemoteError::new(other.to_string()),
        }
    }
}

/// Errors of the local transport, on either side.
#[derive(Error, Debug)]
pub enum LocalTransportError {
    /// Failure with a specific sync status.
    #[error("{message}")]
    Status {
        /// Status to report.
        status: SyncStatus,
        /// Explanation.
        message: String,
    },

    /// Message exchange failed.
    #[error("{0}")]
    Transport(String),

    /// Invalid or inconsistent configuration.
    #[error("{0}")]
    Config(String),

    /// The transport was used in the wrong state.
    #[error("{0}")]
    InvalidState(String),

    /// Starting the helper failed.
    #[error("starting {helper} failed: {source}")]
    Spawn {
        /// Helper executable.
        helper: String,
        /// Underlying error.
        source: io::Error,
    },

    /// Shared memory failure.
    #[error(transparent)]
    Shm(#[from] ShmError),

    /// RPC failure.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Encoding failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Suspended or aborted by the user.
    #[error(transparent)]
    Interrupted(#[from] SuspendError),

    /// I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl LocalTransportError {
    /// Creates an error with a specific status.
    pub fn status_error(status: SyncStatus, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Creates a message exchange error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates a wrong-state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Status code to report for this error.
    pub fn status(&self) -> SyncStatus {
        match self {
            LocalTransportError::Status { status, .. } => *status,
            LocalTransportError::Transport(_) => SyncStatus::TRANSPORT_FAILURE,
            LocalTransportError::Rpc(err) => err.status(),
            LocalTransportError::Interrupted(err) => err.status(),
            _ => SyncStatus::FATAL,
        }
    }

    /// Converts into the error sent to the RPC peer.
    pub fn to_remote(&self) -> RemoteError {
        match self {
            LocalTransportError::Rpc(err) => err.to_remote(),
            other => RemoteError::with_status(other.to_string(), other.status()),
        }
    }
}

impl From<RemoteError> for LocalTransportError {
    fn from(err: RemoteError) -> Self {
        LocalTransportError::Rpc(RpcError::Remote(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_of_errors() {
        assert_eq!(
            LocalTransportError::transport("gone").status(),
            SyncStatus::TRANSPORT_FAILURE
        );
        assert_eq!(
            LocalTransportError::config("datastore not configured").status(),
            SyncStatus::FATAL
        );
        let remote = RemoteError::with_status("denied", SyncStatus::FORBIDDEN);
        assert_eq!(
            LocalTransportError::from(remote).status(),
            SyncStatus::FORBIDDEN
        );
        assert_eq!(
            LocalTransportError::from(SuspendError::UserAbort).status(),
            SyncStatus::USER_ABORT
        );
    }

    #[test]
    fn remote_conversion_keeps_message() {
        let err = LocalTransportError::status_error(SyncStatus::UNAUTHORIZED, "bad password");
        let remote = err.to_remote();
        assert_eq!(remote.message, "bad password");
        assert_eq!(remote.status, Some(SyncStatus::UNAUTHORIZED));

        let lost = LocalTransportError::Rpc(RpcError::ConnectionLost).to_remote();
        assert_eq!(lost.message, "connection to peer lost");
    }
}
