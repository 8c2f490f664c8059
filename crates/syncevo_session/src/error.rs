//! Error types for network sessions.

use syncevo_protocol::SyncStatus;
use syncevo_runtime::SuspendError;
use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that end a session operation.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The server redirected to a location we do not follow.
    #[error("{operation}: {status} status: {from} redirected to {to}")]
    Redirect {
        /// Operation name.
        operation: String,
        /// HTTP status.
        status: u16,
        /// Requested location.
        from: String,
        /// Redirect target.
        to: String,
    },

    /// Request failed with an HTTP status.
    #[error("{message}")]
    Status {
        /// HTTP status.
        status: u16,
        /// Explanation.
        message: String,
    },

    /// Request failed without an HTTP status.
    #[error("{0}")]
    Transport(String),

    /// Obtaining credentials failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Interrupted by a suspend or abort request.
    #[error(transparent)]
    Interrupted(#[from] SuspendError),

    /// A request was classified before an operation was started.
    #[error("internal error: start_operation() not called")]
    NoOperation,
}

impl SessionError {
    /// Status code to report for this error.
    pub fn status(&self) -> SyncStatus {
        match self {
            SessionError::Redirect { status, .. } | SessionError::Status { status, .. } => {
                SyncStatus(u32::from(*status))
            }
            SessionError::Transport(_) => SyncStatus::TRANSPORT_FAILURE,
            SessionError::Auth(_) => SyncStatus::UNAUTHORIZED,
            SessionError::Interrupted(err) => err.status(),
            SessionError::NoOperation => SyncStatus::FATAL,
        }
    }

    /// Returns true if the user asked to stop.
    pub fn is_user_abort(&self) -> bool {
        matches!(self, SessionError::Interrupted(err) if err.status() == SyncStatus::USER_ABORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let err = SessionError::Status {
            status: 401,
            message: "PROPFIND: bad HTTP status: 401".into(),
        };
        assert_eq!(err.status(), SyncStatus::UNAUTHORIZED);
        assert_eq!(
            SessionError::Transport("no route".into()).status(),
            SyncStatus::TRANSPORT_FAILURE
        );
        let abort = SessionError::from(SuspendError::UserAbort);
        assert!(abort.is_user_abort());
        assert_eq!(abort.status(), SyncStatus::USER_ABORT);
    }

    #[test]
    fn redirect_display() {
        let err = SessionError::Redirect {
            operation: "REPORT".into(),
            status: 302,
            from: "/dav/".into(),
            to: "https://example.com/login".into(),
        };
        assert_eq!(
            err.to_string(),
            "REPORT: 302 status: /dav/ redirected to https://example.com/login"
        );
    }
}
