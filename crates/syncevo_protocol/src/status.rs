//! Sync status codes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status code of a sync session or operation.
///
/// Codes below 10000 are SyncML/HTTP codes. Adding
/// [`SyncStatus::LOCAL_STATUS_CODE`] marks a status as generated locally
/// instead of sent by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncStatus(pub u32);

impl SyncStatus {
    /// No error.
    pub const OK: SyncStatus = SyncStatus(0);
    /// HTTP success, also accepted as "no error".
    pub const HTTP_OK: SyncStatus = SyncStatus(200);
    /// Credentials rejected.
    pub const UNAUTHORIZED: SyncStatus = SyncStatus(401);
    /// Access forbidden.
    pub const FORBIDDEN: SyncStatus = SyncStatus(403);
    /// Resource not found.
    pub const NOT_FOUND: SyncStatus = SyncStatus(404);
    /// Generic fatal error.
    pub const FATAL: SyncStatus = SyncStatus(500);
    /// Offset for locally generated codes.
    pub const LOCAL_STATUS_CODE: u32 = 10000;
    /// Last code of the local range.
    pub const LOCAL_STATUS_CODE_END: u32 = 10999;
    /// Aborted at the request of the user.
    pub const USER_ABORT: SyncStatus = SyncStatus(20017);
    /// Transport layer failure.
    pub const TRANSPORT_FAILURE: SyncStatus = SyncStatus(20043);
    /// Helper process ended before producing a report.
    pub const DIED_PREMATURELY: SyncStatus = SyncStatus(22002);

    /// Numeric value.
    pub fn code(self) -> u32 {
        self.0
    }

    /// True for [`OK`](Self::OK) and [`HTTP_OK`](Self::HTTP_OK).
    pub fn is_ok(self) -> bool {
        self == Self::OK || self == Self::HTTP_OK
    }

    /// Strips the local marker: 10xxx becomes xxx.
    pub fn normalized(self) -> SyncStatus {
        if (Self::LOCAL_STATUS_CODE..=Self::LOCAL_STATUS_CODE_END).contains(&self.0) {
            SyncStatus(self.0 - Self::LOCAL_STATUS_CODE)
        } else {
            self
        }
    }

    /// Compares two codes, treating `xxx` and `10xxx` as equal.
    pub fn matches(self, other: SyncStatus) -> bool {
        self.normalized() == other.normalized()
    }
}

impl From<u32> for SyncStatus {
    fn from(code: u32) -> Self {
        SyncStatus(code)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_codes() {
        assert!(SyncStatus::OK.is_ok());
        assert!(SyncStatus::HTTP_OK.is_ok());
        assert!(!SyncStatus::FATAL.is_ok());
    }

    #[test]
    fn local_codes_normalize() {
        assert_eq!(SyncStatus(10403).normalized(), SyncStatus::FORBIDDEN);
        assert_eq!(SyncStatus(403).normalized(), SyncStatus::FORBIDDEN);
        assert_eq!(SyncStatus::USER_ABORT.normalized(), SyncStatus::USER_ABORT);
        assert!(SyncStatus(10500).matches(SyncStatus::FATAL));
        assert!(!SyncStatus(10500).matches(SyncStatus::FORBIDDEN));
    }
}
