//! Outcome report of a sync session.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolResult;
use crate::mode::SyncMode;
use crate::status::SyncStatus;

/// Item counts for one location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCounts {
    /// Items added.
    pub added: u64,
    /// Items updated.
    pub updated: u64,
    /// Items removed.
    pub removed: u64,
}

impl OperationCounts {
    /// Sum over all operations.
    pub fn any(&self) -> u64 {
        self.added + self.updated + self.removed
    }
}

/// Where a change was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemLocation {
    /// In the local datastore.
    Local,
    /// On the peer.
    Remote,
}

/// Kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOperation {
    /// New item.
    Added,
    /// Modified item.
    Updated,
    /// Deleted item.
    Removed,
}

/// Report for one datastore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreReport {
    /// Mode that was used.
    pub mode: Option<SyncMode>,
    /// Status of this datastore.
    pub status: SyncStatus,
    /// Changes applied locally.
    pub local: OperationCounts,
    /// Changes sent to the peer.
    pub remote: OperationCounts,
}

impl DatastoreReport {
    /// Creates an empty report for a datastore synced with `mode`.
    pub fn new(mode: SyncMode) -> Self {
        Self {
            mode: Some(mode),
            ..Self::default()
        }
    }

    /// Adds `count` items to the given bucket.
    pub fn record(&mut self, location: ItemLocation, operation: ItemOperation, count: u64) {
        let counts = match location {
            ItemLocation::Local => &mut self.local,
            ItemLocation::Remote => &mut self.remote,
        };
        match operation {
            ItemOperation::Added => counts.added += count,
            ItemOperation::Updated => counts.updated += count,
            ItemOperation::Removed => counts.removed += count,
        }
    }

    /// Reads one bucket.
    pub fn count(&self, location: ItemLocation, operation: ItemOperation) -> u64 {
        let counts = match location {
            ItemLocation::Local => &self.local,
            ItemLocation::Remote => &self.remote,
        };
        match operation {
            ItemOperation::Added => counts.added,
            ItemOperation::Updated => counts.updated,
            ItemOperation::Removed => counts.removed,
        }
    }
}

/// Final outcome of a sync session.
///
/// The child always produces one and sends it to the parent as JSON
/// through `StoreSyncReport`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Overall status.
    pub status: SyncStatus,
    /// Human-readable explanation of a failure.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// Per-datastore details, keyed by datastore name.
    #[serde(default)]
    pub datastores: BTreeMap<String, DatastoreReport>,
}

impl SyncReport {
    /// Creates a successful, empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a failure report.
    pub fn failed(status: SyncStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            datastores: BTreeMap::new(),
        }
    }

    /// Report used when the helper went away without sending one.
    pub fn died_prematurely() -> Self {
        Self::failed(
            SyncStatus::DIED_PREMATURELY,
            "local sync helper quit before sending its report",
        )
    }

    /// Records a failure unless one was recorded already.
    pub fn set_failure(&mut self, status: SyncStatus, error: &str) {
        if self.status.is_ok() {
            self.status = status;
        }
        if self.error.is_empty() && !error.is_empty() {
            self.error = error.to_string();
        }
    }

    /// Returns the report of a datastore, creating it if necessary.
    pub fn datastore_mut(&mut self, name: &str) -> &mut DatastoreReport {
        self.datastores.entry(name.to_string()).or_default()
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.status == SyncStatus::OK && self.error.is_empty() && self.datastores.is_empty()
    }

    /// Serializes to the JSON text used on the wire.
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses the JSON text produced by [`to_json`](Self::to_json).
    pub fn from_json(text: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_keeps_first_error() {
        let mut report = SyncReport::new();
        assert!(report.is_empty());
        report.set_failure(SyncStatus::FATAL, "first");
        report.set_failure(SyncStatus::UNAUTHORIZED, "second");
        assert_eq!(report.status, SyncStatus::FATAL);
        assert_eq!(report.error, "first");
    }

    #[test]
    fn json_contains_counts() {
        let mut report = SyncReport::new();
        let store = report.datastore_mut("addressbook");
        store.mode = Some(SyncMode::TwoWay);
        store.record(ItemLocation::Local, ItemOperation::Added, 3);
        store.record(ItemLocation::Remote, ItemOperation::Removed, 1);

        let text = report.to_json().unwrap();
        assert!(text.contains("\"addressbook\""));
        assert!(text.contains("\"two-way\""));

        let parsed = SyncReport::from_json(&text).unwrap();
        let store = &parsed.datastores["addressbook"];
        assert_eq!(store.count(ItemLocation::Local, ItemOperation::Added), 3);
        assert_eq!(store.remote.any(), 1);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(SyncReport::from_json("not json").is_err());
    }
}
