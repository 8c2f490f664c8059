//! Opaque item storage of a PIM backend.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use syncevo_protocol::SyncStatus;

use crate::error::{LocalTransportError, TransportResult};

/// Identity and revision of a stored item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ItemRevision {
    /// Locally unique id.
    pub luid: String,
    /// Changes whenever the item changes.
    pub revision: String,
}

/// Result of [`ItemStore::insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Id of the stored item.
    pub luid: String,
    /// New revision.
    pub revision: String,
    /// True if an existing item was replaced.
    pub replaced: bool,
}

/// Items of one datastore, keyed by LUID.
///
/// Sync sessions only see items as opaque bytes.
pub trait ItemStore: Send + Sync {
    /// All items with their current revision.
    fn list(&self) -> TransportResult<Vec<ItemRevision>>;

    /// Reads one item.
    fn get(&self, luid: &str) -> TransportResult<Option<Vec<u8>>>;

    /// Adds a new item (`luid` is `None`) or replaces an existing one.
    ///
    /// # Errors
    ///
    /// Replacing an unknown item fails with status 404.
    fn insert(&mut self, luid: Option<&str>, data: &[u8]) -> TransportResult<InsertOutcome>;

    /// Removes an item.
    ///
    /// # Errors
    ///
    /// Removing an unknown item fails with status 404.
    fn delete(&mut self, luid: &str) -> TransportResult<()>;
}

#[derive(Debug, Default)]
struct Items {
    next_luid: u64,
    items: BTreeMap<String, (u64, Vec<u8>)>,
}

/// An item store in memory, for tests and scripted sessions.
#[derive(Debug, Default)]
pub struct MemoryItemStore {
    items: RwLock<Items>,
}

impl MemoryItemStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.read().items.len()
    }

    /// True if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn not_found(luid: &str) -> LocalTransportError {
    LocalTransportError::status_error(SyncStatus::NOT_FOUND, format!("item {luid} not found"))
}

impl ItemStore for MemoryItemStore {
    fn list(&self) -> TransportResult<Vec<ItemRevision>> {
        Ok(self
            .items
            .read()
            .items
            .iter()
            .map(|(luid, (revision, _))| ItemRevision {
                luid: luid.clone(),
                revision: revision.to_string(),
            })
            .collect())
    }

    fn get(&self, luid: &str) -> TransportResult<Option<Vec<u8>>> {
        Ok(self.items.read().items.get(luid).map(|(_, data)| data.clone()))
    }

    fn insert(&mut self, luid: Option<&str>, data: &[u8]) -> TransportResult<InsertOutcome> {
        let mut items = self.items.write();
        match luid {
            Some(luid) => {
                let entry = items.items.get_mut(luid).ok_or_else(|| not_found(luid))?;
                entry.0 += 1;
                entry.1 = data.to_vec();
                Ok(InsertOutcome {
                    luid: luid.to_string(),
                    revision: entry.0.to_string(),
                    replaced: true,
                })
            }
            None => {
                items.next_luid += 1;
                let luid = items.next_luid.to_string();
                items.items.insert(luid.clone(), (1, data.to_vec()));
                Ok(InsertOutcome {
                    luid,
                    revision: "1".to_string(),
                    replaced: false,
                })
            }
        }
    }

    fn delete(&mut self, luid: &str) -> TransportResult<()> {
        self.items
            .write()
            .items
            .remove(luid)
            .map(|_| ())
            .ok_or_else(|| not_found(luid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_update_delete() {
        let mut store = MemoryItemStore::new();
        assert!(store.is_empty());

        let added = store.insert(None, b"BEGIN:VCARD").unwrap();
        assert!(!added.replaced);
        assert_eq!(added.revision, "1");

        let updated = store.insert(Some(&added.luid), b"BEGIN:VCARD 2").unwrap();
        assert!(updated.replaced);
        assert_eq!(updated.revision, "2");
        assert_eq!(store.get(&added.luid).unwrap().unwrap(), b"BEGIN:VCARD 2");
        assert_eq!(
            store.list().unwrap(),
            vec![ItemRevision {
                luid: added.luid.clone(),
                revision: "2".into()
            }]
        );

        store.delete(&added.luid).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.get(&added.luid).unwrap(), None);
    }

    #[test]
    fn unknown_items() {
        let mut store = MemoryItemStore::new();
        let err = store.delete("42").unwrap_err();
        assert_eq!(err.status(), SyncStatus::NOT_FOUND);
        assert!(store.insert(Some("42"), b"x").is_err());
    }
}
