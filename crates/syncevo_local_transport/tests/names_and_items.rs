//! Property tests for config names and the in-memory item store.

use proptest::prelude::*;
use syncevo_local_transport::{
    child_names, normalize_config_name, split_config_name, ItemStore, MemoryItemStore,
    DEFAULT_PEER,
};

fn config_name() -> impl Strategy<Value = String> {
    (
        "[a-zA-Z0-9-]{0,8}",
        prop::option::of(prop_oneof![Just("Default".to_string()), "[a-z]{1,6}"]),
    )
        .prop_map(|(peer, context)| match context {
            Some(context) => format!("{peer}@{context}"),
            None => peer,
        })
}

proptest! {
    #[test]
    fn normalizing_is_idempotent(name in config_name()) {
        let once = normalize_config_name(&name);
        prop_assert_eq!(normalize_config_name(&once), once.clone());
        prop_assert_eq!(once.to_lowercase(), once);
    }

    #[test]
    fn split_rejoins(peer in "[a-z0-9-]{0,8}", context in "[a-z]{1,6}") {
        let name = format!("{peer}@{context}");
        prop_assert_eq!(split_config_name(&name), (peer.as_str(), context.as_str()));
    }

    #[test]
    fn child_config_always_has_peer_and_context(name in config_name()) {
        let names = child_names(&name);
        let (peer, context) = split_config_name(&names.config);
        prop_assert!(!peer.is_empty());
        prop_assert!(!context.is_empty());
        let default_peer = peer == DEFAULT_PEER;
        prop_assert_eq!(names.process.starts_with('@'), default_peer);
    }

    #[test]
    fn store_keeps_every_insert(items in prop::collection::vec(any::<Vec<u8>>(), 0..20)) {
        let mut store = MemoryItemStore::new();
        let mut luids = Vec::new();
        for item in &items {
            let outcome = store.insert(None, item).unwrap();
            prop_assert!(!outcome.replaced);
            luids.push(outcome.luid);
        }
        prop_assert_eq!(store.len(), items.len());
        prop_assert_eq!(store.list().unwrap().len(), items.len());
        for (luid, item) in luids.iter().zip(&items) {
            let got = store.get(luid).unwrap();
            prop_assert_eq!(got.as_deref(), Some(item.as_slice()));
        }
    }
}
