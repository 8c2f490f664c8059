//! Property-based test generators using proptest.

use std::collections::BTreeMap;

use proptest::prelude::*;
use syncevo_protocol::{Credentials, DatastoreMapping, SyncMode};

/// Strategy for any sync mode.
pub fn sync_mode_strategy() -> impl Strategy<Value = SyncMode> {
    prop::sample::select(SyncMode::ALL.to_vec())
}

/// Strategy for datastore names.
pub fn datastore_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,15}").expect("Invalid regex")
}

/// Strategy for credentials, sometimes empty.
pub fn credentials_strategy() -> impl Strategy<Value = Credentials> {
    (
        prop::string::string_regex("([a-z]{1,8})?").expect("Invalid regex"),
        prop::string::string_regex("([!-~]{1,12})?").expect("Invalid regex"),
    )
        .prop_map(|(username, password)| Credentials::new(username, password))
}

/// Strategy for a set of configured datastores plus parent mappings that
/// all target one of them, each at most once.
pub fn mapped_datastores_strategy(
) -> impl Strategy<Value = (Vec<String>, BTreeMap<String, DatastoreMapping>)> {
    prop::collection::btree_set(datastore_name_strategy(), 1..6).prop_flat_map(|names| {
        let configured: Vec<String> = names.into_iter().collect();
        let count = configured.len();
        (
            Just(configured),
            prop::sample::subsequence((0..count).collect::<Vec<_>>(), 0..=count),
            prop::collection::vec(sync_mode_strategy(), count),
        )
            .prop_map(|(configured, picked, modes)| {
                let mappings = picked
                    .into_iter()
                    .map(|index| {
                        (
                            format!("parent-{}", configured[index]),
                            DatastoreMapping {
                                target: configured[index].clone(),
                                mode: modes[index],
                            },
                        )
                    })
                    .collect();
                (configured, mappings)
            })
    })
}
