//! Sync modes and their translation between the two sides of a local sync.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Sync mode of a datastore.
///
/// `Local`/`Remote` variants are relative to the side that configured them,
/// which is why the child has to translate the parent's modes with
/// [`SyncMode::peer_mode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Datastore does not take part.
    Disabled,
    /// Normal two-way sync.
    TwoWay,
    /// Slow sync comparing all items.
    Slow,
    /// Replace remote data with local data.
    RefreshFromLocal,
    /// Replace local data with remote data.
    RefreshFromRemote,
    /// Send local changes only.
    OneWayFromLocal,
    /// Receive remote changes only.
    OneWayFromRemote,
    /// Refresh initiated by the client role.
    RefreshFromClient,
    /// Refresh initiated by the server role.
    RefreshFromServer,
    /// One-way from the client role.
    OneWayFromClient,
    /// One-way from the server role.
    OneWayFromServer,
    /// Caching peer requests all data.
    LocalCacheSlow,
    /// Caching peer requests changes only.
    LocalCacheIncremental,
}

impl SyncMode {
    /// All modes, in declaration order.
    pub const ALL: [SyncMode; 13] = [
        SyncMode::Disabled,
        SyncMode::TwoWay,
        SyncMode::Slow,
        SyncMode::RefreshFromLocal,
        SyncMode::RefreshFromRemote,
        SyncMode::OneWayFromLocal,
        SyncMode::OneWayFromRemote,
        SyncMode::RefreshFromClient,
        SyncMode::RefreshFromServer,
        SyncMode::OneWayFromClient,
        SyncMode::OneWayFromServer,
        SyncMode::LocalCacheSlow,
        SyncMode::LocalCacheIncremental,
    ];

    /// Mode the peer has to run so that data flows as this side requested.
    ///
    /// Local/remote directions swap. A caching peer asking for a full refresh
    /// gets a slow sync, and one asking for an incremental update gets a
    /// two-way sync. Everything else is direction-neutral.
    pub fn peer_mode(self) -> SyncMode {
        match self {
            SyncMode::RefreshFromLocal => SyncMode::RefreshFromRemote,
            SyncMode::RefreshFromRemote => SyncMode::RefreshFromLocal,
            SyncMode::OneWayFromLocal => SyncMode::OneWayFromRemote,
            SyncMode::OneWayFromRemote => SyncMode::OneWayFromLocal,
            SyncMode::LocalCacheSlow => SyncMode::Slow,
            SyncMode::LocalCacheIncremental => SyncMode::TwoWay,
            other => other,
        }
    }

    /// Returns true unless the datastore is disabled.
    pub fn is_enabled(self) -> bool {
        self != SyncMode::Disabled
    }

    /// Configuration name of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::Disabled => "disabled",
            SyncMode::TwoWay => "two-way",
            SyncMode::Slow => "slow",
            SyncMode::RefreshFromLocal => "refresh-from-local",
            SyncMode::RefreshFromRemote => "refresh-from-remote",
            SyncMode::OneWayFromLocal => "one-way-from-local",
            SyncMode::OneWayFromRemote => "one-way-from-remote",
            SyncMode::RefreshFromClient => "refresh-from-client",
            SyncMode::RefreshFromServer => "refresh-from-server",
            SyncMode::OneWayFromClient => "one-way-from-client",
            SyncMode::OneWayFromServer => "one-way-from-server",
            SyncMode::LocalCacheSlow => "local-cache-slow",
            SyncMode::LocalCacheIncremental => "local-cache-incremental",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("none") {
            return Ok(SyncMode::Disabled);
        }
        SyncMode::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ProtocolError::UnknownSyncMode(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn directions_swap() {
        assert_eq!(SyncMode::RefreshFromLocal.peer_mode(), SyncMode::RefreshFromRemote);
        assert_eq!(SyncMode::RefreshFromRemote.peer_mode(), SyncMode::RefreshFromLocal);
        assert_eq!(SyncMode::OneWayFromLocal.peer_mode(), SyncMode::OneWayFromRemote);
        assert_eq!(SyncMode::OneWayFromRemote.peer_mode(), SyncMode::OneWayFromLocal);
    }

    #[test]
    fn caching_modes_map_to_neutral_modes() {
        assert_eq!(SyncMode::LocalCacheSlow.peer_mode(), SyncMode::Slow);
        assert_eq!(SyncMode::LocalCacheIncremental.peer_mode(), SyncMode::TwoWay);
        assert_eq!(SyncMode::TwoWay.peer_mode(), SyncMode::TwoWay);
        assert_eq!(SyncMode::Slow.peer_mode(), SyncMode::Slow);
        assert_eq!(SyncMode::RefreshFromClient.peer_mode(), SyncMode::RefreshFromClient);
    }

    #[test]
    fn names_parse_back() {
        for mode in SyncMode::ALL {
            assert_eq!(mode.as_str().parse::<SyncMode>().unwrap(), mode);
        }
        assert_eq!("none".parse::<SyncMode>().unwrap(), SyncMode::Disabled);
        assert!("sideways".parse::<SyncMode>().is_err());
    }

    #[test]
    fn serde_uses_config_names() {
        let json = serde_json::to_string(&SyncMode::LocalCacheIncremental).unwrap();
        assert_eq!(json, "\"local-cache-incremental\"");
    }

    fn any_mode() -> impl Strategy<Value = SyncMode> {
        prop::sample::select(SyncMode::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn inversion_is_self_inverse_except_caching(mode in any_mode()) {
            let caching = matches!(mode, SyncMode::LocalCacheSlow | SyncMode::LocalCacheIncremental);
            if !caching {
                prop_assert_eq!(mode.peer_mode().peer_mode(), mode);
            }
            prop_assert_eq!(mode.peer_mode().is_enabled(), mode.is_enabled());
        }
    }
}
