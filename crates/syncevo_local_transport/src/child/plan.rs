//! Turning a `StartSync` request into the setup of the nested session.

use std::collections::BTreeMap;

use syncevo_protocol::{DatastoreMapping, StartSyncRequest, SyncMode, DEFAULT_MAX_MSG_SIZE};

use crate::config::{normalize_config_name, split_config_name, DEFAULT_PEER};
use crate::error::{LocalTransportError, TransportResult};
use crate::session::{FreezeFlag, NestedSessionSetup, PlannedDatastore};

/// Names of the helper's config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildNames {
    /// Normalized name as sent by the parent, used in error messages.
    pub normalized: String,
    /// `peer@context`, with the default peer filled in.
    pub config: String,
    /// Process name for logging.
    pub process: String,
}

/// Derives the helper's config and process names.
pub fn child_names(child_config: &str) -> ChildNames {
    let normalized = normalize_config_name(child_config);
    let (peer, context) = split_config_name(&normalized);
    let peer = if peer.is_empty() { DEFAULT_PEER } else { peer };
    let process = if peer == DEFAULT_PEER {
        format!("@{context}")
    } else {
        format!("{peer}@{context}")
    };
    ChildNames {
        config: format!("{peer}@{context}"),
        process,
        normalized,
    }
}

/// Decides which datastores of the helper take part and how.
///
/// Every configured datastore starts out disabled. Each datastore mapped
/// by the parent is enabled with the mode seen from the helper's side and
/// the parent's datastore name as URI.
pub fn plan_datastores(
    config: &str,
    configured: &[String],
    mappings: &BTreeMap<String, DatastoreMapping>,
    server_name: &str,
) -> TransportResult<Vec<PlannedDatastore>> {
    let mut planned: BTreeMap<&str, PlannedDatastore> = configured
        .iter()
        .map(|name| {
            (
                name.as_str(),
                PlannedDatastore {
                    name: name.clone(),
                    mode: SyncMode::Disabled,
                    uri: String::new(),
                },
            )
        })
        .collect();

    for (source, mapping) in mappings {
        if !mapping.mode.is_enabled() {
            continue;
        }
        let target = mapping.target.as_str();
        let Some(datastore) = planned.get_mut(target) else {
            return Err(if target.is_empty() {
                LocalTransportError::config("missing URI for one of the datastores")
            } else {
                LocalTransportError::config(format!("{config}/{target}: datastore not configured"))
            });
        };
        if datastore.mode.is_enabled() {
            return Err(LocalTransportError::config(format!(
                "{config}/{target}: datastore targetted twice by {server_name}"
            )));
        }
        datastore.mode = mapping.mode.peer_mode();
        datastore.uri = source.clone();
    }
    Ok(planned.into_values().collect())
}

/// Builds the setup of the nested session; `configured` are the
/// datastores of the helper's config.
pub fn nested_setup(
    request: &StartSyncRequest,
    names: &ChildNames,
    configured: &[String],
    freeze: FreezeFlag,
) -> TransportResult<NestedSessionSetup> {
    let datastores = plan_datastores(
        &names.normalized,
        configured,
        &request.datastores,
        &request.server_config.name,
    )?;
    let config_root = match request.server_config.location.as_str() {
        "ephemeral" => None,
        root => Some(format!("{root}/.{}", names.normalized)),
    };
    let log_dir = (!request.do_logging).then(|| format!("{}/child", request.log_dir));
    Ok(NestedSessionSetup {
        config_name: names.config.clone(),
        process_name: names.process.clone(),
        server_config: request.server_config.clone(),
        config_root,
        log_dir,
        credentials: request.credentials.clone(),
        config_props: request.config_props.clone(),
        datastores,
        max_msg_size: request.config_props.max_msg_size().unwrap_or(DEFAULT_MAX_MSG_SIZE),
        freeze,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncevo_protocol::{ConfigProps, Credentials, ServerConfigRef, MAX_MSG_SIZE_PROP};

    fn mapping(target: &str, mode: SyncMode) -> DatastoreMapping {
        DatastoreMapping {
            target: target.into(),
            mode,
        }
    }

    fn configured() -> Vec<String> {
        ["addressbook", "calendar", "todo"].map(String::from).to_vec()
    }

    #[test]
    fn names() {
        let names = child_names("Phone@Default");
        assert_eq!(names.normalized, "phone");
        assert_eq!(names.config, "phone@default");
        assert_eq!(names.process, "phone@default");

        let names = child_names("@work");
        assert_eq!(names.config, "target-config@work");
        assert_eq!(names.process, "@work");
    }

    #[test]
    fn enables_mapped_datastores_with_peer_mode() {
        let mappings = BTreeMap::from([
            ("contacts".to_string(), mapping("addressbook", SyncMode::RefreshFromLocal)),
            ("events".to_string(), mapping("calendar", SyncMode::TwoWay)),
            ("memos".to_string(), mapping("memo", SyncMode::Disabled)),
        ]);
        let planned = plan_datastores("phone", &configured(), &mappings, "server").unwrap();
        assert_eq!(
            planned,
            vec![
                PlannedDatastore {
                    name: "addressbook".into(),
                    mode: SyncMode::RefreshFromRemote,
                    uri: "contacts".into(),
                },
                PlannedDatastore {
                    name: "calendar".into(),
                    mode: SyncMode::TwoWay,
                    uri: "events".into(),
                },
                PlannedDatastore {
                    name: "todo".into(),
                    mode: SyncMode::Disabled,
                    uri: String::new(),
                },
            ]
        );
    }

    #[test]
    fn mapping_errors() {
        let unknown = BTreeMap::from([("x".to_string(), mapping("journal", SyncMode::Slow))]);
        assert_eq!(
            plan_datastores("phone", &configured(), &unknown, "server")
                .unwrap_err()
                .to_string(),
            "phone/journal: datastore not configured"
        );

        let empty = BTreeMap::from([("x".to_string(), mapping("", SyncMode::Slow))]);
        assert_eq!(
            plan_datastores("phone", &configured(), &empty, "server")
                .unwrap_err()
                .to_string(),
            "missing URI for one of the datastores"
        );

        let twice = BTreeMap::from([
            ("a".to_string(), mapping("todo", SyncMode::Slow)),
            ("b".to_string(), mapping("todo", SyncMode::TwoWay)),
        ]);
        assert_eq!(
            plan_datastores("phone", &configured(), &twice, "server")
                .unwrap_err()
                .to_string(),
            "phone/todo: datastore targetted twice by server"
        );
    }

    #[test]
    fn setup_from_request() {
        let mut config_props = ConfigProps::new();
        config_props.set(MAX_MSG_SIZE_PROP, "2048");
        let request = StartSyncRequest {
            child_config: "phone".into(),
            server_config: ServerConfigRef {
                name: "server".into(),
                location: "/home/u/.config/syncevolution/server".into(),
            },
            log_dir: "/tmp/logs".into(),
            do_logging: false,
            credentials: Credentials::new("user", ""),
            config_props,
            datastores: BTreeMap::from([(
                "contacts".to_string(),
                mapping("addressbook", SyncMode::TwoWay),
            )]),
        };
        let setup =
            nested_setup(&request, &child_names(&request.child_config), &configured(), FreezeFlag::new())
                .unwrap();
        assert_eq!(setup.config_name, "phone@default");
        assert_eq!(
            setup.config_root.as_deref(),
            Some("/home/u/.config/syncevolution/server/.phone")
        );
        assert_eq!(setup.log_dir.as_deref(), Some("/tmp/logs/child"));
        assert_eq!(setup.max_msg_size, 2048);
        assert_eq!(setup.enabled_datastores().count(), 1);
    }
}
