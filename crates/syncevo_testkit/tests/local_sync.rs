//! End-to-end tests: the parent agent drives the scripted helper binary.

use std::rc::Rc;

use syncevo_local_transport::{DatastoreConfig, LocalTransportAgent, Transport, TransportStatus};
use syncevo_protocol::{ItemLocation, ItemOperation, SyncMode, SyncStatus, SHUTDOWN_CONTENT_TYPE};
use syncevo_runtime::EventLoop;
use syncevo_testkit::prelude::*;

const HELPER: &str = env!("CARGO_BIN_EXE_syncevo-local-sync");

fn agent(behavior: ScriptedBehavior) -> LocalTransportAgent {
    LocalTransportAgent::new(scripted_config(HELPER, behavior), EventLoop::new().unwrap())
}

#[test]
fn round_trip() {
    let mut agent = agent(ScriptedBehavior::Normal);
    let outcome = ScriptedServer::new(2).run(&mut agent).unwrap();

    assert_eq!(outcome.received, vec![client_message(1), client_message(2)]);
    assert_eq!(outcome.final_content_type.as_deref(), Some(SHUTDOWN_CONTENT_TYPE));
    assert_eq!(outcome.status, TransportStatus::Inactive);

    let report = agent.client_sync_report();
    assert!(report.status.is_ok(), "{report:?}");
    assert_eq!(report.datastores.len(), 2);
    let addressbook = &report.datastores["addressbook"];
    assert_eq!(addressbook.mode, Some(SyncMode::TwoWay));
    assert_eq!(addressbook.count(ItemLocation::Local, ItemOperation::Added), 2);
    assert_eq!(
        report.datastores["calendar"].mode,
        Some(SyncMode::RefreshFromRemote)
    );
}

#[test]
fn freeze_while_running() {
    let mut agent = agent(ScriptedBehavior::Normal);
    agent.start().unwrap();
    assert_eq!(agent.wait(false).unwrap(), TransportStatus::GotReply);
    assert!(agent.child_pid().is_some());

    agent.set_freeze(true).unwrap();
    agent.set_freeze(false).unwrap();

    let reply = agent.get_reply().unwrap();
    assert_eq!(reply.data, client_message(1).as_bytes());
    assert_eq!(reply.content_type, SCRIPTED_CONTENT_TYPE);
    assert_eq!(agent.status(), TransportStatus::Inactive);

    agent.cancel();
    agent.shutdown().unwrap();
}

#[test]
fn send_while_waiting_is_rejected() {
    let mut agent = agent(ScriptedBehavior::Normal);
    agent.start().unwrap();
    let err = agent.send(b"too early").unwrap_err();
    assert_eq!(err.to_string(), "cannot send while waiting for a reply");
    agent.cancel();
    agent.shutdown().unwrap();
}

#[test]
fn cancel_stops_helper() {
    let mut agent = agent(ScriptedBehavior::Normal);
    agent.start().unwrap();
    assert_eq!(agent.wait(false).unwrap(), TransportStatus::GotReply);
    agent.cancel();
    assert_eq!(agent.status(), TransportStatus::Canceled);
    agent.shutdown().unwrap();
    assert_eq!(agent.status(), TransportStatus::Canceled);
    assert!(agent.child_pid().is_none());
}

#[test]
fn helper_crash() {
    let mut agent = agent(ScriptedBehavior::Crash);
    let err = ScriptedServer::new(2).run(&mut agent).unwrap_err();
    assert_eq!(err.to_string(), "child process quit without sending its message");
    assert_eq!(agent.status(), TransportStatus::Failed);
    assert_eq!(agent.client_sync_report().status, SyncStatus::DIED_PREMATURELY);
}

#[test]
fn wait_fails_when_helper_crashes_before_first_reply() {
    let mut agent = agent(ScriptedBehavior::Crash);
    agent.start().unwrap();
    let err = agent.wait(false).unwrap_err();
    assert_eq!(err.to_string(), "child process quit without sending its message");
    assert_eq!(agent.status(), TransportStatus::Failed);
    agent.shutdown().unwrap();
}

#[test]
fn helper_reports_failure() {
    let mut agent = agent(ScriptedBehavior::FailReport);
    let err = ScriptedServer::new(2).run(&mut agent).unwrap_err();
    assert_eq!(err.status(), SyncStatus(10403));
    assert_eq!(
        err.to_string(),
        "failure on target side phone of local sync: access denied"
    );
    assert_eq!(agent.status(), TransportStatus::Failed);
    assert_eq!(agent.client_sync_report().error, FAIL_REPORT_ERROR);
}

#[test]
fn unknown_datastore() {
    let config = scripted_config(HELPER, ScriptedBehavior::Normal)
        .with_datastore(DatastoreConfig::new("journal", SyncMode::TwoWay));
    let mut agent = LocalTransportAgent::new(config, EventLoop::new().unwrap());
    let outcome = ScriptedServer::new(2).run(&mut agent).unwrap();
    assert!(outcome.received.is_empty());
    assert_eq!(outcome.status, TransportStatus::Failed);
    assert_eq!(
        agent.client_sync_report().error,
        "phone/journal: datastore not configured"
    );
}

#[test]
fn password_from_prompt() {
    let mut agent = agent(ScriptedBehavior::Password);
    let prompt = Rc::new(RecordingPasswordPrompt::answering("secret"));
    agent.set_password_prompt(prompt.clone());

    let outcome = ScriptedServer::new(2).run(&mut agent).unwrap();
    assert_eq!(
        outcome.received,
        vec![format!("{}:secret", client_message(1)), client_message(2)]
    );
    let requests = prompt.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].name, "password");
    assert_eq!(requests[0].key.server, "server");
    assert!(agent.client_sync_report().status.is_ok());
}

#[test]
fn password_without_prompt() {
    let mut agent = agent(ScriptedBehavior::Password);
    let err = ScriptedServer::new(2).run(&mut agent).unwrap_err();
    assert_eq!(err.to_string(), "failure on target side phone of local sync");
    assert_eq!(
        agent.client_sync_report().error,
        "retrieving password failed: not connected to UI"
    );
}

#[test]
fn declined_password() {
    let mut agent = agent(ScriptedBehavior::Password);
    agent.set_password_prompt(Rc::new(RecordingPasswordPrompt::declining()));
    assert!(ScriptedServer::new(2).run(&mut agent).is_err());
    assert_eq!(
        agent.client_sync_report().error,
        "retrieving password failed: password request declined"
    );
}
