//! RPC messages exchanged between local sync parent and child.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use syncevo_shm::MessageReference;

use crate::mode::SyncMode;
use crate::status::SyncStatus;

/// Sync property carrying the maximum message size.
pub const MAX_MSG_SIZE_PROP: &str = "maxMsgSize";

/// Default maximum message size in bytes.
pub const DEFAULT_MAX_MSG_SIZE: usize = 150_000;

/// Username/password pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Username, may be empty.
    pub username: String,
    /// Password, may be empty.
    pub password: String,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// True if neither username nor password is set.
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

/// Identifies the parent's configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfigRef {
    /// Config name.
    pub name: String,
    /// Root path of the config, or `ephemeral`.
    pub location: String,
}

/// Sync properties forwarded from the parent's config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigProps(pub BTreeMap<String, String>);

impl ConfigProps {
    /// Creates empty properties.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a property.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Reads a property.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// The maximum message size, if set and valid.
    pub fn max_msg_size(&self) -> Option<usize> {
        self.get(MAX_MSG_SIZE_PROP)?.trim().parse().ok()
    }
}

/// How one parent datastore maps to the child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreMapping {
    /// Name of the child datastore.
    pub target: String,
    /// Mode as configured on the parent side.
    pub mode: SyncMode,
}

/// Arguments of `StartSync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSyncRequest {
    /// Config the child is to run.
    pub child_config: String,
    /// The parent's config.
    pub server_config: ServerConfigRef,
    /// Log directory of the parent.
    pub log_dir: String,
    /// Whether the parent writes its own session logs.
    pub do_logging: bool,
    /// Credentials from the parent config.
    pub credentials: Credentials,
    /// Sync properties.
    pub config_props: ConfigProps,
    /// Parent datastore name to child datastore and parent-side mode.
    pub datastores: BTreeMap<String, DatastoreMapping>,
}

/// Lookup key of a password.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordKey {
    /// User name.
    pub user: String,
    /// Server the password belongs to.
    pub server: String,
    /// Domain.
    pub domain: String,
    /// Protocol.
    pub protocol: String,
}

/// Arguments of `AskPassword`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordRequest {
    /// Name of the password property.
    pub name: String,
    /// Description shown to the user.
    pub description: String,
    /// Lookup key.
    pub key: PasswordKey,
}

impl PasswordRequest {
    /// Creates a request.
    pub fn new(name: impl Into<String>, description: impl Into<String>, key: PasswordKey) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            key,
        }
    }
}

/// A method invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Call {
    /// Parent to child: freeze or thaw the nested session.
    SetFreeze(bool),
    /// Parent to child: start the nested session.
    StartSync(StartSyncRequest),
    /// Parent to child: next message from the parent.
    SendMsg(MessageReference),
    /// Child to parent: obtain a password from the parent's UI.
    AskPassword(PasswordRequest),
    /// Child to parent: final report as JSON.
    StoreSyncReport(String),
}

impl Call {
    /// Method name, for logging.
    pub fn method(&self) -> &'static str {
        match self {
            Call::SetFreeze(_) => "SetFreeze",
            Call::StartSync(_) => "StartSync",
            Call::SendMsg(_) => "SendMsg",
            Call::AskPassword(_) => "AskPassword",
            Call::StoreSyncReport(_) => "StoreSyncReport",
        }
    }
}

/// Successful result of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyValue {
    /// No result.
    Unit,
    /// A message in the replier's buffer.
    Message(MessageReference),
    /// A password.
    Password(String),
}

/// Error result of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Explanation.
    pub message: String,
    /// Status code, if the failure carried one.
    pub status: Option<SyncStatus>,
}

impl RemoteError {
    /// Creates an error without status.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    /// Creates an error with status.
    pub fn with_status(message: impl Into<String>, status: SyncStatus) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
        }
    }

    /// Error used for replies that were dropped without an answer.
    pub fn cancelled() -> Self {
        Self::new("cancelled")
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {status})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// One log event forwarded from child to parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Level name (`ERROR`, `WARN`, `INFO`, `DEBUG`, `TRACE`).
    pub level: String,
    /// Optional prefix, usually the module the event came from.
    pub prefix: String,
    /// Formatted message.
    pub message: String,
}

/// A one-way notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    /// Child to parent: log output.
    LogOutput(LogRecord),
}

/// Content of a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameBody {
    /// Method call expecting a reply with the same serial.
    Call {
        /// Serial chosen by the caller.
        serial: u64,
        /// The call.
        call: Call,
    },
    /// Reply to an earlier call.
    Reply {
        /// Serial of the call.
        serial: u64,
        /// Result.
        result: Result<ReplyValue, RemoteError>,
    },
    /// Notification without reply.
    Signal(Signal),
}

/// A frame on the RPC socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Fork/exec instance the frame belongs to.
    pub instance: String,
    /// Content.
    pub body: FrameBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_msg_size_prop() {
        let mut props = ConfigProps::new();
        assert_eq!(props.max_msg_size(), None);
        props.set(MAX_MSG_SIZE_PROP, "4096");
        assert_eq!(props.max_msg_size(), Some(4096));
        props.set(MAX_MSG_SIZE_PROP, "lots");
        assert_eq!(props.max_msg_size(), None);
    }

    #[test]
    fn remote_error_display() {
        assert_eq!(RemoteError::new("boom").to_string(), "boom");
        assert_eq!(
            RemoteError::with_status("denied", SyncStatus::FORBIDDEN).to_string(),
            "denied (status 403)"
        );
    }

    #[test]
    fn credentials_empty() {
        assert!(Credentials::default().is_empty());
        assert!(!Credentials::new("joe", "").is_empty());
    }
}
