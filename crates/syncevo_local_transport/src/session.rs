//! Seams between the transport and the sync engine running on top of it.

use std::cell::Cell;
use std::rc::Rc;

use syncevo_protocol::{ConfigProps, Credentials, PasswordRequest, ServerConfigRef, SyncMode, SyncReport};

use crate::error::TransportResult;
use crate::rpc::PendingReply;
use crate::transport::Transport;

/// A sync session that exchanges its messages through a [`Transport`].
pub trait SyncSession {
    /// Runs the whole session and returns its report.
    ///
    /// # Errors
    ///
    /// Errors abort the session; the caller turns them into a failed report.
    fn run(&mut self, transport: &mut dyn Transport) -> TransportResult<SyncReport>;
}

/// Source of passwords for a session running in the helper.
pub trait PasswordSource {
    /// Returns the password, blocking until the user answered.
    fn ask_password(&self, request: &PasswordRequest) -> TransportResult<String>;
}

/// The parent's user interface for password requests of the helper.
///
/// Answers through the pending reply, possibly much later.
pub trait PasswordPrompt {
    /// Asks the user for a password.
    fn ask_password(&self, request: PasswordRequest, reply: PendingReply<String>);
}

/// Freeze request of the parent, shared with the running session.
#[derive(Debug, Clone, Default)]
pub struct FreezeFlag(Rc<Cell<bool>>);

impl FreezeFlag {
    /// Creates a flag that is not set.
    pub fn new() -> Self {
        Self::default()
    }

    /// True while the session should not make progress.
    pub fn is_frozen(&self) -> bool {
        self.0.get()
    }

    /// Sets or clears the flag.
    pub fn set(&self, frozen: bool) {
        self.0.set(frozen);
    }
}

/// A datastore as the helper is going to sync it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDatastore {
    /// Datastore name in the helper's config.
    pub name: String,
    /// Mode from the helper's point of view; `Disabled` if not synced.
    pub mode: SyncMode,
    /// Datastore name on the parent side.
    pub uri: String,
}

/// Everything a [`NestedSessionFactory`] needs to create the helper's
/// session.
#[derive(Debug, Clone)]
pub struct NestedSessionSetup {
    /// Config the helper runs, `peer@context`.
    pub config_name: String,
    /// Process name used in logs: `peer@context`, or `@context` for the
    /// default peer.
    pub process_name: String,
    /// The parent's config.
    pub server_config: ServerConfigRef,
    /// Root of the helper config inside the parent's, `None` if ephemeral.
    pub config_root: Option<String>,
    /// Log directory override.
    pub log_dir: Option<String>,
    /// Credentials to use instead of the configured ones; empty fields
    /// keep the configured value.
    pub credentials: Credentials,
    /// Sync properties of the parent.
    pub config_props: ConfigProps,
    /// Every configured datastore.
    pub datastores: Vec<PlannedDatastore>,
    /// Maximum message size.
    pub max_msg_size: usize,
    /// Freeze request of the parent.
    pub freeze: FreezeFlag,
}

impl NestedSessionSetup {
    /// Datastores that take part in the sync.
    pub fn enabled_datastores(&self) -> impl Iterator<Item = &PlannedDatastore> {
        self.datastores.iter().filter(|datastore| datastore.mode.is_enabled())
    }
}

/// Creates the session that runs inside the helper.
pub trait NestedSessionFactory {
    /// Datastores configured in `config`.
    ///
    /// # Errors
    ///
    /// Fails if the config does not exist.
    fn datastores(&self, config: &str) -> TransportResult<Vec<String>>;

    /// Creates the session.
    fn create(
        &self,
        setup: NestedSessionSetup,
        passwords: Rc<dyn PasswordSource>,
    ) -> TransportResult<Box<dyn SyncSession>>;
}
