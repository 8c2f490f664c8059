//! Scripted sessions, prompts and providers for tests.
//!
//! The scripted session plays the client side inside the helper: in round
//! `i` it sends `client-msg-i` and expects `server-reply-i`. The parent
//! side is played by [`ScriptedServer`].

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::str::FromStr;

use parking_lot::Mutex;
use syncevo_local_transport::{
    DatastoreConfig, ItemStore, LocalSyncConfig, LocalTransportAgent, LocalTransportError,
    MemoryItemStore, NestedSessionFactory, NestedSessionSetup, PasswordPrompt, PasswordSource,
    PendingReply, SyncSession, Transport, TransportResult, TransportStatus,
};
use syncevo_protocol::{
    Credentials, DatastoreReport, ItemLocation, ItemOperation, PasswordKey, PasswordRequest,
    RemoteError, SyncMode, SyncReport, SyncStatus,
};
use syncevo_session::{AuthProvider, SessionResult};
use tracing::{debug, error, info};

/// Number of message rounds of the scripted session.
pub const ROUNDS_PROP: &str = "scripted.rounds";

/// Behavior of the scripted session, see [`ScriptedBehavior`].
pub const BEHAVIOR_PROP: &str = "scripted.behavior";

/// Content type used by the scripted session.
pub const SCRIPTED_CONTENT_TYPE: &str = "application/vnd.syncml+xml";

/// Error of the `fail-report` behavior.
pub const FAIL_REPORT_ERROR: &str = "addressbook (remote, status 403): access denied";

/// Datastores configured in every scripted helper config.
pub const SCRIPTED_DATASTORES: [&str; 4] = ["addressbook", "calendar", "todo", "memo"];

/// Message the helper sends in `round`.
pub fn client_message(round: u32) -> String {
    format!("client-msg-{round}")
}

/// Message the parent sends in `round`.
pub fn server_reply(round: u32) -> String {
    format!("server-reply-{round}")
}

/// What the scripted session does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptedBehavior {
    /// Exchange all rounds and report success.
    #[default]
    Normal,
    /// Exit with code 3 before sending anything.
    Crash,
    /// Report a 403 failure without sending anything.
    FailReport,
    /// Ask for a password first and append it to the first message.
    Password,
}

impl ScriptedBehavior {
    /// Property value.
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptedBehavior::Normal => "normal",
            ScriptedBehavior::Crash => "crash",
            ScriptedBehavior::FailReport => "fail-report",
            ScriptedBehavior::Password => "password",
        }
    }
}

impl FromStr for ScriptedBehavior {
    type Err = LocalTransportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "normal" => Ok(ScriptedBehavior::Normal),
            "crash" => Ok(ScriptedBehavior::Crash),
            "fail-report" => Ok(ScriptedBehavior::FailReport),
            "password" => Ok(ScriptedBehavior::Password),
            other => Err(LocalTransportError::config(format!(
                "unknown scripted behavior: {other}"
            ))),
        }
    }
}

/// Parent config that runs the scripted session in `helper`.
///
/// Maps `contacts` to the helper's `addressbook` and `events` to its
/// `calendar`, with two rounds.
pub fn scripted_config(helper: &str, behavior: ScriptedBehavior) -> LocalSyncConfig {
    LocalSyncConfig::new("server", "phone")
        .with_helper(helper)
        .with_prop(ROUNDS_PROP, "2")
        .with_prop(BEHAVIOR_PROP, behavior.as_str())
        .with_datastore(DatastoreConfig::new("contacts", SyncMode::TwoWay).with_uri("addressbook"))
        .with_datastore(
            DatastoreConfig::new("events", SyncMode::RefreshFromLocal).with_uri("calendar"),
        )
        .with_datastore(DatastoreConfig::new("notes", SyncMode::Disabled).with_uri("memo"))
}

/// Nested session driven by properties of the parent config.
pub struct ScriptedSession {
    setup: NestedSessionSetup,
    passwords: Rc<dyn PasswordSource>,
    behavior: ScriptedBehavior,
    rounds: u32,
    stores: BTreeMap<String, MemoryItemStore>,
}

impl ScriptedSession {
    /// Creates the session for `setup`.
    pub fn new(setup: NestedSessionSetup, passwords: Rc<dyn PasswordSource>) -> TransportResult<Self> {
        let behavior = match setup.config_props.get(BEHAVIOR_PROP) {
            Some(value) => value.parse()?,
            None => ScriptedBehavior::Normal,
        };
        let rounds = setup
            .config_props
            .get(ROUNDS_PROP)
            .and_then(|value| value.parse().ok())
            .unwrap_or(2);
        let stores = setup
            .enabled_datastores()
            .map(|datastore| (datastore.name.clone(), MemoryItemStore::new()))
            .collect();
        Ok(Self {
            setup,
            passwords,
            behavior,
            rounds,
            stores,
        })
    }

    fn ask_password(&self) -> TransportResult<String> {
        let request = PasswordRequest::new(
            "password",
            format!("password for {}", self.setup.config_name),
            PasswordKey {
                user: self.setup.credentials.username.clone(),
                server: self.setup.server_config.name.clone(),
                ..PasswordKey::default()
            },
        );
        self.passwords.ask_password(&request)
    }

    fn apply_round(&mut self, report: &mut SyncReport, round: u32) -> TransportResult<()> {
        for (name, store) in &mut self.stores {
            store.insert(None, format!("item {round}").as_bytes())?;
            report
                .datastore_mut(name)
                .record(ItemLocation::Local, ItemOperation::Added, 1);
        }
        Ok(())
    }
}

impl SyncSession for ScriptedSession {
    fn run(&mut self, transport: &mut dyn Transport) -> TransportResult<SyncReport> {
        let mut report = SyncReport::new();
        for datastore in self.setup.enabled_datastores() {
            *report.datastore_mut(&datastore.name) = DatastoreReport::new(datastore.mode);
        }
        let password = match self.behavior {
            ScriptedBehavior::Crash => {
                error!("scripted session crashing");
                std::process::exit(3);
            }
            ScriptedBehavior::FailReport => {
                report.set_failure(SyncStatus(10403), FAIL_REPORT_ERROR);
                return Ok(report);
            }
            ScriptedBehavior::Password => Some(self.ask_password()?),
            ScriptedBehavior::Normal => None,
        };

        transport.set_content_type(SCRIPTED_CONTENT_TYPE);
        for round in 1..=self.rounds {
            let mut message = client_message(round);
            if let (1, Some(password)) = (round, &password) {
                message.push(':');
                message.push_str(password);
            }
            transport.send(message.as_bytes())?;
            let status = transport.wait(false)?;
            if status != TransportStatus::GotReply {
                return Err(LocalTransportError::transport(format!(
                    "unexpected transport status {status}"
                )));
            }
            let reply = transport.get_reply()?;
            if reply.data != server_reply(round).as_bytes() {
                return Err(LocalTransportError::transport(format!(
                    "unexpected message from parent: {}",
                    String::from_utf8_lossy(&reply.data)
                )));
            }
            debug!(round, "scripted round done");
            self.apply_round(&mut report, round)?;
        }
        transport.shutdown()?;
        info!(rounds = self.rounds, "scripted session finished");
        Ok(report)
    }
}

/// Creates [`ScriptedSession`]s. Configs whose name starts with
/// `missing` do not exist.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptedFactory;

impl ScriptedFactory {
    /// Creates the factory.
    pub fn new() -> Self {
        Self
    }
}

impl NestedSessionFactory for ScriptedFactory {
    fn datastores(&self, config: &str) -> TransportResult<Vec<String>> {
        if config.starts_with("missing") {
            return Err(LocalTransportError::config(format!(
                "{config}: configuration does not exist"
            )));
        }
        Ok(SCRIPTED_DATASTORES.iter().map(|name| name.to_string()).collect())
    }

    fn create(
        &self,
        setup: NestedSessionSetup,
        passwords: Rc<dyn PasswordSource>,
    ) -> TransportResult<Box<dyn SyncSession>> {
        Ok(Box::new(ScriptedSession::new(setup, passwords)?))
    }
}

/// What the parent saw of a scripted session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOutcome {
    /// Messages received from the helper.
    pub received: Vec<String>,
    /// Transport status after the last wait.
    pub status: TransportStatus,
    /// Content type of the helper's final answer, if it arrived.
    pub final_content_type: Option<String>,
}

/// Parent side of the scripted exchange.
#[derive(Debug, Clone, Copy)]
pub struct ScriptedServer {
    rounds: u32,
}

impl ScriptedServer {
    /// Creates a driver for `rounds` rounds.
    pub fn new(rounds: u32) -> Self {
        Self { rounds }
    }

    /// Starts the agent, exchanges all rounds and shuts down.
    ///
    /// Stops early, after shutting down, when a wait ends without a reply.
    pub fn run(&self, agent: &mut LocalTransportAgent) -> TransportResult<ServerOutcome> {
        agent.start()?;
        let mut outcome = ServerOutcome {
            received: Vec::new(),
            status: TransportStatus::Inactive,
            final_content_type: None,
        };
        for round in 1..=self.rounds {
            outcome.status = agent.wait(false)?;
            if outcome.status != TransportStatus::GotReply {
                agent.shutdown()?;
                return Ok(outcome);
            }
            let reply = agent.get_reply()?;
            outcome
                .received
                .push(String::from_utf8_lossy(&reply.data).into_owned());
            agent.set_content_type(&reply.content_type);
            agent.send(server_reply(round).as_bytes())?;
        }
        outcome.status = agent.wait(false)?;
        if outcome.status == TransportStatus::GotReply {
            outcome.final_content_type = Some(agent.get_reply()?.content_type);
            outcome.status = agent.status();
        }
        agent.shutdown()?;
        Ok(outcome)
    }
}

/// Password prompt that records requests and gives a fixed answer.
#[derive(Debug, Default)]
pub struct RecordingPasswordPrompt {
    answer: Option<String>,
    requests: RefCell<Vec<PasswordRequest>>,
}

impl RecordingPasswordPrompt {
    /// Answers every request with `password`.
    pub fn answering(password: impl Into<String>) -> Self {
        Self {
            answer: Some(password.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    /// Declines every request.
    pub fn declining() -> Self {
        Self::default()
    }

    /// Requests seen so far.
    pub fn requests(&self) -> Vec<PasswordRequest> {
        self.requests.borrow().clone()
    }
}

impl PasswordPrompt for RecordingPasswordPrompt {
    fn ask_password(&self, request: PasswordRequest, reply: PendingReply<String>) {
        self.requests.borrow_mut().push(request);
        match &self.answer {
            Some(password) => reply.done(password.clone()),
            None => reply.failed(RemoteError::new("password request declined")),
        }
    }
}

#[derive(Debug, Default)]
struct AuthCounters {
    cached: Option<String>,
    issued: u32,
    invalidations: u32,
}

/// Auth provider that hands out numbered tokens (`token-1`, ...) or fixed
/// credentials and counts what happens.
#[derive(Debug)]
pub struct FakeAuthProvider {
    oauth2: bool,
    credentials: Credentials,
    counters: Mutex<AuthCounters>,
}

impl FakeAuthProvider {
    /// Provider of OAuth2 bearer tokens.
    pub fn oauth2() -> Self {
        Self {
            oauth2: true,
            credentials: Credentials::default(),
            counters: Mutex::new(AuthCounters::default()),
        }
    }

    /// Provider of basic credentials.
    pub fn basic(credentials: Credentials) -> Self {
        Self {
            oauth2: false,
            credentials,
            counters: Mutex::new(AuthCounters::default()),
        }
    }

    /// Number of tokens handed out.
    pub fn tokens_issued(&self) -> u32 {
        self.counters.lock().issued
    }

    /// Number of cache invalidations.
    pub fn invalidations(&self) -> u32 {
        self.counters.lock().invalidations
    }
}

impl AuthProvider for FakeAuthProvider {
    fn supports_oauth2(&self) -> bool {
        self.oauth2
    }

    fn oauth2_bearer(&self) -> SessionResult<String> {
        let mut counters = self.counters.lock();
        if let Some(token) = &counters.cached {
            return Ok(token.clone());
        }
        counters.issued += 1;
        let token = format!("token-{}", counters.issued);
        counters.cached = Some(token.clone());
        Ok(token)
    }

    fn credentials(&self) -> SessionResult<Credentials> {
        Ok(self.credentials.clone())
    }

    fn invalidate_cached_secrets(&self) {
        let mut counters = self.counters.lock();
        counters.cached = None;
        counters.invalidations += 1;
    }
}
