//! Parent side of a local sync.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::OnceLock;

use regex::Regex;
use syncevo_protocol::{
    Call, DatastoreMapping, LogRecord, MessageReference, RemoteError, ReplyValue,
    ServerConfigRef, Signal, StartSyncRequest, SyncReport, SyncStatus, MAX_MSG_SIZE_PROP,
};
use syncevo_runtime::EventLoop;
use syncevo_shm::BufferPair;
use tracing::{debug, error, info, trace, warn};

use crate::config::{normalize_config_name, LocalSyncConfig};
use crate::error::{LocalTransportError, RpcError, RpcResult, TransportResult};
use crate::forkexec::{ProcessSupervisor, SupervisorEvent, SupervisorState};
use crate::rpc::{PendingReply, RpcConnection};
use crate::session::PasswordPrompt;
use crate::transport::{Reply, Transport, TransportStatus};

const CONTENT_TYPE_DEFAULT: &str = "application/vnd.syncml+xml";

/// Matches `(local|remote, status N): explanation` in the child's error.
fn child_error_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\((?:local|remote), status (\d+)\): (.*)").ok())
        .as_ref()
}

/// Builds the error reported when the child quit while a reply was
/// outstanding.
pub fn child_quit_error(child_config: &str, report: Option<&SyncReport>) -> LocalTransportError {
    let Some(report) = report.filter(|report| !report.status.is_ok()) else {
        return LocalTransportError::transport("child process quit without sending its message");
    };
    let status = report.status.normalized();
    let mut explanation = format!("failure on target side {child_config} of local sync");
    let detail = child_error_pattern().and_then(|pattern| pattern.captures(&report.error));
    if let Some(captures) = detail {
        let child_status = captures[1].parse::<u32>().ok();
        let same = child_status.is_some_and(|child| {
            child == status.code() || child.checked_sub(SyncStatus::LOCAL_STATUS_CODE) == Some(status.code())
        });
        if same {
            explanation.push_str(": ");
            explanation.push_str(&captures[2]);
        }
    }
    LocalTransportError::status_error(report.status, explanation)
}

struct AgentState {
    status: TransportStatus,
    connection: Option<RpcConnection>,
    reply: Option<MessageReference>,
    client_report: Option<SyncReport>,
    terminated: bool,
    // the child went away while a reply was outstanding
    child_lost: bool,
}

impl AgentState {
    /// Marks the transport as failed. Drop the returned connection only
    /// after the state borrow ended: its pending calls borrow the state.
    #[must_use]
    fn fail(&mut self) -> Option<RpcConnection> {
        self.status = TransportStatus::Failed;
        self.connection.take()
    }
}

/// Runs the peer of a sync session in a helper process.
///
/// The helper is started by [`start()`](Self::start) and runs a complete
/// sync session of its own. Messages travel through two shared buffers,
/// control calls over RPC.
pub struct LocalTransportAgent {
    config: LocalSyncConfig,
    child_config: String,
    event_loop: EventLoop,
    state: Rc<RefCell<AgentState>>,
    buffers: Option<BufferPair>,
    supervisor: Option<ProcessSupervisor>,
    content_type: String,
    prompt: Option<Rc<dyn PasswordPrompt>>,
}

impl fmt::Debug for LocalTransportAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransportAgent")
            .field("child_config", &self.child_config)
            .field("status", &self.status())
            .field("supervisor", &self.supervisor)
            .finish()
    }
}

impl LocalTransportAgent {
    /// Creates an agent; nothing runs until [`start()`](Self::start).
    pub fn new(config: LocalSyncConfig, event_loop: EventLoop) -> Self {
        let child_config = normalize_config_name(&config.child_config);
        Self {
            config,
            child_config,
            event_loop,
            state: Rc::new(RefCell::new(AgentState {
                status: TransportStatus::Inactive,
                connection: None,
                reply: None,
                client_report: None,
                terminated: false,
                child_lost: false,
            })),
            buffers: None,
            supervisor: None,
            content_type: CONTENT_TYPE_DEFAULT.to_string(),
            prompt: None,
        }
    }

    /// Answers password requests of the helper. Without a prompt they
    /// fail with "not connected to UI".
    pub fn set_password_prompt(&mut self, prompt: Rc<dyn PasswordPrompt>) {
        self.prompt = Some(prompt);
    }

    /// The configuration.
    pub fn config(&self) -> &LocalSyncConfig {
        &self.config
    }

    /// Process id of the helper while it runs.
    pub fn child_pid(&self) -> Option<i32> {
        self.supervisor.as_ref().and_then(ProcessSupervisor::pid)
    }

    /// Spawns the helper and starts the nested session.
    ///
    /// The first message comes from the helper, so the caller continues
    /// with [`wait()`](Transport::wait).
    pub fn start(&mut self) -> TransportResult<()> {
        if self.supervisor.is_some() {
            return Err(LocalTransportError::invalid_state("local transport already started"));
        }
        self.state.borrow_mut().status = TransportStatus::Active;

        let buffers = BufferPair::for_parent(self.config.max_msg_size)?;
        let mut supervisor = ProcessSupervisor::new(&self.config.helper, self.event_loop.clone())
            .with_args(self.config.helper_args.iter().cloned())
            .with_output_mode(self.config.output_mode);
        for (name, value) in self.config.env.iter().cloned().chain(buffers.child_env()) {
            supervisor.add_env_var(name, value);
        }

        let handler = EventHandler {
            state: Rc::downgrade(&self.state),
            prompt: self.prompt.clone(),
            child_config: self.child_config.clone(),
            request: self.start_request(),
        };
        buffers.set_inheritable(true)?;
        let started = supervisor.start(move |event| handler.handle(event));
        let restored = buffers.set_inheritable(false);
        if let Err(err) = started {
            self.state.borrow_mut().status = TransportStatus::Failed;
            return Err(err);
        }
        restored?;

        self.buffers = Some(buffers);
        self.supervisor = Some(supervisor);
        Ok(())
    }

    /// Report of the helper's session.
    ///
    /// A helper that went away without one yields a report with status
    /// [`SyncStatus::DIED_PREMATURELY`].
    pub fn client_sync_report(&self) -> SyncReport {
        self.state
            .borrow()
            .client_report
            .clone()
            .unwrap_or_else(SyncReport::died_prematurely)
    }

    fn start_request(&self) -> StartSyncRequest {
        let mut config_props = self.config.config_props.clone();
        config_props.set(MAX_MSG_SIZE_PROP, self.config.max_msg_size.to_string());
        let datastores: BTreeMap<String, DatastoreMapping> = self
            .config
            .datastores
            .iter()
            .filter(|datastore| datastore.mode.is_enabled())
            .map(|datastore| {
                (
                    datastore.name.clone(),
                    DatastoreMapping {
                        target: datastore.target().to_string(),
                        mode: datastore.mode,
                    },
                )
            })
            .collect();
        StartSyncRequest {
            child_config: self.config.child_config.clone(),
            server_config: ServerConfigRef {
                name: self.config.server_name.clone(),
                location: self.config.server_location().to_string(),
            },
            log_dir: self.config.log_dir.clone(),
            do_logging: self.config.do_logging,
            credentials: self.config.credentials.clone(),
            config_props,
            datastores,
        }
    }

    fn connection(&self) -> Option<RpcConnection> {
        self.state.borrow().connection.clone()
    }
}

struct EventHandler {
    state: Weak<RefCell<AgentState>>,
    prompt: Option<Rc<dyn PasswordPrompt>>,
    child_config: String,
    request: StartSyncRequest,
}

impl EventHandler {
    fn handle(&self, event: SupervisorEvent) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        match event {
            SupervisorEvent::Connected(connection) => self.connected(&state, connection),
            SupervisorEvent::Output { stream, line } => {
                info!(process = %self.child_config, "[{}] <{stream}> {line}", self.child_config);
            }
            SupervisorEvent::Failure { status, error } => {
                error!(process = %self.child_config, %status, "local transport failed: {error}");
                let connection = {
                    let mut state = state.borrow_mut();
                    if state.status == TransportStatus::Active {
                        state.child_lost = true;
                    }
                    state.fail()
                };
                drop(connection);
            }
            SupervisorEvent::Quit(exit) => {
                debug!(process = %self.child_config, %exit, "child process has quit");
                state.borrow_mut().terminated = true;
            }
        }
    }

    fn connected(&self, state: &Rc<RefCell<AgentState>>, connection: RpcConnection) {
        debug!(process = %self.child_config, pid = ?connection.peer_pid(), "child is ready");

        let calls = Rc::downgrade(state);
        let prompt = self.prompt.clone();
        connection.set_call_handler(move |call, reply| handle_child_call(&calls, prompt.as_deref(), call, reply));
        let process = self.child_config.clone();
        connection.on_signal(move |signal| match signal {
            Signal::LogOutput(record) => log_child_output(&process, &record),
        });
        state.borrow_mut().connection = Some(connection.clone());

        debug!(process = %self.child_config, "starting nested sync");
        let replies = Rc::downgrade(state);
        let started = connection.call(Call::StartSync(self.request.clone()), move |result| {
            store_reply(&replies, result);
        });
        if let Err(err) = started {
            error!(process = %self.child_config, "starting nested sync failed: {err}");
            let connection = state.borrow_mut().fail();
            drop(connection);
        }
    }
}

fn handle_child_call(
    state: &Weak<RefCell<AgentState>>,
    prompt: Option<&dyn PasswordPrompt>,
    call: Call,
    reply: PendingReply<ReplyValue>,
) {
    match call {
        Call::AskPassword(request) => match prompt {
            Some(prompt) => {
                debug!(name = %request.name, "forwarding password request of child");
                prompt.ask_password(request, reply.map_into(ReplyValue::Password));
            }
            None => reply.failed(RemoteError::new("not connected to UI")),
        },
        Call::StoreSyncReport(json) => match SyncReport::from_json(&json) {
            Ok(report) => {
                debug!(status = %report.status, "got child sync report");
                if let Some(state) = state.upgrade() {
                    state.borrow_mut().client_report = Some(report);
                }
                reply.done(ReplyValue::Unit);
            }
            Err(err) => reply.failed(RemoteError::new(format!("invalid sync report: {err}"))),
        },
        other => reply.failed(RemoteError::new(format!(
            "{} is not supported by the local sync parent",
            other.method()
        ))),
    }
}

fn store_reply(state: &Weak<RefCell<AgentState>>, result: RpcResult<ReplyValue>) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let mut state = state.borrow_mut();
    if state.status != TransportStatus::Active {
        debug!(status = %state.status, "ignoring late reply of child");
        return;
    }
    let lost = match result {
        Ok(ReplyValue::Message(reference)) => {
            debug!(len = reference.length, content_type = %reference.content_type, "got reply from child");
            state.reply = Some(reference);
            state.status = TransportStatus::GotReply;
            None
        }
        Ok(other) => {
            error!("unexpected reply from child: {other:?}");
            state.fail()
        }
        Err(RpcError::ConnectionLost) if state.client_report.is_none() => {
            error!("child went away before answering");
            state.child_lost = true;
            state.fail()
        }
        // an error after the report arrived is the child shutting down
        Err(err) if state.client_report.is_none() => {
            error!("sending message to child failed: {err}");
            state.fail()
        }
        Err(err) => {
            debug!("child did not answer, its report arrived already: {err}");
            None
        }
    };
    drop(state);
    drop(lost);
}

fn log_child_output(process: &str, record: &LogRecord) {
    let prefix = record.prefix.as_str();
    let message = record.message.as_str();
    match record.level.as_str() {
        "ERROR" => error!(process, prefix, "{message}"),
        "WARN" => warn!(process, prefix, "{message}"),
        "INFO" => info!(process, prefix, "{message}"),
        "DEBUG" => debug!(process, prefix, "{message}"),
        _ => trace!(process, prefix, "{message}"),
    }
}

impl Transport for LocalTransportAgent {
    fn set_content_type(&mut self, content_type: &str) {
        self.content_type = content_type.to_string();
    }

    fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        let status = self.status();
        if status == TransportStatus::Active {
            return Err(LocalTransportError::invalid_state(
                "cannot send while waiting for a reply",
            ));
        }
        let connection = self.connection().filter(RpcConnection::is_connected);
        let (Some(connection), Some(buffers)) = (connection, self.buffers.as_mut()) else {
            self.state.borrow_mut().status = TransportStatus::Failed;
            return Err(LocalTransportError::transport(
                "cannot send message because child process is gone",
            ));
        };

        let reference = buffers.local.write(data, &self.content_type)?;
        debug!(len = reference.length, "sending message to child");
        self.state.borrow_mut().status = TransportStatus::Active;
        let replies = Rc::downgrade(&self.state);
        let sent = connection.call(Call::SendMsg(reference), move |result| {
            store_reply(&replies, result);
        });
        if let Err(err) = sent {
            let connection = self.state.borrow_mut().fail();
            drop(connection);
            return Err(err.into());
        }
        Ok(())
    }

    fn wait(&mut self, no_reply: bool) -> TransportResult<TransportStatus> {
        if self.status() == TransportStatus::Active {
            if no_reply {
                self.state.borrow_mut().status = TransportStatus::Inactive;
            } else {
                loop {
                    {
                        let mut state = self.state.borrow_mut();
                        let quit = state.child_lost
                            || (state.terminated && state.status == TransportStatus::Active);
                        if quit {
                            state.status = TransportStatus::Failed;
                            return Err(child_quit_error(
                                &self.child_config,
                                state.client_report.as_ref(),
                            ));
                        }
                        if state.status != TransportStatus::Active {
                            break;
                        }
                    }
                    debug!("waiting for child to send message");
                    self.event_loop.iterate();
                }
            }
        }
        Ok(self.status())
    }

    fn get_reply(&mut self) -> TransportResult<Reply> {
        let reference = {
            let state = self.state.borrow();
            match (&state.reply, state.status) {
                (Some(reference), TransportStatus::GotReply) => reference.clone(),
                _ => {
                    return Err(LocalTransportError::invalid_state(
                        "internal error, no reply available",
                    ))
                }
            }
        };
        let buffers = self
            .buffers
            .as_ref()
            .ok_or_else(|| LocalTransportError::invalid_state("internal error, no reply available"))?;
        let data = buffers.remote.read(&reference)?.to_vec();
        self.state.borrow_mut().status = TransportStatus::Inactive;
        Ok(Reply {
            data,
            content_type: reference.content_type,
        })
    }

    fn cancel(&mut self) {
        if let Some(supervisor) = &self.supervisor {
            debug!("killing local transport child in cancel()");
            supervisor.stop(None);
        }
        self.state.borrow_mut().status = TransportStatus::Canceled;
    }

    fn shutdown(&mut self) -> TransportResult<()> {
        debug!("parent is shutting down");
        if let Some(supervisor) = &self.supervisor {
            while supervisor.state() != SupervisorState::Terminated {
                debug!("waiting for child to stop");
                self.event_loop.iterate();
            }
        }
        self.supervisor = None;
        let connection = self.state.borrow_mut().connection.take();
        drop(connection);
        Ok(())
    }

    fn set_freeze(&mut self, freeze: bool) -> TransportResult<()> {
        let Some(connection) = self.connection() else {
            return Ok(());
        };
        let result = Rc::new(RefCell::new(None));
        let slot = result.clone();
        connection.call(Call::SetFreeze(freeze), move |reply| {
            *slot.borrow_mut() = Some(reply);
        })?;
        self.event_loop.run_until(|| result.borrow().is_some());
        let reply = result.borrow_mut().take();
        match reply {
            Some(Ok(_)) | None => Ok(()),
            Some(Err(err)) => Err(err.into()),
        }
    }

    fn status(&self) -> TransportStatus {
        self.state.borrow().status
    }
}
