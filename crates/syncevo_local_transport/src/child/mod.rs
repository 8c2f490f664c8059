//! Helper side of a local sync.
//!
//! The helper connects back to the parent, waits for `StartSync`, runs the
//! nested session through a [`ChildTransport`] and finally sends its
//! report with `StoreSyncReport`.

mod log;
mod plan;
mod transport;
mod ui;

use std::cell::{Cell, RefCell};
use std::env;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use syncevo_protocol::{Call, MessageReference, RemoteError, ReplyValue, StartSyncRequest, SyncReport};
use syncevo_runtime::{
    ignore_sigpipe, install_child_dispositions, EventLoop, StateBlocker, SuspendController,
};
use syncevo_shm::BufferPair;
use tracing::{debug, error, info, info_span, warn};

pub use log::{forward_logs, log_channel, ChildLogLayer, LogReceiver};
pub use plan::{child_names, nested_setup, plan_datastores, ChildNames};
pub use transport::ChildTransport;
pub use ui::ChildUi;

use crate::error::{LocalTransportError, TransportResult};
use crate::forkexec::ProcessLink;
use crate::session::{FreezeFlag, NestedSessionFactory, PasswordSource, SyncSession};
use crate::transport::{Reply, TransportStatus};
use transport::{cancel_reply, ChildState};

/// Seconds to sleep before connecting, for attaching a debugger.
pub const CHILD_DELAY_ENV: &str = "SYNCEVOLUTION_LOCAL_CHILD_DELAY";

enum Setup {
    Waiting,
    Ready {
        session: Box<dyn SyncSession>,
        process: String,
    },
    Failed(LocalTransportError),
    Taken,
}

struct CallContext {
    state: Weak<RefCell<ChildState>>,
    setup: Weak<RefCell<Setup>>,
    factory: Rc<dyn NestedSessionFactory>,
    ui: Rc<ChildUi>,
    freeze: FreezeFlag,
}

impl CallContext {
    fn handle(&self, call: Call, reply: PendingReply) {
        let (Some(state), Some(setup)) = (self.state.upgrade(), self.setup.upgrade()) else {
            reply.failed(RemoteError::new("local sync helper is shutting down"));
            return;
        };
        match call {
            Call::StartSync(request) => self.start_sync(&state, &setup, &request, reply),
            Call::SendMsg(reference) => send_msg(&state, &reference, reply),
            Call::SetFreeze(freeze) => {
                debug!(freeze, "parent changed freeze state");
                self.freeze.set(freeze);
                reply.done(ReplyValue::Unit);
            }
            other => reply.failed(RemoteError::new(format!(
                "{} is not supported by the local sync helper",
                other.method()
            ))),
        }
    }

    fn start_sync(
        &self,
        state: &Rc<RefCell<ChildState>>,
        setup: &Rc<RefCell<Setup>>,
        request: &StartSyncRequest,
        reply: PendingReply,
    ) {
        debug!(config = %request.child_config, "parent started the nested sync");
        let old = state
            .borrow_mut()
            .replace_msg_to_parent(Some(reply), "sync() was called");
        cancel_reply(old, "sync() was called");

        if !matches!(*setup.borrow(), Setup::Waiting) {
            let reply = state.borrow_mut().msg_to_parent.take();
            if let Some(reply) = reply {
                reply.failed(RemoteError::new("nested sync already started"));
            }
            return;
        }

        match self.prepare(request) {
            Ok((session, buffers, process)) => {
                {
                    let mut state = state.borrow_mut();
                    state.buffers = Some(buffers);
                    state.status = TransportStatus::Active;
                }
                *setup.borrow_mut() = Setup::Ready { session, process };
            }
            Err(err) => {
                error!("{err}");
                let reply = state.borrow_mut().msg_to_parent.take();
                if let Some(reply) = reply {
                    reply.failed(err.to_remote());
                }
                *setup.borrow_mut() = Setup::Failed(err);
            }
        }
    }

    fn prepare(
        &self,
        request: &StartSyncRequest,
    ) -> TransportResult<(Box<dyn SyncSession>, BufferPair, String)> {
        let names = child_names(&request.child_config);
        let configured = self.factory.datastores(&names.config)?;
        let setup = nested_setup(request, &names, &configured, self.freeze.clone())?;
        let buffers = BufferPair::for_child(setup.max_msg_size)?;
        let passwords: Rc<dyn PasswordSource> = self.ui.clone();
        let session = self.factory.create(setup, passwords)?;
        Ok((session, buffers, names.process))
    }
}

type PendingReply = crate::rpc::PendingReply<ReplyValue>;

fn read_message(state: &ChildState, reference: &MessageReference) -> TransportResult<Vec<u8>> {
    let buffers = state
        .buffers
        .as_ref()
        .ok_or_else(|| LocalTransportError::invalid_state("no message buffers"))?;
    Ok(buffers.remote.read(reference)?.to_vec())
}

fn send_msg(state: &Rc<RefCell<ChildState>>, reference: &MessageReference, reply: PendingReply) {
    debug!(len = reference.length, "got message from parent");
    let old = state
        .borrow_mut()
        .replace_msg_to_parent(None, "sendMsg() was called");
    cancel_reply(old, "sendMsg() was called");

    let mut current = state.borrow_mut();
    if current.status != TransportStatus::Active {
        drop(current);
        reply.failed(RemoteError::new("child not expecting any message"));
        return;
    }
    match read_message(&current, reference) {
        Ok(data) => {
            current.message = Some(Reply {
                data,
                content_type: reference.content_type.clone(),
            });
            current.status = TransportStatus::GotReply;
            current.msg_to_parent = Some(reply);
        }
        Err(err) => {
            current.status = TransportStatus::Failed;
            drop(current);
            reply.failed(err.to_remote());
        }
    }
}

/// The helper process of a local sync.
pub struct ChildRuntime {
    event_loop: EventLoop,
    suspend: SuspendController,
    link: ProcessLink,
    state: Rc<RefCell<ChildState>>,
    setup: Rc<RefCell<Setup>>,
    // abort blocker taken when the parent quits, never released
    parent_gone: Rc<RefCell<Option<Arc<StateBlocker>>>>,
}

impl ChildRuntime {
    /// Connects to the parent and installs the RPC handlers.
    ///
    /// `logs` are forwarded to the parent as `LogOutput` signals.
    pub fn connect(
        factory: Rc<dyn NestedSessionFactory>,
        logs: Option<LogReceiver>,
    ) -> TransportResult<Self> {
        let event_loop = EventLoop::new()?;
        let suspend = SuspendController::global();
        let link = ProcessLink::connect(&event_loop)?;

        let parent_gone = Rc::new(RefCell::new(None));
        {
            let gone = parent_gone.clone();
            let suspend = suspend.clone();
            let waker = event_loop.waker();
            link.on_quit(move || {
                error!("sync parent quit unexpectedly");
                *gone.borrow_mut() = Some(suspend.abort());
                waker.wake();
            });
        }
        if let Some(logs) = logs {
            forward_logs(logs, link.connection().downgrade(), &event_loop);
        }

        let state = Rc::new(RefCell::new(ChildState::new()));
        let setup = Rc::new(RefCell::new(Setup::Waiting));
        let context = CallContext {
            state: Rc::downgrade(&state),
            setup: Rc::downgrade(&setup),
            factory,
            ui: Rc::new(ChildUi::new(
                link.connection().downgrade(),
                event_loop.clone(),
                suspend.clone(),
            )),
            freeze: FreezeFlag::new(),
        };
        link.connection()
            .set_call_handler(move |call, reply| context.handle(call, reply));

        Ok(Self {
            event_loop,
            suspend,
            link,
            state,
            setup,
            parent_gone,
        })
    }

    /// True once the parent went away.
    pub fn parent_gone(&self) -> bool {
        self.parent_gone.borrow().is_some()
    }

    fn step(&self, what: &str) -> TransportResult<()> {
        debug!("local transport: {what}");
        if !self.link.is_connected() {
            return Err(LocalTransportError::transport(
                "local transport child no longer has a parent, terminating",
            ));
        }
        self.event_loop.iterate();
        Ok(())
    }

    /// Runs the nested session and reports to the parent.
    ///
    /// Returns the process exit code: 0 if the session ran to completion,
    /// 1 if it failed with an error or was aborted before it started.
    pub fn run(self) -> TransportResult<i32> {
        while matches!(*self.setup.borrow(), Setup::Waiting) {
            if !self.suspend.is_normal() {
                debug!("aborted while waiting for sync() from parent");
                return Ok(1);
            }
            self.step("waiting for sync() from parent")?;
        }

        let setup = std::mem::replace(&mut *self.setup.borrow_mut(), Setup::Taken);
        let outcome = match setup {
            Setup::Ready { session, process } => self.run_session(session, &process),
            Setup::Failed(err) => Err(err),
            Setup::Waiting | Setup::Taken => {
                Err(LocalTransportError::invalid_state("nested sync was not prepared"))
            }
        };

        let code = match outcome {
            Ok(report) => {
                self.send_report(&report, true);
                0
            }
            Err(err) => {
                error!("{err}");
                let report = SyncReport::failed(err.status(), err.to_string());
                self.send_report(&report, false);
                1
            }
        };

        // the parent ignores this answer once it has the report
        let pending = self.state.borrow_mut().msg_to_parent.take();
        drop(pending);
        self.link.connection().finish(&self.event_loop);
        Ok(code)
    }

    fn run_session(
        &self,
        mut session: Box<dyn SyncSession>,
        process: &str,
    ) -> TransportResult<SyncReport> {
        let span = info_span!("local_sync", process);
        let _entered = span.enter();
        install_child_dispositions()?;
        info!("target side of local sync ready");
        let mut transport = ChildTransport::new(
            self.state.clone(),
            self.link.connection().clone(),
            self.event_loop.clone(),
            self.suspend.clone(),
        );
        session.run(&mut transport)
    }

    /// Sends the report. After a failure only one round of the event loop
    /// is spent waiting for the acknowledgement.
    fn send_report(&self, report: &SyncReport, wait_for_ack: bool) {
        let json = match report.to_json() {
            Ok(json) => json,
            Err(err) => {
                error!("encoding sync report failed: {err}");
                return;
            }
        };
        let acked = Rc::new(Cell::new(false));
        let flag = acked.clone();
        let sent = self
            .link
            .connection()
            .call(Call::StoreSyncReport(json), move |result| {
                match result {
                    Ok(_) => debug!("parent stored the sync report"),
                    Err(err) => warn!("storing sync report failed: {err}"),
                }
                flag.set(true);
            });
        if let Err(err) = sent {
            warn!(status = %report.status, error = %report.error, "parent gone, sync report not delivered: {err}");
            return;
        }

        if wait_for_ack {
            while !acked.get() && self.link.is_connected() && self.suspend.is_normal() {
                debug!("waiting for parent's ACK for sync report");
                self.event_loop.iterate();
            }
        } else if self.link.is_connected() {
            debug!("waiting once for parent's ACK for sync report");
            self.event_loop.iterate();
        }
    }
}

/// Entry point of the helper executable; returns the exit code.
///
/// Honors `SYNCEVOLUTION_LOCAL_CHILD_DELAY` and ignores SIGPIPE so that a
/// vanished parent shows up as an error instead of killing the helper.
pub fn run_child(factory: Rc<dyn NestedSessionFactory>, logs: Option<LogReceiver>) -> i32 {
    if let Some(delay) = env::var(CHILD_DELAY_ENV)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
    {
        info!(delay, "local sync helper sleeping before connecting");
        thread::sleep(Duration::from_secs(delay));
    }
    if let Err(err) = ignore_sigpipe() {
        error!("{err}");
        return 1;
    }
    match ChildRuntime::connect(factory, logs).and_then(ChildRuntime::run) {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            1
        }
    }
}
