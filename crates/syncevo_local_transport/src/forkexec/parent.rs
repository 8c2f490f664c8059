//! Parent side: starts the helper and watches it.

use std::cell::{Cell, RefCell};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use futures::stream::{self, LocalBoxStream, StreamExt};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use syncevo_protocol::SyncStatus;
use syncevo_runtime::{pipe, EventLoop, LoopWaker};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::UnixListener;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::exit::{classify_exit, ChildExit, SentSignals};
use super::{FORK_EXEC_ENV, FORK_EXEC_INSTANCE_ENV, LIBEXEC_DIR_ENV};
use crate::config::OutputMode;
use crate::error::{LocalTransportError, TransportResult};
use crate::rpc::RpcConnection;

/// Install location of helpers, fixed at build time.
pub const INSTALL_LIBEXEC_DIR: &str = match option_env!("SYNCEVO_LIBEXECDIR") {
    Some(dir) => dir,
    None => "/usr/libexec",
};

static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_instance() -> String {
    format!("forkexec{}", INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed) + 1)
}

/// Finds the helper executable.
///
/// A name containing `/` is used as is. Otherwise `env_dir` (from
/// `SYNCEVOLUTION_LIBEXEC_DIR`) wins, then `install_dir` if the helper
/// exists there, then the plain name for a `PATH` lookup.
pub fn resolve_helper(helper: &str, env_dir: Option<&Path>, install_dir: &Path) -> PathBuf {
    if helper.contains('/') {
        return PathBuf::from(helper);
    }
    if let Some(dir) = env_dir {
        return dir.join(helper);
    }
    let installed = install_dir.join(helper);
    if installed.exists() {
        return installed;
    }
    PathBuf::from(helper)
}

/// Lifecycle of a supervised helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// `start()` not called yet.
    Unstarted,
    /// Running, not connected.
    Started,
    /// Connected over RPC.
    Connected,
    /// Reaped, with all output and RPC traffic consumed.
    Terminated,
}

/// Origin of a line of helper output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
    /// Both streams through one pipe.
    Combined,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputStream::Stdout => "STDOUT",
            OutputStream::Stderr => "STDERR",
            OutputStream::Combined => "OUTPUT",
        })
    }
}

/// Something happened to the helper.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// The helper connected.
    Connected(RpcConnection),
    /// One line of output, without the newline.
    Output {
        /// Stream the line came from.
        stream: OutputStream,
        /// Line text, invalid UTF-8 replaced.
        line: String,
    },
    /// The helper ended unexpectedly. Delivered before [`Quit`](Self::Quit).
    Failure {
        /// Status to report.
        status: SyncStatus,
        /// Explanation.
        error: String,
    },
    /// The helper is gone. Always the last event.
    Quit(ChildExit),
}

type EventHandler = Rc<dyn Fn(SupervisorEvent)>;

struct Shared {
    helper: String,
    waker: LoopWaker,
    state: Cell<SupervisorState>,
    pid: Cell<Option<Pid>>,
    exit: Cell<Option<ChildExit>>,
    sent: Cell<SentSignals>,
    has_connected: Cell<bool>,
    output_done: Cell<bool>,
    rpc_done: Cell<bool>,
    connection: RefCell<Option<RpcConnection>>,
    on_event: RefCell<Option<EventHandler>>,
    accept: RefCell<Option<JoinHandle<()>>>,
    tasks: RefCell<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn emit(&self, event: SupervisorEvent) {
        let handler = self.on_event.borrow().clone();
        if let Some(handler) = handler {
            handler(event);
        }
        self.waker.wake();
    }

    fn maybe_finish(&self) {
        if self.state.get() == SupervisorState::Terminated || !self.output_done.get() {
            return;
        }
        let Some(exit) = self.exit.get() else {
            return;
        };
        if self.has_connected.get() && !self.rpc_done.get() {
            return;
        }

        self.state.set(SupervisorState::Terminated);
        if let Some(accept) = self.accept.borrow_mut().take() {
            accept.abort();
        }
        debug!(helper = %self.helper, %exit, "helper terminated");
        if let Some(error) = classify_exit(exit, self.sent.get(), self.has_connected.get()) {
            self.emit(SupervisorEvent::Failure {
                status: SyncStatus::FATAL,
                error,
            });
        }
        self.emit(SupervisorEvent::Quit(exit));
    }
}

/// Starts a helper process and reports what it does.
///
/// The helper finds the RPC socket through `SYNCEVOLUTION_FORK_EXEC`.
/// Events are delivered from inside the event loop.
pub struct ProcessSupervisor {
    helper: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    output_mode: OutputMode,
    event_loop: EventLoop,
    shared: Rc<Shared>,
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("helper", &self.helper)
            .field("state", &self.shared.state.get())
            .field("pid", &self.shared.pid.get())
            .finish()
    }
}

impl ProcessSupervisor {
    /// Creates a supervisor for `helper`; nothing runs until `start()`.
    pub fn new(helper: impl Into<String>, event_loop: EventLoop) -> Self {
        let helper = helper.into();
        let shared = Rc::new(Shared {
            helper: helper.clone(),
            waker: event_loop.waker(),
            state: Cell::new(SupervisorState::Unstarted),
            pid: Cell::new(None),
            exit: Cell::new(None),
            sent: Cell::new(SentSignals::default()),
            has_connected: Cell::new(false),
            output_done: Cell::new(false),
            rpc_done: Cell::new(false),
            connection: RefCell::new(None),
            on_event: RefCell::new(None),
            accept: RefCell::new(None),
            tasks: RefCell::new(Vec::new()),
        });
        Self {
            helper,
            args: Vec::new(),
            env: Vec::new(),
            output_mode: OutputMode::default(),
            event_loop,
            shared,
        }
    }

    /// Adds helper arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the output handling.
    #[must_use]
    pub fn with_output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        self
    }

    /// Adds an environment variable for the helper.
    pub fn add_env_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.env.push((name.into(), value.into()));
    }

    /// Current state.
    pub fn state(&self) -> SupervisorState {
        self.shared.state.get()
    }

    /// Process id while the helper runs.
    pub fn pid(&self) -> Option<i32> {
        self.shared.pid.get().map(Pid::as_raw)
    }

    /// Exit information once the helper was reaped.
    pub fn exit(&self) -> Option<ChildExit> {
        self.shared.exit.get()
    }

    /// The RPC connection, once the helper connected.
    pub fn connection(&self) -> Option<RpcConnection> {
        self.shared.connection.borrow().clone()
    }

    /// Spawns the helper. `on_event` receives everything that happens to
    /// it afterwards.
    pub fn start<F>(&mut self, on_event: F) -> TransportResult<()>
    where
        F: Fn(SupervisorEvent) + 'static,
    {
        if self.state() != SupervisorState::Unstarted {
            return Err(LocalTransportError::invalid_state(format!(
                "{} already started",
                self.helper
            )));
        }
        let env_dir = env::var_os(LIBEXEC_DIR_ENV).map(PathBuf::from);
        let helper = resolve_helper(&self.helper, env_dir.as_deref(), Path::new(INSTALL_LIBEXEC_DIR));
        let instance = next_instance();

        let _enter = self.event_loop.enter();
        let dir = tempfile::Builder::new().prefix("syncevo-forkexec").tempdir()?;
        let socket_path = dir.path().join("rpc");
        let listener = UnixListener::bind(&socket_path)?;

        let mut command = Command::new(&helper);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(name, value)| (name.as_str(), value.as_str())))
            .env(FORK_EXEC_ENV, &socket_path)
            .env(FORK_EXEC_INSTANCE_ENV, &instance)
            .stdin(Stdio::null());
        let mut combined = None;
        match self.output_mode {
            OutputMode::Separate => {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            OutputMode::Merged => {
                let (read, write) = pipe()?;
                command
                    .stdout(Stdio::from(write.try_clone()?))
                    .stderr(Stdio::from(write));
                combined = Some(read);
            }
        }
        let mut child = command.spawn().map_err(|source| LocalTransportError::Spawn {
            helper: helper.display().to_string(),
            source,
        })?;
        // our copies of the write ends must go, or output never ends
        drop(command);

        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(Pid::from_raw);
        info!(helper = %helper.display(), pid = ?pid.map(Pid::as_raw), %instance, "started helper");
        self.shared.pid.set(pid);
        self.shared.state.set(SupervisorState::Started);
        *self.shared.on_event.borrow_mut() = Some(Rc::new(on_event));

        let mut streams: Vec<LocalBoxStream<'static, (OutputStream, String)>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            streams.push(line_stream(stdout, OutputStream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            streams.push(line_stream(stderr, OutputStream::Stderr));
        }
        if let Some(read) = combined {
            let receiver = tokio::net::unix::pipe::Receiver::from_owned_fd(read)?;
            streams.push(line_stream(receiver, OutputStream::Combined));
        }

        let weak = Rc::downgrade(&self.shared);
        let output = self.event_loop.spawn_local(pump_output(weak.clone(), streams));
        let reaper = self.event_loop.spawn_local(async move {
            let exit = match child.wait().await {
                Ok(status) => ChildExit::from_status(status),
                Err(err) => {
                    warn!("waiting for helper failed: {err}");
                    ChildExit {
                        code: None,
                        signal: None,
                    }
                }
            };
            if let Some(shared) = weak.upgrade() {
                shared.pid.set(None);
                shared.exit.set(Some(exit));
                shared.maybe_finish();
            }
        });
        let accept = self.event_loop.spawn_local(accept_helper(
            Rc::downgrade(&self.shared),
            listener,
            dir,
            instance,
            self.event_loop.clone(),
        ));
        self.shared.tasks.borrow_mut().extend([output, reaper]);
        *self.shared.accept.borrow_mut() = Some(accept);
        Ok(())
    }

    /// Asks the helper to stop.
    ///
    /// Without a signal, SIGINT and SIGTERM are both sent. Does nothing
    /// unless the helper is running.
    pub fn stop(&self, signal: Option<Signal>) {
        let Some(pid) = self.shared.pid.get() else {
            return;
        };
        if self.state() == SupervisorState::Terminated {
            return;
        }
        let signals = match signal {
            Some(signal) => vec![signal],
            None => vec![Signal::SIGINT, Signal::SIGTERM],
        };
        let mut sent = self.shared.sent.get();
        for signal in signals {
            debug!(pid = pid.as_raw(), ?signal, "stopping helper");
            match kill(pid, signal) {
                Ok(()) => match signal {
                    Signal::SIGINT => sent.sigint = true,
                    Signal::SIGTERM => sent.sigterm = true,
                    Signal::SIGKILL => sent.sigkill = true,
                    _ => {}
                },
                Err(err) => debug!(pid = pid.as_raw(), "sending {signal} failed: {err}"),
            }
        }
        self.shared.sent.set(sent);
    }

    /// Kills the helper with SIGKILL and drops the RPC connection.
    pub fn kill(&self) {
        if let Some(pid) = self.shared.pid.get() {
            debug!(pid = pid.as_raw(), "killing helper");
            match kill(pid, Signal::SIGKILL) {
                Ok(()) => {
                    let mut sent = self.shared.sent.get();
                    sent.sigkill = true;
                    self.shared.sent.set(sent);
                }
                Err(err) => debug!(pid = pid.as_raw(), "SIGKILL failed: {err}"),
            }
        }
        let connection = self.shared.connection.borrow_mut().take();
        if let Some(connection) = connection {
            connection.close();
        }
        self.shared.rpc_done.set(true);
        self.shared.maybe_finish();
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        let connection = self.shared.connection.borrow_mut().take();
        if let Some(connection) = connection {
            connection.close();
        }
        if let Some(accept) = self.shared.accept.borrow_mut().take() {
            accept.abort();
        }
        for task in self.shared.tasks.borrow_mut().drain(..) {
            task.abort();
        }
        self.shared.on_event.borrow_mut().take();
    }
}

fn line_stream<R>(reader: R, origin: OutputStream) -> LocalBoxStream<'static, (OutputStream, String)>
where
    R: AsyncRead + Unpin + 'static,
{
    stream::unfold(BufReader::new(reader), move |mut reader| async move {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => None,
            Ok(_) => {
                if line.last() == Some(&b'\n') {
                    line.pop();
                }
                let text = String::from_utf8_lossy(&line).into_owned();
                Some(((origin, text), reader))
            }
            Err(err) => {
                debug!(stream = %origin, "reading helper output failed: {err}");
                None
            }
        }
    })
    .boxed_local()
}

async fn pump_output(
    shared: Weak<Shared>,
    streams: Vec<LocalBoxStream<'static, (OutputStream, String)>>,
) {
    let mut lines = stream::select_all(streams);
    while let Some((stream, line)) = lines.next().await {
        match shared.upgrade() {
            Some(shared) => shared.emit(SupervisorEvent::Output { stream, line }),
            None => return,
        }
    }
    if let Some(shared) = shared.upgrade() {
        shared.output_done.set(true);
        shared.maybe_finish();
    }
}

async fn accept_helper(
    shared: Weak<Shared>,
    listener: UnixListener,
    dir: tempfile::TempDir,
    instance: String,
    event_loop: EventLoop,
) {
    let stream = match listener.accept().await {
        Ok((stream, _)) => stream,
        Err(err) => {
            warn!("accepting helper connection failed: {err}");
            return;
        }
    };
    // the socket path is not needed once the helper is connected
    drop(dir);
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let connection = RpcConnection::new(stream, instance, &event_loop);
    let weak = Rc::downgrade(&shared);
    connection.on_disconnect(move || {
        if let Some(shared) = weak.upgrade() {
            shared.rpc_done.set(true);
            shared.maybe_finish();
        }
    });
    shared.has_connected.set(true);
    if shared.state.get() == SupervisorState::Started {
        shared.state.set(SupervisorState::Connected);
    }
    *shared.connection.borrow_mut() = Some(connection.clone());
    debug!(helper = %shared.helper, "helper connected");
    shared.emit(SupervisorEvent::Connected(connection));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn helper_resolution_order() {
        let install = tempfile::tempdir().unwrap();
        let install_dir = install.path();

        assert_eq!(
            resolve_helper("./bin/helper", Some(Path::new("/env")), install_dir),
            PathBuf::from("./bin/helper")
        );
        assert_eq!(
            resolve_helper("helper", Some(Path::new("/env")), install_dir),
            PathBuf::from("/env/helper")
        );
        assert_eq!(
            resolve_helper("helper", None, install_dir),
            PathBuf::from("helper")
        );
        fs::write(install_dir.join("helper"), b"").unwrap();
        assert_eq!(
            resolve_helper("helper", None, install_dir),
            install_dir.join("helper")
        );
    }

    #[test]
    fn instances_are_unique() {
        assert_ne!(next_instance(), next_instance());
    }

    fn run_script(script: &str, mode: OutputMode) -> (Vec<String>, Vec<String>, ChildExit) {
        let event_loop = EventLoop::new().unwrap();
        let mut supervisor = ProcessSupervisor::new("/bin/sh", event_loop.clone())
            .with_args(["-c", script])
            .with_output_mode(mode);
        let lines = Rc::new(RefCell::new(Vec::new()));
        let failures = Rc::new(RefCell::new(Vec::new()));
        let quit = Rc::new(Cell::new(None));
        let (l, f, q) = (lines.clone(), failures.clone(), quit.clone());
        supervisor
            .start(move |event| match event {
                SupervisorEvent::Output { line, .. } => l.borrow_mut().push(line),
                SupervisorEvent::Failure { error, .. } => {
                    assert!(q.get().is_none(), "failure after quit");
                    f.borrow_mut().push(error);
                }
                SupervisorEvent::Quit(exit) => q.set(Some(exit)),
                SupervisorEvent::Connected(_) => {}
            })
            .unwrap();
        event_loop.run_until(|| quit.get().is_some());
        assert_eq!(supervisor.state(), SupervisorState::Terminated);
        let lines = lines.borrow().clone();
        let failures = failures.borrow().clone();
        (lines, failures, quit.get().unwrap())
    }

    #[test]
    fn output_is_collected_before_quit() {
        let (mut lines, failures, exit) =
            run_script("echo one; echo two >&2; exit 2", OutputMode::Separate);
        lines.sort();
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(exit, ChildExit::exited(2));
        assert_eq!(
            failures,
            vec!["child process quit unexpectedly with return code 2".to_string()]
        );
    }

    #[test]
    fn merged_output_keeps_order() {
        let (lines, _, exit) = run_script("echo a; echo b >&2; echo c", OutputMode::Merged);
        assert_eq!(lines, vec!["a", "b", "c"]);
        assert_eq!(exit, ChildExit::exited(0));
    }

    #[test]
    fn stop_is_not_a_failure() {
        let event_loop = EventLoop::new().unwrap();
        let mut supervisor =
            ProcessSupervisor::new("/bin/sh", event_loop.clone()).with_args(["-c", "exec sleep 30"]);
        let failed = Rc::new(Cell::new(false));
        let quit = Rc::new(Cell::new(None));
        let (f, q) = (failed.clone(), quit.clone());
        supervisor
            .start(move |event| match event {
                SupervisorEvent::Failure { .. } => f.set(true),
                SupervisorEvent::Quit(exit) => q.set(Some(exit)),
                _ => {}
            })
            .unwrap();
        assert!(supervisor.pid().is_some());
        supervisor.stop(None);
        event_loop.run_until(|| quit.get().is_some());
        assert!(!failed.get());
        assert!(quit.get().unwrap().signal.is_some());
        // stopping a terminated helper is a no-op
        supervisor.stop(None);
    }

    #[test]
    fn kill_is_not_a_failure() {
        let event_loop = EventLoop::new().unwrap();
        let mut supervisor =
            ProcessSupervisor::new("/bin/sh", event_loop.clone()).with_args(["-c", "exec sleep 30"]);
        let failures = Rc::new(RefCell::new(Vec::new()));
        let quit = Rc::new(Cell::new(None));
        let (f, q) = (failures.clone(), quit.clone());
        supervisor
            .start(move |event| match event {
                SupervisorEvent::Failure { error, .. } => f.borrow_mut().push(error),
                SupervisorEvent::Quit(exit) => q.set(Some(exit)),
                _ => {}
            })
            .unwrap();
        supervisor.kill();
        event_loop.run_until(|| quit.get().is_some());
        assert_eq!(quit.get(), Some(ChildExit::killed(Signal::SIGKILL)));
        assert!(failures.borrow().is_empty(), "{:?}", failures.borrow());
        assert_eq!(supervisor.state(), SupervisorState::Terminated);
    }

    #[test]
    fn missing_helper_fails_to_spawn() {
        let event_loop = EventLoop::new().unwrap();
        let mut supervisor =
            ProcessSupervisor::new("/nonexistent/syncevo-helper", event_loop.clone());
        let err = supervisor.start(|_| {}).unwrap_err();
        assert!(matches!(err, LocalTransportError::Spawn { .. }));
        assert_eq!(supervisor.state(), SupervisorState::Unstarted);
    }
}
