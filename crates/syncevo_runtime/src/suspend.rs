//! Translation of SIGINT/SIGTERM into suspend and abort requests.
//!
//! Signal handlers only write the signal number into a non-blocking pipe.
//! Everything else (state transitions, the CTRL-C repeat window, user
//! messages) happens on the normal control flow side, either when
//! [`SuspendController::state`] is queried or when the event loop is woken
//! by the pipe becoming readable.

use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use parking_lot::Mutex;
use syncevo_protocol::SyncStatus;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::event_loop::EventLoop;

/// A second CTRL-C within this interval turns a suspend into an abort.
pub const ABORT_INTERVAL: Duration = Duration::from_secs(2);

/// Write end of the pipe of the currently activated controller, -1 if none.
static NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);

static GLOBAL: OnceLock<SuspendController> = OnceLock::new();

/// Result type for suspend handling.
pub type SuspendResult<T> = Result<T, SuspendError>;

/// Errors reported by the suspend controller.
#[derive(Debug, Error)]
pub enum SuspendError {
    /// The user asked to abort.
    #[error("aborting as requested by user")]
    UserAbort,

    /// The user asked to suspend.
    #[error("suspending as requested by user")]
    UserSuspend,

    /// Creating the notification pipe failed.
    #[error("creating signal notification pipe failed: {0}")]
    Pipe(Errno),

    /// Installing or restoring a handler failed.
    #[error("changing handler for {signal} failed: {source}")]
    Handler {
        /// Affected signal.
        signal: Signal,
        /// Underlying error.
        source: Errno,
    },

    /// Registering the pipe with the event loop failed.
    #[error("watching signal notification pipe failed: {0}")]
    Watch(#[from] std::io::Error),
}

impl SuspendError {
    /// Status code to report for this error.
    pub fn status(&self) -> SyncStatus {
        match self {
            SuspendError::UserAbort | SuspendError::UserSuspend => SyncStatus::USER_ABORT,
            _ => SyncStatus::FATAL,
        }
    }
}

/// Effective state, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SuspendState {
    /// Keep running.
    Normal,
    /// Finish the current step and stop with a resumable state.
    Suspend,
    /// Stop as soon as possible.
    Abort,
}

/// Transient result of processing one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalNotice {
    /// First CTRL-C.
    Suspend,
    /// CTRL-C outside of the abort window while suspending.
    SuspendAgain,
    /// Abort requested.
    Abort,
    /// Abort requested again.
    AbortAgain,
}

impl SignalNotice {
    /// Message shown to the user.
    pub fn message(self) -> &'static str {
        match self {
            SignalNotice::Suspend => {
                "Asking to suspend...\nPress CTRL-C again quickly (within 2s) to stop immediately (can cause problems in the future!)"
            }
            SignalNotice::SuspendAgain => {
                "Suspend in progress...\nPress CTRL-C again quickly (within 2s) to stop immediately (can cause problems in the future!)"
            }
            SignalNotice::Abort => "Aborting immediately ...",
            SignalNotice::AbortAgain => "Already aborting as requested earlier ...",
        }
    }
}

/// Holding this forces the state to at least the blocker's level.
#[derive(Debug)]
pub struct StateBlocker {
    shared: Weak<Shared>,
    level: SuspendState,
}

impl StateBlocker {
    /// Level enforced by this blocker.
    pub fn level(&self) -> SuspendState {
        self.level
    }
}

impl Drop for StateBlocker {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            tracing::debug!(level = ?self.level, "state blocker released");
            shared.publish();
        }
    }
}

/// Keeps the signal handlers installed by [`SuspendController::activate`].
pub struct SuspendGuard {
    shared: Weak<Shared>,
    installed: Vec<(Signal, SigAction)>,
    read_end: OwnedFd,
    _write_end: OwnedFd,
}

impl SuspendGuard {
    /// Signals whose handlers were installed.
    pub fn signals(&self) -> Vec<Signal> {
        self.installed.iter().map(|(signal, _)| *signal).collect()
    }
}

impl std::fmt::Debug for SuspendGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspendGuard")
            .field("signals", &self.signals())
            .field("pipe", &self.read_end.as_raw_fd())
            .finish()
    }
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        for (signal, previous) in self.installed.drain(..) {
            // SAFETY: restores the disposition that was active before activate().
            if let Err(err) = unsafe { sigaction(signal, &previous) } {
                tracing::warn!("restoring handler for {signal} failed: {err}");
            }
        }
        NOTIFY_FD.store(-1, Ordering::SeqCst);
        if let Some(shared) = self.shared.upgrade() {
            shared.inner.lock().pipe = None;
        }
        tracing::debug!("suspend signal handling deactivated");
    }
}

struct Inner {
    base: SuspendState,
    last_suspend: Option<Instant>,
    received: Vec<Signal>,
    suspend_blocker: Weak<StateBlocker>,
    abort_blocker: Weak<StateBlocker>,
    guard: Weak<SuspendGuard>,
    pipe: Option<RawFd>,
}

impl Inner {
    fn effective(&self) -> SuspendState {
        if self.abort_blocker.strong_count() > 0 {
            SuspendState::Abort
        } else if self.suspend_blocker.strong_count() > 0 {
            SuspendState::Suspend.max(self.base)
        } else {
            self.base
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    changes: watch::Sender<SuspendState>,
}

impl Shared {
    fn publish(&self) {
        let state = self.inner.lock().effective();
        self.changes.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }
}

/// Process state consulted by long-running operations.
///
/// Cheap to clone; all clones share the same state. Use [`global`](Self::global)
/// for the instance fed by OS signals and [`new`](Self::new) for isolated
/// instances in tests.
#[derive(Clone)]
pub struct SuspendController {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SuspendController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspendController")
            .field("state", &self.shared.inner.lock().effective())
            .finish()
    }
}

impl Default for SuspendController {
    fn default() -> Self {
        Self::new()
    }
}

impl SuspendController {
    /// Creates an independent controller in state `Normal`.
    pub fn new() -> Self {
        let (changes, _) = watch::channel(SuspendState::Normal);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    base: SuspendState::Normal,
                    last_suspend: None,
                    received: Vec::new(),
                    suspend_blocker: Weak::new(),
                    abort_blocker: Weak::new(),
                    guard: Weak::new(),
                    pipe: None,
                }),
                changes,
            }),
        }
    }

    /// The process-wide controller.
    pub fn global() -> SuspendController {
        GLOBAL.get_or_init(SuspendController::new).clone()
    }

    /// Installs handlers for `signals` that are still at their default
    /// disposition and creates the notification pipe.
    ///
    /// Calling this again while a guard is alive returns the same guard.
    /// Dropping the last guard restores the previous handlers.
    pub fn activate(&self, signals: &[Signal]) -> SuspendResult<Arc<SuspendGuard>> {
        let mut inner = self.shared.inner.lock();
        if let Some(guard) = inner.guard.upgrade() {
            return Ok(guard);
        }

        let (read_raw, write_raw) =
            nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(SuspendError::Pipe)?;
        // SAFETY: pipe2 returned two fresh descriptors owned by nobody else.
        let (read_end, write_end) =
            unsafe { (OwnedFd::from_raw_fd(read_raw), OwnedFd::from_raw_fd(write_raw)) };
        NOTIFY_FD.store(write_end.as_raw_fd(), Ordering::SeqCst);

        let handler = SigAction::new(
            SigHandler::Handler(notify_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let mut installed = Vec::new();
        for &signal in signals {
            if !is_default_disposition(signal) {
                tracing::debug!("{signal} has a custom handler, leaving it alone");
                continue;
            }
            // SAFETY: notify_signal only performs async-signal-safe work.
            match unsafe { sigaction(signal, &handler) } {
                Ok(previous) => installed.push((signal, previous)),
                Err(source) => {
                    for (signal, previous) in installed.drain(..) {
                        // SAFETY: restores what we just replaced.
                        let _ = unsafe { sigaction(signal, &previous) };
                    }
                    NOTIFY_FD.store(-1, Ordering::SeqCst);
                    return Err(SuspendError::Handler { signal, source });
                }
            }
        }

        inner.pipe = Some(read_end.as_raw_fd());
        let guard = Arc::new(SuspendGuard {
            shared: Arc::downgrade(&self.shared),
            installed,
            read_end,
            _write_end: write_end,
        });
        inner.guard = Arc::downgrade(&guard);
        tracing::debug!(signals = ?guard.signals(), "suspend signal handling activated");
        Ok(guard)
    }

    /// Processes signals in the background and wakes `event_loop` after each.
    ///
    /// The task keeps `guard` alive for as long as the loop runs.
    pub fn attach(&self, guard: &Arc<SuspendGuard>, event_loop: &EventLoop) -> SuspendResult<JoinHandle<()>> {
        let fd = {
            let _enter = event_loop.enter();
            AsyncFd::with_interest(guard.read_end.as_raw_fd(), Interest::READABLE)?
        };
        let guard = guard.clone();
        let controller = self.clone();
        let waker = event_loop.waker();
        Ok(event_loop.spawn_local(async move {
            let _guard = guard;
            loop {
                match fd.readable().await {
                    Ok(mut ready) => {
                        ready.clear_ready();
                        controller.poll_signals();
                        waker.wake();
                    }
                    Err(err) => {
                        tracing::warn!("signal pipe failed: {err}");
                        break;
                    }
                }
            }
        }))
    }

    /// Requests a suspend until the returned blocker is dropped.
    pub fn suspend(&self) -> Arc<StateBlocker> {
        self.block(SuspendState::Suspend)
    }

    /// Requests an abort until the returned blocker is dropped.
    pub fn abort(&self) -> Arc<StateBlocker> {
        self.block(SuspendState::Abort)
    }

    fn block(&self, level: SuspendState) -> Arc<StateBlocker> {
        let blocker = {
            let mut inner = self.shared.inner.lock();
            let slot = match level {
                SuspendState::Abort => &mut inner.abort_blocker,
                _ => &mut inner.suspend_blocker,
            };
            match slot.upgrade() {
                Some(existing) => existing,
                None => {
                    let blocker = Arc::new(StateBlocker {
                        shared: Arc::downgrade(&self.shared),
                        level,
                    });
                    *slot = Arc::downgrade(&blocker);
                    blocker
                }
            }
        };
        self.shared.publish();
        blocker
    }

    /// Current effective state, after processing pending signals.
    pub fn state(&self) -> SuspendState {
        self.poll_signals();
        self.shared.inner.lock().effective()
    }

    /// True if the state is `Normal`.
    pub fn is_normal(&self) -> bool {
        self.state() == SuspendState::Normal
    }

    /// True if the state is `Suspend`.
    pub fn is_suspended(&self) -> bool {
        self.state() == SuspendState::Suspend
    }

    /// True if the state is `Abort`.
    pub fn is_aborted(&self) -> bool {
        self.state() == SuspendState::Abort
    }

    /// Fails with a user abort error unless the state is `Normal`.
    pub fn check_for_normal(&self) -> SuspendResult<()> {
        match self.state() {
            SuspendState::Normal => Ok(()),
            SuspendState::Suspend => Err(SuspendError::UserSuspend),
            SuspendState::Abort => Err(SuspendError::UserAbort),
        }
    }

    /// Signals received so far, oldest first.
    pub fn received_signals(&self) -> Vec<Signal> {
        self.poll_signals();
        self.shared.inner.lock().received.clone()
    }

    /// Receiver that sees every change of the effective state.
    pub fn subscribe(&self) -> watch::Receiver<SuspendState> {
        self.shared.changes.subscribe()
    }

    /// Handles a signal as if it had been caught by the installed handler.
    pub fn deliver_signal(&self, signal: Signal) -> Option<SignalNotice> {
        self.deliver_signal_at(signal, Instant::now())
    }

    fn deliver_signal_at(&self, signal: Signal, now: Instant) -> Option<SignalNotice> {
        let notice = {
            let mut inner = self.shared.inner.lock();
            transition(&mut inner, signal, now)
        };
        if let Some(notice) = notice {
            tracing::info!("{}", notice.message());
        }
        self.shared.publish();
        notice
    }

    /// Drains the notification pipe.
    fn poll_signals(&self) {
        let mut pending = Vec::new();
        {
            let inner = self.shared.inner.lock();
            let Some(fd) = inner.pipe else {
                return;
            };
            let mut buf = [0u8; 16];
            loop {
                match nix::unistd::read(fd, &mut buf) {
                    Ok(0) => break,
                    Ok(n) => pending.extend_from_slice(&buf[..n]),
                    Err(Errno::EINTR) => continue,
                    Err(_) => break,
                }
            }
        }
        for byte in pending {
            if let Ok(signal) = Signal::try_from(i32::from(byte)) {
                self.deliver_signal(signal);
            }
        }
    }
}

fn transition(inner: &mut Inner, signal: Signal, now: Instant) -> Option<SignalNotice> {
    inner.received.push(signal);
    match signal {
        Signal::SIGTERM => match inner.base {
            SuspendState::Abort => Some(SignalNotice::AbortAgain),
            _ => {
                inner.base = SuspendState::Abort;
                Some(SignalNotice::Abort)
            }
        },
        Signal::SIGINT => match inner.base {
            SuspendState::Normal => {
                inner.base = SuspendState::Suspend;
                inner.last_suspend = Some(now);
                Some(SignalNotice::Suspend)
            }
            SuspendState::Suspend => {
                let within = inner
                    .last_suspend
                    .is_some_and(|last| now.saturating_duration_since(last) < ABORT_INTERVAL);
                if within {
                    inner.base = SuspendState::Abort;
                    Some(SignalNotice::Abort)
                } else {
                    inner.last_suspend = Some(now);
                    Some(SignalNotice::SuspendAgain)
                }
            }
            SuspendState::Abort => Some(SignalNotice::AbortAgain),
        },
        _ => None,
    }
}

fn is_default_disposition(signal: Signal) -> bool {
    // SAFETY: querying with a null new action does not change anything.
    unsafe {
        let mut current: libc::sigaction = mem::zeroed();
        libc::sigaction(signal as libc::c_int, ptr::null(), &mut current) == 0
            && current.sa_sigaction == libc::SIG_DFL
    }
}

extern "C" fn notify_signal(signal: libc::c_int) {
    let fd = NOTIFY_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = signal as u8;
        // SAFETY: write(2) is async-signal-safe; a full pipe just drops the byte.
        unsafe {
            libc::write(fd, (&byte as *const u8).cast::<libc::c_void>(), 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sigint_twice_within_window_aborts() {
        let controller = SuspendController::new();
        let start = Instant::now();
        assert_eq!(
            controller.deliver_signal_at(Signal::SIGINT, start),
            Some(SignalNotice::Suspend)
        );
        assert_eq!(controller.state(), SuspendState::Suspend);
        assert_eq!(
            controller.deliver_signal_at(Signal::SIGINT, start + Duration::from_millis(500)),
            Some(SignalNotice::Abort)
        );
        assert_eq!(controller.state(), SuspendState::Abort);
    }

    #[test]
    fn sigint_after_window_restarts_it() {
        let controller = SuspendController::new();
        let start = Instant::now();
        controller.deliver_signal_at(Signal::SIGINT, start);
        assert_eq!(
            controller.deliver_signal_at(Signal::SIGINT, start + Duration::from_secs(3)),
            Some(SignalNotice::SuspendAgain)
        );
        assert_eq!(controller.state(), SuspendState::Suspend);
        // window now starts at the second signal
        assert_eq!(
            controller.deliver_signal_at(Signal::SIGINT, start + Duration::from_secs(4)),
            Some(SignalNotice::Abort)
        );
    }

    #[test]
    fn sigterm_aborts_and_repeats() {
        let controller = SuspendController::new();
        assert_eq!(controller.deliver_signal(Signal::SIGTERM), Some(SignalNotice::Abort));
        assert_eq!(
            controller.deliver_signal(Signal::SIGTERM),
            Some(SignalNotice::AbortAgain)
        );
        assert_eq!(controller.deliver_signal(Signal::SIGINT), Some(SignalNotice::AbortAgain));
        assert_eq!(
            controller.received_signals(),
            vec![Signal::SIGTERM, Signal::SIGTERM, Signal::SIGINT]
        );
    }

    #[test]
    fn blockers_raise_and_release_state() {
        let controller = SuspendController::new();
        let suspend = controller.suspend();
        assert!(controller.is_suspended());
        let abort = controller.abort();
        assert!(controller.is_aborted());
        drop(abort);
        assert!(controller.is_suspended());
        drop(suspend);
        assert!(controller.is_normal());
    }

    #[test]
    fn blockers_of_same_level_are_shared() {
        let controller = SuspendController::new();
        let first = controller.abort();
        let second = controller.abort();
        assert!(Arc::ptr_eq(&first, &second));
        drop(first);
        assert!(controller.is_aborted());
        drop(second);
        assert!(controller.is_normal());
    }

    #[test]
    fn check_for_normal_reports_user_abort() {
        let controller = SuspendController::new();
        assert!(controller.check_for_normal().is_ok());
        let _abort = controller.abort();
        let err = controller.check_for_normal().unwrap_err();
        assert_eq!(err.to_string(), "aborting as requested by user");
        assert_eq!(err.status(), SyncStatus::USER_ABORT);
    }

    #[test]
    fn subscribers_see_changes() {
        let controller = SuspendController::new();
        let mut changes = controller.subscribe();
        let blocker = controller.suspend();
        assert!(changes.has_changed().unwrap());
        assert_eq!(*changes.borrow_and_update(), SuspendState::Suspend);
        drop(blocker);
        assert_eq!(*changes.borrow_and_update(), SuspendState::Normal);
    }

    #[test]
    fn activate_handles_real_signal() {
        let controller = SuspendController::new();
        let guard = controller.activate(&[Signal::SIGUSR2]).unwrap();
        let again = controller.activate(&[Signal::SIGUSR2]).unwrap();
        assert!(Arc::ptr_eq(&guard, &again));
        assert_eq!(guard.signals(), vec![Signal::SIGUSR2]);

        nix::sys::signal::raise(Signal::SIGUSR2).unwrap();
        assert_eq!(controller.received_signals(), vec![Signal::SIGUSR2]);
        assert!(controller.is_normal());

        drop(guard);
        drop(again);
        assert!(is_default_disposition(Signal::SIGUSR2));
    }

    #[derive(Debug, Clone)]
    enum Op {
        TakeSuspend,
        TakeAbort,
        Release(usize),
        Interrupt(u64),
        Terminate,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::TakeSuspend),
            Just(Op::TakeAbort),
            (0usize..8).prop_map(Op::Release),
            (0u64..5000).prop_map(Op::Interrupt),
            Just(Op::Terminate),
        ]
    }

    proptest! {
        #[test]
        fn state_never_below_held_blockers(ops in prop::collection::vec(op(), 1..40)) {
            let controller = SuspendController::new();
            let mut held: Vec<Arc<StateBlocker>> = Vec::new();
            let mut now = Instant::now();
            let mut signal_floor = SuspendState::Normal;
            for op in ops {
                match op {
                    Op::TakeSuspend => held.push(controller.suspend()),
                    Op::TakeAbort => held.push(controller.abort()),
                    Op::Release(i) => {
                        if !held.is_empty() {
                            let i = i % held.len();
                            held.remove(i);
                        }
                    }
                    Op::Interrupt(ms) => {
                        now += Duration::from_millis(ms);
                        controller.deliver_signal_at(Signal::SIGINT, now);
                        signal_floor = signal_floor.max(SuspendState::Suspend);
                    }
                    Op::Terminate => {
                        controller.deliver_signal_at(Signal::SIGTERM, now);
                        signal_floor = SuspendState::Abort;
                    }
                }
                let floor = held.iter().map(|b| b.level()).max().unwrap_or(SuspendState::Normal);
                let state = controller.state();
                prop_assert!(state >= floor);
                prop_assert!(state >= signal_floor);
            }
        }
    }
}
