//! Single-threaded cooperative event loop.
//!
//! Blocking operations of the transports are written as
//! `run_until(|| condition)`: the loop runs spawned tasks (socket readers,
//! process watchers, timers) until one of them calls [`LoopWaker::wake`],
//! then the condition is checked again.

use std::future::Future;
use std::io;
use std::rc::Rc;

use tokio::runtime::{Builder, EnterGuard, Runtime};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, LocalSet};

struct Inner {
    // Drop spawned tasks before the runtime that drives their I/O.
    local: LocalSet,
    runtime: Runtime,
    wakeup: Rc<Notify>,
}

/// Handle to the event loop of this thread.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<Inner>,
}

/// Wakes a loop blocked in [`EventLoop::iterate`].
#[derive(Clone)]
pub struct LoopWaker {
    wakeup: Rc<Notify>,
}

impl LoopWaker {
    /// Ends the current (or next) iteration.
    pub fn wake(&self) {
        self.wakeup.notify_one();
    }
}

impl EventLoop {
    /// Creates a loop backed by a current-thread tokio runtime.
    pub fn new() -> io::Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self {
            inner: Rc::new(Inner {
                local: LocalSet::new(),
                runtime,
                wakeup: Rc::new(Notify::new()),
            }),
        })
    }

    /// Returns a waker for this loop.
    pub fn waker(&self) -> LoopWaker {
        LoopWaker {
            wakeup: self.inner.wakeup.clone(),
        }
    }

    /// Wakes the loop.
    pub fn wake(&self) {
        self.inner.wakeup.notify_one();
    }

    /// Enters the runtime context, needed to create sockets and processes
    /// outside of a task.
    pub fn enter(&self) -> EnterGuard<'_> {
        self.inner.runtime.enter()
    }

    /// Spawns a task on this thread.
    pub fn spawn_local<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.inner.local.spawn_local(future)
    }

    /// Runs tasks until something wakes the loop.
    pub fn iterate(&self) {
        let inner = &self.inner;
        inner
            .runtime
            .block_on(inner.local.run_until(inner.wakeup.notified()));
    }

    /// Iterates until `done` returns true.
    pub fn run_until<F>(&self, mut done: F)
    where
        F: FnMut() -> bool,
    {
        while !done() {
            self.iterate();
        }
    }

    /// Drives `future` to completion while running other tasks.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let inner = &self.inner;
        inner.runtime.block_on(inner.local.run_until(future))
    }
}
