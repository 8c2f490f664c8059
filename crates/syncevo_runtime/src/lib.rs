//! # SyncEvolution Runtime
//!
//! Process-level runtime support shared by the local sync parent and its
//! helper.
//!
//! This crate provides:
//! - `EventLoop`, a single-threaded cooperative loop with `run_until`
//! - `SuspendController`, which turns SIGINT/SIGTERM and programmatic
//!   blockers into a `Normal`/`Suspend`/`Abort` state
//! - Signal dispositions of the helper process

#![warn(missing_docs)]

mod event_loop;
mod process;
mod suspend;

pub use event_loop::{EventLoop, LoopWaker};
pub use nix::sys::signal::Signal;
pub use process::{ignore_sigpipe, install_child_dispositions, pipe};
pub use suspend::{
    SignalNotice, StateBlocker, SuspendController, SuspendError, SuspendGuard, SuspendResult,
    SuspendState, ABORT_INTERVAL,
};
