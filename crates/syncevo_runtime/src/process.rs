//! Signal dispositions of the local sync helper and descriptor helpers.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd};

use nix::fcntl::OFlag;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::suspend::{SuspendError, SuspendResult};

/// Ignores SIGPIPE, writes to a closed socket then fail with `EPIPE`.
pub fn ignore_sigpipe() -> SuspendResult<()> {
    set_disposition(Signal::SIGPIPE, SigHandler::SigIgn)
}

/// Dispositions of the helper while its nested session runs.
///
/// SIGINT is ignored because the parent owns CTRL-C handling and tells
/// the helper to stop with SIGTERM. SIGTERM terminates immediately: a lot
/// of backend code cannot check for an abort request in time, so the
/// handler restores the default action and re-raises the signal, which
/// makes the parent see "killed by SIGTERM".
pub fn install_child_dispositions() -> SuspendResult<()> {
    set_disposition(Signal::SIGINT, SigHandler::SigIgn)?;
    set_disposition(Signal::SIGTERM, SigHandler::Handler(terminate_child))?;
    tracing::debug!("local sync helper: ignore SIGINT, die in SIGTERM");
    Ok(())
}

fn set_disposition(signal: Signal, handler: SigHandler) -> SuspendResult<()> {
    let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
    // SAFETY: the handlers installed here are async-signal-safe.
    unsafe { sigaction(signal, &action) }
        .map(|_| ())
        .map_err(|source| SuspendError::Handler { signal, source })
}

extern "C" fn terminate_child(signal: libc::c_int) {
    const MESSAGE: &[u8] = b"local sync child shutting down due to SIGTERM\n";
    // SAFETY: only async-signal-safe calls; tracing cannot be used here.
    unsafe {
        libc::write(libc::STDERR_FILENO, MESSAGE.as_ptr().cast::<libc::c_void>(), MESSAGE.len());
        libc::signal(signal, libc::SIG_DFL);
        libc::raise(signal);
    }
}

/// Creates a close-on-exec pipe and returns `(read, write)`.
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
    // SAFETY: pipe2 returned two fresh descriptors owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn pipe_transfers_bytes() {
        let (read, write) = pipe().unwrap();
        let mut writer = std::fs::File::from(write);
        writer.write_all(b"output").unwrap();
        drop(writer);
        let mut reader = std::fs::File::from(read);
        let mut text = String::new();
        reader.read_to_string(&mut text).unwrap();
        assert_eq!(text, "output");
    }
}
