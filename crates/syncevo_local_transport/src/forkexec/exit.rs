//! How a helper process ended and whether that counts as a failure.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::sys::signal::Signal;

/// Exit information of a helper process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Signal number, if the process was killed.
    pub signal: Option<i32>,
}

impl ChildExit {
    /// Normal exit with `code`.
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Death by `signal`.
    pub fn killed(signal: Signal) -> Self {
        Self {
            code: None,
            signal: Some(signal as i32),
        }
    }

    /// Converts the status reported by the operating system.
    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    /// True for a normal exit with code 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn killed_by(&self, signal: Signal) -> bool {
        self.signal == Some(signal as i32)
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "return code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Signals the supervisor sent to the helper.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SentSignals {
    /// SIGINT was sent.
    pub sigint: bool,
    /// SIGTERM was sent.
    pub sigterm: bool,
    /// SIGKILL was sent.
    pub sigkill: bool,
}

/// Decides whether the end of a helper is a failure and describes it.
///
/// Deaths caused by our own signals are expected; SIGKILL also counts as
/// expected once SIGTERM was sent. A clean exit is only fine if the
/// helper connected at some point.
pub fn classify_exit(exit: ChildExit, sent: SentSignals, connected: bool) -> Option<String> {
    if (exit.killed_by(Signal::SIGINT) && sent.sigint)
        || (exit.killed_by(Signal::SIGTERM) && sent.sigterm)
        || (exit.killed_by(Signal::SIGKILL) && (sent.sigkill || sent.sigterm))
    {
        return None;
    }
    if connected && exit.success() {
        return None;
    }

    let mut error = String::from("child process quit");
    if !connected {
        error.push_str(" unexpectedly");
    }
    match (exit.code, exit.signal) {
        (Some(code), _) => error.push_str(&format!(" with return code {code}")),
        (None, Some(signal)) => error.push_str(&format!(" because of signal {signal}")),
        (None, None) => {}
    }
    Some(error)
}
