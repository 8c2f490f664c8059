//! Request loop of an HTTP/DAV session.

use std::sync::Arc;
use std::time::Duration;

use syncevo_runtime::SuspendController;
use tracing::debug;

use crate::auth::{AuthProvider, Authorization};
use crate::clock::{RetryClock, SystemClock};
use crate::config::SessionSettings;
use crate::error::SessionResult;
use crate::retry::{Classification, RequestOutcome, RetrySession};

/// Runs requests until they succeed, fail for good or the deadline passes.
///
/// The actual HTTP stack is supplied per operation as a closure which
/// receives the credentials to attach and reports what happened.
pub struct DavSession<C: RetryClock = SystemClock> {
    retry: RetrySession,
    clock: C,
}

impl DavSession<SystemClock> {
    /// Creates a session using the wall clock.
    pub fn new(settings: SessionSettings, suspend: SuspendController) -> Self {
        Self::with_clock(settings, suspend, SystemClock)
    }
}

impl<C: RetryClock> DavSession<C> {
    /// Creates a session with a custom clock.
    pub fn with_clock(settings: SessionSettings, suspend: SuspendController, clock: C) -> Self {
        Self {
            retry: RetrySession::new(settings, suspend),
            clock,
        }
    }

    /// Uses an external credential provider.
    #[must_use]
    pub fn with_auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.retry = self.retry.with_auth_provider(provider);
        self
    }

    /// Retry state.
    pub fn retry_session(&self) -> &RetrySession {
        &self.retry
    }

    /// Runs one operation.
    ///
    /// `timeout` bounds the time spent retrying; `None` disables retries.
    /// `requested` is the path the request goes to and `expected` lists
    /// non-2xx status codes that count as success.
    pub fn run<F>(
        &mut self,
        operation: &str,
        timeout: Option<Duration>,
        requested: &str,
        expected: &[u16],
        mut request: F,
    ) -> SessionResult<RequestOutcome>
    where
        F: FnMut(&Authorization) -> RequestOutcome,
    {
        let deadline = timeout.map(|timeout| self.clock.now() + timeout);
        self.retry.start_operation(operation, deadline)?;
        loop {
            let authorization = self.retry.authorization()?;
            let outcome = request(&authorization);
            let now = self.clock.now();
            match self.retry.classify_at(&outcome, requested, expected, now) {
                Classification::Accept => return Ok(outcome),
                Classification::Fail(err) => return Err(err),
                Classification::Retry { delay } => {
                    if !delay.is_zero() {
                        debug!(%operation, ?delay, "waiting before retry");
                        self.clock.sleep(delay, self.retry.suspend_controller());
                    }
                    self.retry.suspend_controller().check_for_normal()?;
                }
            }
        }
    }
}
