//! Retry state machine of one network session.
//!
//! Every request of an operation is classified as accepted, retryable or
//! fatal. Retries are only possible while the operation has a deadline
//! that has not passed and the suspend state is normal. The delay before
//! attempt `n` doubles with every attempt and is measured from the end of
//! the previous successful request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use syncevo_runtime::SuspendController;
use tracing::{debug, info};

use crate::auth::{AuthProvider, Authorization};
use crate::config::SessionSettings;
use crate::error::{SessionError, SessionResult};

/// Low-level result of a request, before looking at the HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCode {
    /// A response was received.
    Ok,
    /// Generic failure, possibly with an HTTP status.
    Error,
    /// Host name lookup failed.
    Lookup,
    /// The request timed out.
    Timeout,
    /// Connecting failed.
    Connect,
    /// The server rejected our credentials.
    Auth,
}

/// What happened to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    /// Transport result.
    pub code: TransportCode,
    /// HTTP status, if the server answered.
    pub status: Option<u16>,
    /// Location header of a redirect.
    pub location: Option<String>,
    /// Transport error text.
    pub message: String,
}

impl RequestOutcome {
    /// A response with the given HTTP status.
    pub fn response(status: u16) -> Self {
        Self {
            code: TransportCode::Ok,
            status: Some(status),
            location: None,
            message: String::new(),
        }
    }

    /// A failure without HTTP status.
    pub fn failure(code: TransportCode, message: impl Into<String>) -> Self {
        Self {
            code,
            status: None,
            location: None,
            message: message.into(),
        }
    }

    /// A generic error that carries an HTTP status.
    pub fn error_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            code: TransportCode::Error,
            status: Some(status),
            location: None,
            message: message.into(),
        }
    }

    /// Adds a redirect location.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Decision about one request.
#[derive(Debug)]
pub enum Classification {
    /// The request succeeded.
    Accept,
    /// Repeat the request after the delay.
    Retry {
        /// Time to wait before the next attempt.
        delay: Duration,
    },
    /// Give up.
    Fail(SessionError),
}

impl Classification {
    /// Returns true for `Retry`.
    pub fn is_retry(&self) -> bool {
        matches!(self, Classification::Retry { .. })
    }
}

/// Delay before attempt `attempt` (starting at 1) without deadline.
pub fn backoff_delay(interval: Duration, attempt: u32) -> Duration {
    let factor = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    interval.saturating_mul(factor)
}

/// Point in time of the next attempt, never later than the deadline.
pub fn next_attempt_at(
    interval: Duration,
    attempt: u32,
    last_completion: Instant,
    deadline: Instant,
) -> Instant {
    last_completion
        .checked_add(backoff_delay(interval, attempt))
        .map_or(deadline, |next| next.min(deadline))
}

/// 5xx codes which are worth repeating.
fn is_retryable_server_error(status: u16) -> bool {
    (500..600).contains(&status) && status != 501 && status != 505
}

/// Per-operation retry bookkeeping.
pub struct RetrySession {
    settings: SessionSettings,
    suspend: SuspendController,
    auth: Option<Arc<dyn AuthProvider>>,
    operation: Option<String>,
    deadline: Option<Instant>,
    attempt: u32,
    last_request_end: Option<Instant>,
    credentials_sent: bool,
    bearer: Option<String>,
    token_refreshed: bool,
}

impl RetrySession {
    /// Creates a session without operation.
    pub fn new(settings: SessionSettings, suspend: SuspendController) -> Self {
        Self {
            settings,
            suspend,
            auth: None,
            operation: None,
            deadline: None,
            attempt: 0,
            last_request_end: None,
            credentials_sent: false,
            bearer: None,
            token_refreshed: false,
        }
    }

    /// Uses an external credential provider instead of the static
    /// credentials of the settings.
    #[must_use]
    pub fn with_auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(provider);
        self
    }

    /// Settings of this session.
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Suspend controller consulted before each retry.
    pub fn suspend_controller(&self) -> &SuspendController {
        &self.suspend
    }

    /// Name of the current operation.
    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    /// Number of retries so far in the current operation.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Begins a new operation. Without deadline nothing is retried.
    pub fn start_operation(
        &mut self,
        operation: impl Into<String>,
        deadline: Option<Instant>,
    ) -> SessionResult<()> {
        self.suspend.check_for_normal()?;
        let operation = operation.into();
        debug!(%operation, has_deadline = deadline.is_some(), "starting operation");
        self.operation = Some(operation);
        self.deadline = deadline;
        self.attempt = 0;
        self.credentials_sent = false;
        self.token_refreshed = false;
        Ok(())
    }

    /// Credentials for the next request.
    pub fn authorization(&mut self) -> SessionResult<Authorization> {
        let authorization = match &self.auth {
            Some(provider) if provider.supports_oauth2() => {
                let bearer = match &self.bearer {
                    Some(bearer) => bearer.clone(),
                    None => {
                        let bearer = provider.oauth2_bearer()?;
                        if bearer.is_empty() {
                            return Err(SessionError::Auth(
                                "OAuth2 provider returned an empty token".into(),
                            ));
                        }
                        self.bearer = Some(bearer.clone());
                        bearer
                    }
                };
                Authorization::Bearer(bearer)
            }
            Some(provider) => {
                let credentials = provider.credentials()?;
                if credentials.is_empty() {
                    Authorization::None
                } else {
                    Authorization::Basic(credentials)
                }
            }
            None if self.settings.credentials.is_empty() => Authorization::None,
            None => Authorization::Basic(self.settings.credentials.clone()),
        };
        if authorization.is_some() {
            self.credentials_sent = true;
        }
        Ok(authorization)
    }

    /// Classifies a request outcome at the current time.
    pub fn classify(
        &mut self,
        outcome: &RequestOutcome,
        requested: &str,
        expected: &[u16],
    ) -> Classification {
        self.classify_at(outcome, requested, expected, Instant::now())
    }

    /// Classifies a request outcome.
    ///
    /// `requested` is the path of the request, used to judge redirects.
    /// Status codes in `expected` are accepted as they are.
    pub fn classify_at(
        &mut self,
        outcome: &RequestOutcome,
        requested: &str,
        expected: &[u16],
        now: Instant,
    ) -> Classification {
        let Some(operation) = self.operation.clone() else {
            return Classification::Fail(SessionError::NoOperation);
        };
        let quirks = Arc::clone(&self.settings.quirks);
        let mut code = outcome.code;
        let mut status = outcome.status.unwrap_or(0);
        let mut retry = false;
        let mut oauth_exhausted = false;
        let mut description = if outcome.message.is_empty() {
            format!("{operation}: request failed")
        } else {
            format!("{operation}: {}", outcome.message)
        };

        if matches!(code, TransportCode::Ok | TransportCode::Error) && (300..400).contains(&status)
        {
            let location = outcome.location.clone().unwrap_or_default();
            if quirks.is_temporary_redirect(requested, &location) {
                debug!(%operation, %location, "treating redirect as temporary failure");
                retry = true;
            } else {
                return Classification::Fail(SessionError::Redirect {
                    operation,
                    status,
                    from: requested.to_string(),
                    to: location,
                });
            }
        }

        if self.auth.is_some() && code == TransportCode::Error && quirks.treat_as_auth_failure(status)
        {
            code = TransportCode::Auth;
        }

        match code {
            TransportCode::Ok => {
                if expected.contains(&status) {
                    return Classification::Accept;
                }
                if status != 0 && !(200..300).contains(&status) {
                    description = format!("{operation}: bad HTTP status: {status}");
                    if is_retryable_server_error(status) {
                        retry = true;
                    }
                } else if !retry {
                    self.last_request_end = Some(now);
                    if self.credentials_sent {
                        self.settings.set_credentials_okay(true);
                    }
                    return Classification::Accept;
                }
            }
            TransportCode::Auth => {
                if let Some(provider) = &self.auth {
                    if provider.supports_oauth2() {
                        if self.bearer.is_some() {
                            if self.token_refreshed {
                                oauth_exhausted = true;
                            } else {
                                retry = true;
                            }
                        }
                        if self.credentials_sent {
                            debug!(%operation, "invalidating cached OAuth2 token");
                            provider.invalidate_cached_secrets();
                            self.bearer = None;
                            if retry {
                                self.token_refreshed = true;
                            }
                        }
                    } else if self.credentials_sent {
                        provider.invalidate_cached_secrets();
                    }
                }
                status = 401;
                description = format!("{operation}: access denied");
            }
            TransportCode::Error => {
                if status != 0 {
                    description = format!("{description}, HTTP status {status}");
                    if is_retryable_server_error(status) {
                        retry = true;
                    }
                } else if quirks.is_transient_error(&outcome.message) {
                    retry = true;
                }
            }
            TransportCode::Lookup | TransportCode::Timeout | TransportCode::Connect => {
                retry = true;
            }
        }

        if status == 401 && !oauth_exhausted && self.settings.credentials_okay() {
            // credentials worked before, assume throttling
            retry = true;
        }

        if retry {
            self.attempt += 1;
            match self.deadline {
                None => debug!(%operation, "retrying not allowed, no deadline"),
                Some(deadline) if now < deadline => {
                    if let Err(err) = self.suspend.check_for_normal() {
                        return Classification::Fail(err.into());
                    }
                    let delay = match self.settings.retry_interval {
                        None => Duration::ZERO,
                        Some(interval) => {
                            let last = self.last_request_end.unwrap_or(now);
                            next_attempt_at(interval, self.attempt, last, deadline)
                                .saturating_duration_since(now)
                        }
                    };
                    info!(
                        %operation,
                        attempt = self.attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "{description}, will retry"
                    );
                    return Classification::Retry { delay };
                }
                Some(_) => debug!(%operation, attempt = self.attempt, "retry deadline reached"),
            }
        }

        if status == 401 {
            self.settings.set_credentials_okay(false);
        }
        if status != 0 {
            Classification::Fail(SessionError::Status {
                status,
                message: description,
            })
        } else {
            Classification::Fail(SessionError::Transport(description))
        }
    }
}
