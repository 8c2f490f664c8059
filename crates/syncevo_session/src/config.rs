//! Session retry configuration.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use syncevo_protocol::Credentials;

use crate::quirks::{NoQuirks, ProviderQuirks};

/// Default base interval between retries.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Retry and authentication settings of a network session.
///
/// Clones share the "credentials okay" flag, so a successful
/// authenticated request in one operation is remembered by the next.
#[derive(Clone)]
pub struct SessionSettings {
    /// Base retry interval. `None` retries immediately.
    pub retry_interval: Option<Duration>,

    /// Username and password for basic authentication.
    pub credentials: Credentials,

    /// Provider-specific response handling.
    pub quirks: Arc<dyn ProviderQuirks>,

    credentials_okay: Arc<AtomicBool>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            retry_interval: Some(DEFAULT_RETRY_INTERVAL),
            credentials: Credentials::default(),
            quirks: Arc::new(NoQuirks),
            credentials_okay: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("retry_interval", &self.retry_interval)
            .field("username", &self.credentials.username)
            .field("quirks", &self.quirks)
            .field("credentials_okay", &self.credentials_okay())
            .finish()
    }
}

impl SessionSettings {
    /// Creates settings with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base retry interval.
    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    /// Retries without waiting.
    #[must_use]
    pub fn with_immediate_retry(mut self) -> Self {
        self.retry_interval = None;
        self
    }

    /// Sets basic authentication credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Sets provider quirks.
    #[must_use]
    pub fn with_quirks(mut self, quirks: Arc<dyn ProviderQuirks>) -> Self {
        self.quirks = quirks;
        self
    }

    /// Converts a configured interval in seconds; negative means immediate.
    #[must_use]
    pub fn with_retry_seconds(self, seconds: i64) -> Self {
        match u64::try_from(seconds) {
            Ok(seconds) => self.with_retry_interval(Duration::from_secs(seconds)),
            Err(_) => self.with_immediate_retry(),
        }
    }

    /// Returns true once credentials have been accepted by the server.
    pub fn credentials_okay(&self) -> bool {
        self.credentials_okay.load(Ordering::Acquire)
    }

    /// Records whether the server accepted our credentials.
    pub fn set_credentials_okay(&self, okay: bool) {
        self.credentials_okay.store(okay, Ordering::Release);
    }
}
