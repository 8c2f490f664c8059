//! Provider-specific handling of server responses.

use std::fmt::Debug;

const TRANSIENT_TLS_ERRORS: [&str; 2] = [
    "Secure connection truncated",
    "decryption failed or bad record mac",
];

const GOOGLE_TEMPORARY_REDIRECTS: [&str; 3] = [
    "http://www.google.com/googlecalendar/unavailable.html",
    "https://www.google.com/googlecalendar/unavailable.html",
    "https://accounts.google.com/ServiceLogin",
];

/// Hooks for servers that deviate from plain HTTP semantics.
pub trait ProviderQuirks: Send + Sync + Debug {
    /// Returns true if a redirect from `requested` to `location` is a
    /// temporary glitch worth retrying.
    fn is_temporary_redirect(&self, _requested: &str, _location: &str) -> bool {
        false
    }

    /// Returns true if an error status should be handled like an
    /// authentication failure.
    fn treat_as_auth_failure(&self, _status: u16) -> bool {
        false
    }

    /// Returns true if a transport error without HTTP status is transient.
    fn is_transient_error(&self, message: &str) -> bool {
        TRANSIENT_TLS_ERRORS.iter().any(|m| message.contains(m))
    }
}

/// Plain HTTP semantics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoQuirks;

impl ProviderQuirks for NoQuirks {}

/// Google CalDAV/CardDAV.
///
/// Google answers with 403 when an OAuth2 token expired and sometimes
/// redirects to an "unavailable" or login page under load.
#[derive(Debug, Default, Clone, Copy)]
pub struct GoogleQuirks;

impl ProviderQuirks for GoogleQuirks {
    fn is_temporary_redirect(&self, requested: &str, location: &str) -> bool {
        // redirects of the root and the calendar home are real ones
        requested != "/"
            && requested != "/calendar/"
            && GOOGLE_TEMPORARY_REDIRECTS
                .iter()
                .any(|prefix| location.starts_with(prefix))
    }

    fn treat_as_auth_failure(&self, status: u16) -> bool {
        status == 403
    }
}
