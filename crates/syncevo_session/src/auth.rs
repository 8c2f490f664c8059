//! Credential providers.

use syncevo_protocol::Credentials;

use crate::error::SessionResult;

/// Source of credentials with its own cache, such as an OAuth2 account.
pub trait AuthProvider: Send + Sync {
    /// Returns true if requests authenticate with a bearer token.
    fn supports_oauth2(&self) -> bool;

    /// Returns a bearer token, refreshing it if the cache is empty.
    fn oauth2_bearer(&self) -> SessionResult<String>;

    /// Returns username and password for basic authentication.
    fn credentials(&self) -> SessionResult<Credentials>;

    /// Drops cached tokens so the next request fetches fresh ones.
    fn invalidate_cached_secrets(&self);
}

/// Authorization attached to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    /// No credentials.
    None,
    /// HTTP basic authentication.
    Basic(Credentials),
    /// OAuth2 bearer token.
    Bearer(String),
}

impl Authorization {
    /// Returns true if credentials are attached.
    pub fn is_some(&self) -> bool {
        !matches!(self, Authorization::None)
    }
}
