//! # SyncEvolution Session
//!
//! Retry, backoff and error classification for HTTP/DAV-like sessions.
//!
//! This crate provides:
//! - `RetrySession`, the per-operation classification state machine
//! - `DavSession`, a request loop that sleeps between attempts
//! - `SessionSettings` with the shared "credentials okay" flag
//! - `AuthProvider` for OAuth2 tokens and `ProviderQuirks` for servers
//!   that need special handling
//!
//! The HTTP stack itself is not part of this crate. Requests are issued
//! by a closure which reports a [`RequestOutcome`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod clock;
mod config;
mod error;
mod quirks;
mod retry;
mod session;

pub use auth::{AuthProvider, Authorization};
pub use clock::{ManualClock, RetryClock, SystemClock};
pub use config::{SessionSettings, DEFAULT_RETRY_INTERVAL};
pub use error::{SessionError, SessionResult};
pub use quirks::{GoogleQuirks, NoQuirks, ProviderQuirks};
pub use retry::{
    backoff_delay, next_attempt_at, Classification, RequestOutcome, RetrySession, TransportCode,
};
pub use session::DavSession;
