//! # SyncEvolution Testkit
//!
//! Test utilities for the local sync transport.
//!
//! This crate provides:
//! - A scripted nested session and its factory, run by the
//!   `syncevo-local-sync` helper binary
//! - A scripted parent driver for end-to-end tests
//! - Recording password prompts and fake OAuth2/basic auth providers
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use syncevo_testkit::prelude::*;
//!
//! #[test]
//! fn round_trip() {
//!     let config = scripted_config(env!("CARGO_BIN_EXE_syncevo-local-sync"), ScriptedBehavior::Normal);
//!     let mut agent = LocalTransportAgent::new(config, EventLoop::new().unwrap());
//!     let outcome = ScriptedServer::new(2).run(&mut agent).unwrap();
//!     assert_eq!(outcome.received.len(), 2);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
