//! # SyncEvolution Shared Memory
//!
//! Message buffers shared between a local sync parent and its helper.
//!
//! This crate provides:
//! - `SharedMessageBuffer`, a memfd-backed arena mapped by both processes
//! - `MessageReference`, the `(offset, length, content type)` triple that
//!   travels over RPC instead of the payload
//! - `BufferPair` and the environment variables used to hand the buffers
//!   to the child
//!
//! ## Invariants
//!
//! - Both sides agree on the capacity, which is twice the maximum message size
//! - A side writes only into its local buffer
//! - Every reference is bounds-checked before use

#![warn(missing_docs)]

mod buffer;
mod error;
mod pair;
mod reference;

pub use buffer::SharedMessageBuffer;
pub use error::{ShmError, ShmResult};
pub use pair::{buffer_capacity, BufferPair, CHILD_FD_ENV, PARENT_FD_ENV};
pub use reference::{MessageReference, SHUTDOWN_CONTENT_TYPE};
