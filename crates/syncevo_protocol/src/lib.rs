//! # SyncEvolution Local Sync Protocol
//!
//! Messages and data types shared by the parent and the child of a local
//! sync.
//!
//! This crate provides:
//! - `SyncMode` with the translation between both sides of a local sync
//! - `SyncStatus` codes and the `SyncReport` sent by the child
//! - RPC calls, replies and signals (`StartSync`, `SendMsg`, `SetFreeze`,
//!   `AskPassword`, `StoreSyncReport`, `LogOutput`)
//! - Length-prefixed CBOR framing
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod messages;
mod mode;
mod report;
mod status;

pub use codec::{encode_frame, FrameDecoder, MAX_FRAME_LEN};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    Call, ConfigProps, Credentials, DatastoreMapping, Frame, FrameBody, LogRecord, PasswordKey,
    PasswordRequest, RemoteError, ReplyValue, ServerConfigRef, Signal, StartSyncRequest,
    DEFAULT_MAX_MSG_SIZE, MAX_MSG_SIZE_PROP,
};
pub use mode::SyncMode;
pub use report::{DatastoreReport, ItemLocation, ItemOperation, OperationCounts, SyncReport};
pub use status::SyncStatus;
pub use syncevo_shm::{MessageReference, SHUTDOWN_CONTENT_TYPE};
