//! # SyncEvolution Local Transport
//!
//! Runs the peer of a sync session in a helper process on the same
//! machine.
//!
//! This crate provides:
//! - `LocalTransportAgent`, the parent side `Transport`
//! - `ChildRuntime` and `run_child` for the helper executable
//! - `ProcessSupervisor` and `ProcessLink` for starting the helper and
//!   connecting it back over a Unix socket
//! - `RpcConnection` with deferred replies (`PendingReply`)
//! - The `SyncSession`, `NestedSessionFactory` and `ItemStore` seams
//!
//! Messages are exchanged through a pair of shared memory buffers; only
//! references to them travel over RPC.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod agent;
mod child;
mod config;
mod error;
pub mod forkexec;
mod rpc;
mod session;
mod store;
mod transport;

pub use agent::{child_quit_error, LocalTransportAgent};
pub use child::{
    child_names, forward_logs, log_channel, nested_setup, plan_datastores, run_child,
    ChildLogLayer, ChildNames, ChildRuntime, ChildTransport, ChildUi, LogReceiver,
    CHILD_DELAY_ENV,
};
pub use config::{
    normalize_config_name, split_config_name, DatastoreConfig, LocalSyncConfig, OutputMode,
    DEFAULT_HELPER, DEFAULT_PEER,
};
pub use error::{LocalTransportError, RpcError, RpcResult, TransportResult};
pub use rpc::{PendingReply, RpcConnection, WeakRpcConnection};
pub use session::{
    FreezeFlag, NestedSessionFactory, NestedSessionSetup, PasswordPrompt, PasswordSource,
    PlannedDatastore, SyncSession,
};
pub use store::{InsertOutcome, ItemRevision, ItemStore, MemoryItemStore};
pub use transport::{Reply, Transport, TransportStatus};
