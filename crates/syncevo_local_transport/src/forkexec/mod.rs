//! Starting a helper process and connecting it back over RPC.

mod child;
mod exit;
mod parent;

pub use child::ProcessLink;
pub use exit::{classify_exit, ChildExit, SentSignals};
pub use parent::{
    resolve_helper, OutputStream, ProcessSupervisor, SupervisorEvent, SupervisorState,
    INSTALL_LIBEXEC_DIR,
};

/// Path of the RPC socket, set for the helper.
pub const FORK_EXEC_ENV: &str = "SYNCEVOLUTION_FORK_EXEC";

/// Instance id of the connection, set for the helper.
pub const FORK_EXEC_INSTANCE_ENV: &str = "SYNCEVOLUTION_FORK_EXEC_INSTANCE";

/// Overrides where helpers are looked up.
pub const LIBEXEC_DIR_ENV: &str = "SYNCEVOLUTION_LIBEXEC_DIR";
