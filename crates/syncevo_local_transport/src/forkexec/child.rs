//! Helper side: connects back to the parent.

use std::env;

use syncevo_runtime::EventLoop;
use tokio::net::UnixStream;
use tracing::debug;

use super::{FORK_EXEC_ENV, FORK_EXEC_INSTANCE_ENV};
use crate::error::{LocalTransportError, TransportResult};
use crate::rpc::RpcConnection;

/// Connection of a helper to the parent that started it.
#[derive(Debug)]
pub struct ProcessLink {
    connection: RpcConnection,
}

impl ProcessLink {
    /// True if this process was started by a
    /// [`ProcessSupervisor`](super::ProcessSupervisor).
    pub fn was_forked() -> bool {
        env::var_os(FORK_EXEC_ENV).is_some()
    }

    /// Connects to the parent named in the environment.
    pub fn connect(event_loop: &EventLoop) -> TransportResult<Self> {
        Self::connect_with(event_loop, |name| env::var(name).ok())
    }

    /// Connects, looking up the environment through `lookup`.
    pub fn connect_with<F>(event_loop: &EventLoop, lookup: F) -> TransportResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = lookup(FORK_EXEC_ENV).ok_or_else(|| {
            LocalTransportError::config("cannot connect to parent, was not forked")
        })?;
        let instance = lookup(FORK_EXEC_INSTANCE_ENV).unwrap_or_default();
        debug!(%path, %instance, "connecting to parent");
        let stream = event_loop.block_on(UnixStream::connect(&path))?;
        let _enter = event_loop.enter();
        let connection = RpcConnection::new(stream, instance, event_loop);
        Ok(Self { connection })
    }

    /// The RPC connection to the parent.
    pub fn connection(&self) -> &RpcConnection {
        &self.connection
    }

    /// False once the parent went away.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Runs `handler` when the parent goes away.
    pub fn on_quit<F>(&self, handler: F)
    where
        F: FnOnce() + 'static,
    {
        self.connection.on_disconnect(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use tokio::net::UnixListener;

    #[test]
    fn not_forked_without_environment() {
        let event_loop = EventLoop::new().unwrap();
        let err = ProcessLink::connect_with(&event_loop, |_| None).unwrap_err();
        assert_eq!(err.to_string(), "cannot connect to parent, was not forked");
    }

    #[test]
    fn connects_and_notices_parent_quit() {
        let event_loop = EventLoop::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpc");
        let listener = {
            let _enter = event_loop.enter();
            UnixListener::bind(&path).unwrap()
        };
        let socket = path.to_string_lossy().into_owned();
        let link = ProcessLink::connect_with(&event_loop, |name| match name {
            FORK_EXEC_ENV => Some(socket.clone()),
            FORK_EXEC_INSTANCE_ENV => Some("forkexec7".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(link.connection().instance(), "forkexec7");

        let (parent, _) = event_loop.block_on(listener.accept()).unwrap();
        let gone = Rc::new(Cell::new(false));
        let flag = gone.clone();
        link.on_quit(move || flag.set(true));
        drop(parent);
        event_loop.run_until(|| gone.get());
        assert!(!link.is_connected());
    }
}
