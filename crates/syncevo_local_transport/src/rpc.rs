//! Framed RPC over the Unix socket between parent and helper.
//!
//! Calls are answered asynchronously: a handler receives a
//! [`PendingReply`] which may be resolved right away or kept until the
//! answer is known. Replies to our own calls are delivered to the
//! callback passed to [`RpcConnection::call`].

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Duration;

use syncevo_protocol::{
    encode_frame, Call, Frame, FrameBody, FrameDecoder, RemoteError, ReplyValue, Signal,
};
use syncevo_runtime::{EventLoop, LoopWaker};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{RpcError, RpcResult};

const READ_CHUNK: usize = 64 * 1024;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

type ReplyCallback = Box<dyn FnOnce(RpcResult<ReplyValue>)>;
type CallHandler = Rc<dyn Fn(Call, PendingReply<ReplyValue>)>;
type SignalHandler = Rc<dyn Fn(Signal)>;

/// Answer to a call that may be given later.
///
/// Resolved at most once. Dropping it unresolved answers the call with a
/// "cancelled" error.
pub struct PendingReply<T> {
    resolve: Option<Box<dyn FnOnce(Result<T, RemoteError>)>>,
}

impl<T: 'static> PendingReply<T> {
    /// Wraps the function that delivers the answer.
    pub fn new<F>(resolve: F) -> Self
    where
        F: FnOnce(Result<T, RemoteError>) + 'static,
    {
        Self {
            resolve: Some(Box::new(resolve)),
        }
    }

    /// Answers successfully.
    pub fn done(mut self, value: T) {
        if let Some(resolve) = self.resolve.take() {
            resolve(Ok(value));
        }
    }

    /// Answers with an error.
    pub fn failed(mut self, error: RemoteError) {
        if let Some(resolve) = self.resolve.take() {
            resolve(Err(error));
        }
    }

    /// Adapts the value type, for handing the reply to code that produces
    /// a `U`.
    pub fn map_into<U: 'static, F>(mut self, convert: F) -> PendingReply<U>
    where
        F: FnOnce(U) -> T + 'static,
    {
        let resolve = self.resolve.take();
        PendingReply::new(move |result: Result<U, RemoteError>| {
            if let Some(resolve) = resolve {
                resolve(result.map(convert));
            }
        })
    }
}

impl<T> Drop for PendingReply<T> {
    fn drop(&mut self) {
        if let Some(resolve) = self.resolve.take() {
            resolve(Err(RemoteError::cancelled()));
        }
    }
}

impl<T> fmt::Debug for PendingReply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("resolved", &self.resolve.is_none())
            .finish()
    }
}

struct Shared {
    instance: String,
    peer_pid: Option<i32>,
    waker: LoopWaker,
    outgoing: RefCell<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    pending: RefCell<HashMap<u64, ReplyCallback>>,
    next_serial: Cell<u64>,
    call_handler: RefCell<Option<CallHandler>>,
    signal_handler: RefCell<Option<SignalHandler>>,
    disconnect_handlers: RefCell<Vec<Box<dyn FnOnce()>>>,
    reader: RefCell<Option<JoinHandle<()>>>,
    writer: RefCell<Option<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
        for (_, callback) in self.pending.get_mut().drain() {
            callback(Err(RpcError::ConnectionLost));
        }
    }
}

/// One end of the RPC socket.
///
/// Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct RpcConnection {
    shared: Rc<Shared>,
}

impl fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcConnection")
            .field("instance", &self.shared.instance)
            .field("peer_pid", &self.shared.peer_pid)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Non-owning handle to an [`RpcConnection`].
#[derive(Clone)]
pub struct WeakRpcConnection {
    shared: Weak<Shared>,
}

impl WeakRpcConnection {
    /// Returns the connection if it still exists.
    pub fn upgrade(&self) -> Option<RpcConnection> {
        self.shared.upgrade().map(|shared| RpcConnection { shared })
    }
}

impl RpcConnection {
    /// Takes over a connected socket. Must be called inside the runtime
    /// context of `event_loop`.
    pub fn new(stream: UnixStream, instance: impl Into<String>, event_loop: &EventLoop) -> Self {
        let peer_pid = stream.peer_cred().ok().and_then(|cred| cred.pid());
        let (read_half, write_half) = stream.into_split();
        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Rc::new(Shared {
            instance: instance.into(),
            peer_pid,
            waker: event_loop.waker(),
            outgoing: RefCell::new(Some(sender)),
            pending: RefCell::new(HashMap::new()),
            next_serial: Cell::new(1),
            call_handler: RefCell::new(None),
            signal_handler: RefCell::new(None),
            disconnect_handlers: RefCell::new(Vec::new()),
            reader: RefCell::new(None),
            writer: RefCell::new(None),
        });
        let writer = event_loop.spawn_local(write_loop(receiver, write_half));
        let reader = event_loop.spawn_local(read_loop(Rc::downgrade(&shared), read_half));
        *shared.writer.borrow_mut() = Some(writer);
        *shared.reader.borrow_mut() = Some(reader);
        debug!(instance = %shared.instance, pid = ?peer_pid, "RPC connection established");
        Self { shared }
    }

    /// Instance id carried by every frame.
    pub fn instance(&self) -> &str {
        &self.shared.instance
    }

    /// Process id of the peer, if the platform reports it.
    pub fn peer_pid(&self) -> Option<i32> {
        self.shared.peer_pid
    }

    /// Handle that does not keep the connection alive, for handlers
    /// stored inside the connection itself.
    pub fn downgrade(&self) -> WeakRpcConnection {
        WeakRpcConnection {
            shared: Rc::downgrade(&self.shared),
        }
    }

    /// False once the connection was closed or lost.
    pub fn is_connected(&self) -> bool {
        self.shared.outgoing.borrow().is_some()
    }

    /// Handles calls from the peer.
    pub fn set_call_handler<F>(&self, handler: F)
    where
        F: Fn(Call, PendingReply<ReplyValue>) + 'static,
    {
        *self.shared.call_handler.borrow_mut() = Some(Rc::new(handler));
    }

    /// Handles signals from the peer.
    pub fn on_signal<F>(&self, handler: F)
    where
        F: Fn(Signal) + 'static,
    {
        *self.shared.signal_handler.borrow_mut() = Some(Rc::new(handler));
    }

    /// Runs `handler` when the peer goes away.
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: FnOnce() + 'static,
    {
        if self.is_connected() {
            self.shared.disconnect_handlers.borrow_mut().push(Box::new(handler));
        } else {
            handler();
        }
    }

    /// Calls a method of the peer; `on_reply` gets the result.
    ///
    /// Fails right away if the connection is gone, without invoking
    /// `on_reply`.
    pub fn call<F>(&self, call: Call, on_reply: F) -> RpcResult<()>
    where
        F: FnOnce(RpcResult<ReplyValue>) + 'static,
    {
        let serial = self.shared.next_serial.get();
        self.shared.next_serial.set(serial + 1);
        debug!(method = call.method(), serial, "calling peer");
        self.send(FrameBody::Call { serial, call })?;
        self.shared
            .pending
            .borrow_mut()
            .insert(serial, Box::new(on_reply));
        Ok(())
    }

    /// Sends a signal. Never logs, so that it can carry log output.
    pub fn emit_signal(&self, signal: Signal) -> RpcResult<()> {
        self.send(FrameBody::Signal(signal))
    }

    /// Closes the connection. Pending calls fail with
    /// [`RpcError::ConnectionLost`]; disconnect handlers do not run.
    pub fn close(&self) {
        self.disconnect(false);
    }

    /// Closes the connection after queued frames were written.
    pub fn finish(&self, event_loop: &EventLoop) {
        self.close();
        let writer = self.shared.writer.borrow_mut().take();
        if let Some(writer) = writer {
            if event_loop
                .block_on(tokio::time::timeout(FLUSH_TIMEOUT, writer))
                .is_err()
            {
                debug!("flushing RPC connection timed out");
            }
        }
    }

    fn send(&self, body: FrameBody) -> RpcResult<()> {
        let bytes = encode_frame(&Frame {
            instance: self.shared.instance.clone(),
            body,
        })?;
        let outgoing = self.shared.outgoing.borrow();
        let sender = outgoing.as_ref().ok_or(RpcError::ConnectionLost)?;
        sender.send(bytes).map_err(|_| RpcError::ConnectionLost)
    }

    fn disconnect(&self, notify: bool) {
        let was_connected = self.shared.outgoing.borrow_mut().take().is_some();
        let reader = self.shared.reader.borrow_mut().take();
        if let Some(reader) = reader {
            reader.abort();
        }
        let pending: Vec<ReplyCallback> = self
            .shared
            .pending
            .borrow_mut()
            .drain()
            .map(|(_, callback)| callback)
            .collect();
        for callback in pending {
            callback(Err(RpcError::ConnectionLost));
        }
        let handlers = std::mem::take(&mut *self.shared.disconnect_handlers.borrow_mut());
        if was_connected && notify {
            for handler in handlers {
                handler();
            }
        }
        self.shared.waker.wake();
    }

    fn dispatch(&self, frame: Frame) {
        if frame.instance != self.shared.instance {
            warn!(
                expected = %self.shared.instance,
                got = %frame.instance,
                "ignoring frame for another instance"
            );
            return;
        }
        match frame.body {
            FrameBody::Call { serial, call } => self.dispatch_call(serial, call),
            FrameBody::Reply { serial, result } => {
                let callback = self.shared.pending.borrow_mut().remove(&serial);
                match callback {
                    Some(callback) => callback(result.map_err(RpcError::Remote)),
                    None => warn!(serial, "reply to unknown call"),
                }
            }
            FrameBody::Signal(signal) => {
                let handler = self.shared.signal_handler.borrow().clone();
                if let Some(handler) = handler {
                    handler(signal);
                }
            }
        }
        self.shared.waker.wake();
    }

    fn dispatch_call(&self, serial: u64, call: Call) {
        let method = call.method();
        debug!(method, serial, "call from peer");
        let connection = Rc::downgrade(&self.shared);
        let reply = PendingReply::new(move |result| {
            let Some(shared) = connection.upgrade() else {
                return;
            };
            let connection = RpcConnection { shared };
            if let Err(err) = connection.send(FrameBody::Reply { serial, result }) {
                debug!(serial, "dropping reply: {err}");
            }
            connection.shared.waker.wake();
        });
        let handler = self.shared.call_handler.borrow().clone();
        match handler {
            Some(handler) => handler(call, reply),
            None => reply.failed(RpcError::NoHandler(method).to_remote()),
        }
    }
}

async fn write_loop(mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>, mut writer: OwnedWriteHalf) {
    while let Some(bytes) = outgoing.recv().await {
        if let Err(err) = writer.write_all(&bytes).await {
            debug!("writing RPC frame failed: {err}");
            return;
        }
    }
    // peer sees EOF
    let _ = writer.shutdown().await;
}

async fn read_loop(shared: Weak<Shared>, mut reader: OwnedReadHalf) {
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let reason = 'read: loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break "peer closed the connection".to_string(),
            Ok(n) => decoder.extend(&chunk[..n]),
            Err(err) => break format!("reading failed: {err}"),
        }
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => match shared.upgrade() {
                    Some(shared) => RpcConnection { shared }.dispatch(frame),
                    None => return,
                },
                Ok(None) => break,
                Err(err) => break 'read format!("invalid frame: {err}"),
            }
        }
    };
    if let Some(shared) = shared.upgrade() {
        debug!(instance = %shared.instance, %reason, "RPC connection lost");
        RpcConnection { shared }.disconnect(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncevo_protocol::PasswordRequest;

    fn pair(event_loop: &EventLoop) -> (RpcConnection, RpcConnection) {
        let _enter = event_loop.enter();
        let (a, b) = UnixStream::pair().unwrap();
        (
            RpcConnection::new(a, "forkexec1", event_loop),
            RpcConnection::new(b, "forkexec1", event_loop),
        )
    }

    fn password_call() -> Call {
        Call::AskPassword(PasswordRequest::new("password", "test", Default::default()))
    }

    #[test]
    fn call_and_reply() {
        let event_loop = EventLoop::new().unwrap();
        let (parent, child) = pair(&event_loop);
        parent.set_call_handler(|call, reply| match call {
            Call::AskPassword(request) => reply.done(ReplyValue::Password(request.name)),
            _ => reply.failed(RemoteError::new("unexpected")),
        });

        let result = Rc::new(RefCell::new(None));
        let slot = result.clone();
        child
            .call(password_call(), move |reply| {
                *slot.borrow_mut() = Some(reply);
            })
            .unwrap();
        event_loop.run_until(|| result.borrow().is_some());
        let reply = result.borrow_mut().take().unwrap().unwrap();
        assert_eq!(reply, ReplyValue::Password("password".into()));
    }

    #[test]
    fn deferred_reply_and_cancellation() {
        let event_loop = EventLoop::new().unwrap();
        let (parent, child) = pair(&event_loop);
        let kept = Rc::new(RefCell::new(None));
        let store = kept.clone();
        child.set_call_handler(move |_call, reply| {
            *store.borrow_mut() = Some(reply);
        });

        let result = Rc::new(RefCell::new(None));
        let slot = result.clone();
        parent
            .call(Call::SetFreeze(true), move |reply| {
                *slot.borrow_mut() = Some(reply);
            })
            .unwrap();
        event_loop.run_until(|| kept.borrow().is_some());
        assert!(result.borrow().is_none());

        // dropping the kept reply answers with an error
        kept.borrow_mut().take();
        event_loop.run_until(|| result.borrow().is_some());
        match result.borrow_mut().take().unwrap() {
            Err(RpcError::Remote(err)) => assert_eq!(err, RemoteError::cancelled()),
            other => panic!("unexpected {other:?}"),
        };
    }

    #[test]
    fn missing_handler_fails_call() {
        let event_loop = EventLoop::new().unwrap();
        let (parent, _child) = pair(&event_loop);
        let result = Rc::new(RefCell::new(None));
        let slot = result.clone();
        parent
            .call(Call::SetFreeze(false), move |reply| {
                *slot.borrow_mut() = Some(reply);
            })
            .unwrap();
        event_loop.run_until(|| result.borrow().is_some());
        assert!(matches!(
            result.borrow_mut().take().unwrap(),
            Err(RpcError::Remote(err)) if err.message == "no handler for SetFreeze"
        ));
    }

    #[test]
    fn close_fails_pending_calls() {
        let event_loop = EventLoop::new().unwrap();
        let (parent, _child) = pair(&event_loop);
        let result = Rc::new(RefCell::new(None));
        let slot = result.clone();
        parent
            .call(Call::SetFreeze(true), move |reply| {
                *slot.borrow_mut() = Some(reply);
            })
            .unwrap();
        parent.close();
        assert!(matches!(
            result.borrow_mut().take(),
            Some(Err(RpcError::ConnectionLost))
        ));
        assert!(!parent.is_connected());
        assert!(matches!(
            parent.call(Call::SetFreeze(true), |_| {}),
            Err(RpcError::ConnectionLost)
        ));
    }

    #[test]
    fn peer_disconnect_is_reported() {
        let event_loop = EventLoop::new().unwrap();
        let (parent, child) = pair(&event_loop);
        let lost = Rc::new(Cell::new(false));
        let flag = lost.clone();
        child.on_disconnect(move || flag.set(true));
        drop(parent);
        event_loop.run_until(|| lost.get());
        assert!(!child.is_connected());
    }

    #[test]
    fn signals_are_delivered() {
        let event_loop = EventLoop::new().unwrap();
        let (parent, child) = pair(&event_loop);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        parent.on_signal(move |signal| log.borrow_mut().push(signal));
        let record = syncevo_protocol::LogRecord {
            level: "INFO".into(),
            prefix: String::new(),
            message: "hello".into(),
        };
        child.emit_signal(Signal::LogOutput(record.clone())).unwrap();
        event_loop.run_until(|| !seen.borrow().is_empty());
        assert_eq!(seen.borrow()[0], Signal::LogOutput(record));
    }
}
