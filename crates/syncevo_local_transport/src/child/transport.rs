//! The transport the nested session uses to talk to the parent.

use std::cell::RefCell;
use std::rc::Rc;

use syncevo_protocol::{MessageReference, RemoteError, ReplyValue};
use syncevo_runtime::{EventLoop, SuspendController};
use syncevo_shm::BufferPair;
use tracing::debug;

use crate::error::{LocalTransportError, TransportResult};
use crate::rpc::{PendingReply, RpcConnection};
use crate::transport::{Reply, Transport, TransportStatus};

/// State shared between the RPC handlers and the nested transport.
#[derive(Debug)]
pub(crate) struct ChildState {
    pub(crate) status: TransportStatus,
    /// Reply to the parent's last `StartSync` or `SendMsg`.
    pub(crate) msg_to_parent: Option<PendingReply<ReplyValue>>,
    /// Last message of the parent, copied out of its buffer.
    pub(crate) message: Option<Reply>,
    pub(crate) buffers: Option<BufferPair>,
}

impl ChildState {
    pub(crate) fn new() -> Self {
        Self {
            status: TransportStatus::Inactive,
            msg_to_parent: None,
            message: None,
            buffers: None,
        }
    }

    /// Stores the reply handle for the parent's current call and fails
    /// any older one.
    pub(crate) fn replace_msg_to_parent(
        &mut self,
        reply: Option<PendingReply<ReplyValue>>,
        reason: &str,
    ) -> Option<PendingReply<ReplyValue>> {
        let old = std::mem::replace(&mut self.msg_to_parent, reply);
        if old.is_some() {
            debug!("cancelling message: {reason}");
        }
        old
    }
}

/// Fails a reply that was replaced by a newer call of the parent.
pub(crate) fn cancel_reply(reply: Option<PendingReply<ReplyValue>>, reason: &str) {
    if let Some(reply) = reply {
        reply.failed(RemoteError::new(format!("cancelling message: {reason}")));
    }
}

/// Transport of the nested session inside the helper.
///
/// `send()` answers the parent's pending call, so the helper can only
/// send after the parent sent something.
pub struct ChildTransport {
    state: Rc<RefCell<ChildState>>,
    connection: RpcConnection,
    event_loop: EventLoop,
    suspend: SuspendController,
    content_type: String,
}

impl ChildTransport {
    pub(crate) fn new(
        state: Rc<RefCell<ChildState>>,
        connection: RpcConnection,
        event_loop: EventLoop,
        suspend: SuspendController,
    ) -> Self {
        Self {
            state,
            connection,
            event_loop,
            suspend,
            content_type: String::new(),
        }
    }

    fn step(&self, what: &str) -> TransportResult<()> {
        debug!("local transport: {what}");
        if !self.connection.is_connected() {
            return Err(LocalTransportError::transport(
                "local transport child no longer has a parent, terminating",
            ));
        }
        self.event_loop.iterate();
        Ok(())
    }
}

impl Transport for ChildTransport {
    fn set_content_type(&mut self, content_type: &str) {
        self.content_type = content_type.to_string();
    }

    fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        let mut state = self.state.borrow_mut();
        let Some(reply) = state.msg_to_parent.take() else {
            state.status = TransportStatus::Failed;
            return Err(LocalTransportError::transport(
                "cannot send data to parent because parent is not waiting for message",
            ));
        };
        let written = match state.buffers.as_mut() {
            Some(buffers) => buffers
                .local
                .write(data, &self.content_type)
                .map_err(LocalTransportError::from),
            None => Err(LocalTransportError::invalid_state("no message buffers")),
        };
        let reference = match written {
            Ok(reference) => reference,
            Err(err) => {
                state.status = TransportStatus::Failed;
                state.msg_to_parent = Some(reply);
                return Err(err);
            }
        };
        debug!(len = reference.length, "sending message to parent");
        state.status = TransportStatus::Active;
        drop(state);
        reply.done(ReplyValue::Message(reference));
        Ok(())
    }

    fn wait(&mut self, _no_reply: bool) -> TransportResult<TransportStatus> {
        while self.status() == TransportStatus::Active && self.suspend.is_normal() {
            self.step("waiting for message from parent")?;
        }
        Ok(self.status())
    }

    fn get_reply(&mut self) -> TransportResult<Reply> {
        let state = self.state.borrow();
        match (&state.message, state.status) {
            (Some(message), TransportStatus::GotReply) => Ok(message.clone()),
            _ => Err(LocalTransportError::invalid_state(
                "get_reply() called in child when no reply available",
            )),
        }
    }

    fn cancel(&mut self) {}

    fn shutdown(&mut self) -> TransportResult<()> {
        let reply = {
            let mut state = self.state.borrow_mut();
            if state.status != TransportStatus::Failed {
                state.status = TransportStatus::Closed;
            }
            state.msg_to_parent.take()
        };
        if let Some(reply) = reply {
            debug!("sending final reply to parent");
            reply.done(ReplyValue::Message(MessageReference::shutdown()));
        }
        Ok(())
    }

    fn status(&self) -> TransportStatus {
        self.state.borrow().status
    }
}
