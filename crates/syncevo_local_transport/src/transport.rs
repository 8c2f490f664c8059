//! Message transport used by a sync session.

use std::fmt;
use std::time::Duration;

use crate::error::TransportResult;

/// State of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportStatus {
    /// Nothing in flight.
    Inactive,
    /// A message was sent, the reply is pending.
    Active,
    /// A reply is available.
    GotReply,
    /// Permanently broken.
    Failed,
    /// Cancelled by the local side.
    Canceled,
    /// Shut down after the last message.
    Closed,
}

impl TransportStatus {
    /// True for states that end the message exchange.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransportStatus::Failed | TransportStatus::Canceled | TransportStatus::Closed
        )
    }
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportStatus::Inactive => "inactive",
            TransportStatus::Active => "active",
            TransportStatus::GotReply => "got reply",
            TransportStatus::Failed => "failed",
            TransportStatus::Canceled => "canceled",
            TransportStatus::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Payload, copied out of the peer's buffer.
    pub data: Vec<u8>,
    /// Content type set by the peer.
    pub content_type: String,
}

/// Request/reply message transport as seen by a sync engine.
///
/// A session calls `send()`, then `wait()`, and `get_reply()` once
/// `wait()` reported `GotReply`. Only one message is in flight at a time.
pub trait Transport {
    /// Sets the URL of the next message. Ignored by local transports.
    fn set_url(&mut self, _url: &str) {}

    /// Sets the content type of the next message.
    fn set_content_type(&mut self, content_type: &str);

    /// Starts sending a message.
    fn send(&mut self, data: &[u8]) -> TransportResult<()>;

    /// Waits for the reply to the last message.
    ///
    /// With `no_reply` the caller does not expect an answer and the
    /// transport returns to `Inactive` right away.
    fn wait(&mut self, no_reply: bool) -> TransportResult<TransportStatus>;

    /// Returns the reply. Only valid after `wait()` returned `GotReply`.
    fn get_reply(&mut self) -> TransportResult<Reply>;

    /// Aborts the message exchange.
    fn cancel(&mut self);

    /// Ends the message exchange normally.
    fn shutdown(&mut self) -> TransportResult<()>;

    /// Freezes or thaws the peer.
    fn set_freeze(&mut self, _freeze: bool) -> TransportResult<()> {
        Ok(())
    }

    /// Sets a timeout for replies. Local peers fail by dying, so the
    /// default ignores it.
    fn set_timeout(&mut self, _timeout: Option<Duration>) {}

    /// Current state.
    fn status(&self) -> TransportStatus;
}
