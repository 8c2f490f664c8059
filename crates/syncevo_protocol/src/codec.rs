//! Length-prefixed CBOR framing for the RPC socket.
//!
//! Each frame is a 4-byte big-endian length followed by the CBOR encoding
//! of a [`Frame`].

use bytes::{Buf, BytesMut};

use crate::error::{ProtocolError, ProtocolResult};
use crate::messages::Frame;

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Encodes a frame including its length prefix.
pub fn encode_frame(frame: &Frame) -> ProtocolResult<Vec<u8>> {
    let mut out = vec![0u8; HEADER_LEN];
    ciborium::into_writer(frame, &mut out).map_err(|e| ProtocolError::encode(e.to_string()))?;
    let len = out.len() - HEADER_LEN;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    out[..HEADER_LEN].copy_from_slice(&(len as u32).to_be_bytes());
    Ok(out)
}

/// Incremental decoder for a byte stream of frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Mutable access to the internal buffer, for reading directly into it.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Bytes received but not yet decoded.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> ProtocolResult<Option<Frame>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buffer[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        if self.buffer.len() < HEADER_LEN + len {
            self.buffer.reserve(HEADER_LEN + len - self.buffer.len());
            return Ok(None);
        }
        self.buffer.advance(HEADER_LEN);
        let body = self.buffer.split_to(len);
        let frame = ciborium::from_reader(&body[..]).map_err(|e| ProtocolError::decode(e.to_string()))?;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Call, FrameBody, LogRecord, ReplyValue, Signal};
    use syncevo_shm::MessageReference;

    fn call_frame(serial: u64) -> Frame {
        Frame {
            instance: "forkexec1".into(),
            body: FrameBody::Call {
                serial,
                call: Call::SendMsg(MessageReference::new(0, 12, "application/vnd.syncml+xml")),
            },
        }
    }

    #[test]
    fn frames_split_across_reads() {
        let mut bytes = encode_frame(&call_frame(1)).unwrap();
        bytes.extend(encode_frame(&call_frame(2)).unwrap());

        let mut decoder = FrameDecoder::new();
        let (first, rest) = bytes.split_at(3);
        decoder.extend(first);
        assert!(decoder.next_frame().unwrap().is_none());
        decoder.extend(rest);
        assert_eq!(decoder.next_frame().unwrap(), Some(call_frame(1)));
        assert_eq!(decoder.next_frame().unwrap(), Some(call_frame(2)));
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn reply_with_error_survives() {
        let frame = Frame {
            instance: "forkexec7".into(),
            body: FrameBody::Reply {
                serial: 9,
                result: Err(crate::RemoteError::new("child not expecting any message")),
            },
        };
        let mut decoder = FrameDecoder::new();
        decoder.extend(&encode_frame(&frame).unwrap());
        assert_eq!(decoder.next_frame().unwrap(), Some(frame));

        let ok = Frame {
            instance: "forkexec7".into(),
            body: FrameBody::Reply {
                serial: 10,
                result: Ok(ReplyValue::Password("secret".into())),
            },
        };
        decoder.extend(&encode_frame(&ok).unwrap());
        assert_eq!(decoder.next_frame().unwrap(), Some(ok));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        assert!(matches!(
            decoder.next_frame(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn corrupt_body_is_a_decode_error() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&3u32.to_be_bytes());
        decoder.extend(&[0xff, 0xff, 0xff]);
        assert!(matches!(decoder.next_frame(), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn signal_frame() {
        let frame = Frame {
            instance: "forkexec1".into(),
            body: FrameBody::Signal(Signal::LogOutput(LogRecord {
                level: "INFO".into(),
                prefix: String::new(),
                message: "target side of local sync ready".into(),
            })),
        };
        let mut decoder = FrameDecoder::new();
        decoder.extend(&encode_frame(&frame).unwrap());
        assert_eq!(decoder.next_frame().unwrap(), Some(frame));
    }
}
