//! Addressing of messages inside a shared buffer.

use serde::{Deserialize, Serialize};

use crate::error::{ShmError, ShmResult};

/// Content type used by the child to acknowledge a shutdown without payload.
pub const SHUTDOWN_CONTENT_TYPE: &str = "shutdown-message";

/// Location of a message inside the sender's buffer.
///
/// References are plain data and travel over the RPC channel. They are only
/// meaningful together with the buffer they were produced for, and every use
/// goes through [`MessageReference::checked_range`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageReference {
    /// Byte offset of the message start.
    pub offset: u64,
    /// Message length in bytes.
    pub length: u64,
    /// MIME type of the message.
    pub content_type: String,
}

impl MessageReference {
    /// Creates a new reference.
    pub fn new(offset: u64, length: u64, content_type: impl Into<String>) -> Self {
        Self {
            offset,
            length,
            content_type: content_type.into(),
        }
    }

    /// The "no payload" sentinel sent by the child when it shuts down while
    /// the parent still waits for a message.
    pub fn shutdown() -> Self {
        Self::new(0, 0, SHUTDOWN_CONTENT_TYPE)
    }

    /// Returns true for the shutdown sentinel.
    pub fn is_shutdown(&self) -> bool {
        self.offset == 0 && self.length == 0 && self.content_type == SHUTDOWN_CONTENT_TYPE
    }

    /// Validates the reference against a buffer capacity and returns the
    /// byte range it covers.
    pub fn checked_range(&self, capacity: usize) -> ShmResult<std::ops::Range<usize>> {
        let out_of_bounds = || ShmError::OutOfBounds {
            offset: self.offset,
            len: self.length,
            capacity,
        };
        let end = self.offset.checked_add(self.length).ok_or_else(out_of_bounds)?;
        if end > capacity as u64 {
            return Err(out_of_bounds());
        }
        // Both values fit into usize because end <= capacity.
        Ok(self.offset as usize..end as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn shutdown_sentinel() {
        let r = MessageReference::shutdown();
        assert!(r.is_shutdown());
        assert_eq!(r.checked_range(0).unwrap(), 0..0);
        assert!(!MessageReference::new(0, 0, "application/vnd.syncml+xml").is_shutdown());
    }

    #[test]
    fn rejects_overflowing_reference() {
        let r = MessageReference::new(u64::MAX, 2, "x");
        assert!(matches!(
            r.checked_range(100),
            Err(ShmError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn end_at_capacity_is_valid() {
        let r = MessageReference::new(10, 90, "x");
        assert_eq!(r.checked_range(100).unwrap(), 10..100);
        let r = MessageReference::new(10, 91, "x");
        assert!(r.checked_range(100).is_err());
    }

    proptest! {
        #[test]
        fn accepted_ranges_stay_inside(offset in 0u64..4096, length in 0u64..4096, capacity in 0usize..4096) {
            let r = MessageReference::new(offset, length, "x");
            match r.checked_range(capacity) {
                Ok(range) => {
                    prop_assert!(range.end <= capacity);
                    prop_assert_eq!(range.len() as u64, length);
                }
                Err(_) => prop_assert!(offset + length > capacity as u64),
            }
        }
    }
}
