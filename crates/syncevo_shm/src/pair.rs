//! The two buffers of a local sync session.

use crate::buffer::SharedMessageBuffer;
use crate::error::{ShmError, ShmResult};

/// Names the parent's buffer (the child's remote buffer).
pub const PARENT_FD_ENV: &str = "SYNCEVOLUTION_LOCAL_SYNC_PARENT_FD";

/// Names the child's buffer (the parent's remote buffer).
pub const CHILD_FD_ENV: &str = "SYNCEVOLUTION_LOCAL_SYNC_CHILD_FD";

/// Buffer size for a given maximum message size.
///
/// Twice the message size leaves headroom for messages the engine produces
/// slightly above its configured limit.
pub fn buffer_capacity(max_msg_size: usize) -> ShmResult<usize> {
    if max_msg_size == 0 {
        return Err(ShmError::ZeroCapacity);
    }
    max_msg_size
        .checked_mul(2)
        .ok_or(ShmError::CapacityOverflow(max_msg_size))
}

/// Local and remote buffer as seen from one side of the session.
#[derive(Debug)]
pub struct BufferPair {
    /// Buffer this side writes to.
    pub local: SharedMessageBuffer,
    /// Buffer the peer writes to.
    pub remote: SharedMessageBuffer,
}

impl BufferPair {
    /// Creates both buffers in the parent.
    pub fn for_parent(max_msg_size: usize) -> ShmResult<Self> {
        let capacity = buffer_capacity(max_msg_size)?;
        Ok(Self {
            local: SharedMessageBuffer::create(capacity)?,
            remote: SharedMessageBuffer::create(capacity)?,
        })
    }

    /// Adopts both buffers in the child from its environment.
    pub fn for_child(max_msg_size: usize) -> ShmResult<Self> {
        Self::for_child_with(max_msg_size, |name| std::env::var(name).ok())
    }

    /// Adopts both buffers, looking up handle variables through `lookup`.
    pub fn for_child_with<F>(max_msg_size: usize, lookup: F) -> ShmResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let capacity = buffer_capacity(max_msg_size)?;
        let handle = |name: &'static str| {
            let value = lookup(name).ok_or(ShmError::MissingHandle(name))?;
            SharedMessageBuffer::from_handle(name, &value, capacity)
        };
        // The parent's local buffer is our remote one and vice versa.
        let remote = handle(PARENT_FD_ENV)?;
        let local = handle(CHILD_FD_ENV)?;
        Ok(Self { local, remote })
    }

    /// Environment for the child, as produced by the parent.
    pub fn child_env(&self) -> Vec<(String, String)> {
        vec![
            (PARENT_FD_ENV.to_string(), self.local.raw_fd().to_string()),
            (CHILD_FD_ENV.to_string(), self.remote.raw_fd().to_string()),
        ]
    }

    /// Makes both descriptors survive (or not survive) the next `exec`.
    pub fn set_inheritable(&self, inheritable: bool) -> ShmResult<()> {
        self.local.set_inheritable(inheritable)?;
        self.remote.set_inheritable(inheritable)
    }

    /// Capacity of each buffer.
    pub fn capacity(&self) -> usize {
        self.local.capacity()
    }
}
