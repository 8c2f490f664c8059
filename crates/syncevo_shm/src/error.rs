//! Error types for shared buffer operations.

use nix::errno::Errno;
use thiserror::Error;

/// Result type for shared buffer operations.
pub type ShmResult<T> = Result<T, ShmError>;

/// Errors that can occur while creating, adopting or accessing a shared buffer.
#[derive(Debug, Error)]
pub enum ShmError {
    /// `memfd_create` failed.
    #[error("memfd_create failed: {0}")]
    Create(Errno),

    /// Resizing the backing file failed.
    #[error("ftruncate to {size} bytes failed: {source}")]
    Resize {
        /// Requested size.
        size: usize,
        /// Underlying error.
        source: Errno,
    },

    /// Mapping the backing file failed.
    #[error("mmap of {size} bytes failed: {source}")]
    Map {
        /// Requested size.
        size: usize,
        /// Underlying error.
        source: Errno,
    },

    /// `fstat` on an inherited handle failed.
    #[error("fstat on shared buffer handle {fd} failed: {source}")]
    Stat {
        /// Raw descriptor.
        fd: i32,
        /// Underlying error.
        source: Errno,
    },

    /// Changing descriptor flags failed.
    #[error("fcntl on shared buffer handle {fd} failed: {source}")]
    Flags {
        /// Raw descriptor.
        fd: i32,
        /// Underlying error.
        source: Errno,
    },

    /// Capacity of zero bytes was requested.
    #[error("shared buffer capacity must be non-zero")]
    ZeroCapacity,

    /// Doubling the maximum message size overflowed.
    #[error("maximum message size {0} is too large for a shared buffer")]
    CapacityOverflow(usize),

    /// Both sides disagree about the buffer size.
    #[error("local and remote side do not agree on shared buffer size: {actual} != {expected}")]
    CapacityMismatch {
        /// Size of the inherited buffer.
        actual: u64,
        /// Size this side expected.
        expected: usize,
    },

    /// Environment variable with the handle is not set.
    #[error("shared buffer handle {0} not set")]
    MissingHandle(&'static str),

    /// Environment variable with the handle does not hold a descriptor.
    #[error("invalid shared buffer handle {name}={value:?}")]
    InvalidHandle {
        /// Variable name.
        name: &'static str,
        /// Variable content.
        value: String,
    },

    /// Message does not fit into the buffer.
    #[error("message of {len} bytes exceeds shared buffer capacity of {capacity} bytes")]
    MessageTooLarge {
        /// Message length.
        len: usize,
        /// Buffer capacity.
        capacity: usize,
    },

    /// A reference points outside of the buffer.
    #[error("message reference out of bounds: offset {offset}, len {len}, capacity {capacity}")]
    OutOfBounds {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: u64,
        /// Buffer capacity.
        capacity: usize,
    },
}

impl ShmError {
    /// Returns true if the error indicates inconsistent configuration
    /// between parent and child rather than an OS failure.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ShmError::CapacityMismatch { .. }
                | ShmError::MissingHandle(_)
                | ShmError::InvalidHandle { .. }
                | ShmError::CapacityOverflow(_)
                | ShmError::ZeroCapacity
        )
    }
}
