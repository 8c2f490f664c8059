//! memfd-backed buffer mapped into both processes.

use std::{
    ffi::c_void,
    fmt,
    num::NonZeroUsize,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    ptr::NonNull,
    slice,
};

use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, FdFlag},
    sys::{
        memfd::{memfd_create, MemFdCreateFlag},
        mman::{mmap, munmap, MapFlags, ProtFlags},
        stat::fstat,
    },
    unistd::ftruncate,
};

use crate::error::{ShmError, ShmResult};
use crate::reference::MessageReference;

/// A fixed-capacity byte arena shared between parent and child.
///
/// Each side writes only into its own local buffer and reads only from the
/// peer's buffer. The RPC protocol allows at most one message in flight per
/// direction, which is what keeps both processes from touching the same
/// bytes concurrently.
pub struct SharedMessageBuffer {
    fd: OwnedFd,
    ptr: NonNull<u8>,
    capacity: usize,
}

// SAFETY: the mapping is owned by this value and only reachable through it.
unsafe impl Send for SharedMessageBuffer {}

impl SharedMessageBuffer {
    /// Creates a new anonymous buffer of `capacity` bytes.
    ///
    /// The descriptor is close-on-exec; use [`set_inheritable`](Self::set_inheritable)
    /// around spawning the helper that is meant to adopt it.
    pub fn create(capacity: usize) -> ShmResult<Self> {
        if capacity == 0 {
            return Err(ShmError::ZeroCapacity);
        }
        let raw = memfd_create(c"syncevo-message-buffer", MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(ShmError::Create)?;
        // SAFETY: memfd_create returned a fresh descriptor that nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        let len = i64::try_from(capacity).map_err(|_| ShmError::CapacityOverflow(capacity))?;
        ftruncate(fd.as_raw_fd(), len).map_err(|source| ShmError::Resize {
            size: capacity,
            source,
        })?;
        let ptr = map(&fd, capacity)?;
        tracing::debug!(fd = fd.as_raw_fd(), capacity, "created shared message buffer");
        Ok(Self { fd, ptr, capacity })
    }

    /// Maps a buffer created by the peer.
    ///
    /// Fails with [`ShmError::CapacityMismatch`] if the backing file does not
    /// have exactly `expected_capacity` bytes.
    pub fn adopt(fd: OwnedFd, expected_capacity: usize) -> ShmResult<Self> {
        let raw = fd.as_raw_fd();
        let stat = fstat(raw).map_err(|source| ShmError::Stat { fd: raw, source })?;
        let actual = u64::try_from(stat.st_size).unwrap_or(0);
        if actual != expected_capacity as u64 {
            return Err(ShmError::CapacityMismatch {
                actual,
                expected: expected_capacity,
            });
        }
        if expected_capacity == 0 {
            return Err(ShmError::ZeroCapacity);
        }
        let ptr = map(&fd, expected_capacity)?;
        tracing::debug!(fd = raw, capacity = expected_capacity, "adopted shared message buffer");
        Ok(Self {
            fd,
            ptr,
            capacity: expected_capacity,
        })
    }

    /// Adopts the buffer whose descriptor number is stored in the
    /// environment variable `name`.
    pub fn from_env(name: &'static str, expected_capacity: usize) -> ShmResult<Self> {
        let value = std::env::var(name).map_err(|_| ShmError::MissingHandle(name))?;
        Self::from_handle(name, &value, expected_capacity)
    }

    /// Adopts the buffer whose descriptor number is `value`, as read from
    /// the variable `name`.
    pub fn from_handle(name: &'static str, value: &str, expected_capacity: usize) -> ShmResult<Self> {
        let raw: RawFd = value
            .trim()
            .parse()
            .ok()
            .filter(|fd| *fd >= 0)
            .ok_or_else(|| ShmError::InvalidHandle {
                name,
                value: value.to_string(),
            })?;
        // Validate before taking ownership, closing a foreign number would be wrong.
        fstat(raw).map_err(|source| ShmError::Stat { fd: raw, source })?;
        // SAFETY: the descriptor was inherited for this process and is open.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Self::adopt(fd, expected_capacity)
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw descriptor number, as passed to the child.
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Toggles close-on-exec so that the descriptor survives (or does not
    /// survive) the next `exec`.
    pub fn set_inheritable(&self, inheritable: bool) -> ShmResult<()> {
        let raw = self.fd.as_raw_fd();
        let flags = fcntl(raw, FcntlArg::F_GETFD).map_err(|source| ShmError::Flags { fd: raw, source })?;
        let mut flags = FdFlag::from_bits_truncate(flags);
        flags.set(FdFlag::FD_CLOEXEC, !inheritable);
        fcntl(raw, FcntlArg::F_SETFD(flags)).map_err(|source| ShmError::Flags { fd: raw, source })?;
        Ok(())
    }

    /// Copies `data` to the start of the buffer and returns its reference.
    pub fn write(&mut self, data: &[u8], content_type: &str) -> ShmResult<MessageReference> {
        if data.len() > self.capacity {
            return Err(ShmError::MessageTooLarge {
                len: data.len(),
                capacity: self.capacity,
            });
        }
        self.as_mut_slice()[..data.len()].copy_from_slice(data);
        Ok(MessageReference::new(0, data.len() as u64, content_type))
    }

    /// Returns the bytes a reference points to.
    ///
    /// The slice borrows the buffer; copy it out before acknowledging the
    /// message, the peer reuses the space for its next one.
    pub fn read(&self, reference: &MessageReference) -> ShmResult<&[u8]> {
        let range = reference.checked_range(self.capacity)?;
        Ok(&self.as_slice()[range])
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr maps exactly `capacity` bytes for the lifetime of self.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.capacity) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees exclusive local access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }
}

impl Drop for SharedMessageBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr/capacity describe a mapping created by `map` and no
        // slices borrowed from it can outlive self.
        let result = unsafe { munmap(self.ptr.as_ptr().cast::<c_void>(), self.capacity) };
        if let Err(err) = result {
            tracing::warn!(fd = self.fd.as_raw_fd(), "munmap failed: {err}");
        }
    }
}

impl fmt::Debug for SharedMessageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMessageBuffer")
            .field("fd", &self.fd.as_raw_fd())
            .field("capacity", &self.capacity)
            .finish()
    }
}

fn map(fd: &OwnedFd, capacity: usize) -> ShmResult<NonNull<u8>> {
    let len = NonZeroUsize::new(capacity).ok_or(ShmError::ZeroCapacity)?;
    // SAFETY: a fresh shared mapping of a file we hold open; nothing else in
    // this process aliases the returned region.
    let ptr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    }
    .map_err(|source| ShmError::Map {
        size: capacity,
        source,
    })?;
    NonNull::new(ptr.cast::<u8>()).ok_or(ShmError::Map {
        size: capacity,
        source: Errno::EINVAL,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dup(buffer: &SharedMessageBuffer) -> OwnedFd {
        let raw = nix::unistd::dup(buffer.raw_fd()).unwrap();
        // SAFETY: dup returned a new descriptor owned by the test.
        unsafe { OwnedFd::from_raw_fd(raw) }
    }

    #[test]
    fn write_then_read() {
        let mut buffer = SharedMessageBuffer::create(64).unwrap();
        let reference = buffer.write(b"hello", "text/plain").unwrap();
        assert_eq!(reference, MessageReference::new(0, 5, "text/plain"));
        assert_eq!(buffer.read(&reference).unwrap(), b"hello");
    }

    #[test]
    fn zero_capacity_rejected() {
        assert!(matches!(
            SharedMessageBuffer::create(0),
            Err(ShmError::ZeroCapacity)
        ));
    }

    #[test]
    fn message_larger_than_capacity() {
        let mut buffer = SharedMessageBuffer::create(4).unwrap();
        let err = buffer.write(b"hello", "text/plain").unwrap_err();
        assert!(matches!(err, ShmError::MessageTooLarge { len: 5, capacity: 4 }));
        // a message of exactly the capacity fits
        assert!(buffer.write(b"hell", "text/plain").is_ok());
    }

    #[test]
    fn adopted_mapping_sees_writes() {
        let mut buffer = SharedMessageBuffer::create(32).unwrap();
        let peer = SharedMessageBuffer::adopt(dup(&buffer), 32).unwrap();
        let reference = buffer.write(b"shared", "x").unwrap();
        assert_eq!(peer.read(&reference).unwrap(), b"shared");
    }

    #[test]
    fn adopt_with_wrong_capacity() {
        let buffer = SharedMessageBuffer::create(32).unwrap();
        let err = SharedMessageBuffer::adopt(dup(&buffer), 64).unwrap_err();
        assert!(matches!(
            err,
            ShmError::CapacityMismatch {
                actual: 32,
                expected: 64
            }
        ));
    }

    #[test]
    fn read_out_of_bounds() {
        let buffer = SharedMessageBuffer::create(8).unwrap();
        let reference = MessageReference::new(4, 5, "x");
        assert!(matches!(
            buffer.read(&reference),
            Err(ShmError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn inheritable_flag_round_trip() {
        let buffer = SharedMessageBuffer::create(8).unwrap();
        let cloexec = || {
            let flags = fcntl(buffer.raw_fd(), FcntlArg::F_GETFD).unwrap();
            FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC)
        };
        assert!(cloexec());
        buffer.set_inheritable(true).unwrap();
        assert!(!cloexec());
        buffer.set_inheritable(false).unwrap();
        assert!(cloexec());
    }
}
