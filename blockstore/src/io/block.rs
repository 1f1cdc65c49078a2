use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("unaligned {op}: offset {offset} length {len} on a {block_size} byte block device")]
    Unaligned {
        op: &'static str,
        offset: u64,
        len: usize,
        block_size: u64,
    },
    #[error("{op} out of bounds: offset {offset} length {len} on a {size} byte device")]
    OutOfBounds {
        op: &'static str,
        offset: u64,
        len: usize,
        size: u64,
    },
    #[error("short {op}: moved {moved} of {len} byte(s) at offset {offset}")]
    ShortTransfer {
        op: &'static str,
        offset: u64,
        len: usize,
        moved: usize,
    },
    #[error("device is closed")]
    Closed,
    #[error("{op} is not supported by this device")]
    Unsupported { op: &'static str },
    #[error("{op} failed at offset {offset} length {len}")]
    Io {
        op: &'static str,
        offset: u64,
        len: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Uniform fixed-block-size I/O over some backing store.
///
/// Every transfer must be block aligned: both the offset and the buffer
/// length are exact multiples of [`block_size`](Self::block_size), and the
/// addressed range lies inside `[0, size())`. Violations fail before any I/O
/// happens, which lets everything layered above (allocators, the filesystem
/// driver) assume block granularity without re-checking.
///
/// This layer performs no caching, retrying, or reordering; a transfer either
/// completes in full or reports an error.
pub trait BlockDevice {
    /// Transfer granularity in bytes. Fixed for the lifetime of the device.
    fn block_size(&self) -> u64;

    /// Total addressable bytes, always a multiple of
    /// [`block_size`](Self::block_size).
    fn size(&self) -> u64;

    /// Reads `buf.len()` bytes starting at `offset`. On success the whole
    /// buffer was filled and `buf.len()` is returned.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, DeviceError>;

    /// Writes the whole buffer starting at `offset`. On success `buf.len()`
    /// is returned; a short write is an error, never silently partial.
    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize, DeviceError>;

    /// Blocks until every previously accepted write is durable.
    fn flush(&mut self) -> Result<(), DeviceError>;

    /// Advises the device that the contents of `[offset, offset + len)` are
    /// no longer needed. Purely a hint: backends without a discard primitive
    /// may ignore it or report [`DeviceError::Unsupported`].
    fn discard(&mut self, offset: u64, len: u64) -> Result<(), DeviceError>;

    /// Flushes and releases the device. Any call after a successful close
    /// fails with [`DeviceError::Closed`].
    fn close(&mut self) -> Result<(), DeviceError>;
}

/// Validates the alignment and bounds contract for a transfer of `len` bytes
/// at `offset`. Backends call this before touching the backing store.
pub(crate) fn check_transfer(
    op: &'static str,
    block_size: u64,
    size: u64,
    offset: u64,
    len: usize,
) -> Result<(), DeviceError> {
    if offset % block_size != 0 || len as u64 % block_size != 0 {
        return Err(DeviceError::Unaligned {
            op,
            offset,
            len,
            block_size,
        });
    }
    let end = offset.checked_add(len as u64);
    match end {
        Some(end) if end <= size => Ok(()),
        _ => Err(DeviceError::OutOfBounds {
            op,
            offset,
            len,
            size,
        }),
    }
}
