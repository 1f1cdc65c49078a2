use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::SeekFrom;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use log::debug;

use super::block::{check_transfer, BlockDevice, DeviceError};

// Linux block-layer ioctls, from <linux/fs.h>. The libc crate does not
// export these.
const BLKSSZGET: libc::c_ulong = 0x1268;
const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;
const BLKDISCARD: libc::c_ulong = 0x1277;

fn io_err(op: &'static str, offset: u64, len: usize) -> impl FnOnce(std::io::Error) -> DeviceError {
    move |source| DeviceError::Io {
        op,
        offset,
        len,
        source,
    }
}

/// A block device backed by a real disk (or partition) node such as
/// `/dev/sdb`. Geometry is whatever the kernel reports: the logical sector
/// size becomes the block size and the device byte size comes straight from
/// the block layer, neither is configurable per call.
pub struct RawBlockDevice {
    fd: Option<File>,
    block_size: u64,
    size: u64,
}

impl RawBlockDevice {
    /// Opens a block device node read-write and queries its geometry.
    ///
    /// Fails on anything that is not a block device; regular files belong on
    /// [`FileBlockDevice`](super::FileBlockDevice).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DeviceError> {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_err("open", 0, 0))?;

        let raw = fd.as_raw_fd();
        let mut sector_size: libc::c_int = 0;
        if unsafe { libc::ioctl(raw, BLKSSZGET, &mut sector_size) } != 0 {
            return Err(io_err("open", 0, 0)(std::io::Error::last_os_error()));
        }
        let mut bytes: u64 = 0;
        if unsafe { libc::ioctl(raw, BLKGETSIZE64, &mut bytes) } != 0 {
            return Err(io_err("open", 0, 0)(std::io::Error::last_os_error()));
        }

        let block_size = sector_size as u64;
        debug!(
            "raw block device geometry: {} byte sectors, {} bytes total",
            block_size, bytes
        );
        Ok(RawBlockDevice {
            fd: Some(fd),
            block_size,
            // The block layer reports whole sectors, but clamp anyway so the
            // size invariant cannot be violated by an odd report.
            size: bytes - bytes % block_size,
        })
    }

    fn fd(&mut self) -> Result<&mut File, DeviceError> {
        self.fd.as_mut().ok_or(DeviceError::Closed)
    }
}

impl BlockDevice for RawBlockDevice {
    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, DeviceError> {
        self.fd()?;
        check_transfer("read", self.block_size, self.size, offset, buf.len())?;
        let len = buf.len();
        let fd = self.fd()?;
        fd.seek(SeekFrom::Start(offset))
            .map_err(io_err("read", offset, len))?;
        fd.read_exact(buf).map_err(io_err("read", offset, len))?;
        Ok(len)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize, DeviceError> {
        self.fd()?;
        check_transfer("write", self.block_size, self.size, offset, buf.len())?;
        let len = buf.len();
        let fd = self.fd()?;
        fd.seek(SeekFrom::Start(offset))
            .map_err(io_err("write", offset, len))?;
        fd.write_all(buf).map_err(io_err("write", offset, len))?;
        Ok(len)
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        self.fd()?.sync_all().map_err(io_err("flush", 0, 0))
    }

    fn discard(&mut self, offset: u64, len: u64) -> Result<(), DeviceError> {
        self.fd()?;
        check_transfer("discard", self.block_size, self.size, offset, len as usize)?;
        let raw = self.fd()?.as_raw_fd();
        let range: [u64; 2] = [offset, len];
        if unsafe { libc::ioctl(raw, BLKDISCARD, range.as_ptr()) } != 0 {
            let err = std::io::Error::last_os_error();
            // Plenty of devices (and loop setups) simply lack TRIM.
            if err.raw_os_error() == Some(libc::EOPNOTSUPP) {
                return Err(DeviceError::Unsupported { op: "discard" });
            }
            return Err(io_err("discard", offset, len as usize)(err));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.flush()?;
        self.fd = None;
        Ok(())
    }
}
