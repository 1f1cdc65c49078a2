use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, SeekFrom};
use std::path::Path;

use super::block::{check_transfer, BlockDevice, DeviceError};

fn io_err(op: &'static str, offset: u64, len: usize) -> impl FnOnce(std::io::Error) -> DeviceError {
    move |source| DeviceError::Io {
        op,
        offset,
        len,
        source,
    }
}

/// A block device stored in an ordinary file. The workhorse backend for
/// development and testing: a fixed-size file stands in for a disk, with the
/// device size derived from the file size rounded down to a whole number of
/// blocks.
pub struct FileBlockDevice {
    /// Dropped on close so later calls cannot reach the medium.
    fd: Option<File>,
    block_size: u64,
    size: u64,
}

impl FileBlockDevice {
    /// Opens an existing file as a block device. The file is not resized or
    /// validated beyond deriving the device size; clients preparing a fresh
    /// medium use [`FileBlockDeviceBuilder`] instead.
    pub fn open<P: AsRef<Path>>(path: P, block_size: u64) -> Result<Self, DeviceError> {
        assert!(block_size > 0, "block size must be non-zero");
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_err("open", 0, 0))?;
        let len = fd.metadata().map_err(io_err("open", 0, 0))?.len();
        Ok(FileBlockDevice {
            fd: Some(fd),
            block_size,
            size: len - len % block_size,
        })
    }

    fn fd(&mut self) -> Result<&mut File, DeviceError> {
        self.fd.as_mut().ok_or(DeviceError::Closed)
    }
}

impl BlockDevice for FileBlockDevice {
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
        // read_exact turns any short read inside the device range into an
        // error rather than a partial transfer.
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
        // Plain files have no discard primitive; the hint is advisory so the
        // caller can carry on without one.
        Err(DeviceError::Unsupported { op: "discard" })
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.flush()?;
        self.fd = None;
        Ok(())
    }
}

/// Prepares a file for use as a [`FileBlockDevice`].
///
/// The builder takes ownership of the file descriptor and can do destructive
/// things to it (truncating to the requested geometry, zeroing the medium),
/// so a builder produces exactly one device.
pub struct FileBlockDeviceBuilder {
    fd: File,
    block_size: u64,
    block_count: Option<u64>,
    clear_medium: bool,
}

impl From<File> for FileBlockDeviceBuilder {
    fn from(fd: File) -> Self {
        FileBlockDeviceBuilder {
            fd,
            block_size: 512,
            block_count: None,
            clear_medium: false,
        }
    }
}

impl FileBlockDeviceBuilder {
    /// Sets the device block size. Defaults to 512, the customary disk
    /// sector size.
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    /// Sizes the medium to exactly `blocks` blocks, growing or truncating
    /// the file as needed. Without this the device size comes from the
    /// existing file length.
    pub fn with_block_count(mut self, blocks: u64) -> Self {
        self.block_count = Some(blocks);
        self
    }

    /// Zero-fills the medium during [`build`](Self::build). Skip this when
    /// reopening an already initialized disk image.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear_medium = clear;
        self
    }

    pub fn build(mut self) -> Result<FileBlockDevice, DeviceError> {
        assert!(self.block_size > 0, "block size must be non-zero");
        let size = match self.block_count {
            Some(blocks) => {
                let size = blocks * self.block_size;
                self.fd.set_len(size).map_err(io_err("build", 0, 0))?;
                size
            }
            None => {
                let len = self.fd.metadata().map_err(io_err("build", 0, 0))?.len();
                len - len % self.block_size
            }
        };

        if self.clear_medium {
            self.zero_medium(size)?;
        }

        Ok(FileBlockDevice {
            fd: Some(self.fd),
            block_size: self.block_size,
            size,
        })
    }

    fn zero_medium(&mut self, size: u64) -> Result<(), DeviceError> {
        self.fd
            .seek(SeekFrom::Start(0))
            .map_err(io_err("build", 0, 0))?;
        // Buffer the zero blocks so initializing a large medium does not
        // issue one syscall per block.
        let mut bfd = BufWriter::new(&self.fd);
        let zeros = vec![0u8; self.block_size as usize];
        for _ in 0..size / self.block_size {
            bfd.write_all(&zeros).map_err(io_err("build", 0, 0))?;
        }
        bfd.flush().map_err(io_err("build", 0, 0))
    }
}
