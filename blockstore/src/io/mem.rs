use super::block::{check_transfer, BlockDevice, DeviceError};

/// A heap-backed block device. The cheapest way to exercise anything that
/// speaks [`BlockDevice`] without touching a real disk.
pub struct MemBlockDevice {
    data: Vec<u8>,
    block_size: u64,
    open: bool,
}

impl MemBlockDevice {
    /// Creates a zero-filled device of `block_count` blocks of `block_size`
    /// bytes each. Panics on a zero block size, which is a caller bug.
    pub fn new(block_size: u64, block_count: u64) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        MemBlockDevice {
            data: vec![0; (block_size * block_count) as usize],
            block_size,
            open: true,
        }
    }

    fn ensure_open(&self) -> Result<(), DeviceError> {
        if self.open {
            Ok(())
        } else {
            Err(DeviceError::Closed)
        }
    }

    /// Consumes the device and returns the backing bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl BlockDevice for MemBlockDevice {
    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, DeviceError> {
        self.ensure_open()?;
        check_transfer("read", self.block_size, self.size(), offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(buf.len())
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize, DeviceError> {
        self.ensure_open()?;
        check_transfer("write", self.block_size, self.size(), offset, buf.len())?;
        let start = offset as usize;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        self.ensure_open()
    }

    fn discard(&mut self, offset: u64, len: u64) -> Result<(), DeviceError> {
        self.ensure_open()?;
        check_transfer("discard", self.block_size, self.size(), offset, len as usize)?;
        // Discarded contents are undefined by contract; zeroing makes reuse
        // bugs reproducible.
        let start = offset as usize;
        for byte in &mut self.data[start..start + len as usize] {
            *byte = 0;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.ensure_open()?;
        self.open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_blocks_read_back_exactly() {
        let mut dev = MemBlockDevice::new(512, 8);
        assert_eq!(dev.size(), 4096);

        let block = vec![0xab; 512];
        assert_eq!(dev.write_at(&block, 1024).unwrap(), 512);

        let mut out = vec![0; 512];
        assert_eq!(dev.read_at(&mut out, 1024).unwrap(), 512);
        assert_eq!(out, block);

        // Neighboring blocks are untouched.
        dev.read_at(&mut out, 512).unwrap();
        assert_eq!(out, vec![0; 512]);
    }

    #[test]
    fn misaligned_io_fails_without_side_effects() {
        let mut dev = MemBlockDevice::new(512, 4);
        let block = vec![0xab; 512];
        assert!(matches!(
            dev.write_at(&block, 100),
            Err(DeviceError::Unaligned { .. })
        ));
        assert!(matches!(
            dev.write_at(&block[..100], 0),
            Err(DeviceError::Unaligned { .. })
        ));
        // Nothing was written by the rejected calls.
        assert_eq!(dev.into_inner(), vec![0; 2048]);
    }

    #[test]
    fn out_of_bounds_io_fails() {
        let mut dev = MemBlockDevice::new(512, 4);
        let mut block = vec![0; 512];
        assert!(matches!(
            dev.read_at(&mut block, 2048),
            Err(DeviceError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn discard_zeroes_the_range() {
        let mut dev = MemBlockDevice::new(512, 4);
        dev.write_at(&vec![0xff; 1024], 0).unwrap();
        dev.discard(0, 512).unwrap();

        let mut out = vec![0xee; 512];
        dev.read_at(&mut out, 0).unwrap();
        assert_eq!(out, vec![0; 512]);
        dev.read_at(&mut out, 512).unwrap();
        assert_eq!(out, vec![0xff; 512]);
    }

    #[test]
    fn closed_device_rejects_every_call() {
        let mut dev = MemBlockDevice::new(512, 4);
        dev.close().unwrap();

        let mut buf = vec![0; 512];
        assert!(matches!(dev.read_at(&mut buf, 0), Err(DeviceError::Closed)));
        assert!(matches!(dev.write_at(&buf, 0), Err(DeviceError::Closed)));
        assert!(matches!(dev.flush(), Err(DeviceError::Closed)));
        assert!(matches!(dev.discard(0, 512), Err(DeviceError::Closed)));
        assert!(matches!(dev.close(), Err(DeviceError::Closed)));
    }
}
