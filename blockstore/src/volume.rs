use log::{debug, info};
use thiserror::Error;

use crate::bitmap::{AllocError, Bitmap};
use crate::io::{BlockDevice, DeviceError};
use crate::mbr::{write_protective_mbr, Mbr, MbrError, MBR_SIZE};

const VOLUME_MAGIC: u32 = 0x424c_4b56; // BLKV

/// Known device block indexes.
const MBR_BLOCK: u64 = 0;
const HEADER_BLOCK: u64 = 1;
const TABLE_BLOCK: u64 = 2;

const HEADER_LEN: usize = 20;

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("device: {0}")]
    Device(#[from] DeviceError),
    #[error("boot record: {0}")]
    Mbr(#[from] MbrError),
    #[error("allocation: {0}")]
    Alloc(#[from] AllocError),
    #[error("bad volume header magic {0:#010x}")]
    BadMagic(u32),
    #[error("cluster size {0} is not a positive multiple of the {1} byte device block size")]
    BadClusterSize(u64, u64),
    #[error("cluster count {0} exceeds the 32-bit allocation table limit")]
    TooManyClusters(u64),
    #[error("device too small to hold volume metadata and a data region")]
    TooSmall,
    #[error("cluster {0} is outside the data region")]
    BadCluster(u64),
    #[error("buffer of {0} byte(s) does not span exactly one {1} byte cluster")]
    BadBuffer(usize, u32),
}

/// Format-time geometry. Everything else (block size, device size) is
/// dictated by the device itself.
#[derive(Clone, Copy, Debug)]
pub struct VolumeParams {
    /// Allocation unit in bytes; must be a multiple of the device block
    /// size.
    pub cluster_size: u64,
}

impl Default for VolumeParams {
    fn default() -> Self {
        VolumeParams { cluster_size: 4096 }
    }
}

/// The volume header written behind the MBR. Fixed little-endian layout,
/// [`HEADER_LEN`] bytes used of the header block.
#[derive(Debug, PartialEq, Clone, Copy)]
struct VolumeHeader {
    cluster_size: u32,
    cluster_count: u32,
    first_data_cluster: u32,
    table_len: u32,
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut out = [0; 4];
    out.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(out)
}

impl VolumeHeader {
    fn parse(buf: &[u8]) -> Result<Self, VolumeError> {
        let magic = read_u32(buf, 0);
        if magic != VOLUME_MAGIC {
            return Err(VolumeError::BadMagic(magic));
        }
        Ok(VolumeHeader {
            cluster_size: read_u32(buf, 4),
            cluster_count: read_u32(buf, 8),
            first_data_cluster: read_u32(buf, 12),
            table_len: read_u32(buf, 16),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut encoded = Vec::with_capacity(HEADER_LEN);
        encoded.extend_from_slice(&VOLUME_MAGIC.to_le_bytes());
        encoded.extend_from_slice(&self.cluster_size.to_le_bytes());
        encoded.extend_from_slice(&self.cluster_count.to_le_bytes());
        encoded.extend_from_slice(&self.first_data_cluster.to_le_bytes());
        encoded.extend_from_slice(&self.table_len.to_le_bytes());
        encoded
    }
}

/// A formatted volume: one exclusively owned block device, the boot record
/// read off it, and the cluster allocation table.
///
/// # Layout
/// ```text
/// =============================================================
/// | MBR | Header | Allocation table | Data region (clusters)  |
/// =============================================================
/// ```
/// The metadata region occupies whole device blocks; the data region starts
/// at the first cluster boundary past it, and the allocation table keeps
/// every metadata cluster permanently out of the allocatable domain.
///
/// The filesystem driver that mounted the volume owns it outright;
/// [`unmount`](Self::unmount) tears it down and releases the device.
pub struct Volume<D: BlockDevice> {
    dev: D,
    header: VolumeHeader,
    map: Bitmap,
}

impl<D: BlockDevice> Volume<D> {
    /// Initializes the volume layout onto owned block storage: a protective
    /// MBR, the volume header, and a zeroed allocation table.
    pub fn format(mut dev: D, params: VolumeParams) -> Result<Self, VolumeError> {
        let bs = dev.block_size();
        let cs = params.cluster_size;
        if cs == 0 || cs % bs != 0 {
            return Err(VolumeError::BadClusterSize(cs, bs));
        }
        let cluster_count = dev.size() / cs;
        if cluster_count > u64::from(u32::MAX) {
            return Err(VolumeError::TooManyClusters(cluster_count));
        }

        let table_len = (cluster_count + 7) / 8;
        let table_blocks = (table_len + bs - 1) / bs;
        let meta_bytes = (TABLE_BLOCK + table_blocks) * bs;
        let first_data = (meta_bytes + cs - 1) / cs;
        if first_data >= cluster_count {
            return Err(VolumeError::TooSmall);
        }

        // Protective MBR in block 0, padded to a full device block.
        let mut mbr_block = Vec::with_capacity(bs as usize);
        write_protective_mbr(&mut mbr_block, bs, dev.size() / bs)?;
        dev.write_at(&mbr_block, MBR_BLOCK * bs)?;

        let header = VolumeHeader {
            cluster_size: cs as u32,
            cluster_count: cluster_count as u32,
            first_data_cluster: first_data as u32,
            table_len: table_len as u32,
        };
        let mut header_block = vec![0; bs as usize];
        header_block[0..HEADER_LEN].copy_from_slice(&header.serialize());
        dev.write_at(&header_block, HEADER_BLOCK * bs)?;

        // Fresh allocation table: everything in the data region is free.
        let table = vec![0; (table_blocks * bs) as usize];
        dev.write_at(&table, TABLE_BLOCK * bs)?;
        dev.flush()?;

        info!(
            "formatted volume: {} clusters of {} bytes, data region starts at cluster {}",
            cluster_count, cs, first_data
        );
        Ok(Volume {
            dev,
            header,
            map: Bitmap::new(table, first_data as usize, cluster_count as usize),
        })
    }

    /// Opens an already formatted volume, validating the boot record and
    /// header before loading the allocation table.
    pub fn mount(mut dev: D) -> Result<Self, VolumeError> {
        let bs = dev.block_size();

        let mut block = vec![0; bs as usize];
        dev.read_at(&mut block, MBR_BLOCK * bs)?;
        let mbr = Mbr::parse(&block[..MBR_SIZE.min(block.len())])?;
        mbr.validate()?;

        dev.read_at(&mut block, HEADER_BLOCK * bs)?;
        let header = VolumeHeader::parse(&block)?;

        let table_blocks = (u64::from(header.table_len) + bs - 1) / bs;
        let mut table = vec![0; (table_blocks * bs) as usize];
        dev.read_at(&mut table, TABLE_BLOCK * bs)?;

        debug!(
            "mounted volume: {} clusters of {} bytes, {} table byte(s)",
            header.cluster_count, header.cluster_size, header.table_len
        );
        Ok(Volume {
            dev,
            map: Bitmap::new(
                table,
                header.first_data_cluster as usize,
                header.cluster_count as usize,
            ),
            header,
        })
    }

    /// Claims `count` free clusters from the data region. All-or-nothing:
    /// either `count` clusters come back or none were taken.
    pub fn alloc_clusters(&self, count: usize) -> Result<Vec<u64>, VolumeError> {
        let clusters = self.map.allocate(count)?;
        Ok(clusters.into_iter().map(|c| c as u64).collect())
    }

    /// Returns clusters to the free pool. Unknown or already free clusters
    /// are ignored, so release lists can be replayed after a crash.
    pub fn release_clusters(&self, clusters: &[u64]) {
        let positions: Vec<usize> = clusters.iter().map(|&c| c as usize).collect();
        self.map.free(&positions);
    }

    /// Number of clusters still allocatable.
    pub fn free_clusters(&self) -> usize {
        self.map.free_count()
    }

    /// Byte offset of a cluster on the underlying device; the offsets fed to
    /// reads and writes below.
    pub fn cluster_offset(&self, cluster: u64) -> u64 {
        cluster * u64::from(self.header.cluster_size)
    }

    fn check_cluster(&self, cluster: u64, buf_len: usize) -> Result<(), VolumeError> {
        if cluster < u64::from(self.header.first_data_cluster)
            || cluster >= u64::from(self.header.cluster_count)
        {
            return Err(VolumeError::BadCluster(cluster));
        }
        if buf_len != self.header.cluster_size as usize {
            return Err(VolumeError::BadBuffer(buf_len, self.header.cluster_size));
        }
        Ok(())
    }

    /// Reads one whole cluster. `buf` must be exactly one cluster long.
    pub fn read_cluster(&mut self, cluster: u64, buf: &mut [u8]) -> Result<(), VolumeError> {
        self.check_cluster(cluster, buf.len())?;
        self.dev.read_at(buf, self.cluster_offset(cluster))?;
        Ok(())
    }

    /// Writes one whole cluster. `buf` must be exactly one cluster long.
    pub fn write_cluster(&mut self, cluster: u64, buf: &[u8]) -> Result<(), VolumeError> {
        self.check_cluster(cluster, buf.len())?;
        self.dev.write_at(buf, self.cluster_offset(cluster))?;
        Ok(())
    }

    /// Persists the allocation table and flushes the device, so a crash
    /// after `sync` returns cannot lose accepted allocations.
    pub fn sync(&mut self) -> Result<(), VolumeError> {
        let table = self.map.copy();
        let bs = self.dev.block_size();
        self.dev.write_at(&table, TABLE_BLOCK * bs)?;
        self.dev.flush()?;
        Ok(())
    }

    /// Tears the volume down: syncs bookkeeping, then closes and releases
    /// the device.
    pub fn unmount(mut self) -> Result<(), VolumeError> {
        self.sync()?;
        self.dev.close()?;
        info!("unmounted volume");
        Ok(())
    }
}
