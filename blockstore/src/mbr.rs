use std::io::{Read, Write};

use thiserror::Error;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

/// An MBR always occupies the first 512 bytes of the disk, whatever the
/// device block size.
pub const MBR_SIZE: usize = 512;

/// The boot signature closing every valid MBR.
pub const MBR_SIGNATURE: u16 = 0xaa55;

/// Partition OS type bytes a FAT-family bootstrap runs into.
pub const PART_TYPE_EMPTY: u8 = 0x00;
pub const PART_TYPE_FAT12: u8 = 0x01;
pub const PART_TYPE_FAT16: u8 = 0x06;
pub const PART_TYPE_FAT32_LBA: u8 = 0x0c;
/// Marks the disk as GPT-partitioned to legacy tools that only read MBRs.
pub const PART_TYPE_GPT_PROTECTIVE: u8 = 0xee;

#[derive(Error, Debug)]
pub enum MbrError {
    #[error("an mbr is exactly 512 bytes, got {0}")]
    BadLength(usize),
    #[error("block size {0} cannot hold a 512 byte mbr")]
    BlockTooSmall(u64),
    #[error("bad mbr signature {0:#06x}, want 0xaa55")]
    BadSignature(u16),
    #[error("{0} failed")]
    Io(&'static str, #[source] std::io::Error),
}

/// One of the four 16-byte partition records in an MBR. Multi-byte fields
/// are little-endian; the CHS triples are the legacy packed
/// cylinder/head/sector encoding and are carried opaquely.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionRecord {
    pub boot_indicator: u8,
    pub start_chs: [u8; 3],
    pub os_type: u8,
    pub end_chs: [u8; 3],
    pub start_lba: U32<LittleEndian>,
    pub size_lba: U32<LittleEndian>,
}

impl PartitionRecord {
    pub fn zeroed() -> Self {
        PartitionRecord {
            boot_indicator: 0,
            start_chs: [0; 3],
            os_type: PART_TYPE_EMPTY,
            end_chs: [0; 3],
            start_lba: U32::new(0),
            size_lba: U32::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.os_type == PART_TYPE_EMPTY
    }
}

/// The fixed 512-byte Master Boot Record living in the first sector of a
/// partitioned disk.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mbr {
    pub boot_code: [u8; 424],
    pub pad: [u8; 16],
    pub disk_signature: U32<LittleEndian>,
    pub reserved: U16<LittleEndian>,
    pub partitions: [PartitionRecord; 4],
    /// [`MBR_SIGNATURE`] on every valid record.
    pub signature: U16<LittleEndian>,
}

impl Mbr {
    /// An empty record: no boot code, no partitions, but a valid signature.
    pub fn zeroed() -> Self {
        Mbr {
            boot_code: [0; 424],
            pad: [0; 16],
            disk_signature: U32::new(0),
            reserved: U16::new(0),
            partitions: [PartitionRecord::zeroed(); 4],
            signature: U16::new(MBR_SIGNATURE),
        }
    }

    /// A protective MBR for a disk of `num_blocks` sectors, per the UEFI
    /// specification: a single partition of type
    /// [`PART_TYPE_GPT_PROTECTIVE`] starting at LBA 1 and covering the rest
    /// of the disk, clamped to the 32-bit LBA ceiling for larger disks.
    pub fn protective(num_blocks: u64) -> Self {
        let mut mbr = Mbr::zeroed();
        mbr.partitions[0] = PartitionRecord {
            boot_indicator: 0,
            // CHS 0/0/2, the sector right after the MBR itself.
            start_chs: [0x00, 0x02, 0x00],
            os_type: PART_TYPE_GPT_PROTECTIVE,
            // Past the reach of CHS addressing; by convention pinned at the
            // encoding maximum.
            end_chs: [0xff, 0xff, 0xff],
            start_lba: U32::new(1),
            size_lba: U32::new(num_blocks.saturating_sub(1).min(u64::from(u32::MAX)) as u32),
        };
        mbr
    }

    /// Interprets exactly [`MBR_SIZE`] bytes as an MBR. No validation beyond
    /// the length; see [`validate`](Self::validate).
    pub fn parse(buf: &[u8]) -> Result<Self, MbrError> {
        let lv = LayoutVerified::<_, Mbr>::new_unaligned(buf).ok_or(MbrError::BadLength(buf.len()))?;
        Ok(*lv)
    }

    /// Reads exactly [`MBR_SIZE`] bytes from `r` and parses them.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, MbrError> {
        let mut buf = [0u8; MBR_SIZE];
        r.read_exact(&mut buf)
            .map_err(|e| MbrError::Io("reading mbr", e))?;
        Mbr::parse(&buf)
    }

    /// The on-disk representation, always [`MBR_SIZE`] bytes.
    pub fn serialize(&self) -> &[u8] {
        self.as_bytes()
    }

    /// Writes the record as exactly [`MBR_SIZE`] bytes.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), MbrError> {
        w.write_all(self.as_bytes())
            .map_err(|e| MbrError::Io("writing mbr", e))
    }

    /// Checks the boot signature.
    pub fn validate(&self) -> Result<(), MbrError> {
        if self.signature.get() != MBR_SIGNATURE {
            return Err(MbrError::BadSignature(self.signature.get()));
        }
        Ok(())
    }

    /// True when this is a protective MBR: a valid signature and exactly one
    /// partition, of the GPT-protective type.
    pub fn is_protective(&self) -> bool {
        self.validate().is_ok()
            && self.partitions[0].os_type == PART_TYPE_GPT_PROTECTIVE
            && self.partitions[1..].iter().all(PartitionRecord::is_empty)
    }
}

/// Builds a protective MBR for a disk of `num_blocks` blocks and writes it
/// to `w`, padded with zeros to a full `block_size` bytes so the remainder
/// of the first physical block is clean.
pub fn write_protective_mbr<W: Write>(
    w: &mut W,
    block_size: u64,
    num_blocks: u64,
) -> Result<(), MbrError> {
    if block_size < MBR_SIZE as u64 {
        return Err(MbrError::BlockTooSmall(block_size));
    }
    Mbr::protective(num_blocks).write_to(w)?;
    let pad = vec![0u8; block_size as usize - MBR_SIZE];
    w.write_all(&pad)
        .map_err(|e| MbrError::Io("padding protective mbr", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn record_layout_is_exactly_one_sector() {
        assert_eq!(size_of::<PartitionRecord>(), 16);
        assert_eq!(size_of::<Mbr>(), MBR_SIZE);
    }

    #[test]
    fn serialized_records_parse_back_deep_equal() {
        let mut mbr = Mbr::zeroed();
        mbr.boot_code[0] = 0xfa;
        mbr.disk_signature = U32::new(0xdead_beef);
        mbr.partitions[1] = PartitionRecord {
            boot_indicator: 0x80,
            start_chs: [0, 33, 2],
            os_type: PART_TYPE_FAT16,
            end_chs: [7, 42, 9],
            start_lba: U32::new(2048),
            size_lba: U32::new(409_600),
        };

        let mut buf = Vec::new();
        mbr.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), MBR_SIZE);

        let parsed = Mbr::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(parsed, mbr);
    }

    #[test]
    fn parse_rejects_wrong_length_buffers() {
        assert!(matches!(Mbr::parse(&[0; 511]), Err(MbrError::BadLength(511))));
        assert!(matches!(Mbr::parse(&[0; 513]), Err(MbrError::BadLength(513))));
    }

    #[test]
    fn protective_mbr_covers_the_disk_from_lba_one() {
        let mbr = Mbr::protective(100);
        assert!(mbr.is_protective());
        assert_eq!(mbr.signature.get(), MBR_SIGNATURE);

        let part = &mbr.partitions[0];
        assert_eq!(part.os_type, PART_TYPE_GPT_PROTECTIVE);
        assert_eq!(part.start_lba.get(), 1);
        assert_eq!(part.size_lba.get(), 99);
        assert!(mbr.partitions[1..].iter().all(PartitionRecord::is_empty));
    }

    #[test]
    fn protective_mbr_clamps_to_32_bit_lba_range() {
        let mbr = Mbr::protective(1 << 33);
        assert_eq!(mbr.partitions[0].size_lba.get(), u32::MAX);
    }

    #[test]
    fn write_protective_mbr_pads_to_block_size() {
        let mut buf = Vec::new();
        write_protective_mbr(&mut buf, 4096, 100).unwrap();
        assert_eq!(buf.len(), 4096);
        assert!(buf[MBR_SIZE..].iter().all(|&b| b == 0));

        let parsed = Mbr::read_from(&mut buf.as_slice()).unwrap();
        assert!(parsed.is_protective());
        assert_eq!(parsed.partitions[0].size_lba.get(), 99);
    }

    #[test]
    fn undersized_blocks_cannot_hold_an_mbr() {
        let mut buf = Vec::new();
        assert!(matches!(
            write_protective_mbr(&mut buf, 256, 100),
            Err(MbrError::BlockTooSmall(256))
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn signature_is_validated() {
        let mut mbr = Mbr::zeroed();
        mbr.signature = U16::new(0x1234);
        assert!(matches!(mbr.validate(), Err(MbrError::BadSignature(0x1234))));
        assert!(!mbr.is_protective());
    }

    #[test]
    fn on_disk_field_offsets_match_the_legacy_layout() {
        let mbr = Mbr::protective(100);
        let bytes = mbr.serialize();

        // First partition record sits at offset 446.
        assert_eq!(bytes[446], 0); // boot indicator
        assert_eq!(bytes[450], PART_TYPE_GPT_PROTECTIVE);
        assert_eq!(&bytes[454..458], &1u32.to_le_bytes()); // starting LBA
        assert_eq!(&bytes[458..462], &99u32.to_le_bytes()); // size in LBA
        // Boot signature closes the sector.
        assert_eq!(&bytes[510..512], &[0x55, 0xaa]);
    }
}
