//! Low-level storage substrate for FAT-family filesystems: free-space
//! bookkeeping, block-granularity device I/O, and the on-disk structures
//! needed to bootstrap partitioned storage.
//!
//! A filesystem driver opens a [`BlockDevice`], reads and validates the
//! [`Mbr`] (or its own boot record), seeds a [`Bitmap`] or
//! [`BuddyAllocator`] from the on-disk allocation table, and from then on
//! pairs `allocate`/`free` calls with `read_at`/`write_at` at offsets
//! derived from the allocated units. [`Volume`] wires those pieces together
//! for drivers that want the composition ready-made.

pub mod bitmap;
pub mod buddy;
pub mod io;
pub mod mbr;
pub mod volume;

pub use crate::bitmap::{Bitmap, TwoBitArray};
pub use crate::buddy::BuddyAllocator;
pub use crate::io::{BlockDevice, DeviceError, FileBlockDevice, FileBlockDeviceBuilder, MemBlockDevice};
#[cfg(target_os = "linux")]
pub use crate::io::RawBlockDevice;
pub use crate::mbr::Mbr;
pub use crate::volume::{Volume, VolumeParams};
