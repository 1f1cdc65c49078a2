use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum AllocError {
    #[error("no free positions left in allocation domain (wanted {wanted} more)")]
    Exhausted { wanted: usize },
}

/// A bit vector tracking which allocation units (inodes, clusters) are free
/// and which are used. The map covers positions `[lo, hi)`; bits outside that
/// window are carried in the buffer but never touched by allocation, which
/// lets a caller hand in a whole on-disk allocation table while reserving the
/// leading system units.
///
/// Allocation scans forward from the position handed out most recently,
/// wrapping back to `lo` at the end of the domain. Spreading allocations over
/// the domain this way avoids rewriting the same leading units over and over
/// on flash-backed media.
pub struct Bitmap {
    inner: Mutex<BitmapInner>,
}

struct BitmapInner {
    bits: Vec<u8>,
    lo: usize,
    hi: usize,
    /// Cursor for the next forward scan. Starts below `lo` so the first
    /// allocation begins at `lo`.
    last_allocated: usize,
}

impl BitmapInner {
    fn get(&self, pos: usize) -> bool {
        self.bits[pos / 8] & (1 << (pos % 8)) != 0
    }

    fn set(&mut self, pos: usize) {
        self.bits[pos / 8] |= 1 << (pos % 8);
    }

    fn clear(&mut self, pos: usize) {
        self.bits[pos / 8] &= !(1 << (pos % 8));
    }
}

impl Bitmap {
    /// Wraps an existing byte buffer as a bitmap over the domain `[lo, hi)`.
    ///
    /// The buffer is typically the raw allocation table read off disk; its
    /// contents are taken as-is. Panics if the domain does not fit in the
    /// buffer or is empty, both of which are caller bugs rather than runtime
    /// conditions.
    pub fn new(buf: Vec<u8>, lo: usize, hi: usize) -> Self {
        assert!(
            hi <= buf.len() * 8,
            "bitmap domain end {} exceeds buffer capacity of {} bits",
            hi,
            buf.len() * 8
        );
        assert!(lo < hi, "bitmap domain [{}, {}) is empty", lo, hi);
        Bitmap {
            inner: Mutex::new(BitmapInner {
                bits: buf,
                lo,
                hi,
                last_allocated: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<BitmapInner> {
        // A panic mid-operation can only leave extra bits set, never corrupt
        // the buffer, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claims `count` free positions, marking each as used, and returns them
    /// in the order they were found.
    ///
    /// The scan starts just past the last successful allocation and wraps
    /// around the domain once. If fewer than `count` free positions exist the
    /// positions claimed so far are released again and the whole call fails;
    /// an allocation never partially succeeds.
    pub fn allocate(&self, count: usize) -> Result<Vec<usize>, AllocError> {
        let mut inner = self.lock();
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut cursor = inner.last_allocated.wrapping_add(1);
        if cursor < inner.lo || cursor >= inner.hi {
            cursor = inner.lo;
        }

        let mut taken = Vec::with_capacity(count);
        for _ in inner.lo..inner.hi {
            if !inner.get(cursor) {
                inner.set(cursor);
                taken.push(cursor);
                if taken.len() == count {
                    inner.last_allocated = cursor;
                    return Ok(taken);
                }
            }
            cursor += 1;
            if cursor >= inner.hi {
                cursor = inner.lo;
            }
        }

        // Not enough room; roll back everything claimed by this call.
        let wanted = count - taken.len();
        for pos in taken {
            inner.clear(pos);
        }
        Err(AllocError::Exhausted { wanted })
    }

    /// Releases previously allocated positions.
    ///
    /// Position `0` is the conventional "no position" sentinel (real
    /// allocation domains start above it) and is skipped, as is anything
    /// outside `[lo, hi)` or already free. An empty slice does nothing.
    pub fn free(&self, positions: &[usize]) {
        let mut inner = self.lock();
        for &pos in positions {
            if pos == 0 || pos < inner.lo || pos >= inner.hi {
                continue;
            }
            inner.clear(pos);
        }
    }

    /// Reports whether position `i` is currently allocated. Positions outside
    /// the domain always read as free.
    pub fn get(&self, i: usize) -> bool {
        let inner = self.lock();
        if i < inner.lo || i >= inner.hi {
            return false;
        }
        inner.get(i)
    }

    /// Number of free positions remaining in the domain.
    pub fn free_count(&self) -> usize {
        let inner = self.lock();
        (inner.lo..inner.hi).filter(|&i| !inner.get(i)).count()
    }

    /// Snapshots the raw backing bytes, including any bits outside the
    /// domain, so the table can be written back to disk and later rebuilt
    /// with [`Bitmap::new`] using the same bounds.
    pub fn copy(&self) -> Vec<u8> {
        self.lock().bits.clone()
    }
}

/// A packed array of 2-bit entries, four to a byte, for allocation tables
/// whose units carry more state than free/used (FAT cluster-chain class
/// markers, for example). Entry `i` lives in bits `[2*(i%4), 2*(i%4)+2)` of
/// byte `i/4`.
pub struct TwoBitArray {
    bytes: Vec<u8>,
}

impl TwoBitArray {
    pub fn new(buf: Vec<u8>) -> Self {
        TwoBitArray { bytes: buf }
    }

    /// Number of 2-bit entries the buffer holds.
    pub fn len(&self) -> usize {
        self.bytes.len() * 4
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn get(&self, i: usize) -> u8 {
        assert!(i < self.len(), "entry {} out of range", i);
        (self.bytes[i / 4] >> (2 * (i % 4))) & 0b11
    }

    /// Stores `val` at entry `i`. Only the low two bits of `val` are kept.
    pub fn set(&mut self, i: usize, val: u8) {
        assert!(i < self.len(), "entry {} out of range", i);
        let shift = 2 * (i % 4);
        let byte = &mut self.bytes[i / 4];
        *byte = (*byte & !(0b11 << shift)) | ((val & 0b11) << shift);
    }

    /// Consumes the array and returns the raw backing bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_start_at_domain_floor() {
        let bmp = Bitmap::new(vec![0], 2, 8);
        assert_eq!(bmp.allocate(2).unwrap(), vec![2, 3]);
        assert_eq!(bmp.allocate(4).unwrap(), vec![4, 5, 6, 7]);
    }

    #[test]
    fn exhausted_domain_returns_error() {
        let bmp = Bitmap::new(vec![0], 2, 8);
        bmp.allocate(6).unwrap();
        assert_eq!(bmp.allocate(1).unwrap_err(), AllocError::Exhausted { wanted: 1 });
    }

    #[test]
    fn failed_allocation_rolls_back_claimed_bits() {
        let bmp = Bitmap::new(vec![0], 2, 8);
        bmp.allocate(4).unwrap();
        // Two positions left but three requested; neither survivor may be
        // claimed by the failed call.
        assert!(bmp.allocate(3).is_err());
        assert_eq!(bmp.allocate(2).unwrap(), vec![6, 7]);
    }

    #[test]
    fn free_then_get_reflects_released_positions() {
        let bmp = Bitmap::new(vec![0], 2, 8);
        bmp.allocate(6).unwrap();
        bmp.free(&[4, 6]);
        assert!(!bmp.get(4));
        assert!(bmp.get(5));
        assert!(!bmp.get(6));
        assert!(bmp.get(7));
    }

    #[test]
    fn free_ignores_sentinel_and_out_of_domain_positions() {
        let bmp = Bitmap::new(vec![0; 2], 2, 8);
        bmp.allocate(3).unwrap();
        bmp.free(&[0, 1, 9, 2]);
        assert!(!bmp.get(2));
        assert!(bmp.get(3));
        // Freeing an already-free position is a no-op.
        bmp.free(&[2]);
        assert!(!bmp.get(2));
    }

    #[test]
    fn allocation_wraps_around_the_domain() {
        let bmp = Bitmap::new(vec![0], 2, 8);
        bmp.allocate(6).unwrap();
        bmp.free(&[2, 3]);
        // Cursor sits at 7; the next scan wraps to the front of the domain.
        assert_eq!(bmp.allocate(2).unwrap(), vec![2, 3]);
    }

    #[test]
    fn cursor_spreads_allocations_instead_of_reusing_freed_bits() {
        let bmp = Bitmap::new(vec![0], 2, 8);
        let first = bmp.allocate(1).unwrap();
        assert_eq!(first, vec![2]);
        bmp.free(&first);
        // Position 2 is free again but the cursor has moved past it.
        assert_eq!(bmp.allocate(1).unwrap(), vec![3]);
    }

    #[test]
    fn copy_and_rebuild_preserves_every_position() {
        let bmp = Bitmap::new(vec![0; 4], 3, 30);
        bmp.allocate(9).unwrap();
        bmp.free(&[5, 7]);

        let rebuilt = Bitmap::new(bmp.copy(), 3, 30);
        for i in 3..30 {
            assert_eq!(bmp.get(i), rebuilt.get(i), "position {} diverged", i);
        }
    }

    #[test]
    fn free_count_tracks_allocations() {
        let bmp = Bitmap::new(vec![0], 2, 8);
        assert_eq!(bmp.free_count(), 6);
        bmp.allocate(4).unwrap();
        assert_eq!(bmp.free_count(), 2);
        bmp.free(&[2]);
        assert_eq!(bmp.free_count(), 3);
    }

    #[test]
    #[should_panic(expected = "exceeds buffer capacity")]
    fn domain_beyond_buffer_panics() {
        Bitmap::new(vec![0], 0, 9);
    }

    #[test]
    #[should_panic(expected = "is empty")]
    fn empty_domain_panics() {
        Bitmap::new(vec![0], 4, 4);
    }

    #[test]
    fn shared_bitmap_never_hands_out_duplicates() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let bmp = Arc::new(Bitmap::new(vec![0; 64], 1, 512));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let bmp = Arc::clone(&bmp);
            handles.push(std::thread::spawn(move || {
                let mut mine = Vec::new();
                for _ in 0..16 {
                    mine.extend(bmp.allocate(4).unwrap());
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for pos in handle.join().unwrap() {
                assert!(seen.insert(pos), "position {} allocated twice", pos);
            }
        }
        assert_eq!(seen.len(), 4 * 16 * 4);
    }

    #[test]
    fn two_bit_entries_pack_four_per_byte() {
        let mut arr = TwoBitArray::new(vec![0; 2]);
        assert_eq!(arr.len(), 8);
        arr.set(0, 0b01);
        arr.set(3, 0b11);
        arr.set(4, 0b10);
        assert_eq!(arr.get(0), 0b01);
        assert_eq!(arr.get(3), 0b11);
        assert_eq!(arr.get(4), 0b10);
        assert_eq!(arr.get(1), 0);
        // Entries 0 and 3 share the first byte.
        assert_eq!(arr.into_bytes(), vec![0b1100_0001, 0b0000_0010]);
    }

    #[test]
    fn two_bit_set_overwrites_previous_value() {
        let mut arr = TwoBitArray::new(vec![0]);
        arr.set(2, 0b11);
        arr.set(2, 0b01);
        assert_eq!(arr.get(2), 0b01);
        // Values wider than two bits are masked down.
        arr.set(1, 0xff);
        assert_eq!(arr.get(1), 0b11);
        assert_eq!(arr.get(2), 0b01);
    }
}
