//! Access to the memory of a crashed program.
//!
//! Lookups read parameter values out of whatever memory the crash
//! capture preserved. Captures are sparse: address-space holes and
//! truncated regions are ordinary states, reported as short reads
//! rather than errors.

use rangemap::RangeInclusiveMap;

/// Read-only view of (part of) a crashed program's address space.
pub trait MemoryRegion {
    /// Reads up to `dest.len()` bytes starting at `address`, returning
    /// how many contiguous bytes were actually available.
    fn read_memory(&self, address: u64, dest: &mut [u8]) -> usize;

    /// Reads one byte at `address`.
    fn read_u8(&self, address: u64) -> Option<u8> {
        let mut buf = [0u8; 1];
        if self.read_memory(address, &mut buf) == buf.len() {
            Some(buf[0])
        } else {
            None
        }
    }

    /// Reads an 8-byte value at `address` in host byte order. Dumps
    /// taken from a foreign-endian target must be byte-swapped before
    /// they reach this crate.
    fn read_u64(&self, address: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        if self.read_memory(address, &mut buf) == buf.len() {
            Some(u64::from_ne_bytes(buf))
        } else {
            None
        }
    }
}

/// A flat byte image mapped at a fixed base address.
#[derive(Clone, Debug)]
pub struct ImageMemory {
    base: u64,
    img: Vec<u8>,
}

impl ImageMemory {
    pub fn new(base: u64, img: impl Into<Vec<u8>>) -> Self {
        Self {
            base,
            img: img.into(),
        }
    }
}

impl MemoryRegion for ImageMemory {
    fn read_memory(&self, address: u64, dest: &mut [u8]) -> usize {
        let Some(offset) = address.checked_sub(self.base) else {
            return 0;
        };
        let Ok(offset) = usize::try_from(offset) else {
            return 0;
        };
        let end = offset.checked_add(dest.len()).unwrap_or(usize::MAX);
        let end = usize::min(end, self.img.len());
        let Some(chunk) = end.checked_sub(offset) else {
            return 0;
        };

        dest[..chunk].copy_from_slice(&self.img[offset..end]);
        chunk
    }
}

impl MemoryRegion for RangeInclusiveMap<u64, Vec<u8>> {
    fn read_memory(&self, address: u64, dest: &mut [u8]) -> usize {
        let Some((range, segment)) = self.get_key_value(&address) else {
            return 0;
        };
        let offset = address - range.start();

        let Ok(offset) = usize::try_from(offset) else {
            return 0;
        };
        let end = offset.checked_add(dest.len()).unwrap_or(usize::MAX);
        let end = usize::min(end, segment.len());
        let Some(chunk) = end.checked_sub(offset) else {
            return 0;
        };

        dest[..chunk].copy_from_slice(&segment[offset..end]);
        chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_reads_at_base_offset() {
        let mem = ImageMemory::new(0x1000, vec![1, 2, 3, 4]);
        let mut buf = [0u8; 2];
        assert_eq!(mem.read_memory(0x1001, &mut buf), 2);
        assert_eq!(buf, [2, 3]);
        assert_eq!(mem.read_memory(0x0fff, &mut buf), 0);
        assert_eq!(mem.read_memory(0x1003, &mut buf), 1);
        assert_eq!(mem.read_memory(0x1004, &mut buf), 0);
    }

    #[test]
    fn helpers_require_full_reads() {
        let mem = ImageMemory::new(0, vec![0xaa; 10]);
        assert_eq!(mem.read_u8(9), Some(0xaa));
        assert_eq!(mem.read_u8(10), None);
        assert_eq!(mem.read_u64(2), Some(u64::from_ne_bytes([0xaa; 8])));
        assert_eq!(mem.read_u64(3), None);
    }

    #[test]
    fn sparse_map_reads_within_one_segment() {
        let mut mem: RangeInclusiveMap<u64, Vec<u8>> = RangeInclusiveMap::new();
        mem.insert(0x100..=0x103, vec![9, 8, 7, 6]);
        mem.insert(0x500..=0x501, vec![1, 2]);

        assert_eq!(mem.read_u8(0x102), Some(7));
        assert_eq!(mem.read_u8(0x104), None);
        let mut buf = [0u8; 4];
        assert_eq!(mem.read_memory(0x500, &mut buf), 2);
        assert_eq!(&buf[..2], &[1, 2]);
    }
}
