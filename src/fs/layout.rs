//! On-disk geometry: header, then the bmap region, then the log.

use crate::fs::{BLOCK_SIZE, HEADER_SIZE};

/// Byte positions and sizes derived from the total image size. The bmap
/// region reserves 1/1024 of the image (4 bytes per 4096-byte log slot),
/// rounded up to whole blocks; the log fills the rest.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub bmap_start: u64,
    pub bmap_size: u64,
    pub log_start: u64,
    /// Number of log slots; also the upper bound for block ids.
    pub log_size: u32,
}

impl Layout {
    pub fn for_size(size_b: u64) -> Self {
        let bmap_size = ((size_b - HEADER_SIZE) / 1024).div_ceil(BLOCK_SIZE as u64)
            * BLOCK_SIZE as u64;
        let log_start = HEADER_SIZE + bmap_size;
        let log_size = ((size_b - HEADER_SIZE - bmap_size) / BLOCK_SIZE as u64) as u32;
        Self {
            bmap_start: HEADER_SIZE,
            bmap_size,
            log_start,
            log_size,
        }
    }

    /// Byte offset of a 1-based log slot.
    pub fn slot_offset(&self, log_ptr: u32) -> u64 {
        self.log_start + (log_ptr as u64 - 1) * BLOCK_SIZE as u64
    }
}
