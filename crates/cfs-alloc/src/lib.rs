#![forbid(unsafe_code)]
//! Block allocation for the container data area.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw bit manipulation, one bit per data block.
//! 2. **High-water mark**: every block at or past it has never been handed
//!    out, so fresh capacity is a counter bump instead of a scan.
//! 3. **Free list**: a LIFO stack of freed blocks below the high-water
//!    mark. Allocation drains it before touching fresh capacity.
//!
//! `allocate` and `free` cost O(requested blocks). The only full scan is
//! [`BlockStore::from_bitmap`], which rebuilds the free list at mount.

use cfs_error::{CfsError, Result};
use cfs_types::{BlockNumber, BlockRange, BlockSize};
use tracing::{debug, trace};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Number of bytes needed for a bitmap of `bits` bits.
#[must_use]
pub fn bitmap_len(bits: u64) -> u64 {
    bits.div_ceil(8)
}

fn bit_position(idx: u64) -> Option<(usize, u32)> {
    let byte_idx = usize::try_from(idx / 8).ok()?;
    let bit_idx = u32::try_from(idx % 8).ok()?;
    Some((byte_idx, bit_idx))
}

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u64) -> bool {
    let Some((byte_idx, bit_idx)) = bit_position(idx) else {
        return false;
    };
    bitmap
        .get(byte_idx)
        .is_some_and(|byte| (byte >> bit_idx) & 1 == 1)
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u64) {
    if let Some((byte_idx, bit_idx)) = bit_position(idx) {
        if let Some(byte) = bitmap.get_mut(byte_idx) {
            *byte |= 1 << bit_idx;
        }
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u64) {
    if let Some((byte_idx, bit_idx)) = bit_position(idx) {
        if let Some(byte) = bitmap.get_mut(byte_idx) {
            *byte &= !(1 << bit_idx);
        }
    }
}

/// Count set (used) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_used(bitmap: &[u8], count: u64) -> u64 {
    (0..count).filter(|&idx| bitmap_get(bitmap, idx)).count() as u64
}

// ── Block store ─────────────────────────────────────────────────────────────

/// Free/used accounting for the data area of one container.
///
/// Block numbers handed out are absolute container block numbers; bit `i`
/// of the bitmap tracks block `first + i`.
#[derive(Debug, Clone)]
pub struct BlockStore {
    block_size: BlockSize,
    first: BlockNumber,
    count: u64,
    bitmap: Vec<u8>,
    high_water: u64,
    /// Freed indices below `high_water`; popped from the back.
    free_list: Vec<u64>,
    used: u64,
}

impl BlockStore {
    /// Empty store over `count` data blocks starting at `first`.
    pub fn new(block_size: BlockSize, first: BlockNumber, count: u64) -> Result<Self> {
        first
            .checked_add(count)
            .ok_or_else(|| CfsError::Format("data area end overflows u64".to_owned()))?;
        let len = usize::try_from(bitmap_len(count))
            .map_err(|_| CfsError::Format("bitmap length does not fit usize".to_owned()))?;
        Ok(Self {
            block_size,
            first,
            count,
            bitmap: vec![0_u8; len],
            high_water: 0,
            free_list: Vec::new(),
            used: 0,
        })
    }

    /// Rebuild a store from a persisted bitmap and high-water mark.
    ///
    /// Rejects bitmaps of the wrong length and used bits at or beyond the
    /// high-water mark with `Corruption`.
    pub fn from_bitmap(
        block_size: BlockSize,
        first: BlockNumber,
        count: u64,
        bitmap: Vec<u8>,
        high_water: u64,
    ) -> Result<Self> {
        let expected = bitmap_len(count);
        if u64::try_from(bitmap.len()).ok() != Some(expected) {
            return Err(CfsError::corruption(
                first.0,
                format!(
                    "allocation bitmap length mismatch: got={} expected={expected}",
                    bitmap.len()
                ),
            ));
        }
        if high_water > count {
            return Err(CfsError::corruption(
                first.0,
                format!("high-water mark {high_water} exceeds data block count {count}"),
            ));
        }
        let padded_bits = expected.saturating_mul(8);
        if let Some(stray) = (high_water..padded_bits).find(|&idx| bitmap_get(&bitmap, idx)) {
            return Err(CfsError::corruption(
                first.0,
                format!("block index {stray} marked used beyond high-water mark {high_water}"),
            ));
        }

        let used = bitmap_count_used(&bitmap, high_water);
        let free_list: Vec<u64> = (0..high_water)
            .rev()
            .filter(|&idx| !bitmap_get(&bitmap, idx))
            .collect();

        debug!(
            count,
            used,
            high_water,
            reusable = free_list.len(),
            "block store rebuilt from bitmap"
        );
        Ok(Self {
            block_size,
            first,
            count,
            bitmap,
            high_water,
            free_list,
            used,
        })
    }

    /// Allocate enough blocks to hold `n_bytes` bytes.
    ///
    /// All-or-nothing: on `NoSpace` the store is unchanged.
    pub fn allocate(&mut self, n_bytes: u64) -> Result<Vec<BlockRange>> {
        self.allocate_blocks(self.block_size.blocks_for(n_bytes))
    }

    /// Allocate exactly `n` blocks, reusing freed blocks first.
    pub fn allocate_blocks(&mut self, n: u64) -> Result<Vec<BlockRange>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        if n > self.free_blocks() {
            debug!(
                requested = n,
                free = self.free_blocks(),
                "block allocation refused"
            );
            return Err(CfsError::NoSpace);
        }

        let mut ranges: Vec<BlockRange> = Vec::new();
        let mut remaining = n;
        while remaining > 0 {
            let Some(idx) = self.free_list.pop() else {
                break;
            };
            self.take(idx, &mut ranges);
            remaining -= 1;
        }
        let reused = n - remaining;
        while remaining > 0 {
            let idx = self.high_water;
            self.high_water += 1;
            self.take(idx, &mut ranges);
            remaining -= 1;
        }
        self.used += n;

        debug!(
            blocks = n,
            reused,
            ranges = ranges.len(),
            used = self.used,
            "allocated blocks"
        );
        Ok(ranges)
    }

    fn take(&mut self, idx: u64, ranges: &mut Vec<BlockRange>) {
        bitmap_set(&mut self.bitmap, idx);
        let block = BlockNumber(self.first.0 + idx);
        match ranges.last_mut() {
            Some(last) if last.end() == Some(block) => last.count += 1,
            _ => ranges.push(BlockRange::new(block, 1)),
        }
    }

    /// Return `ranges` to the store.
    ///
    /// Freeing a block outside the data area or one that is already free is
    /// `Corruption`; the store is left unchanged in that case.
    pub fn free(&mut self, ranges: &[BlockRange]) -> Result<()> {
        let mut cleared: Vec<u64> = Vec::new();
        for range in ranges {
            for block in range.blocks() {
                match self.index_of(block) {
                    Some(idx) if bitmap_get(&self.bitmap, idx) => {
                        bitmap_clear(&mut self.bitmap, idx);
                        cleared.push(idx);
                    }
                    Some(_) => {
                        self.restore(&cleared);
                        return Err(CfsError::corruption(
                            block.0,
                            "double free: block already free in bitmap",
                        ));
                    }
                    None => {
                        self.restore(&cleared);
                        return Err(CfsError::corruption(
                            block.0,
                            "free of block outside the data area",
                        ));
                    }
                }
            }
        }

        self.used -= cleared.len() as u64;
        // Reverse so the next allocation pops the lowest block of the most
        // recently freed range first and reuse stays contiguous.
        self.free_list.extend(cleared.iter().rev());
        trace!(blocks = cleared.len(), used = self.used, "freed blocks");
        Ok(())
    }

    fn restore(&mut self, cleared: &[u64]) {
        for &idx in cleared {
            bitmap_set(&mut self.bitmap, idx);
        }
    }

    fn index_of(&self, block: BlockNumber) -> Option<u64> {
        let idx = block.0.checked_sub(self.first.0)?;
        (idx < self.count).then_some(idx)
    }

    /// Whether `block` lies in the data area and is marked used.
    #[must_use]
    pub fn is_allocated(&self, block: BlockNumber) -> bool {
        self.index_of(block)
            .is_some_and(|idx| bitmap_get(&self.bitmap, idx))
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn first_block(&self) -> BlockNumber {
        self.first
    }

    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub fn used_blocks(&self) -> u64 {
        self.used
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.count - self.used
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.used.saturating_mul(self.block_size.as_u64())
    }

    #[must_use]
    pub fn capacity_bytes(&self) -> u64 {
        self.count.saturating_mul(self.block_size.as_u64())
    }

    #[must_use]
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    #[must_use]
    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }
}
