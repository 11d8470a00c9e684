//! Container geometry and superblock.
//!
//! ```text
//! block 0                     superblock (88 bytes, rest of block zero)
//! [1, 1 + slot)               metadata slot A
//! [1 + slot, 1 + 2*slot)      metadata slot B
//! [1 + 2*slot, block_count)   data area
//!
//! Superblock:
//! +----------------------+--------+
//! | magic                | 4 bytes| = 0x3153_4643 ("CFS1")
//! | version              | 2 bytes| = 1
//! | flags                | 2 bytes| = 0
//! | block_size           | 4 bytes|
//! | reserved             | 4 bytes|
//! | block_count          | 8 bytes|
//! | meta_start           | 8 bytes| = 1
//! | meta_blocks_per_slot | 8 bytes|
//! | data_start           | 8 bytes|
//! | data_blocks          | 8 bytes|
//! | active_slot          | 4 bytes| 0 = A, 1 = B
//! | reserved             | 4 bytes|
//! | generation           | 8 bytes|
//! | image_len            | 8 bytes| bytes of image in the active slot
//! | image_crc            | 4 bytes| CRC32c of those bytes
//! | sb_crc               | 4 bytes| CRC32c of bytes 0..84
//! +----------------------+--------+
//! ```

use cfs_error::{CfsError, Result};
use cfs_types::{
    BlockNumber, BlockSize, Generation, ParseError, read_le_u16, read_le_u32, read_le_u64,
};
use serde::{Deserialize, Serialize};

/// Superblock magic ("CFS1" little-endian).
pub const SUPERBLOCK_MAGIC: u32 = 0x3153_4643;

pub const FORMAT_VERSION: u16 = 1;

/// Encoded superblock length in bytes.
pub const SUPERBLOCK_SIZE: usize = 88;

const SB_CRC_OFFSET: usize = 84;

pub const MIN_META_BLOCKS: u64 = 2;
pub const MAX_META_BLOCKS: u64 = 16_384;

/// Options accepted by `Container::format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOptions {
    pub block_size: BlockSize,
    /// Blocks per metadata slot. `None` picks `block_count / 32`, clamped
    /// to `MIN_META_BLOCKS..=MAX_META_BLOCKS`.
    pub metadata_blocks: Option<u64>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: BlockSize::DEFAULT,
            metadata_blocks: None,
        }
    }
}

/// Which of the two metadata slots holds the committed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    #[must_use]
    pub fn index(self) -> u32 {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    #[must_use]
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(Self::A),
            1 => Some(Self::B),
            _ => None,
        }
    }
}

/// Block-level layout of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub block_size: BlockSize,
    pub block_count: u64,
    pub meta_start: BlockNumber,
    pub meta_blocks_per_slot: u64,
    pub data_start: BlockNumber,
    pub data_blocks: u64,
}

impl Geometry {
    /// Lay out a fresh container over `block_count` blocks.
    pub fn plan(block_count: u64, block_size: BlockSize, metadata_blocks: Option<u64>) -> Result<Self> {
        let meta = metadata_blocks
            .unwrap_or_else(|| (block_count / 32).clamp(MIN_META_BLOCKS, MAX_META_BLOCKS));
        if !(MIN_META_BLOCKS..=MAX_META_BLOCKS).contains(&meta) {
            return Err(CfsError::Format(format!(
                "metadata_blocks must be in {MIN_META_BLOCKS}..={MAX_META_BLOCKS}, got {meta}"
            )));
        }
        let data_start = meta
            .checked_mul(2)
            .and_then(|m| m.checked_add(1))
            .ok_or_else(|| CfsError::Format("metadata area overflows u64".to_owned()))?;
        if data_start >= block_count {
            return Err(CfsError::Format(format!(
                "container too small: {block_count} blocks leave no data area after {data_start} reserved"
            )));
        }
        let geometry = Self {
            block_size,
            block_count,
            meta_start: BlockNumber(1),
            meta_blocks_per_slot: meta,
            data_start: BlockNumber(data_start),
            data_blocks: block_count - data_start,
        };
        geometry.validate().map_err(|e| CfsError::Format(e.to_string()))?;
        Ok(geometry)
    }

    /// Check internal consistency of the region boundaries.
    pub fn validate(&self) -> std::result::Result<(), ParseError> {
        if self.meta_start != BlockNumber(1) {
            return Err(ParseError::InvalidField {
                field: "meta_start",
                reason: "must be 1",
            });
        }
        if !(MIN_META_BLOCKS..=MAX_META_BLOCKS).contains(&self.meta_blocks_per_slot) {
            return Err(ParseError::InvalidField {
                field: "meta_blocks_per_slot",
                reason: "out of range",
            });
        }
        let expected_data_start = self
            .meta_blocks_per_slot
            .checked_mul(2)
            .and_then(|m| m.checked_add(self.meta_start.0));
        if expected_data_start != Some(self.data_start.0) {
            return Err(ParseError::InvalidField {
                field: "data_start",
                reason: "does not follow metadata slots",
            });
        }
        if self.data_blocks == 0 {
            return Err(ParseError::InvalidField {
                field: "data_blocks",
                reason: "empty data area",
            });
        }
        if self.data_start.0.checked_add(self.data_blocks) != Some(self.block_count) {
            return Err(ParseError::InvalidField {
                field: "data_blocks",
                reason: "regions do not cover block_count",
            });
        }
        if self
            .block_size
            .as_u64()
            .checked_mul(self.meta_blocks_per_slot)
            .is_none()
        {
            return Err(ParseError::InvalidField {
                field: "meta_blocks_per_slot",
                reason: "slot byte size overflows",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn slot_start(&self, slot: Slot) -> BlockNumber {
        match slot {
            Slot::A => self.meta_start,
            Slot::B => BlockNumber(self.meta_start.0 + self.meta_blocks_per_slot),
        }
    }

    /// Bytes available to one serialized image.
    #[must_use]
    pub fn slot_capacity_bytes(&self) -> u64 {
        self.block_size.as_u64() * self.meta_blocks_per_slot
    }

    #[must_use]
    pub fn capacity_bytes(&self) -> u64 {
        self.block_size.as_u64() * self.data_blocks
    }
}

/// Decoded block 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub geometry: Geometry,
    pub active_slot: Slot,
    pub generation: Generation,
    pub image_len: u64,
    pub image_crc: u32,
}

impl Superblock {
    #[must_use]
    pub fn encode(&self) -> [u8; SUPERBLOCK_SIZE] {
        let g = &self.geometry;
        let mut buf = [0_u8; SUPERBLOCK_SIZE];
        buf[0..4].copy_from_slice(&SUPERBLOCK_MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        // 6..8 flags, 12..16 reserved
        buf[8..12].copy_from_slice(&g.block_size.get().to_le_bytes());
        buf[16..24].copy_from_slice(&g.block_count.to_le_bytes());
        buf[24..32].copy_from_slice(&g.meta_start.0.to_le_bytes());
        buf[32..40].copy_from_slice(&g.meta_blocks_per_slot.to_le_bytes());
        buf[40..48].copy_from_slice(&g.data_start.0.to_le_bytes());
        buf[48..56].copy_from_slice(&g.data_blocks.to_le_bytes());
        buf[56..60].copy_from_slice(&self.active_slot.index().to_le_bytes());
        // 60..64 reserved
        buf[64..72].copy_from_slice(&self.generation.0.to_le_bytes());
        buf[72..80].copy_from_slice(&self.image_len.to_le_bytes());
        buf[80..84].copy_from_slice(&self.image_crc.to_le_bytes());
        let crc = crc32c::crc32c(&buf[..SB_CRC_OFFSET]);
        buf[SB_CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse and validate a superblock.
    ///
    /// Checks magic, version, checksum and geometry; does not look at the
    /// device.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, ParseError> {
        let magic = read_le_u32(bytes, 0)?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SUPERBLOCK_MAGIC),
                actual: u64::from(magic),
            });
        }
        if read_le_u16(bytes, 4)? != FORMAT_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported format version",
            });
        }
        let stored_crc = read_le_u32(bytes, SB_CRC_OFFSET)?;
        if crc32c::crc32c(&bytes[..SB_CRC_OFFSET]) != stored_crc {
            return Err(ParseError::InvalidField {
                field: "sb_crc",
                reason: "superblock checksum mismatch",
            });
        }

        let geometry = Geometry {
            block_size: BlockSize::new(read_le_u32(bytes, 8)?)?,
            block_count: read_le_u64(bytes, 16)?,
            meta_start: BlockNumber(read_le_u64(bytes, 24)?),
            meta_blocks_per_slot: read_le_u64(bytes, 32)?,
            data_start: BlockNumber(read_le_u64(bytes, 40)?),
            data_blocks: read_le_u64(bytes, 48)?,
        };
        geometry.validate()?;

        let active_slot =
            Slot::from_index(read_le_u32(bytes, 56)?).ok_or(ParseError::InvalidField {
                field: "active_slot",
                reason: "must be 0 or 1",
            })?;
        let image_len = read_le_u64(bytes, 72)?;
        if image_len > geometry.slot_capacity_bytes() {
            return Err(ParseError::InvalidField {
                field: "image_len",
                reason: "larger than a metadata slot",
            });
        }

        Ok(Self {
            geometry,
            active_slot,
            generation: Generation(read_le_u64(bytes, 64)?),
            image_len,
            image_crc: read_le_u32(bytes, 80)?,
        })
    }
}
