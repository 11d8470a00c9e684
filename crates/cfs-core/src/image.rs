//! Metadata image codec.
//!
//! One image holds the whole namespace plus the allocation map and is
//! written to a single metadata slot.
//!
//! ```text
//! Image:
//! +------------------+--------+
//! | magic            | 4 bytes| = "CFSI"
//! | version          | 2 bytes| = 1
//! | reserved         | 2 bytes|
//! | generation       | 8 bytes|
//! +------------------+--------+
//! | high_water       | 8 bytes|
//! | data_blocks      | 8 bytes|
//! | bitmap_len       | 4 bytes|
//! | bitmap           | N bytes| bit i set = data block i used
//! +------------------+--------+
//! | entry_count      | 4 bytes|
//! | entries          |        | in id order
//! +------------------+--------+
//! | crc              | 4 bytes| CRC32c of everything above
//! +------------------+--------+
//!
//! Entry:
//! +------------------+--------+
//! | id               | 8 bytes|
//! | parent           | 8 bytes|
//! | kind             | 1 byte | 1 dir, 2 file, 3 symlink
//! | name_len         | 2 bytes|
//! | name             | N bytes| UTF-8
//! | atime/mtime/ctime| 24 bytes| i64 seconds each
//! +------------------+--------+
//! | file:    size u64, extent_count u32, extents (start u64, count u32)*
//! | symlink: target_len u32, target
//! +---------------------------+
//! ```

use cfs_alloc::BlockStore;
use cfs_error::{CfsError, Result};
use cfs_tree::{Content, Entry, Namespace, NewEntry, Times};
use cfs_types::{
    BlockNumber, BlockRange, EntryId, Generation, ParseError, Timestamp, ensure_slice, read_le_i64,
    read_le_u16, read_le_u32, read_le_u64, read_u8, u64_to_usize,
};
use std::collections::BTreeMap;

pub const IMAGE_MAGIC: u32 = u32::from_le_bytes(*b"CFSI");
pub const IMAGE_VERSION: u16 = 1;

const HEADER_LEN: usize = 16;
const ALLOC_HEADER_LEN: usize = 8 + 8 + 4;
const ENTRY_COUNT_LEN: usize = 4;
const CRC_LEN: usize = 4;

/// Fixed bytes of an entry record before its kind-specific tail.
pub const ENTRY_FIXED_LEN: usize = 8 + 8 + 1 + 2 + 24;
/// Bytes per encoded extent.
pub const EXTENT_LEN: usize = 12;
const FILE_TAIL_LEN: usize = 8 + 4;
const SYMLINK_TAIL_LEN: usize = 4;

const KIND_DIR: u8 = 1;
const KIND_FILE: u8 = 2;
const KIND_SYMLINK: u8 = 3;

/// Encoded length of an image with an empty namespace, excluding bitmap
/// and entries.
#[must_use]
pub fn base_len() -> usize {
    HEADER_LEN + ALLOC_HEADER_LEN + ENTRY_COUNT_LEN + CRC_LEN
}

#[must_use]
pub fn entry_len(entry: &Entry) -> usize {
    ENTRY_FIXED_LEN
        + entry.name().len()
        + match entry.content() {
            Content::Directory { .. } => 0,
            Content::File { extents, .. } => FILE_TAIL_LEN + extents.len() * EXTENT_LEN,
            Content::Symlink { target } => SYMLINK_TAIL_LEN + target.len(),
        }
}

/// Encoded length of an entry about to be created.
#[must_use]
pub fn new_entry_len(name: &str, new: &NewEntry) -> usize {
    ENTRY_FIXED_LEN
        + name.len()
        + match new {
            NewEntry::Directory => 0,
            NewEntry::File => FILE_TAIL_LEN,
            NewEntry::Symlink(target) => SYMLINK_TAIL_LEN + target.len(),
        }
}

/// Exact encoded length of the image for this state.
#[must_use]
pub fn encoded_len(store: &BlockStore, ns: &Namespace) -> usize {
    base_len() + store.bitmap().len() + ns.iter().map(entry_len).sum::<usize>()
}

fn field_u32(value: usize, field: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| CfsError::Format(format!("{field} does not fit u32")))
}

fn kind_tag(content: &Content) -> u8 {
    match content {
        Content::Directory { .. } => KIND_DIR,
        Content::File { .. } => KIND_FILE,
        Content::Symlink { .. } => KIND_SYMLINK,
    }
}

/// Serialize the allocation map and namespace.
pub fn encode(generation: Generation, store: &BlockStore, ns: &Namespace) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(encoded_len(store, ns));
    buf.extend_from_slice(&IMAGE_MAGIC.to_le_bytes());
    buf.extend_from_slice(&IMAGE_VERSION.to_le_bytes());
    buf.extend_from_slice(&0_u16.to_le_bytes());
    buf.extend_from_slice(&generation.0.to_le_bytes());

    buf.extend_from_slice(&store.high_water().to_le_bytes());
    buf.extend_from_slice(&store.total_blocks().to_le_bytes());
    let bitmap = store.bitmap();
    buf.extend_from_slice(&field_u32(bitmap.len(), "bitmap_len")?.to_le_bytes());
    buf.extend_from_slice(bitmap);

    buf.extend_from_slice(&field_u32(ns.len(), "entry_count")?.to_le_bytes());
    for entry in ns.iter() {
        buf.extend_from_slice(&entry.id().0.to_le_bytes());
        buf.extend_from_slice(&entry.parent().0.to_le_bytes());
        buf.push(kind_tag(entry.content()));
        let name_len = u16::try_from(entry.name().len())
            .map_err(|_| CfsError::Format("name_len does not fit u16".to_owned()))?;
        buf.extend_from_slice(&name_len.to_le_bytes());
        buf.extend_from_slice(entry.name().as_bytes());
        let times = entry.times();
        for t in [times.atime, times.mtime, times.ctime] {
            buf.extend_from_slice(&t.0.to_le_bytes());
        }
        match entry.content() {
            Content::Directory { .. } => {}
            Content::File { size, extents } => {
                buf.extend_from_slice(&size.to_le_bytes());
                buf.extend_from_slice(&field_u32(extents.len(), "extent_count")?.to_le_bytes());
                for extent in extents {
                    let count = u32::try_from(extent.count)
                        .map_err(|_| CfsError::Format("extent count does not fit u32".to_owned()))?;
                    buf.extend_from_slice(&extent.start.0.to_le_bytes());
                    buf.extend_from_slice(&count.to_le_bytes());
                }
            }
            Content::Symlink { target } => {
                buf.extend_from_slice(&field_u32(target.len(), "target_len")?.to_le_bytes());
                buf.extend_from_slice(target.as_bytes());
            }
        }
    }

    let crc = crc32c::crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Parsed image contents, not yet validated against each other.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub generation: Generation,
    pub high_water: u64,
    pub data_blocks: u64,
    pub bitmap: Vec<u8>,
    pub entries: Vec<Entry>,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn advance(&mut self, len: usize) -> std::result::Result<usize, ParseError> {
        let at = self.pos;
        self.pos = at.checked_add(len).ok_or(ParseError::InvalidField {
            field: "image",
            reason: "offset overflow",
        })?;
        Ok(at)
    }

    fn u8(&mut self) -> std::result::Result<u8, ParseError> {
        let at = self.advance(1)?;
        read_u8(self.data, at)
    }

    fn u16(&mut self) -> std::result::Result<u16, ParseError> {
        let at = self.advance(2)?;
        read_le_u16(self.data, at)
    }

    fn u32(&mut self) -> std::result::Result<u32, ParseError> {
        let at = self.advance(4)?;
        read_le_u32(self.data, at)
    }

    fn u64(&mut self) -> std::result::Result<u64, ParseError> {
        let at = self.advance(8)?;
        read_le_u64(self.data, at)
    }

    fn i64(&mut self) -> std::result::Result<i64, ParseError> {
        let at = self.advance(8)?;
        read_le_i64(self.data, at)
    }

    fn bytes(&mut self, len: usize) -> std::result::Result<&'a [u8], ParseError> {
        let at = self.advance(len)?;
        ensure_slice(self.data, at, len)
    }

    fn string(&mut self, len: usize, field: &'static str) -> std::result::Result<String, ParseError> {
        let raw = self.bytes(len)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| ParseError::InvalidField {
                field,
                reason: "not valid UTF-8",
            })
    }
}

/// Parse an image read from the slot starting at `meta_block`.
///
/// Every failure is `Corruption` at `meta_block`.
pub fn decode(bytes: &[u8], meta_block: u64) -> Result<DecodedImage> {
    decode_inner(bytes).map_err(|e| CfsError::corruption(meta_block, format!("metadata image: {e}")))
}

fn decode_inner(bytes: &[u8]) -> std::result::Result<DecodedImage, ParseError> {
    let Some(body_len) = bytes.len().checked_sub(CRC_LEN) else {
        return Err(ParseError::InsufficientData {
            needed: CRC_LEN,
            offset: 0,
            actual: bytes.len(),
        });
    };
    let stored_crc = read_le_u32(bytes, body_len)?;
    let body = &bytes[..body_len];
    if crc32c::crc32c(body) != stored_crc {
        return Err(ParseError::InvalidField {
            field: "crc",
            reason: "image checksum mismatch",
        });
    }

    let mut r = Reader { data: body, pos: 0 };
    let magic = r.u32()?;
    if magic != IMAGE_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(IMAGE_MAGIC),
            actual: u64::from(magic),
        });
    }
    if r.u16()? != IMAGE_VERSION {
        return Err(ParseError::InvalidField {
            field: "version",
            reason: "unsupported image version",
        });
    }
    let _reserved = r.u16()?;
    let generation = Generation(r.u64()?);

    let high_water = r.u64()?;
    let data_blocks = r.u64()?;
    let bitmap_len = r.u32()?;
    let bitmap = r.bytes(u64_to_usize(u64::from(bitmap_len), "bitmap_len")?)?.to_vec();

    let entry_count = u64_to_usize(u64::from(r.u32()?), "entry_count")?;
    // Bound the allocation by what the body could possibly hold.
    let mut entries = Vec::with_capacity(entry_count.min(body_len / ENTRY_FIXED_LEN));
    for _ in 0..entry_count {
        entries.push(decode_entry(&mut r)?);
    }
    if r.pos != body_len {
        return Err(ParseError::InvalidField {
            field: "entries",
            reason: "trailing bytes after last entry",
        });
    }

    Ok(DecodedImage {
        generation,
        high_water,
        data_blocks,
        bitmap,
        entries,
    })
}

fn decode_entry(r: &mut Reader<'_>) -> std::result::Result<Entry, ParseError> {
    let id = EntryId(r.u64()?);
    let parent = EntryId(r.u64()?);
    let kind = r.u8()?;
    let name_len = usize::from(r.u16()?);
    let name = r.string(name_len, "name")?;
    let times = Times {
        atime: Timestamp(r.i64()?),
        mtime: Timestamp(r.i64()?),
        ctime: Timestamp(r.i64()?),
    };
    let content = match kind {
        KIND_DIR => Content::Directory {
            children: BTreeMap::new(),
        },
        KIND_FILE => {
            let size = r.u64()?;
            let count = u64_to_usize(u64::from(r.u32()?), "extent_count")?;
            let mut extents = Vec::with_capacity(count.min(r.data.len() / EXTENT_LEN));
            for _ in 0..count {
                let start = BlockNumber(r.u64()?);
                let len = u64::from(r.u32()?);
                let range = BlockRange::new(start, len);
                if range.is_empty() {
                    return Err(ParseError::InvalidField {
                        field: "extent",
                        reason: "empty extent",
                    });
                }
                if range.end().is_none() {
                    return Err(ParseError::InvalidField {
                        field: "extent",
                        reason: "extent end overflows u64",
                    });
                }
                extents.push(range);
            }
            Content::File { size, extents }
        }
        KIND_SYMLINK => {
            let len = u64_to_usize(u64::from(r.u32()?), "target_len")?;
            Content::Symlink {
                target: r.string(len, "target")?,
            }
        }
        _ => {
            return Err(ParseError::InvalidField {
                field: "kind",
                reason: "unknown entry kind",
            });
        }
    };
    Ok(Entry::new(id, parent, name, times, content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_types::BlockSize;

    fn populated() -> (BlockStore, Namespace) {
        let mut store = BlockStore::new(BlockSize::DEFAULT, BlockNumber(7), 90).unwrap();
        let mut ns = Namespace::new(Timestamp(946_702_800));
        let dir = ns
            .create(EntryId::ROOT, "docs", NewEntry::Directory, Timestamp(1))
            .unwrap();
        let file = ns.create(dir, "a.txt", NewEntry::File, Timestamp(2)).unwrap();
        let extents = store.allocate_blocks(3).unwrap();
        ns.set_file_content(file, 2500, extents).unwrap();
        ns.create(dir, "link", NewEntry::Symlink("../docs/a.txt".into()), Timestamp(-5))
            .unwrap();
        (store, ns)
    }

    #[test]
    fn encoded_len_is_exact() {
        let (store, ns) = populated();
        let image = encode(Generation(3), &store, &ns).unwrap();
        assert_eq!(image.len(), encoded_len(&store, &ns));
    }

    #[test]
    fn decode_restores_entries_and_allocation() {
        let (store, ns) = populated();
        let image = encode(Generation(3), &store, &ns).unwrap();
        let decoded = decode(&image, 1).unwrap();

        assert_eq!(decoded.generation, Generation(3));
        assert_eq!(decoded.high_water, store.high_water());
        assert_eq!(decoded.data_blocks, 90);
        assert_eq!(decoded.bitmap, store.bitmap());
        assert_eq!(decoded.entries.len(), ns.len());

        let rebuilt = Namespace::from_entries(decoded.entries, 1024, 1).unwrap();
        for entry in ns.iter() {
            assert_eq!(rebuilt.get(entry.id()).unwrap(), entry);
        }
        let link = rebuilt.lookup_nofollow("/docs/link").unwrap();
        assert_eq!(rebuilt.get(link).unwrap().times().atime, Timestamp(-5));
    }

    #[test]
    fn new_entry_len_matches_created_entry() {
        let mut ns = Namespace::new(Timestamp(0));
        for (name, new) in [
            ("d", NewEntry::Directory),
            ("f", NewEntry::File),
            ("s", NewEntry::Symlink("/somewhere/else".into())),
        ] {
            let expected = new_entry_len(name, &new);
            let id = ns.create(EntryId::ROOT, name, new, Timestamp(0)).unwrap();
            assert_eq!(entry_len(ns.get(id).unwrap()), expected);
        }
    }

    fn with_extents(extents: Vec<BlockRange>) -> Vec<u8> {
        let (store, mut ns) = populated();
        let file = ns.lookup_nofollow("/docs/a.txt").unwrap();
        ns.set_file_content(file, 4096, extents).unwrap();
        encode(Generation(2), &store, &ns).unwrap()
    }

    #[test]
    fn overflowing_extent_is_corruption() {
        let image = with_extents(vec![BlockRange::new(BlockNumber(u64::MAX), 2)]);
        let err = decode(&image, 1).unwrap_err();
        assert!(matches!(err, CfsError::Corruption { block: 1, .. }), "{err}");
        assert!(err.to_string().contains("overflows"), "{err}");
    }

    #[test]
    fn empty_extent_is_corruption() {
        let image = with_extents(vec![BlockRange::new(BlockNumber(7), 0)]);
        assert!(matches!(decode(&image, 1), Err(CfsError::Corruption { .. })));
    }

    #[test]
    fn any_flipped_byte_is_corruption() {
        let (store, ns) = populated();
        let image = encode(Generation(1), &store, &ns).unwrap();
        for idx in [0, 5, 17, image.len() / 2, image.len() - 1] {
            let mut damaged = image.clone();
            damaged[idx] ^= 0x40;
            assert!(
                matches!(decode(&damaged, 4), Err(CfsError::Corruption { block: 4, .. })),
                "flip at {idx} not detected"
            );
        }
        assert!(matches!(decode(&image[..3], 4), Err(CfsError::Corruption { .. })));
        assert!(matches!(
            decode(&image[..image.len() - 10], 4),
            Err(CfsError::Corruption { .. })
        ));
    }
}
