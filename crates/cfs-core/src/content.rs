//! File content manager.
//!
//! Maps a file's logical byte range onto its block list. Invariant kept by
//! every operation: bytes past `size` inside the last allocated block are
//! zero, so growing a file never exposes stale data.

use cfs_alloc::BlockStore;
use cfs_block::BlockDevice;
use cfs_error::{CfsError, Result};
use cfs_tree::Namespace;
use cfs_types::{BlockNumber, BlockRange, EntryId, Timestamp};
use tracing::{trace, warn};

/// Physical blocks of `extents` starting at logical block `first`.
fn blocks_from(extents: &[BlockRange], first: u64) -> impl Iterator<Item = BlockNumber> + '_ {
    let mut skip = first;
    extents
        .iter()
        .filter_map(move |range| {
            if skip >= range.count {
                skip -= range.count;
                return None;
            }
            let tail = BlockRange::new(BlockNumber(range.start.0 + skip), range.count - skip);
            skip = 0;
            Some(tail)
        })
        .flat_map(BlockRange::blocks)
}

fn total_blocks(extents: &[BlockRange]) -> u64 {
    extents.iter().map(|r| r.count).sum()
}

/// Append `range`, merging with the last extent when contiguous.
fn push_extent(extents: &mut Vec<BlockRange>, range: BlockRange) {
    if let Some(last) = extents.last_mut() {
        if last.end() == Some(range.start) {
            last.count += range.count;
            return;
        }
    }
    extents.push(range);
}

/// Keep the first `keep` blocks; return the kept list and the rest.
fn split_extents(extents: &[BlockRange], keep: u64) -> (Vec<BlockRange>, Vec<BlockRange>) {
    let mut kept = Vec::new();
    let mut freed = Vec::new();
    let mut remaining = keep;
    for range in extents {
        if remaining >= range.count {
            remaining -= range.count;
            kept.push(*range);
        } else if remaining == 0 {
            freed.push(*range);
        } else {
            kept.push(BlockRange::new(range.start, remaining));
            freed.push(BlockRange::new(
                BlockNumber(range.start.0 + remaining),
                range.count - remaining,
            ));
            remaining = 0;
        }
    }
    (kept, freed)
}

fn byte_of(store: &BlockStore, logical: u64) -> Result<u64> {
    logical
        .checked_mul(store.block_size().as_u64())
        .ok_or_else(|| CfsError::InvalidArgument("file offset overflows u64".to_owned()))
}

fn block_len(store: &BlockStore) -> Result<usize> {
    usize::try_from(store.block_size().get())
        .map_err(|_| CfsError::Format("block size does not fit usize".to_owned()))
}

/// Read up to `len` bytes at `offset`. Empty at or past EOF.
pub fn read(
    dev: &dyn BlockDevice,
    store: &BlockStore,
    ns: &Namespace,
    id: EntryId,
    offset: u64,
    len: u64,
) -> Result<Vec<u8>> {
    let (size, extents) = ns.file_content(id)?;
    if offset >= size || len == 0 {
        return Ok(Vec::new());
    }
    let end = size.min(offset.saturating_add(len));
    let bs = store.block_size().as_u64();
    let first = offset / bs;
    let want = usize::try_from(end - offset)
        .map_err(|_| CfsError::InvalidArgument("read length does not fit usize".to_owned()))?;

    let mut out = Vec::with_capacity(want);
    for (logical, physical) in (first..).zip(blocks_from(extents, first)) {
        let block_start = byte_of(store, logical)?;
        if block_start >= end {
            break;
        }
        let buf = dev.read_block(physical)?;
        let from = usize::try_from(offset.saturating_sub(block_start)).unwrap_or(0);
        let to = usize::try_from((end - block_start).min(bs)).unwrap_or(0);
        out.extend_from_slice(&buf.as_slice()[from..to]);
    }
    if out.len() != want {
        return Err(CfsError::corruption(
            0,
            format!("entry {id}: block list shorter than size {size}"),
        ));
    }
    trace!(id = id.0, offset, len = out.len(), "content read");
    Ok(out)
}

/// Write `data` at `offset`, growing the file as needed.
///
/// Missing blocks are allocated before any byte is written, so `NoSpace`
/// leaves the file untouched. The resulting block list may hold at most
/// `max_extents` ranges. Returns the number of bytes written.
#[allow(clippy::too_many_arguments)]
pub fn write(
    dev: &dyn BlockDevice,
    store: &mut BlockStore,
    ns: &mut Namespace,
    id: EntryId,
    offset: u64,
    data: &[u8],
    max_extents: usize,
    now: Timestamp,
) -> Result<usize> {
    let (size, old_extents) = ns.file_content(id)?;
    if data.is_empty() {
        return Ok(0);
    }
    let data_len = u64::try_from(data.len())
        .map_err(|_| CfsError::InvalidArgument("write length does not fit u64".to_owned()))?;
    let end = offset
        .checked_add(data_len)
        .ok_or_else(|| CfsError::InvalidArgument("write range overflows u64".to_owned()))?;

    let bs = store.block_size();
    let have = total_blocks(old_extents);
    let need = bs.blocks_for(end.max(size));
    let mut extents = old_extents.to_vec();
    let fresh = if need > have {
        store.allocate_blocks(need - have)?
    } else {
        Vec::new()
    };
    for range in &fresh {
        push_extent(&mut extents, *range);
    }
    if extents.len() > max_extents {
        release(store, &fresh);
        return Err(CfsError::NoSpace);
    }

    if let Err(err) = write_blocks(dev, store, &extents, have, offset, data) {
        release(store, &fresh);
        return Err(err);
    }

    ns.set_file_content(id, end.max(size), extents)?;
    ns.touch(id, now)?;
    trace!(id = id.0, offset, len = data.len(), new_blocks = need.saturating_sub(have), "content written");
    Ok(data.len())
}

fn release(store: &mut BlockStore, ranges: &[BlockRange]) {
    if let Err(err) = store.free(ranges) {
        warn!(error = %err, "failed to release blocks after aborted write");
    }
}

/// Write `data` at `offset` into `extents`. Blocks at or past logical
/// index `have` are new and get zero-filled where `data` does not cover
/// them, including the gap between the old end and `offset`.
fn write_blocks(
    dev: &dyn BlockDevice,
    store: &BlockStore,
    extents: &[BlockRange],
    have: u64,
    offset: u64,
    data: &[u8],
) -> Result<()> {
    let bs = store.block_size().as_u64();
    let block_len = block_len(store)?;
    let end = offset + data.len() as u64;
    let first = (offset / bs).min(have);
    let last = store.block_size().blocks_for(end);

    for (logical, physical) in (first..last).zip(blocks_from(extents, first)) {
        let block_start = byte_of(store, logical)?;
        let block_end = block_start + bs;
        let lo = offset.max(block_start);
        let hi = end.min(block_end);

        let mut buf = if logical < have && (lo > block_start || hi < block_end) {
            dev.read_block(physical)?.into_inner()
        } else {
            vec![0_u8; block_len]
        };
        if lo < hi {
            let dst = usize::try_from(lo - block_start).unwrap_or(0);
            let src = usize::try_from(lo - offset).unwrap_or(0);
            let n = usize::try_from(hi - lo).unwrap_or(0);
            buf[dst..dst + n].copy_from_slice(&data[src..src + n]);
        }
        dev.write_block(physical, &buf)?;
    }
    Ok(())
}

/// Resize a file. Shrinking frees exactly the blocks no longer needed and
/// zeroes the tail of the last kept block; growing allocates zeroed blocks.
#[allow(clippy::too_many_arguments)]
pub fn truncate(
    dev: &dyn BlockDevice,
    store: &mut BlockStore,
    ns: &mut Namespace,
    id: EntryId,
    new_size: u64,
    max_extents: usize,
    now: Timestamp,
) -> Result<()> {
    let (size, old_extents) = ns.file_content(id)?;
    let bs = store.block_size();
    let have = total_blocks(old_extents);
    let need = bs.blocks_for(new_size);

    if new_size < size {
        let (kept, freed) = split_extents(old_extents, need);
        let tail = new_size % bs.as_u64();
        if tail != 0 {
            if let Some(last) = blocks_from(&kept, need - 1).next() {
                let mut buf = dev.read_block(last)?;
                let from = usize::try_from(tail).unwrap_or(0);
                buf.as_mut_slice()[from..].fill(0);
                dev.write_block(last, buf.as_slice())?;
            }
        }
        store.free(&freed)?;
        ns.set_file_content(id, new_size, kept)?;
    } else if need > have {
        let fresh = store.allocate_blocks(need - have)?;
        let mut extents = old_extents.to_vec();
        for range in &fresh {
            push_extent(&mut extents, *range);
        }
        if extents.len() > max_extents {
            release(store, &fresh);
            return Err(CfsError::NoSpace);
        }
        let zeros = vec![0_u8; block_len(store)?];
        for physical in fresh.iter().flat_map(|r| r.blocks()) {
            if let Err(err) = dev.write_block(physical, &zeros) {
                release(store, &fresh);
                return Err(err);
            }
        }
        ns.set_file_content(id, new_size, extents)?;
    } else {
        let extents = old_extents.to_vec();
        ns.set_file_content(id, new_size, extents)?;
    }

    ns.touch(id, now)?;
    trace!(id = id.0, from = size, to = new_size, "content truncated");
    Ok(())
}

/// Replace the whole content: `truncate(0)` then `write(offset, data)`.
#[allow(clippy::too_many_arguments)]
pub fn replace(
    dev: &dyn BlockDevice,
    store: &mut BlockStore,
    ns: &mut Namespace,
    id: EntryId,
    offset: u64,
    data: &[u8],
    max_extents: usize,
    now: Timestamp,
) -> Result<usize> {
    truncate(dev, store, ns, id, 0, max_extents, now)?;
    write(dev, store, ns, id, offset, data, max_extents, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_block::{ByteBlockDevice, MemByteDevice};
    use cfs_tree::NewEntry;
    use cfs_types::BlockSize;

    const BLOCK_SIZE: usize = 1024;
    const DATA_BLOCKS: u64 = 16;
    const NO_LIMIT: usize = usize::MAX;
    const T: Timestamp = Timestamp(100);

    struct Fixture {
        dev: ByteBlockDevice<MemByteDevice>,
        store: BlockStore,
        ns: Namespace,
        file: EntryId,
    }

    fn fixture() -> Fixture {
        let mem = MemByteDevice::new(BLOCK_SIZE * (1 + DATA_BLOCKS as usize));
        // Stale bytes everywhere so missing zero-fill shows up.
        mem.with_bytes_mut(|b| b.fill(0xEE));
        let dev = ByteBlockDevice::new(mem, BlockSize::DEFAULT).unwrap();
        let store = BlockStore::new(BlockSize::DEFAULT, BlockNumber(1), DATA_BLOCKS).unwrap();
        let mut ns = Namespace::new(Timestamp(0));
        let file = ns.create(EntryId::ROOT, "f", NewEntry::File, Timestamp(0)).unwrap();
        Fixture {
            dev,
            store,
            ns,
            file,
        }
    }

    impl Fixture {
        fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
            write(&self.dev, &mut self.store, &mut self.ns, self.file, offset, data, NO_LIMIT, T)
        }

        fn read_all(&self) -> Vec<u8> {
            read(&self.dev, &self.store, &self.ns, self.file, 0, u64::MAX).unwrap()
        }

        fn truncate(&mut self, size: u64) -> Result<()> {
            truncate(&self.dev, &mut self.store, &mut self.ns, self.file, size, NO_LIMIT, T)
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn write_then_read_spans_blocks() {
        let mut fx = fixture();
        let data = pattern(3000, 1);
        assert_eq!(fx.write(0, &data).unwrap(), 3000);
        assert_eq!(fx.read_all(), data);
        assert_eq!(fx.store.used_blocks(), 3);
        assert_eq!(
            read(&fx.dev, &fx.store, &fx.ns, fx.file, 1000, 100).unwrap(),
            data[1000..1100].to_vec()
        );
        assert_eq!(fx.ns.get(fx.file).unwrap().times().mtime, T);
    }

    #[test]
    fn read_past_eof_is_empty() {
        let mut fx = fixture();
        fx.write(0, b"hello").unwrap();
        assert!(read(&fx.dev, &fx.store, &fx.ns, fx.file, 5, 10).unwrap().is_empty());
        assert!(read(&fx.dev, &fx.store, &fx.ns, fx.file, 500, 10).unwrap().is_empty());
        assert_eq!(read(&fx.dev, &fx.store, &fx.ns, fx.file, 3, 10).unwrap(), b"lo");
    }

    #[test]
    fn gap_reads_back_as_zeros() {
        let mut fx = fixture();
        fx.write(0, b"abc").unwrap();
        fx.write(2500, b"xyz").unwrap();
        let all = fx.read_all();
        assert_eq!(all.len(), 2503);
        assert_eq!(&all[..3], b"abc");
        assert!(all[3..2500].iter().all(|&b| b == 0));
        assert_eq!(&all[2500..], b"xyz");
    }

    #[test]
    fn overwrite_in_place_keeps_size_and_blocks() {
        let mut fx = fixture();
        fx.write(0, &pattern(2048, 3)).unwrap();
        fx.write(1020, b"MIDDLE").unwrap();
        let all = fx.read_all();
        assert_eq!(all.len(), 2048);
        assert_eq!(&all[1020..1026], b"MIDDLE");
        assert_eq!(all[..1020], pattern(2048, 3)[..1020]);
        assert_eq!(fx.store.used_blocks(), 2);
    }

    #[test]
    fn non_contiguous_block_lists() {
        let mut fx = fixture();
        let other = fx.ns.create(EntryId::ROOT, "g", NewEntry::File, T).unwrap();
        let mut expected = Vec::new();
        for round in 0..4_u8 {
            let chunk = pattern(BLOCK_SIZE, round);
            fx.write(expected.len() as u64, &chunk).unwrap();
            expected.extend_from_slice(&chunk);
            write(&fx.dev, &mut fx.store, &mut fx.ns, other, u64::from(round) * 1024, &[round; 1024], NO_LIMIT, T)
                .unwrap();
        }
        assert_eq!(fx.ns.get(fx.file).unwrap().extents().len(), 4);
        assert_eq!(fx.read_all(), expected);
    }

    #[test]
    fn no_space_leaves_file_intact() {
        let mut fx = fixture();
        fx.write(0, b"keep me").unwrap();
        let before = fx.store.used_blocks();
        let too_big = vec![1_u8; BLOCK_SIZE * DATA_BLOCKS as usize];
        assert!(matches!(fx.write(7, &too_big), Err(CfsError::NoSpace)));
        assert_eq!(fx.store.used_blocks(), before);
        assert_eq!(fx.read_all(), b"keep me");
    }

    #[test]
    fn extent_limit_rolls_back_allocation() {
        let mut fx = fixture();
        let other = fx.ns.create(EntryId::ROOT, "g", NewEntry::File, T).unwrap();
        fx.write(0, &[1; 1024]).unwrap();
        write(&fx.dev, &mut fx.store, &mut fx.ns, other, 0, &[2; 1024], NO_LIMIT, T).unwrap();
        let used = fx.store.used_blocks();
        let err = write(&fx.dev, &mut fx.store, &mut fx.ns, fx.file, 1024, &[3; 10], 1, T);
        assert!(matches!(err, Err(CfsError::NoSpace)));
        assert_eq!(fx.store.used_blocks(), used);
        assert_eq!(fx.read_all(), vec![1; 1024]);
    }

    #[test]
    fn truncate_shrink_frees_and_zeroes_tail() {
        let mut fx = fixture();
        fx.write(0, &pattern(4000, 9)).unwrap();
        assert_eq!(fx.store.used_blocks(), 4);

        fx.truncate(1500).unwrap();
        assert_eq!(fx.store.used_blocks(), 2);
        assert_eq!(fx.read_all(), pattern(4000, 9)[..1500].to_vec());

        fx.truncate(3000).unwrap();
        let all = fx.read_all();
        assert_eq!(all.len(), 3000);
        assert!(all[1500..].iter().all(|&b| b == 0));
        assert_eq!(fx.store.used_blocks(), 3);

        fx.truncate(0).unwrap();
        assert_eq!(fx.store.used_blocks(), 0);
        assert!(fx.read_all().is_empty());
    }

    #[test]
    fn replace_reuses_freed_blocks() {
        let mut fx = fixture();
        let big = pattern(BLOCK_SIZE * 12, 4);
        fx.write(0, &big).unwrap();
        let replaced = pattern(BLOCK_SIZE * 12, 5);
        replace(&fx.dev, &mut fx.store, &mut fx.ns, fx.file, 0, &replaced, NO_LIMIT, T).unwrap();
        assert_eq!(fx.read_all(), replaced);
        assert_eq!(fx.store.used_blocks(), 12);
    }

    #[test]
    fn directories_have_no_content() {
        let mut fx = fixture();
        let dir = fx.ns.create(EntryId::ROOT, "d", NewEntry::Directory, T).unwrap();
        assert!(matches!(
            write(&fx.dev, &mut fx.store, &mut fx.ns, dir, 0, b"x", NO_LIMIT, T),
            Err(CfsError::IsDirectory)
        ));
        assert!(matches!(
            read(&fx.dev, &fx.store, &fx.ns, dir, 0, 1),
            Err(CfsError::IsDirectory)
        ));
    }

    #[test]
    fn split_extents_at_boundaries() {
        let extents = [
            BlockRange::new(BlockNumber(10), 3),
            BlockRange::new(BlockNumber(20), 2),
        ];
        let (kept, freed) = split_extents(&extents, 4);
        assert_eq!(
            kept,
            vec![BlockRange::new(BlockNumber(10), 3), BlockRange::new(BlockNumber(20), 1)]
        );
        assert_eq!(freed, vec![BlockRange::new(BlockNumber(21), 1)]);
        let (kept, freed) = split_extents(&extents, 0);
        assert!(kept.is_empty());
        assert_eq!(freed.len(), 2);
        let mapped: Vec<_> = blocks_from(&extents, 2).collect();
        assert_eq!(mapped, vec![BlockNumber(12), BlockNumber(20), BlockNumber(21)]);
    }
}
