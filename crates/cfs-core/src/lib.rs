#![forbid(unsafe_code)]
//! CanFS container engine.
//!
//! A [`Container`] owns one backing device and everything mounted from it:
//! the geometry read from the superblock, the [`BlockStore`] over the data
//! area and the [`Namespace`] tree. All of it sits behind one
//! `parking_lot::RwLock`; structural mutations take the write lock and
//! reads share the read lock.
//!
//! Two access styles are offered over the same state:
//!
//! - path-level methods on [`Container`] (`mkdir`, `write_file`, `rename`,
//!   ...) used by the CLI and tests;
//! - the inode-level [`FsOps`] trait consumed by the FUSE adapter.
//!
//! Nothing reaches the device's metadata slots until [`Container::flush`]
//! (or [`Container::unmount`]). A flush writes the image to the inactive
//! slot and then commits by rewriting the superblock, so a crash between
//! the two leaves the previous image in force.

pub mod check;
pub mod content;
pub mod image;
pub mod layout;

use cfs_alloc::BlockStore;
use cfs_block::{BlockDevice, ByteBlockDevice};
use cfs_tree::{Content, Entry, Namespace, NewEntry};
use cfs_types::BlockNumber;
use layout::{SUPERBLOCK_SIZE, Superblock};
use parking_lot::{RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::Path;
use std::time::SystemTime;
use tracing::{debug, info, trace, warn};

pub use cfs_block::{ByteDevice, FileByteDevice, MemByteDevice};
pub use cfs_error::{CfsError, Result};
pub use cfs_tree::{EntryKind, MAX_SYMLINK_HOPS, Times};
pub use cfs_types::{BlockSize, EntryId, Generation, NAME_MAX, Timestamp};
pub use check::CheckReport;
pub use layout::{FormatOptions, Geometry, Slot};

// ── VFS-facing types ────────────────────────────────────────────────────────

/// File type as reported to the VFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
}

impl From<EntryKind> for FileType {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::Directory => Self::Directory,
            EntryKind::File => Self::RegularFile,
            EntryKind::Symlink => Self::Symlink,
        }
    }
}

/// Entry attributes returned by [`FsOps::getattr`] and [`FsOps::lookup`].
///
/// Ownership is not stored in the container; `uid` and `gid` are 0 and the
/// adapter substitutes its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    pub ino: EntryId,
    /// Size in bytes.
    pub size: u64,
    /// Number of 512-byte blocks allocated.
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Creation time; the container keeps none, so this mirrors `ctime`.
    pub crtime: SystemTime,
    pub kind: FileType,
    /// POSIX permission bits (lower 12 bits of mode).
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    /// Preferred I/O block size.
    pub blksize: u32,
}

/// Directory entry returned by [`FsOps::readdir`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub ino: EntryId,
    /// Opaque offset cookie for readdir continuation.
    pub offset: u64,
    pub kind: FileType,
    /// Entry name (filename component, not a full path).
    pub name: Vec<u8>,
}

impl DirEntry {
    /// Return the name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// How a file handle was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpenMode {
    /// Read-only; nothing happens at open.
    Read,
    /// Write without append: the content is freed at open.
    Truncate,
    /// Every write lands at the current end of file.
    Append,
}

/// Mode for path-level [`Container::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteMode {
    /// Free all content first, then write at the offset.
    Truncate,
    /// Write at the current end of file; the offset is ignored.
    Append,
    /// Overwrite or extend at the offset.
    InPlace,
}

/// Attribute changes accepted by [`FsOps::setattr`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttrRequest {
    pub size: Option<u64>,
    pub atime: Option<Timestamp>,
    pub mtime: Option<Timestamp>,
}

/// Filesystem statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFs {
    pub block_size: u32,
    /// Data blocks in the container.
    pub blocks: u64,
    pub free_blocks: u64,
    /// Live entries, including the root.
    pub entries: u64,
    pub name_max: u32,
}

/// Geometry and usage summary of a mounted container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub geometry: Geometry,
    pub active_slot: Slot,
    pub generation: Generation,
    pub metadata_len: u64,
    pub metadata_capacity: u64,
    pub used_blocks: u64,
    pub free_blocks: u64,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub entries: u64,
}

/// One line of [`Container::tree`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    pub ino: EntryId,
    pub kind: FileType,
    pub size: u64,
}

// ── FsOps trait ─────────────────────────────────────────────────────────────

/// Inode-level filesystem operations.
///
/// This is the boundary the FUSE adapter calls through. Inode numbers are
/// [`EntryId`]s; the root is [`EntryId::ROOT`] (1), matching FUSE's root
/// inode.
pub trait FsOps: Send + Sync {
    /// Get attributes by inode number.
    fn getattr(&self, ino: EntryId) -> Result<InodeAttr>;

    /// Look up `name` inside directory `parent`.
    ///
    /// Returns `NotFound` if the name does not exist, or `NotDirectory` if
    /// `parent` is not a directory.
    fn lookup(&self, parent: EntryId, name: &OsStr) -> Result<InodeAttr>;

    /// List directory entries starting from `offset`.
    ///
    /// `.` and `..` come first. The `offset` is an opaque cookie from a
    /// previous call's `DirEntry::offset` (0 for the first call). An empty
    /// result marks the end of the directory.
    fn readdir(&self, ino: EntryId, offset: u64) -> Result<Vec<DirEntry>>;

    /// Read up to `size` bytes at `offset`. Empty at or past EOF.
    fn read(&self, ino: EntryId, offset: u64, size: u32) -> Result<Vec<u8>>;

    /// Target of a symbolic link.
    fn readlink(&self, ino: EntryId) -> Result<Vec<u8>>;

    /// Prepare `ino` for I/O in `mode`. `Truncate` frees the content.
    fn open(&self, ino: EntryId, mode: OpenMode) -> Result<()>;

    /// Write `data` at `offset`. Returns bytes written.
    fn write(&self, ino: EntryId, offset: u64, data: &[u8]) -> Result<u32>;

    /// Write `data` at the current end of file.
    fn append(&self, ino: EntryId, data: &[u8]) -> Result<u32>;

    /// Apply size and time changes.
    fn setattr(&self, ino: EntryId, request: &SetAttrRequest) -> Result<InodeAttr>;

    fn mkdir(&self, parent: EntryId, name: &OsStr) -> Result<InodeAttr>;

    /// Create an empty regular file.
    fn create(&self, parent: EntryId, name: &OsStr) -> Result<InodeAttr>;

    fn symlink(&self, parent: EntryId, name: &OsStr, target: &Path) -> Result<InodeAttr>;

    /// Remove a non-directory.
    fn unlink(&self, parent: EntryId, name: &OsStr) -> Result<()>;

    /// Remove an empty directory.
    fn rmdir(&self, parent: EntryId, name: &OsStr) -> Result<()>;

    /// Move `parent/name` to `new_parent/new_name`, replacing a compatible
    /// destination.
    fn rename(
        &self,
        parent: EntryId,
        name: &OsStr,
        new_parent: EntryId,
        new_name: &OsStr,
    ) -> Result<()>;

    fn statfs(&self) -> Result<StatFs>;

    /// Persist all pending metadata.
    fn flush(&self) -> Result<()>;
}

fn name_str(name: &OsStr) -> Result<&str> {
    name.to_str()
        .ok_or_else(|| CfsError::InvalidArgument(format!("name is not UTF-8: {name:?}")))
}

// ── Container state ─────────────────────────────────────────────────────────

type Device = ByteBlockDevice<Box<dyn ByteDevice>>;

/// Which kinds a removal accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoveKind {
    Any,
    NonDirectory,
    Directory,
}

struct State {
    dev: Device,
    geometry: Geometry,
    store: BlockStore,
    ns: Namespace,
    active: Slot,
    generation: Generation,
    /// Encoded length of the image the next flush will write.
    meta_len: u64,
    dirty: bool,
}

impl State {
    fn meta_room(&self) -> u64 {
        self.geometry
            .slot_capacity_bytes()
            .saturating_sub(self.meta_len)
    }

    fn ensure_meta_room(&self, extra: u64) -> Result<()> {
        if extra > self.meta_room() {
            debug!(
                extra,
                meta_len = self.meta_len,
                capacity = self.geometry.slot_capacity_bytes(),
                "metadata slot full"
            );
            return Err(CfsError::NoSpace);
        }
        Ok(())
    }

    /// Most extents `id` may hold without overflowing the metadata slot.
    fn extent_budget(&self, id: EntryId) -> Result<usize> {
        let current = self.ns.get(id)?.extents().len();
        let room = usize::try_from(self.meta_room() / image::EXTENT_LEN as u64).unwrap_or(usize::MAX);
        Ok(current.saturating_add(room))
    }

    fn entry_len(&self, id: EntryId) -> Result<u64> {
        Ok(image::entry_len(self.ns.get(id)?) as u64)
    }

    /// Run a content operation on `id`, keeping `meta_len` in step with the
    /// entry's encoded size.
    fn track<T>(&mut self, id: EntryId, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let before = self.entry_len(id)?;
        let out = op(self)?;
        let after = self.entry_len(id)?;
        self.meta_len = self.meta_len - before + after;
        self.dirty = true;
        Ok(out)
    }

    fn attr(&self, id: EntryId) -> Result<InodeAttr> {
        let entry = self.ns.get(id)?;
        let kind = FileType::from(entry.kind());
        let block_size = self.geometry.block_size;
        let allocated: u64 = entry.extents().iter().map(|r| r.count).sum();
        let nlink = match entry.content() {
            Content::Directory { children } => {
                let subdirs = children
                    .values()
                    .filter(|child| self.ns.get(**child).is_ok_and(Entry::is_dir))
                    .count();
                2 + u32::try_from(subdirs).unwrap_or(u32::MAX - 2)
            }
            _ => 1,
        };
        let times = entry.times();
        Ok(InodeAttr {
            ino: id,
            size: entry.size(),
            blocks: allocated * (block_size.as_u64() / 512),
            atime: times.atime.to_system_time(),
            mtime: times.mtime.to_system_time(),
            ctime: times.ctime.to_system_time(),
            crtime: times.ctime.to_system_time(),
            kind,
            perm: match kind {
                FileType::Directory => 0o755,
                FileType::RegularFile => 0o644,
                FileType::Symlink => 0o777,
            },
            nlink,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: block_size.get(),
        })
    }

    fn create(&mut self, parent: EntryId, name: &str, new: NewEntry) -> Result<EntryId> {
        let len = image::new_entry_len(name, &new) as u64;
        self.ensure_meta_room(len)?;
        let id = self.ns.create(parent, name, new, Timestamp::now())?;
        self.meta_len += len;
        self.dirty = true;
        Ok(id)
    }

    fn remove(&mut self, parent: EntryId, name: &str, accept: RemoveKind) -> Result<()> {
        let id = self.ns.lookup_child(parent, name)?;
        let is_dir = self.ns.get(id)?.is_dir();
        match accept {
            RemoveKind::NonDirectory if is_dir => return Err(CfsError::IsDirectory),
            RemoveKind::Directory if !is_dir => return Err(CfsError::NotDirectory),
            _ => {}
        }
        let removed = self.ns.remove(parent, name, Timestamp::now())?;
        self.store.free(removed.extents())?;
        self.meta_len -= image::entry_len(&removed) as u64;
        self.dirty = true;
        Ok(())
    }

    fn rename(
        &mut self,
        src_parent: EntryId,
        src_name: &str,
        dst_parent: EntryId,
        dst_name: &str,
    ) -> Result<()> {
        let grow = dst_name.len().saturating_sub(src_name.len()) as u64;
        self.ensure_meta_room(grow)?;
        let replaced =
            self.ns
                .rename(src_parent, src_name, dst_parent, dst_name, Timestamp::now())?;
        self.meta_len = self.meta_len - src_name.len() as u64 + dst_name.len() as u64;
        if let Some(old) = replaced {
            self.store.free(old.extents())?;
            self.meta_len -= image::entry_len(&old) as u64;
        }
        self.dirty = true;
        Ok(())
    }

    fn read(&self, id: EntryId, offset: u64, len: u64) -> Result<Vec<u8>> {
        content::read(&self.dev, &self.store, &self.ns, id, offset, len)
    }

    fn write(&mut self, id: EntryId, offset: u64, data: &[u8]) -> Result<usize> {
        let budget = self.extent_budget(id)?;
        self.track(id, |s| {
            content::write(
                &s.dev,
                &mut s.store,
                &mut s.ns,
                id,
                offset,
                data,
                budget,
                Timestamp::now(),
            )
        })
    }

    fn append(&mut self, id: EntryId, data: &[u8]) -> Result<usize> {
        let (size, _) = self.ns.file_content(id)?;
        self.write(id, size, data)
    }

    fn replace(&mut self, id: EntryId, offset: u64, data: &[u8]) -> Result<usize> {
        let budget = self.extent_budget(id)?;
        self.track(id, |s| {
            content::replace(
                &s.dev,
                &mut s.store,
                &mut s.ns,
                id,
                offset,
                data,
                budget,
                Timestamp::now(),
            )
        })
    }

    fn truncate(&mut self, id: EntryId, size: u64) -> Result<()> {
        let budget = self.extent_budget(id)?;
        self.track(id, |s| {
            content::truncate(
                &s.dev,
                &mut s.store,
                &mut s.ns,
                id,
                size,
                budget,
                Timestamp::now(),
            )
        })
    }

    fn set_times(&mut self, id: EntryId, times: Times) -> Result<()> {
        self.ns.set_times(id, times)?;
        self.dirty = true;
        Ok(())
    }

    fn readdir(&self, ino: EntryId, offset: u64) -> Result<Vec<DirEntry>> {
        let dir = self.ns.get(ino)?;
        let children = self.ns.children(ino)?;
        let dots = [(".", ino), ("..", dir.parent())];
        let listing = dots
            .into_iter()
            .chain(children.iter().map(|(name, id)| (name.as_str(), *id)));

        let mut out = Vec::new();
        for (idx, (name, id)) in listing.enumerate() {
            let cookie = idx as u64 + 1;
            if cookie <= offset {
                continue;
            }
            out.push(DirEntry {
                ino: id,
                offset: cookie,
                kind: FileType::from(self.ns.get(id)?.kind()),
                name: name.as_bytes().to_vec(),
            });
        }
        Ok(out)
    }

    fn statfs(&self) -> StatFs {
        StatFs {
            block_size: self.geometry.block_size.get(),
            blocks: self.store.total_blocks(),
            free_blocks: self.store.free_blocks(),
            entries: self.ns.len() as u64,
            name_max: NAME_MAX as u32,
        }
    }

    /// Write the image to the inactive slot, then commit it by rewriting
    /// the superblock.
    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let target = self.active.other();
        let generation = self.generation.next();
        let encoded = image::encode(generation, &self.store, &self.ns)?;
        let image_len = encoded.len() as u64;
        if image_len != self.meta_len {
            warn!(
                tracked = self.meta_len,
                actual = image_len,
                "metadata length drifted from tracked value"
            );
            self.meta_len = image_len;
        }
        if image_len > self.geometry.slot_capacity_bytes() {
            warn!(
                image_len,
                capacity = self.geometry.slot_capacity_bytes(),
                "metadata image does not fit its slot"
            );
            return Err(CfsError::NoSpace);
        }

        let block_len = usize::try_from(self.geometry.block_size.get())
            .map_err(|_| CfsError::Format("block size does not fit usize".to_owned()))?;
        let start = self.geometry.slot_start(target);
        for (idx, chunk) in encoded.chunks(block_len).enumerate() {
            let mut block = chunk.to_vec();
            block.resize(block_len, 0);
            self.dev
                .write_block(BlockNumber(start.0 + idx as u64), &block)?;
        }
        self.dev.sync()?;

        let superblock = Superblock {
            geometry: self.geometry,
            active_slot: target,
            generation,
            image_len,
            image_crc: crc32c::crc32c(&encoded),
        };
        let mut block0 = vec![0_u8; block_len];
        block0[..SUPERBLOCK_SIZE].copy_from_slice(&superblock.encode());
        self.dev.write_block(BlockNumber(0), &block0)?;
        self.dev.sync()?;

        self.active = target;
        self.generation = generation;
        self.dirty = false;
        info!(
            generation = generation.0,
            slot = ?target,
            image_len,
            entries = self.ns.len(),
            "metadata flushed"
        );
        Ok(())
    }
}

/// Read the superblock and the active image, and rebuild in-memory state.
fn open_state(device: Box<dyn ByteDevice>) -> Result<State> {
    let len = device.len_bytes();
    if len < SUPERBLOCK_SIZE as u64 {
        return Err(CfsError::corruption(
            0,
            format!("{len} bytes cannot hold a superblock"),
        ));
    }
    let mut raw = [0_u8; SUPERBLOCK_SIZE];
    device.read_exact_at(0, &mut raw)?;
    let superblock = Superblock::decode(&raw)
        .map_err(|e| CfsError::corruption(0, format!("superblock: {e}")))?;
    let geometry = superblock.geometry;

    let dev = ByteBlockDevice::new(device, geometry.block_size)?;
    if dev.block_count() < geometry.block_count {
        return Err(CfsError::corruption(
            0,
            format!(
                "container truncated: superblock expects {} blocks, device holds {}",
                geometry.block_count,
                dev.block_count()
            ),
        ));
    }

    let slot_block = geometry.slot_start(superblock.active_slot).0;
    let bytes = read_image(&dev, &superblock)?;
    if crc32c::crc32c(&bytes) != superblock.image_crc {
        warn!(slot = ?superblock.active_slot, "metadata image checksum mismatch");
        return Err(CfsError::corruption(
            slot_block,
            "metadata image does not match superblock checksum",
        ));
    }
    let decoded = image::decode(&bytes, slot_block)?;
    if decoded.generation != superblock.generation {
        return Err(CfsError::corruption(
            slot_block,
            format!(
                "image generation {} does not match superblock generation {}",
                decoded.generation, superblock.generation
            ),
        ));
    }
    if decoded.data_blocks != geometry.data_blocks {
        return Err(CfsError::corruption(
            slot_block,
            format!(
                "image covers {} data blocks, geometry has {}",
                decoded.data_blocks, geometry.data_blocks
            ),
        ));
    }

    let store = BlockStore::from_bitmap(
        geometry.block_size,
        geometry.data_start,
        geometry.data_blocks,
        decoded.bitmap,
        decoded.high_water,
    )?;
    let max_id = geometry.slot_capacity_bytes() / image::ENTRY_FIXED_LEN as u64 + 1;
    let ns = Namespace::from_entries(decoded.entries, max_id, slot_block)?;

    let meta_len = image::encoded_len(&store, &ns) as u64;
    Ok(State {
        dev,
        geometry,
        store,
        ns,
        active: superblock.active_slot,
        generation: superblock.generation,
        meta_len,
        dirty: false,
    })
}

fn read_image(dev: &Device, superblock: &Superblock) -> Result<Vec<u8>> {
    let geometry = &superblock.geometry;
    let start = geometry.slot_start(superblock.active_slot);
    let len = usize::try_from(superblock.image_len)
        .map_err(|_| CfsError::corruption(0, "image_len does not fit usize"))?;
    let mut bytes = Vec::with_capacity(len);
    for idx in 0..geometry.block_size.blocks_for(superblock.image_len) {
        let block = dev.read_block(BlockNumber(start.0 + idx))?;
        bytes.extend_from_slice(block.as_slice());
    }
    bytes.truncate(len);
    trace!(slot = ?superblock.active_slot, len, "metadata image read");
    Ok(bytes)
}

// ── Container ───────────────────────────────────────────────────────────────

/// A mounted container.
pub struct Container {
    state: RwLock<State>,
    read_only: bool,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("Container")
            .field("geometry", &state.geometry)
            .field("generation", &state.generation)
            .field("entries", &state.ns.len())
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl Container {
    /// Lay out a fresh, empty container on `device` and commit it.
    pub fn format<D: ByteDevice + 'static>(device: D, options: FormatOptions) -> Result<Self> {
        let boxed: Box<dyn ByteDevice> = Box::new(device);
        let dev = ByteBlockDevice::new(boxed, options.block_size)?;
        let geometry = Geometry::plan(dev.block_count(), options.block_size, options.metadata_blocks)?;
        let store = BlockStore::new(geometry.block_size, geometry.data_start, geometry.data_blocks)?;
        let ns = Namespace::new(Timestamp::now());
        let meta_len = image::encoded_len(&store, &ns) as u64;
        if meta_len > geometry.slot_capacity_bytes() {
            return Err(CfsError::Format(format!(
                "metadata slot of {} bytes cannot hold a {meta_len}-byte allocation map; \
                 use a larger block size or more metadata blocks",
                geometry.slot_capacity_bytes()
            )));
        }

        let mut state = State {
            dev,
            geometry,
            store,
            ns,
            active: Slot::B,
            generation: Generation(0),
            meta_len,
            dirty: true,
        };
        state.flush()?;
        info!(
            blocks = geometry.block_count,
            block_size = geometry.block_size.get(),
            data_blocks = geometry.data_blocks,
            meta_blocks_per_slot = geometry.meta_blocks_per_slot,
            "container formatted"
        );
        Ok(Self {
            state: RwLock::new(state),
            read_only: false,
        })
    }

    /// Format an in-memory container of `size` bytes with default options.
    pub fn format_memory(size: usize) -> Result<Self> {
        Self::format(MemByteDevice::new(size), FormatOptions::default())
    }

    /// Mount an existing container. Any validation failure is `Corruption`.
    pub fn mount<D: ByteDevice + 'static>(device: D) -> Result<Self> {
        Self::load(Box::new(device), false)
    }

    /// Mount without allowing mutations; nothing is ever written back.
    pub fn mount_read_only<D: ByteDevice + 'static>(device: D) -> Result<Self> {
        Self::load(Box::new(device), true)
    }

    /// Decode and cross-check the container on `device` without mounting it.
    ///
    /// Unreadable metadata still fails with `Corruption`; disagreements
    /// between the allocation map and the namespace are returned in the
    /// report instead of failing.
    pub fn diagnose<D: ByteDevice + 'static>(device: D) -> Result<CheckReport> {
        let state = open_state(Box::new(device))?;
        let report = check::check(&state.store, &state.ns);
        info!(
            generation = state.generation.0,
            problems = report.problem_count(),
            "container diagnosed"
        );
        Ok(report)
    }

    fn load(device: Box<dyn ByteDevice>, read_only: bool) -> Result<Self> {
        let state = open_state(device)?;
        let slot_block = state.geometry.slot_start(state.active).0;
        let report = check::check(&state.store, &state.ns);
        if !report.is_clean() {
            let first = report.findings.first().cloned().unwrap_or_default();
            return Err(CfsError::corruption(
                slot_block,
                format!(
                    "allocation map disagrees with namespace ({} problems): {first}",
                    report.problem_count()
                ),
            ));
        }

        info!(
            generation = state.generation.0,
            slot = ?state.active,
            entries = state.ns.len(),
            used_blocks = state.store.used_blocks(),
            read_only,
            "container mounted"
        );
        Ok(Self {
            state: RwLock::new(state),
            read_only,
        })
    }

    /// Flush pending metadata and release the device.
    pub fn unmount(self) -> Result<()> {
        let mut state = self.state.into_inner();
        if !self.read_only {
            state.flush()?;
        }
        state.dev.sync()?;
        info!(generation = state.generation.0, "container unmounted");
        Ok(())
    }

    /// Persist all pending metadata. A no-op when nothing changed.
    pub fn flush(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.state.write().flush()
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, State>> {
        if self.read_only {
            return Err(CfsError::ReadOnly);
        }
        Ok(self.state.write())
    }

    // ── Path-level operations ───────────────────────────────────────────

    /// Resolve `path`, following symlinks.
    pub fn lookup(&self, path: &str) -> Result<EntryId> {
        self.state.read().ns.lookup(path)
    }

    pub fn stat(&self, path: &str) -> Result<InodeAttr> {
        let state = self.state.read();
        let id = state.ns.lookup(path)?;
        state.attr(id)
    }

    /// Like [`Container::stat`] but does not follow a final symlink.
    pub fn lstat(&self, path: &str) -> Result<InodeAttr> {
        let state = self.state.read();
        let id = state.ns.lookup_nofollow(path)?;
        state.attr(id)
    }

    pub fn mkdir(&self, path: &str) -> Result<EntryId> {
        let mut state = self.write_state()?;
        let (parent, name) = state.ns.resolve_parent(path)?;
        state.create(parent, name, NewEntry::Directory)
    }

    /// Create an empty regular file. `Exists` if anything is at `path`.
    pub fn create_file(&self, path: &str) -> Result<EntryId> {
        let mut state = self.write_state()?;
        let (parent, name) = state.ns.resolve_parent(path)?;
        state.create(parent, name, NewEntry::File)
    }

    pub fn symlink(&self, path: &str, target: &str) -> Result<EntryId> {
        let mut state = self.write_state()?;
        let (parent, name) = state.ns.resolve_parent(path)?;
        state.create(parent, name, NewEntry::Symlink(target.to_owned()))
    }

    /// Remove a file, symlink or empty directory, freeing its blocks.
    pub fn remove(&self, path: &str) -> Result<()> {
        self.remove_as(path, RemoveKind::Any)
    }

    /// Remove a non-directory.
    pub fn unlink(&self, path: &str) -> Result<()> {
        self.remove_as(path, RemoveKind::NonDirectory)
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, path: &str) -> Result<()> {
        self.remove_as(path, RemoveKind::Directory)
    }

    fn remove_as(&self, path: &str, accept: RemoveKind) -> Result<()> {
        let mut state = self.write_state()?;
        let (parent, name) = state.ns.resolve_parent(path)?;
        state.remove(parent, name, accept)
    }

    /// Move `src` to `dst`.
    ///
    /// When `dst` names an existing directory other than `src` itself, the
    /// source moves into it under its own name. Otherwise an existing
    /// destination of a compatible kind is replaced and its blocks freed.
    pub fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let mut state = self.write_state()?;
        let (src_parent, src_name) = state.ns.resolve_parent(src)?;
        let src_id = state.ns.lookup_child(src_parent, src_name)?;

        let into_dir = match state.ns.lookup(dst) {
            Ok(target) if target != src_id && state.ns.get(target)?.is_dir() => Some(target),
            _ => None,
        };
        let (dst_parent, dst_name) = match into_dir {
            Some(dir) => (dir, src_name),
            None => state.ns.resolve_parent(dst)?,
        };
        state.rename(src_parent, src_name, dst_parent, dst_name)
    }

    /// Read up to `len` bytes at `offset`. Empty at or past EOF.
    pub fn read(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        let state = self.state.read();
        let id = state.ns.lookup(path)?;
        state.read(id, offset, len)
    }

    pub fn read_to_end(&self, path: &str) -> Result<Vec<u8>> {
        self.read(path, 0, u64::MAX)
    }

    /// Open `path` for writing (creating a regular file if missing) and
    /// write `data` according to `mode`. Returns bytes written.
    pub fn write(&self, path: &str, offset: u64, data: &[u8], mode: WriteMode) -> Result<usize> {
        let mut state = self.write_state()?;
        let id = match state.ns.lookup(path) {
            Ok(id) => id,
            Err(CfsError::NotFound(detail)) => {
                // A dangling symlink: the target is missing, not the link.
                if state.ns.lookup_nofollow(path).is_ok() {
                    return Err(CfsError::NotFound(detail));
                }
                let (parent, name) = state.ns.resolve_parent(path)?;
                state.create(parent, name, NewEntry::File)?
            }
            Err(err) => return Err(err),
        };
        match mode {
            WriteMode::Truncate => state.replace(id, offset, data),
            WriteMode::Append => state.append(id, data),
            WriteMode::InPlace => state.write(id, offset, data),
        }
    }

    /// Replace the whole content of `path` with `data`.
    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<usize> {
        self.write(path, 0, data, WriteMode::Truncate)
    }

    /// Append `data` to `path`.
    pub fn append(&self, path: &str, data: &[u8]) -> Result<usize> {
        self.write(path, 0, data, WriteMode::Append)
    }

    pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
        let mut state = self.write_state()?;
        let id = state.ns.lookup(path)?;
        state.truncate(id, size)
    }

    pub fn readlink(&self, path: &str) -> Result<String> {
        let state = self.state.read();
        let id = state.ns.lookup_nofollow(path)?;
        state.ns.readlink(id).map(str::to_owned)
    }

    /// Set all three timestamps of the entry `path` resolves to.
    pub fn set_times(
        &self,
        path: &str,
        atime: Timestamp,
        mtime: Timestamp,
        ctime: Timestamp,
    ) -> Result<()> {
        let mut state = self.write_state()?;
        let id = state.ns.lookup(path)?;
        state.set_times(id, Times { atime, mtime, ctime })
    }

    /// Children of the directory at `path`, without `.` and `..`.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let state = self.state.read();
        let id = state.ns.lookup(path)?;
        state.readdir(id, 2)
    }

    /// Every path in depth-first order, starting with `/`.
    pub fn tree(&self) -> Result<Vec<TreeEntry>> {
        let state = self.state.read();
        state
            .ns
            .walk()
            .into_iter()
            .map(|(path, ino)| {
                let entry = state.ns.get(ino)?;
                Ok(TreeEntry {
                    path,
                    ino,
                    kind: FileType::from(entry.kind()),
                    size: entry.size(),
                })
            })
            .collect()
    }

    pub fn statfs(&self) -> StatFs {
        self.state.read().statfs()
    }

    pub fn used_bytes(&self) -> u64 {
        self.state.read().store.used_bytes()
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.state.read().store.capacity_bytes()
    }

    pub fn info(&self) -> ContainerInfo {
        let state = self.state.read();
        ContainerInfo {
            geometry: state.geometry,
            active_slot: state.active,
            generation: state.generation,
            metadata_len: state.meta_len,
            metadata_capacity: state.geometry.slot_capacity_bytes(),
            used_blocks: state.store.used_blocks(),
            free_blocks: state.store.free_blocks(),
            used_bytes: state.store.used_bytes(),
            capacity_bytes: state.store.capacity_bytes(),
            entries: state.ns.len() as u64,
        }
    }

    /// Cross-check the in-memory namespace against the allocation map.
    pub fn check(&self) -> CheckReport {
        let state = self.state.read();
        check::check(&state.store, &state.ns)
    }
}

// ── FsOps for Container ─────────────────────────────────────────────────────

impl FsOps for Container {
    fn getattr(&self, ino: EntryId) -> Result<InodeAttr> {
        self.state.read().attr(ino)
    }

    fn lookup(&self, parent: EntryId, name: &OsStr) -> Result<InodeAttr> {
        let state = self.state.read();
        let id = state.ns.lookup_child(parent, name_str(name)?)?;
        state.attr(id)
    }

    fn readdir(&self, ino: EntryId, offset: u64) -> Result<Vec<DirEntry>> {
        self.state.read().readdir(ino, offset)
    }

    fn read(&self, ino: EntryId, offset: u64, size: u32) -> Result<Vec<u8>> {
        self.state.read().read(ino, offset, u64::from(size))
    }

    fn readlink(&self, ino: EntryId) -> Result<Vec<u8>> {
        let state = self.state.read();
        Ok(state.ns.readlink(ino)?.as_bytes().to_vec())
    }

    fn open(&self, ino: EntryId, mode: OpenMode) -> Result<()> {
        match mode {
            OpenMode::Read => self.state.read().ns.get(ino).map(|_| ()),
            OpenMode::Append => {
                let state = self.write_state()?;
                state.ns.file_content(ino).map(|_| ())
            }
            OpenMode::Truncate => self.write_state()?.truncate(ino, 0),
        }
    }

    fn write(&self, ino: EntryId, offset: u64, data: &[u8]) -> Result<u32> {
        let written = self.write_state()?.write(ino, offset, data)?;
        Ok(u32::try_from(written).unwrap_or(u32::MAX))
    }

    fn append(&self, ino: EntryId, data: &[u8]) -> Result<u32> {
        let written = self.write_state()?.append(ino, data)?;
        Ok(u32::try_from(written).unwrap_or(u32::MAX))
    }

    fn setattr(&self, ino: EntryId, request: &SetAttrRequest) -> Result<InodeAttr> {
        let mut state = self.write_state()?;
        if let Some(size) = request.size {
            state.truncate(ino, size)?;
        }
        if request.atime.is_some() || request.mtime.is_some() {
            let current = state.ns.get(ino)?.times();
            let mtime = request.mtime.unwrap_or(current.mtime);
            let ctime = request.mtime.unwrap_or_else(Timestamp::now);
            state.set_times(
                ino,
                Times {
                    atime: request.atime.unwrap_or(current.atime),
                    mtime,
                    ctime,
                },
            )?;
        }
        state.attr(ino)
    }

    fn mkdir(&self, parent: EntryId, name: &OsStr) -> Result<InodeAttr> {
        let mut state = self.write_state()?;
        let id = state.create(parent, name_str(name)?, NewEntry::Directory)?;
        state.attr(id)
    }

    fn create(&self, parent: EntryId, name: &OsStr) -> Result<InodeAttr> {
        let mut state = self.write_state()?;
        let id = state.create(parent, name_str(name)?, NewEntry::File)?;
        state.attr(id)
    }

    fn symlink(&self, parent: EntryId, name: &OsStr, target: &Path) -> Result<InodeAttr> {
        let target = target
            .to_str()
            .ok_or_else(|| CfsError::InvalidArgument(format!("target is not UTF-8: {target:?}")))?;
        let mut state = self.write_state()?;
        let id = state.create(parent, name_str(name)?, NewEntry::Symlink(target.to_owned()))?;
        state.attr(id)
    }

    fn unlink(&self, parent: EntryId, name: &OsStr) -> Result<()> {
        self.write_state()?
            .remove(parent, name_str(name)?, RemoveKind::NonDirectory)
    }

    fn rmdir(&self, parent: EntryId, name: &OsStr) -> Result<()> {
        self.write_state()?
            .remove(parent, name_str(name)?, RemoveKind::Directory)
    }

    fn rename(
        &self,
        parent: EntryId,
        name: &OsStr,
        new_parent: EntryId,
        new_name: &OsStr,
    ) -> Result<()> {
        self.write_state()?
            .rename(parent, name_str(name)?, new_parent, name_str(new_name)?)
    }

    fn statfs(&self) -> Result<StatFs> {
        Ok(Container::statfs(self))
    }

    fn flush(&self) -> Result<()> {
        Container::flush(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: usize = 100_000;

    fn mem_container(size: usize) -> (MemByteDevice, Container) {
        let mem = MemByteDevice::new(size);
        let fs = Container::format(mem.clone(), FormatOptions::default()).unwrap();
        (mem, fs)
    }

    fn tracked_len_matches(fs: &Container) {
        let state = fs.state.read();
        assert_eq!(
            state.meta_len,
            image::encoded_len(&state.store, &state.ns) as u64
        );
    }

    #[test]
    fn format_small_container_geometry() {
        let (_, fs) = mem_container(SMALL);
        let info = fs.info();
        assert_eq!(info.geometry.block_count, 97);
        assert_eq!(info.geometry.data_blocks, 90);
        assert_eq!(info.generation, Generation(1));
        assert_eq!(info.active_slot, Slot::A);
        assert_eq!(fs.capacity_bytes(), 90 * 1024);
        assert_eq!(fs.used_bytes(), 0);
        assert_eq!(fs.statfs().entries, 1);
    }

    #[test]
    fn format_rejects_tiny_device() {
        assert!(matches!(
            Container::format_memory(4 * 1024),
            Err(CfsError::Format(_))
        ));
        assert!(matches!(Container::format_memory(100), Err(CfsError::Format(_))));
    }

    #[test]
    fn path_operations_round_trip() {
        let (_, fs) = mem_container(SMALL);
        fs.mkdir("/docs").unwrap();
        fs.write_file("/docs/a.txt", b"hello").unwrap();
        fs.append("/docs/a.txt", b" world").unwrap();
        assert_eq!(fs.read_to_end("/docs/a.txt").unwrap(), b"hello world");
        assert_eq!(fs.read("/docs/a.txt", 6, 100).unwrap(), b"world");
        assert!(fs.read("/docs/a.txt", 50, 10).unwrap().is_empty());

        fs.write("/docs/a.txt", 0, b"J", WriteMode::InPlace).unwrap();
        assert_eq!(fs.read_to_end("/docs/a.txt").unwrap(), b"Jello world");

        let attr = fs.stat("/docs/a.txt").unwrap();
        assert_eq!(attr.size, 11);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.blocks, 2);
        assert_eq!(fs.stat("/docs").unwrap().nlink, 2);
        assert_eq!(fs.stat("/").unwrap().nlink, 3);

        let names: Vec<_> = fs.read_dir("/docs").unwrap().iter().map(DirEntry::name_str).collect();
        assert_eq!(names, vec!["a.txt"]);
        tracked_len_matches(&fs);
    }

    #[test]
    fn unlink_and_rmdir_check_kinds() {
        let (_, fs) = mem_container(SMALL);
        fs.mkdir("/d").unwrap();
        fs.create_file("/f").unwrap();
        assert!(matches!(fs.unlink("/d"), Err(CfsError::IsDirectory)));
        assert!(matches!(fs.rmdir("/f"), Err(CfsError::NotDirectory)));
        assert!(matches!(fs.create_file("/f"), Err(CfsError::Exists)));
        fs.unlink("/f").unwrap();
        fs.rmdir("/d").unwrap();
        assert_eq!(fs.tree().unwrap().len(), 1);
        tracked_len_matches(&fs);
    }

    #[test]
    fn rename_into_existing_directory() {
        let (_, fs) = mem_container(SMALL);
        fs.mkdir("/dir").unwrap();
        fs.write_file("/f", b"data").unwrap();
        fs.rename("/f", "/dir").unwrap();
        assert_eq!(fs.read_to_end("/dir/f").unwrap(), b"data");
        fs.rename("/dir/f", "/dir/renamed-with-a-longer-name").unwrap();
        assert!(matches!(fs.stat("/dir/f"), Err(CfsError::NotFound(_))));
        tracked_len_matches(&fs);
    }

    #[test]
    fn metadata_budget_rejects_growth_before_flush_fails() {
        let mem = MemByteDevice::new(SMALL);
        let fs = Container::format(
            mem,
            FormatOptions {
                metadata_blocks: Some(2),
                ..FormatOptions::default()
            },
        )
        .unwrap();
        let mut created = 0;
        let err = loop {
            match fs.mkdir(&format!("/{}-{created:04}", "d".repeat(200))) {
                Ok(_) => created += 1,
                Err(err) => break err,
            }
        };
        assert!(matches!(err, CfsError::NoSpace));
        assert!(created > 0);
        tracked_len_matches(&fs);
        fs.flush().unwrap();
    }

    #[test]
    fn fsops_readdir_cookies() {
        let (_, fs) = mem_container(SMALL);
        for name in ["c", "a", "b"] {
            FsOps::create(&fs, EntryId::ROOT, OsStr::new(name)).unwrap();
        }
        let all = FsOps::readdir(&fs, EntryId::ROOT, 0).unwrap();
        let names: Vec<_> = all.iter().map(DirEntry::name_str).collect();
        assert_eq!(names, vec![".", "..", "a", "b", "c"]);
        assert_eq!(all[0].ino, EntryId::ROOT);
        assert_eq!(all[1].ino, EntryId::ROOT);

        let rest = FsOps::readdir(&fs, EntryId::ROOT, all[2].offset).unwrap();
        let names: Vec<_> = rest.iter().map(DirEntry::name_str).collect();
        assert_eq!(names, vec!["b", "c"]);
        assert!(FsOps::readdir(&fs, EntryId::ROOT, all[4].offset).unwrap().is_empty());
    }

    #[test]
    fn fsops_open_modes() {
        let (_, fs) = mem_container(SMALL);
        let attr = FsOps::create(&fs, EntryId::ROOT, OsStr::new("f")).unwrap();
        FsOps::write(&fs, attr.ino, 0, b"original").unwrap();

        FsOps::open(&fs, attr.ino, OpenMode::Read).unwrap();
        assert_eq!(FsOps::getattr(&fs, attr.ino).unwrap().size, 8);

        FsOps::open(&fs, attr.ino, OpenMode::Append).unwrap();
        FsOps::append(&fs, attr.ino, b"+more").unwrap();
        assert_eq!(FsOps::read(&fs, attr.ino, 0, 64).unwrap(), b"original+more");

        FsOps::open(&fs, attr.ino, OpenMode::Truncate).unwrap();
        assert_eq!(FsOps::getattr(&fs, attr.ino).unwrap().size, 0);
        assert_eq!(fs.used_bytes(), 0);
        assert!(matches!(
            FsOps::open(&fs, EntryId::ROOT, OpenMode::Truncate),
            Err(CfsError::IsDirectory)
        ));
    }

    #[test]
    fn fsops_setattr_size_and_times() {
        let (_, fs) = mem_container(SMALL);
        let attr = FsOps::create(&fs, EntryId::ROOT, OsStr::new("f")).unwrap();
        let updated = FsOps::setattr(
            &fs,
            attr.ino,
            &SetAttrRequest {
                size: Some(3000),
                atime: Some(Timestamp(946_702_800)),
                mtime: Some(Timestamp(946_702_800)),
            },
        )
        .unwrap();
        assert_eq!(updated.size, 3000);
        assert_eq!(updated.mtime, Timestamp(946_702_800).to_system_time());
        assert_eq!(updated.ctime, Timestamp(946_702_800).to_system_time());
        assert_eq!(FsOps::read(&fs, attr.ino, 0, 4096).unwrap(), vec![0; 3000]);
    }

    #[test]
    fn fsops_rejects_non_utf8_names() {
        use std::os::unix::ffi::OsStrExt;
        let (_, fs) = mem_container(SMALL);
        let bad = OsStr::from_bytes(&[0x66, 0xFF]);
        assert!(matches!(
            FsOps::mkdir(&fs, EntryId::ROOT, bad),
            Err(CfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn read_only_mount_refuses_mutation() {
        let (mem, fs) = mem_container(SMALL);
        fs.write_file("/f", b"x").unwrap();
        fs.unmount().unwrap();
        let before = mem.snapshot();

        let ro = Container::mount_read_only(mem.clone()).unwrap();
        assert!(ro.is_read_only());
        assert_eq!(ro.read_to_end("/f").unwrap(), b"x");
        assert!(matches!(ro.mkdir("/d"), Err(CfsError::ReadOnly)));
        assert!(matches!(
            FsOps::write(&ro, EntryId(2), 0, b"y"),
            Err(CfsError::ReadOnly)
        ));
        ro.unmount().unwrap();
        assert_eq!(mem.snapshot(), before);
    }

    /// Commit `damage` through the normal flush path so checksums stay valid.
    fn seal_damaged(fs: Container, damage: impl FnOnce(&mut State)) {
        let mut state = fs.state.into_inner();
        damage(&mut state);
        state.dirty = true;
        state.flush().unwrap();
    }

    #[test]
    fn diagnose_reports_leaked_block_that_mount_rejects() {
        let (mem, fs) = mem_container(SMALL);
        fs.write_file("/f", b"first").unwrap();
        fs.write_file("/g", b"second").unwrap();
        fs.unlink("/f").unwrap();
        seal_damaged(fs, |state| {
            state.store.allocate_blocks(1).unwrap();
        });

        let err = Container::mount(mem.clone()).unwrap_err();
        assert!(matches!(err, CfsError::Corruption { .. }), "{err}");
        assert!(matches!(
            Container::mount_read_only(mem.clone()),
            Err(CfsError::Corruption { .. })
        ));

        let report = Container::diagnose(mem.clone()).unwrap();
        assert_eq!(report.leaked, 1);
        assert_eq!(report.problem_count(), 1);
        assert_eq!((report.files, report.used_blocks), (1, 2));
        assert!(report.findings[0].contains("marked used but unowned"));
    }

    #[test]
    fn diagnose_clean_container() {
        let (mem, fs) = mem_container(SMALL);
        fs.write_file("/f", b"data").unwrap();
        fs.unmount().unwrap();
        let report = Container::diagnose(mem).unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.referenced_blocks, 1);
    }

    #[test]
    fn overflowing_extent_fails_mount_without_panicking() {
        let (mem, fs) = mem_container(SMALL);
        fs.write_file("/f", b"data").unwrap();
        seal_damaged(fs, |state| {
            let f = state.ns.lookup("/f").unwrap();
            let bogus = cfs_types::BlockRange::new(BlockNumber(u64::MAX), 2);
            state.ns.set_file_content(f, 2048, vec![bogus]).unwrap();
        });
        assert!(matches!(Container::mount(mem.clone()), Err(CfsError::Corruption { .. })));
        assert!(matches!(Container::diagnose(mem), Err(CfsError::Corruption { .. })));
    }

    #[test]
    fn huge_extent_fails_mount_and_is_reported() {
        let (mem, fs) = mem_container(SMALL);
        fs.write_file("/f", b"data").unwrap();
        let data_start = fs.info().geometry.data_start;
        let count = u64::from(u32::MAX);
        seal_damaged(fs, |state| {
            let f = state.ns.lookup("/f").unwrap();
            let bogus = cfs_types::BlockRange::new(data_start, count);
            state.ns.set_file_content(f, count * 1024, vec![bogus]).unwrap();
        });
        assert!(matches!(Container::mount(mem.clone()), Err(CfsError::Corruption { .. })));
        let report = Container::diagnose(mem).unwrap();
        assert_eq!(report.out_of_range, count);
        // The block /f really used is now owned by nobody.
        assert_eq!(report.leaked, 1);
    }

    #[test]
    fn write_through_dangling_symlink_is_not_found() {
        let (_, fs) = mem_container(SMALL);
        fs.symlink("/link", "/missing").unwrap();
        assert!(matches!(fs.write_file("/link", b"x"), Err(CfsError::NotFound(_))));
        assert!(matches!(fs.append("/link", b"x"), Err(CfsError::NotFound(_))));
        assert!(matches!(fs.stat("/missing"), Err(CfsError::NotFound(_))));
        assert_eq!(fs.readlink("/link").unwrap(), "/missing");
        tracked_len_matches(&fs);
    }

    #[test]
    fn truncating_write_frees_old_blocks() {
        let (_, fs) = mem_container(SMALL);
        fs.write_file("/f", &[7_u8; 5000]).unwrap();
        assert_eq!(fs.used_bytes(), 5 * 1024);
        fs.write_file("/f", b"short").unwrap();
        assert_eq!(fs.read_to_end("/f").unwrap(), b"short");
        assert_eq!(fs.used_bytes(), 1024);
        assert!(fs.check().is_clean());
        tracked_len_matches(&fs);
    }

    #[test]
    fn clean_unmount_without_changes_writes_nothing() {
        let (mem, fs) = mem_container(SMALL);
        fs.unmount().unwrap();
        let before = mem.snapshot();
        let fs = Container::mount(mem.clone()).unwrap();
        let _ = fs.stat("/").unwrap();
        fs.unmount().unwrap();
        assert_eq!(mem.snapshot(), before);
    }
}
