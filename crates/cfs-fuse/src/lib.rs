#![forbid(unsafe_code)]
//! FUSE adapter for CanFS.
//!
//! A thin translation layer: kernel requests arrive through `fuser`, are
//! forwarded to a [`FsOps`] implementation (normally a mounted
//! `cfs_core::Container`), and errors are mapped through
//! [`CfsError::to_errno()`].
//!
//! Open handles carry the write discipline chosen at `open`/`create`:
//!
//! | flags                         | mode       | effect                        |
//! |-------------------------------|------------|-------------------------------|
//! | `O_RDONLY`                    | `Read`     | stateless, no handle recorded |
//! | write access with `O_APPEND`  | `Append`   | writes land at end of file    |
//! | write access otherwise        | `Truncate` | content freed at open         |
//!
//! `O_RDWR` follows the write rows.

use cfs_core::{
    CfsError, EntryId, FileType as CfsFileType, FsOps, InodeAttr, OpenMode, SetAttrRequest,
    Timestamp,
};
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::raw::c_int;
#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// TTL for cached attributes and entries.
///
/// The mount is the only writer, so the kernel cache stays coherent with a
/// short TTL.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Handle returned for stateless opens.
const STATELESS_FH: u64 = 0;

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── FUSE error context ─────────────────────────────────────────────────────

/// Structured error context for FUSE operation failures.
pub struct FuseErrorContext<'a> {
    pub error: &'a CfsError,
    pub operation: &'static str,
    pub ino: u64,
    pub offset: Option<u64>,
}

impl FuseErrorContext<'_> {
    /// Log this error context via tracing and return the errno for the reply.
    pub fn log_and_errno(&self) -> c_int {
        let errno = self.error.to_errno();
        // ENOENT from lookup is routine.
        if errno == libc::ENOENT {
            trace!(
                op = self.operation,
                ino = self.ino,
                errno,
                error = %self.error,
                "FUSE op returned ENOENT"
            );
        } else {
            warn!(
                op = self.operation,
                ino = self.ino,
                offset = self.offset,
                errno,
                error = %self.error,
                "FUSE op failed"
            );
        }
        errno
    }
}

// ── Type conversions ────────────────────────────────────────────────────────

fn to_fuser_file_type(ft: CfsFileType) -> FileType {
    match ft {
        CfsFileType::RegularFile => FileType::RegularFile,
        CfsFileType::Directory => FileType::Directory,
        CfsFileType::Symlink => FileType::Symlink,
    }
}

fn to_file_attr(attr: &InodeAttr) -> FileAttr {
    FileAttr {
        ino: attr.ino.0,
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.crtime,
        kind: to_fuser_file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: attr.blksize,
        flags: 0,
    }
}

/// Map kernel open flags onto the container's open discipline.
fn open_mode(flags: i32) -> OpenMode {
    if flags & libc::O_ACCMODE == libc::O_RDONLY {
        OpenMode::Read
    } else if flags & libc::O_APPEND != 0 {
        OpenMode::Append
    } else {
        OpenMode::Truncate
    }
}

fn resolve_time(t: TimeOrNow) -> Timestamp {
    match t {
        TimeOrNow::SpecificTime(st) => Timestamp::from_system_time(st),
        TimeOrNow::Now => Timestamp::now(),
    }
}

// ── Mount options ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub read_only: bool,
    pub allow_other: bool,
    pub auto_unmount: bool,
    /// Owner reported for every entry. The container stores no ownership.
    pub uid: u32,
    pub gid: u32,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            allow_other: false,
            auto_unmount: true,
            uid: 0,
            gid: 0,
        }
    }
}

// ── Metrics ─────────────────────────────────────────────────────────────────

/// Lock-free per-mount request counters.
#[derive(Default)]
pub struct AtomicMetrics {
    requests_total: AtomicU64,
    requests_ok: AtomicU64,
    requests_err: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl AtomicMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record<T>(&self, result: &cfs_core::Result<T>) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if result.is_ok() {
            self.requests_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_err.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_bytes_read(&self, n: usize) {
        self.bytes_read
            .fetch_add(u64::try_from(n).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    fn record_bytes_written(&self, n: u32) {
        self.bytes_written
            .fetch_add(u64::from(n), Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_ok: self.requests_ok.load(Ordering::Relaxed),
            requests_err: self.requests_err.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for AtomicMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.snapshot(), f)
    }
}

/// Point-in-time copy of [`AtomicMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_ok: u64,
    pub requests_err: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

// ── Shared state ────────────────────────────────────────────────────────────

struct FuseInner {
    ops: Arc<dyn FsOps>,
    metrics: AtomicMetrics,
    options: MountOptions,
    handles: Mutex<HashMap<u64, OpenMode>>,
    next_fh: AtomicU64,
}

impl std::fmt::Debug for FuseInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuseInner")
            .field("metrics", &self.metrics)
            .field("options", &self.options)
            .field("open_handles", &self.handles.lock().len())
            .finish_non_exhaustive()
    }
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// FUSE adapter that delegates to a [`FsOps`] implementation.
#[derive(Debug)]
pub struct CanFuse {
    inner: Arc<FuseInner>,
}

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<CanFuse>;
};

impl CanFuse {
    #[must_use]
    pub fn new(ops: Box<dyn FsOps>) -> Self {
        Self::with_options(ops, &MountOptions::default())
    }

    #[must_use]
    pub fn with_options(ops: Box<dyn FsOps>, options: &MountOptions) -> Self {
        info!(
            read_only = options.read_only,
            uid = options.uid,
            gid = options.gid,
            "CanFuse initialized"
        );
        Self {
            inner: Arc::new(FuseInner {
                ops: Arc::from(ops),
                metrics: AtomicMetrics::new(),
                options: options.clone(),
                handles: Mutex::new(HashMap::new()),
                next_fh: AtomicU64::new(1),
            }),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &AtomicMetrics {
        &self.inner.metrics
    }

    /// Number of write handles currently open.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.inner.handles.lock().len()
    }

    fn tracked<T>(&self, result: cfs_core::Result<T>) -> cfs_core::Result<T> {
        self.inner.metrics.record(&result);
        result
    }

    fn file_attr(&self, attr: &InodeAttr) -> FileAttr {
        let mut out = to_file_attr(attr);
        out.uid = self.inner.options.uid;
        out.gid = self.inner.options.gid;
        out
    }

    /// Open `ino` per `flags`, returning the handle to hand the kernel.
    fn open_handle(&self, ino: u64, flags: i32) -> cfs_core::Result<u64> {
        let mode = open_mode(flags);
        if mode != OpenMode::Read && self.inner.options.read_only {
            return Err(CfsError::ReadOnly);
        }
        self.inner.ops.open(EntryId(ino), mode)?;
        if mode == OpenMode::Read {
            return Ok(STATELESS_FH);
        }
        let fh = self.inner.next_fh.fetch_add(1, Ordering::Relaxed);
        self.inner.handles.lock().insert(fh, mode);
        debug!(ino, fh, ?mode, "handle opened");
        Ok(fh)
    }

    /// Create `name` under `parent` and open it per `flags`.
    ///
    /// If the open fails the new entry is unlinked again, so a failed
    /// `create` leaves nothing behind.
    fn create_handle(
        &self,
        parent: u64,
        name: &OsStr,
        flags: i32,
    ) -> cfs_core::Result<(u64, InodeAttr)> {
        if self.inner.options.read_only {
            return Err(CfsError::ReadOnly);
        }
        let attr = self.inner.ops.create(EntryId(parent), name)?;
        match self.open_handle(attr.ino.0, flags) {
            Ok(fh) => Ok((fh, attr)),
            Err(err) => {
                if let Err(cleanup) = self.inner.ops.unlink(EntryId(parent), name) {
                    warn!(parent, error = %cleanup, "could not remove entry after failed open");
                }
                Err(err)
            }
        }
    }

    /// Write through handle `fh`; append handles ignore `offset`.
    fn write_handle(&self, ino: u64, fh: u64, offset: u64, data: &[u8]) -> cfs_core::Result<u32> {
        let mode = self.inner.handles.lock().get(&fh).copied();
        let written = match mode {
            Some(OpenMode::Append) => self.inner.ops.append(EntryId(ino), data)?,
            _ => self.inner.ops.write(EntryId(ino), offset, data)?,
        };
        self.inner.metrics.record_bytes_written(written);
        Ok(written)
    }

    fn release_handle(&self, fh: u64) {
        if self.inner.handles.lock().remove(&fh).is_some() {
            debug!(fh, "handle released");
        }
    }

    fn setattr_request(
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> SetAttrRequest {
        SetAttrRequest {
            size,
            atime: atime.map(resolve_time),
            mtime: mtime.map(resolve_time),
        }
    }

    fn reject_read_only(&self) -> Option<c_int> {
        self.inner.options.read_only.then_some(libc::EROFS)
    }
}

impl Filesystem for CanFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn destroy(&mut self) {
        if let Err(e) = self.inner.ops.flush() {
            warn!(error = %e, "flush at unmount failed");
        } else {
            info!(metrics = ?self.inner.metrics.snapshot(), "CanFuse unmounted");
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.tracked(self.inner.ops.lookup(EntryId(parent), name)) {
            Ok(attr) => reply.entry(&ATTR_TTL, &self.file_attr(&attr), 0),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "lookup",
                    ino: parent,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.tracked(self.inner.ops.getattr(EntryId(ino))) {
            Ok(attr) => reply.attr(&ATTR_TTL, &self.file_attr(&attr)),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "getattr",
                    ino,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // chmod and chown fall through to a plain getattr-style reply.
        let request = Self::setattr_request(size, atime, mtime);
        let mutates = request.size.is_some() || request.atime.is_some() || request.mtime.is_some();
        if mutates {
            if let Some(errno) = self.reject_read_only() {
                reply.error(errno);
                return;
            }
        }
        match self.tracked(self.inner.ops.setattr(EntryId(ino), &request)) {
            Ok(attr) => reply.attr(&ATTR_TTL, &self.file_attr(&attr)),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "setattr",
                    ino,
                    offset: size,
                }
                .log_and_errno(),
            ),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.tracked(self.inner.ops.readlink(EntryId(ino))) {
            Ok(target) => reply.data(&target),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "readlink",
                    ino,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        if let Some(errno) = self.reject_read_only() {
            reply.error(errno);
            return;
        }
        match self.tracked(self.inner.ops.mkdir(EntryId(parent), name)) {
            Ok(attr) => reply.entry(&ATTR_TTL, &self.file_attr(&attr), 0),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "mkdir",
                    ino: parent,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if let Some(errno) = self.reject_read_only() {
            reply.error(errno);
            return;
        }
        match self.tracked(self.inner.ops.unlink(EntryId(parent), name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "unlink",
                    ino: parent,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        if let Some(errno) = self.reject_read_only() {
            reply.error(errno);
            return;
        }
        match self.tracked(self.inner.ops.rmdir(EntryId(parent), name)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "rmdir",
                    ino: parent,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        if let Some(errno) = self.reject_read_only() {
            reply.error(errno);
            return;
        }
        match self.tracked(self.inner.ops.symlink(EntryId(parent), link_name, target)) {
            Ok(attr) => reply.entry(&ATTR_TTL, &self.file_attr(&attr), 0),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "symlink",
                    ino: parent,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if let Some(errno) = self.reject_read_only() {
            reply.error(errno);
            return;
        }
        // RENAME_NOREPLACE and RENAME_EXCHANGE are not supported.
        if flags != 0 {
            debug!(parent, flags, "rename flags rejected");
            reply.error(libc::EINVAL);
            return;
        }
        match self.tracked(self.inner.ops.rename(
            EntryId(parent),
            name,
            EntryId(newparent),
            newname,
        )) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "rename",
                    ino: parent,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.tracked(self.open_handle(ino, flags)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "open",
                    ino,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.tracked(self.inner.ops.read(EntryId(ino), byte_offset, size)) {
            Ok(data) => {
                self.inner.metrics.record_bytes_read(data.len());
                reply.data(&data);
            }
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "read",
                    ino,
                    offset: Some(byte_offset),
                }
                .log_and_errno(),
            ),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if let Some(errno) = self.reject_read_only() {
            reply.error(errno);
            return;
        }
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.tracked(self.write_handle(ino, fh, byte_offset, data)) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "write",
                    ino,
                    offset: Some(byte_offset),
                }
                .log_and_errno(),
            ),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.release_handle(fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        if self.inner.options.read_only {
            reply.ok();
            return;
        }
        match self.tracked(self.inner.ops.flush()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "fsync",
                    ino,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.tracked(self.inner.ops.getattr(EntryId(ino))) {
            Ok(attr) if attr.kind == CfsFileType::Directory => reply.opened(STATELESS_FH, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "opendir",
                    ino,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let fs_offset = u64::try_from(offset).unwrap_or(0);
        match self.tracked(self.inner.ops.readdir(EntryId(ino), fs_offset)) {
            Ok(entries) => {
                for entry in &entries {
                    #[cfg(unix)]
                    let name = OsStr::from_bytes(&entry.name);
                    #[cfg(not(unix))]
                    let owned_name = entry.name_str();
                    #[cfg(not(unix))]
                    let name = OsStr::new(&owned_name);

                    let full = reply.add(
                        entry.ino.0,
                        i64::try_from(entry.offset).unwrap_or(i64::MAX),
                        to_fuser_file_type(entry.kind),
                        name,
                    );
                    if full {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "readdir",
                    ino,
                    offset: Some(fs_offset),
                }
                .log_and_errno(),
            ),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        match self.tracked(self.inner.ops.statfs()) {
            Ok(st) => reply.statfs(
                st.blocks,
                st.free_blocks,
                st.free_blocks,
                st.entries,
                0,
                st.block_size,
                st.name_max,
                st.block_size,
            ),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "statfs",
                    ino,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let result = self.create_handle(parent, name, flags);
        match self.tracked(result) {
            Ok((fh, attr)) => reply.created(&ATTR_TTL, &self.file_attr(&attr), 0, fh, 0),
            Err(e) => reply.error(
                FuseErrorContext {
                    error: &e,
                    operation: "create",
                    ino: parent,
                    offset: None,
                }
                .log_and_errno(),
            ),
        }
    }
}

// ── Mount entrypoint ────────────────────────────────────────────────────────

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("canfs".to_owned()),
        MountOption::Subtype("cfs".to_owned()),
        MountOption::NoAtime,
    ];

    if options.read_only {
        opts.push(MountOption::RO);
    } else {
        opts.push(MountOption::RW);
    }
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }

    opts
}

fn check_mountpoint(mountpoint: &Path) -> Result<(), FuseError> {
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    Ok(())
}

/// Mount at `mountpoint` and block until the filesystem is unmounted.
pub fn mount(
    ops: Box<dyn FsOps>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    check_mountpoint(mountpoint)?;
    let fuse_opts = build_mount_options(options);
    let fs = CanFuse::with_options(ops, options);
    info!(mountpoint = %mountpoint.display(), "mounting");
    fuser::mount2(fs, mountpoint, &fuse_opts)?;
    Ok(())
}
