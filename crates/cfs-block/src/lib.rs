#![forbid(unsafe_code)]
//! Block I/O layer for CanFS containers.
//!
//! A container is a fixed-length byte region. [`ByteDevice`] gives
//! pread/pwrite access to that region (a regular file or an in-memory
//! buffer) and [`ByteBlockDevice`] slices it into fixed-size blocks. This
//! is the only layer that turns block numbers into byte offsets.

use cfs_error::{CfsError, Result};
use cfs_types::{BlockNumber, BlockSize};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

fn checked_end(offset: u64, len: usize, what: &str) -> Result<u64> {
    let len = u64::try_from(len)
        .map_err(|_| CfsError::Format(format!("{what} length overflows u64")))?;
    offset
        .checked_add(len)
        .ok_or_else(|| CfsError::Format(format!("{what} range overflows u64")))
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

impl<T: ByteDevice + ?Sized> ByteDevice for Box<T> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open an existing container file, falling back to read-only access
    /// when the file cannot be opened for writing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        debug!(path = %path.as_ref().display(), len, writable, "opened container file");
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Create (or truncate) a container file of exactly `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        debug!(path = %path.as_ref().display(), len, "created container file");
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: true,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = checked_end(offset, buf.len(), "read")?;
        if end > self.len {
            return Err(CfsError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(CfsError::ReadOnly);
        }
        let end = checked_end(offset, buf.len(), "write")?;
        if end > self.len {
            return Err(CfsError::Format(format!(
                "write out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device.
///
/// Clones share the same buffer, so a test (or a `:memory:` mount) can
/// unmount a container and mount the same bytes again.
#[derive(Debug, Clone)]
pub struct MemByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0_u8; len])),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Apply `f` to the raw buffer (used to inject corruption in tests).
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut bytes = self.bytes.lock();
        f(&mut bytes)
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| CfsError::Format("offset overflow".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| CfsError::Format("read range overflow".to_owned()))?;
        let bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(CfsError::Format(format!(
                "read out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                bytes.len()
            )));
        }
        buf.copy_from_slice(&bytes[start..end]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| CfsError::Format("offset overflow".to_owned()))?;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| CfsError::Format("write range overflow".to_owned()))?;
        let mut bytes = self.bytes.lock();
        if end > bytes.len() {
            return Err(CfsError::Format(format!(
                "write out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                bytes.len()
            )));
        }
        bytes[start..end].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size.
    fn block_size(&self) -> BlockSize;

    /// Total number of whole blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Block view over a [`ByteDevice`].
///
/// A trailing partial block is ignored: containers are formatted from a
/// byte size that need not be block-aligned.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: BlockSize,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: BlockSize) -> Result<Self> {
        let len = inner.len_bytes();
        let block_count = len / block_size.as_u64();
        if block_count == 0 {
            return Err(CfsError::Format(format!(
                "device smaller than one block: len_bytes={len} block_size={block_size}"
            )));
        }
        let tail = len % block_size.as_u64();
        if tail != 0 {
            debug!(
                len_bytes = len,
                block_size = block_size.get(),
                tail,
                "ignoring trailing partial block"
            );
        }
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn block_offset(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(CfsError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        self.block_size
            .block_to_byte(block)
            .ok_or_else(|| CfsError::Format("block offset overflow".to_owned()))
    }

    fn block_len(&self) -> Result<usize> {
        usize::try_from(self.block_size.get())
            .map_err(|_| CfsError::Format("block_size does not fit usize".to_owned()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.block_offset(block)?;
        let mut buf = vec![0_u8; self.block_len()?];
        self.inner.read_exact_at(offset, &mut buf)?;
        trace!(block = block.0, "read block");
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = self.block_len()?;
        if data.len() != expected {
            return Err(CfsError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        let offset = self.block_offset(block)?;
        self.inner.write_all_at(offset, data)?;
        trace!(block = block.0, "wrote block");
        Ok(())
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}
