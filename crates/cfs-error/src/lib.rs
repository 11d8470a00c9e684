#![forbid(unsafe_code)]
//! Error types for CanFS.
//!
//! # Error Taxonomy
//!
//! CanFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `cfs-types` | Byte-level violations while decoding the superblock or a metadata image |
//! | Runtime | `CfsError` | `cfs-error` (this crate) | Errors returned by the container, the FUSE adapter and the CLI |
//!
//! `cfs-error` does not depend on `cfs-types`. The conversion from
//! `ParseError` to `CfsError` lives in `cfs-core`, which sees both:
//!
//! | ParseError Variant | CfsError Variant |
//! |--------------------|------------------|
//! | `InsufficientData` | `Corruption { block, detail }` |
//! | `InvalidMagic` | `Corruption { block, detail }` |
//! | `InvalidField` | `Corruption { block, detail }` |
//! | `IntegerConversion` | `Corruption { block, detail }` |
//!
//! A container that fails to decode is never mounted, so every parse
//! failure during mount surfaces as `Corruption`.
//!
//! ## errno Mapping
//!
//! Every `CfsError` variant maps to exactly one POSIX errno via
//! [`CfsError::to_errno`]. The match has no wildcard arm, so a new variant
//! does not compile until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `InvalidArgument` | `EINVAL` |
//! | `Unsupported` | `EOPNOTSUPP` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `ReadOnly` | `EROFS` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `NotEmpty` | `ENOTEMPTY` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `Exists` | `EEXIST` |
//! | `SymlinkLoop` | `ELOOP` |

use thiserror::Error;

/// Unified error type for all CanFS operations.
#[derive(Debug, Error)]
pub enum CfsError {
    /// Operating system I/O error on the backing file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted metadata failed validation.
    ///
    /// `block` is the container block where the problem was found (0 for
    /// the superblock, or the first block of the metadata slot).
    #[error("corrupt container at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Invalid geometry or out-of-range request against the device.
    #[error("invalid container format: {0}")]
    Format(String),

    /// Malformed request from a caller (bad name, bad flags, cyclic move).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is well-formed but deliberately not supported.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Not enough free data blocks or metadata room.
    #[error("no space left on device")]
    NoSpace,

    /// Path component or entry not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Container was mounted read-only and a mutation was attempted.
    #[error("read-only filesystem")]
    ReadOnly,

    /// A path component is not a directory.
    #[error("not a directory")]
    NotDirectory,

    /// Attempted a file operation on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// rmdir, or rename onto a directory that still has children.
    #[error("directory not empty")]
    NotEmpty,

    /// Entry name longer than 255 bytes.
    #[error("name too long")]
    NameTooLong,

    /// Target already exists (create, mkdir, symlink).
    #[error("file exists")]
    Exists,

    /// Symlink resolution exceeded the hop limit.
    #[error("too many levels of symbolic links")]
    SymlinkLoop,
}

impl CfsError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::ReadOnly => libc::EROFS,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Exists => libc::EEXIST,
            Self::SymlinkLoop => libc::ELOOP,
        }
    }

    /// Shorthand for a corruption report at `block`.
    #[must_use]
    pub fn corruption(block: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            block,
            detail: detail.into(),
        }
    }
}

/// Result alias using `CfsError`.
pub type Result<T> = std::result::Result<T, CfsError>;
