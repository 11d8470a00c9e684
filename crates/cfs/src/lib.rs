#![forbid(unsafe_code)]
//! CanFS public API.
//!
//! A whole filesystem (directories, regular files, symbolic links) kept in
//! one container file or in memory. Start with [`Container::format`] or
//! [`Container::mount`]; serve it to the kernel with the `cfs-fuse` crate.

pub use cfs_core::*;
