//! # hcas-fs
//!
//! Filesystem trees on top of the hcas object store.
//!
//! A directory is encoded as a single blob holding a checksum-indexed entry
//! table (see [`dir`]); file and symlink bodies are plain objects referenced
//! by name. The importers in [`import_fs`] and [`import_tar`] turn a local
//! directory or a tar stream into such a tree, bottom-up, so every
//! directory blob depends on the objects of its children.

mod dir;
mod import_fs;
mod import_tar;
mod inode;

pub use dir::{lookup_child, BuiltDir, DirBuilder};
pub use import_fs::import_path;
pub use import_tar::import_tar;
pub use inode::{DirEntry, InodeData, DIR_HEADER_SIZE, DIR_INDEX_ENTRY_SIZE};

use std::io;

use thiserror::Error;

use hcas_store::StoreError;

/// Maximum filename length in bytes.
pub const NAME_MAX: usize = 255;

/// Errors from codec and import operations.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("invalid file name {0:?}")]
    InvalidName(String),

    #[error("invalid directory format: {0}")]
    InvalidFormat(&'static str),

    #[error("file type changed while importing")]
    UnexpectedFileType,

    #[error("file size changed while importing")]
    SizeChanged,

    #[error("archive contains broken hard link to {0:?}")]
    BrokenHardLink(String),

    #[error("archive entry {0:?} appears before its parent directory")]
    OutOfOrderArchive(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("system error: {0}")]
    Sys(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// A filename is valid if it is non-empty, at most [`NAME_MAX`] bytes, and
/// contains neither NUL nor `/`.
pub fn validate_file_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= NAME_MAX && !name.bytes().any(|b| b == 0 || b == b'/')
}
