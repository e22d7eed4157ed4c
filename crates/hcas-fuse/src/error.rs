//! Handler error to FUSE errno translation.

use std::io;

use libc::c_int;

use hcas_fs::FsError;
use hcas_store::StoreError;

/// Error raised by a request handler, carrying enough to pick an errno.
#[derive(Debug)]
pub(crate) enum ServeError {
    /// A bare errno, for conditions like `ENOENT` and `EBADF`.
    Errno(c_int),
    Fs(FsError),
    Store(StoreError),
    Io(io::Error),
}

impl ServeError {
    pub(crate) fn errno(&self) -> c_int {
        match self {
            ServeError::Errno(errno) => *errno,
            ServeError::Fs(err) => fs_errno(err),
            ServeError::Store(err) => store_errno(err),
            ServeError::Io(err) => io_errno(err),
        }
    }
}

fn io_errno(err: &io::Error) -> c_int {
    err.raw_os_error().unwrap_or(libc::EIO)
}

fn store_errno(err: &StoreError) -> c_int {
    match err {
        StoreError::NotFound(_) => libc::ENOENT,
        StoreError::Io(err) => io_errno(err),
        _ => libc::EIO,
    }
}

fn fs_errno(err: &FsError) -> c_int {
    match err {
        FsError::Store(err) => store_errno(err),
        FsError::Io(err) => io_errno(err),
        FsError::Sys(errno) => *errno as c_int,
        _ => libc::EIO,
    }
}

impl From<FsError> for ServeError {
    fn from(err: FsError) -> Self {
        ServeError::Fs(err)
    }
}

impl From<StoreError> for ServeError {
    fn from(err: StoreError) -> Self {
        ServeError::Store(err)
    }
}

impl From<io::Error> for ServeError {
    fn from(err: io::Error) -> Self {
        ServeError::Io(err)
    }
}
