//! # hcas-store
//!
//! Hierarchical content-addressable storage.
//!
//! Objects are immutable byte blobs named by a SHA-256 digest over their
//! content and their dependency list, so tree-like data can be stored with
//! structural sharing. An object stays alive while anything references it:
//! a dependency edge from another object, a label, or an unexpired lease.
//! Unreferenced objects are reclaimed by [`Store::garbage_collect`]; there
//! is no direct delete.
//!
//! ## On-disk layout
//!
//! ```text
//! <root>/
//! ├── metadata.sqlite   # objects, deps, labels, temp reservations
//! ├── data/
//! │   └── ab/
//! │       └── cdef...   # blob named abcdef..., 2-char shard dirs
//! └── temp/             # in-flight writer spill files
//! ```

mod gc;
mod meta;
mod name;
mod session;
mod writer;

pub use name::{Name, NameHasher};
pub use session::Session;
pub use writer::ObjectWriter;

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use meta::MetaStore;

pub const DATA_DIR: &str = "data";
pub const TEMP_DIR: &str = "temp";
pub const METADATA_FILE: &str = "metadata.sqlite";

/// Errors from store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object name")]
    InvalidName,

    #[error("dependency does not exist: {0}")]
    DependencyMissing(String),

    #[error("unsupported metadata version {found}, expected {}", meta::VERSION_LATEST)]
    VersionMismatch { found: i64 },

    #[error("metadata store busy")]
    StoreBusy,

    #[error("metadata error: {0}")]
    StoreIo(rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(e, _) = &err {
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return StoreError::StoreBusy;
            }
        }
        StoreError::StoreIo(err)
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Tunables for a store instance.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How long a freshly created or touched object is protected from GC.
    pub object_lease: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            object_lease: Duration::from_secs(60 * 60),
        }
    }
}

pub(crate) struct StoreInner {
    base_path: PathBuf,
    meta: MetaStore,
    options: StoreOptions,
}

impl StoreInner {
    pub(crate) fn meta(&self) -> &MetaStore {
        &self.meta
    }

    pub(crate) fn temp_dir(&self) -> PathBuf {
        self.base_path.join(TEMP_DIR)
    }

    pub(crate) fn data_dir(&self) -> PathBuf {
        self.base_path.join(DATA_DIR)
    }

    /// Shard directory and final blob path for a name.
    pub(crate) fn data_file_path(&self, name: &Name) -> (PathBuf, PathBuf) {
        let hex = name.to_hex();
        let dir = self.base_path.join(DATA_DIR).join(&hex[..2]);
        let path = dir.join(&hex[2..]);
        (dir, path)
    }

    /// Lease deadline for objects created or touched now.
    pub(crate) fn lease_deadline(&self) -> i64 {
        now_millis() + self.options.object_lease.as_millis() as i64
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A content-addressable store rooted at a directory.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Create a store at `path`, or open it if one already exists there.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::create_with(path, StoreOptions::default())
    }

    pub fn create_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let base_path = abs_path(path.as_ref())?;
        mkdir_tolerant(&base_path)?;
        mkdir_tolerant(&base_path.join(TEMP_DIR))?;
        mkdir_tolerant(&base_path.join(DATA_DIR))?;

        let meta = MetaStore::open(&base_path.join(METADATA_FILE), true)?;
        Ok(Store {
            inner: Arc::new(StoreInner {
                base_path,
                meta,
                options,
            }),
        })
    }

    /// Open an existing store; fails if the metadata database is missing or
    /// written by a different schema version.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, StoreOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let base_path = abs_path(path.as_ref())?;
        let db_path = base_path.join(METADATA_FILE);
        if !db_path.exists() {
            return Err(StoreError::NotFound(base_path.display().to_string()));
        }
        let meta = MetaStore::open(&db_path, false)?;
        Ok(Store {
            inner: Arc::new(StoreInner {
                base_path,
                meta,
                options,
            }),
        })
    }

    /// Open a short-lived scope for reading and creating objects. Accessing
    /// an object through the session refreshes its lease, protecting it
    /// from GC for the lease window.
    pub fn session(&self) -> Session {
        Session::new(self.inner.clone())
    }

    pub fn base_path(&self) -> &Path {
        &self.inner.base_path
    }

    pub fn data_dir(&self) -> PathBuf {
        self.inner.data_dir()
    }

    /// Path of an object's blob, whether or not it exists.
    pub fn object_path(&self, name: &Name) -> PathBuf {
        self.inner.data_file_path(name).1
    }

    /// Open an object's blob read-only.
    pub fn object_open(&self, name: &Name) -> Result<File> {
        let path = self.object_path(name);
        File::open(&path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(name.to_hex()),
            _ => StoreError::Io(err),
        })
    }

    /// Run garbage collection.
    ///
    /// `budget` bounds the number of rows deleted plus files removed;
    /// `None` runs to completion. Returns `true` if a full pass finished
    /// within the budget.
    pub fn garbage_collect(&self, budget: Option<u64>) -> Result<bool> {
        gc::garbage_collect(&self.inner, budget)
    }
}

fn abs_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn mkdir_tolerant(path: &Path) -> Result<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(StoreError::Io(err)),
    }
}
