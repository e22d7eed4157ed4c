//! Crash-safe streaming object insertion.
//!
//! Content accumulates in a bounded memory buffer and spills to a locked
//! temp file under `<root>/temp/` once it outgrows the buffer. The commit
//! protocol reserves the computed name in `temp_objects` before touching
//! `data/`, so a crash at any point leaves either a clean store or a
//! reservation GC knows how to clean up.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use fs2::FileExt;
use tracing::debug;

use crate::meta::{
    tx_add_dep, tx_bump_existing_lease, tx_create_object, tx_find_object_id, tx_remove_temp_object,
};
use crate::name::{Name, NameHasher};
use crate::{Result, StoreError, StoreInner};

const WRITER_BUFFER_SIZE: usize = 1 << 16;

struct SpillFile {
    file: File,
    path: PathBuf,
}

/// Streaming writer for a new object. Obtain via
/// [`Session::stream_object`](crate::Session::stream_object), feed it with
/// [`io::Write`], then call [`commit`](ObjectWriter::commit).
pub struct ObjectWriter {
    store: Arc<StoreInner>,
    buffer: Vec<u8>,
    spill: Option<SpillFile>,
    hasher: NameHasher,
    deps: Vec<Name>,
}

impl ObjectWriter {
    pub(crate) fn new(store: Arc<StoreInner>, deps: &[Name]) -> Self {
        let mut deps = deps.to_vec();
        deps.sort();
        let hasher = NameHasher::new(&deps);
        ObjectWriter {
            store,
            buffer: Vec::with_capacity(WRITER_BUFFER_SIZE),
            spill: None,
            hasher,
            deps,
        }
    }

    /// Create the spill file and drain the memory buffer into it.
    ///
    /// The file is advisory-locked before use. GC may unlink an unlocked
    /// temp file between our create and lock, so verify the path still
    /// exists after locking and retry if it is gone.
    fn make_spill(&mut self) -> io::Result<()> {
        let temp_dir = self.store.temp_dir();
        let spill = loop {
            let tmp = tempfile::Builder::new()
                .prefix("tmp-")
                .tempfile_in(&temp_dir)?;
            let (file, path) = tmp.keep().map_err(|e| e.error)?;
            file.lock_exclusive()?;
            match fs::metadata(&path) {
                Ok(_) => break SpillFile { file, path },
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            }
        };
        self.spill = Some(spill);

        let buffered = std::mem::take(&mut self.buffer);
        self.spill
            .as_mut()
            .expect("spill file just created")
            .file
            .write_all(&buffered)?;
        Ok(())
    }

    /// Finalise the object, returning its content-addressed name.
    ///
    /// If an object with the same name already exists its lease is extended
    /// and the buffered data is discarded; the caller cannot tell the two
    /// outcomes apart, which makes concurrent identical writes idempotent.
    pub fn commit(mut self) -> Result<Name> {
        let name = std::mem::replace(&mut self.hasher, NameHasher::new(&[])).finalize();

        let temp_id = self.store.meta().enqueue_temp_object(&name)?;

        // Shard directory can be created optimistically; it is never removed.
        let (object_dir, object_path) = self.store.data_file_path(&name);
        match fs::create_dir(&object_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(StoreError::Io(err)),
        }

        if let Some(spill) = &self.spill {
            spill.file.sync_all()?;
        }

        let lease_time = self.store.lease_deadline();
        let deps = std::mem::take(&mut self.deps);

        // Everything below holds the exclusive write transaction; a failure
        // rolls the reservation back into temp_objects and leaves any spill
        // file behind for GC.
        let store = self.store.clone();
        let result = store.meta().with_immediate_tx(|tx| {
            tx_remove_temp_object(tx, temp_id)?;

            if tx_bump_existing_lease(tx, &name, lease_time)? {
                // Another writer already published this name.
                return Ok(true);
            }

            let object_id = tx_create_object(tx, &name, lease_time)?;
            for dep in &deps {
                let dep_id = tx_find_object_id(tx, dep)?
                    .ok_or_else(|| StoreError::DependencyMissing(dep.to_hex()))?;
                tx_add_dep(tx, object_id, dep_id)?;
            }

            // Data must reach the disk before the row that promises it.
            if self.spill.is_none() {
                self.make_spill()?;
                self.spill
                    .as_ref()
                    .expect("spill file just created")
                    .file
                    .sync_all()?;
            }
            let spill = self.spill.as_ref().expect("spill exists past this point");
            fs::rename(&spill.path, &object_path)?;
            Ok(false)
        });

        match result {
            Ok(deduplicated) => {
                if deduplicated {
                    debug!(name = %name, "object already present, lease extended");
                    if let Some(spill) = self.spill.take() {
                        let _ = fs::remove_file(&spill.path);
                    }
                } else {
                    // Renamed into place; nothing left to clean up.
                    self.spill = None;
                }
                Ok(name)
            }
            Err(err) => {
                // The reservation row is back after rollback; GC owns the
                // spill file now.
                if let Some(spill) = self.spill.take() {
                    drop(spill);
                }
                Err(err)
            }
        }
    }
}

impl Write for ObjectWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.spill.is_none() {
            if self.buffer.len() + buf.len() <= WRITER_BUFFER_SIZE {
                self.buffer.extend_from_slice(buf);
                self.hasher.update(buf);
                return Ok(buf.len());
            }
            self.make_spill()?;
        }

        self.spill
            .as_mut()
            .expect("spill exists past this point")
            .file
            .write_all(buf)?;
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(spill) = &mut self.spill {
            spill.file.flush()?;
        }
        Ok(())
    }
}

impl Drop for ObjectWriter {
    fn drop(&mut self) {
        // An uncommitted writer owns its spill file; committed (or
        // commit-failed) writers have already given it up.
        if let Some(spill) = self.spill.take() {
            let _ = fs::remove_file(&spill.path);
        }
    }
}
