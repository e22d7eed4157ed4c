//! Open-handle registry.
//!
//! A handle is the server-side state behind a kernel file handle id:
//! regular files carry a read-only fd served with positional reads (safe
//! to share across concurrent `READ`s), directories carry the blob fd plus
//! a decode cursor guarded by a mutex.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex, RwLock};

use fuser::FileType;

use hcas_fs::{DirEntry, DIR_HEADER_SIZE, DIR_INDEX_ENTRY_SIZE};

use crate::error::ServeError;
use crate::node::fuse_file_type;

pub(crate) enum Handle {
    Reg(RegHandle),
    Dir(DirHandle),
}

pub(crate) struct RegHandle {
    file: File,
}

impl RegHandle {
    pub(crate) fn new(file: File) -> Self {
        RegHandle { file }
    }

    /// Positional read; short only at end of file.
    pub(crate) fn read(&self, offset: u64, size: u32) -> Result<Vec<u8>, ServeError> {
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

struct DirCursor {
    file: File,
    /// Index of the record the file is positioned at.
    next_index: u32,
}

pub(crate) struct DirHandle {
    cursor: Mutex<DirCursor>,
    entry_count: u32,
}

/// Cookie-space offset of the first real record: 1 and 2 are taken by the
/// synthesised `.` and `..`.
const FIRST_RECORD_COOKIE: i64 = 3;

impl DirHandle {
    /// Validate the directory header and position the fd past the index
    /// table, ready for sequential record decoding.
    pub(crate) fn open(mut file: File) -> Result<Self, ServeError> {
        let mut header = [0u8; DIR_HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        let flags = u32::from_be_bytes(header[0..4].try_into().unwrap());
        if flags != 0 {
            return Err(ServeError::Fs(hcas_fs::FsError::InvalidFormat(
                "unexpected directory flags",
            )));
        }
        let entry_count = u32::from_be_bytes(header[4..8].try_into().unwrap());
        file.seek(SeekFrom::Start(
            DIR_HEADER_SIZE + DIR_INDEX_ENTRY_SIZE * entry_count as u64,
        ))?;

        Ok(DirHandle {
            cursor: Mutex::new(DirCursor {
                file,
                next_index: 0,
            }),
            entry_count,
        })
    }

    fn seek_to_record(cursor: &mut DirCursor, index: u32) -> Result<(), ServeError> {
        cursor.file.seek(SeekFrom::Start(
            DIR_HEADER_SIZE + DIR_INDEX_ENTRY_SIZE * index as u64,
        ))?;
        let mut buf = [0u8; 4];
        cursor.file.read_exact(&mut buf)?;
        cursor.file.seek(SeekFrom::Start(u32::from_be_bytes(buf) as u64))?;
        cursor.next_index = index;
        Ok(())
    }

    /// Fill a readdir buffer starting at the kernel's `offset` cookie.
    ///
    /// `emit` receives `(node id, next cookie, type, name)` and returns
    /// `true` when the reply buffer is full. `.` and `..` are synthesised
    /// ahead of the records.
    pub(crate) fn fill(
        &self,
        node_id: u64,
        offset: i64,
        mut emit: impl FnMut(u64, i64, FileType, &str) -> bool,
    ) -> Result<(), ServeError> {
        if offset == 0 && emit(node_id, 1, FileType::Directory, ".") {
            return Ok(());
        }
        if offset <= 1 && emit(node_id, 2, FileType::Directory, "..") {
            return Ok(());
        }

        let start = if offset < 2 {
            0
        } else {
            (offset - 2) as u32
        };
        if start >= self.entry_count {
            return Ok(());
        }

        let mut cursor = self.cursor.lock().expect("directory cursor poisoned");
        // The kernel seeked this handle; chase the record through the index.
        if start != cursor.next_index {
            Self::seek_to_record(&mut cursor, start)?;
        }

        while cursor.next_index < self.entry_count {
            let entry = DirEntry::decode_from(&mut cursor.file)?;
            let child_id = node_id + entry.parent_depth;
            let next_cookie = cursor.next_index as i64 + FIRST_RECORD_COOKIE;
            if emit(
                child_id,
                next_cookie,
                fuse_file_type(entry.inode.mode),
                &entry.file_name,
            ) {
                // Buffer full before this entry fit; rewind so the next
                // request decodes it again.
                let index = cursor.next_index;
                Self::seek_to_record(&mut cursor, index)?;
                break;
            }
            cursor.next_index += 1;
        }
        Ok(())
    }
}

#[derive(Default)]
struct HandleMap {
    map: HashMap<u64, Arc<Handle>>,
    last_handle_id: u64,
}

/// Registry of open handles keyed by the ids we hand the kernel.
#[derive(Default)]
pub(crate) struct HandleTable {
    inner: RwLock<HandleMap>,
}

impl HandleTable {
    pub(crate) fn insert(&self, handle: Handle) -> u64 {
        let mut inner = self.inner.write().expect("handle table lock poisoned");
        inner.last_handle_id += 1;
        let handle_id = inner.last_handle_id;
        inner.map.insert(handle_id, Arc::new(handle));
        handle_id
    }

    pub(crate) fn get(&self, handle_id: u64) -> Option<Arc<Handle>> {
        let inner = self.inner.read().expect("handle table lock poisoned");
        inner.map.get(&handle_id).cloned()
    }

    pub(crate) fn remove(&self, handle_id: u64) -> Option<Arc<Handle>> {
        let mut inner = self.inner.write().expect("handle table lock poisoned");
        inner.map.remove(&handle_id)
    }
}
