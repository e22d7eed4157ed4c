//! Directory blob assembly and name lookup.
//!
//! Blob layout: a 16-byte header (4-byte flags, must be zero; 4-byte entry
//! count; 8-byte total subtree size), an index of `(record offset, filename
//! CRC32)` pairs sorted by CRC, then the 8-byte-aligned entry records.
//! Lookup interpolation-searches the CRC index and resolves collisions by
//! decoding the neighbouring records with the same CRC.

use std::io::{Read, Seek, SeekFrom};

use hcas_store::Name;

use crate::inode::{DirEntry, InodeData, DIR_HEADER_SIZE, DIR_INDEX_ENTRY_SIZE};
use crate::{FsError, Result};

struct PendingEntry {
    entry: DirEntry,
    tree_size: u64,
}

/// Collects directory entries and encodes them into a directory blob.
///
/// The builder owns its entries and the dependency list and is consumed by
/// [`build`](DirBuilder::build), which hands both to the caller for the
/// object writer.
#[derive(Default)]
pub struct DirBuilder {
    entries: Vec<PendingEntry>,
    deps: Vec<Name>,
}

/// Result of [`DirBuilder::build`]: the encoded blob, the object names the
/// directory depends on, and the directory's own subtree size.
pub struct BuiltDir {
    pub blob: Vec<u8>,
    pub deps: Vec<Name>,
    pub tree_size: u64,
}

impl DirBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one child. `tree_size` is 1 for non-directories and the child's
    /// own subtree size for directories.
    pub fn insert(&mut self, file_name: &str, inode: InodeData, tree_size: u64) {
        if let Some(obj) = &inode.obj {
            self.deps.push(*obj);
        }
        let name_crc = crc32fast::hash(file_name.as_bytes());
        self.entries.push(PendingEntry {
            entry: DirEntry {
                inode,
                file_name: file_name.to_string(),
                name_crc,
                parent_depth: 0,
            },
            tree_size,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn build(mut self) -> BuiltDir {
        // Stable sort: colliding CRCs keep insertion order, and lookup
        // walks the whole run of equal CRCs.
        self.entries.sort_by_key(|e| e.entry.name_crc);

        let mut parent_depth = 1u64;
        for pending in &mut self.entries {
            pending.entry.parent_depth = parent_depth;
            parent_depth += pending.tree_size;
        }
        let total_size: u64 = self.entries.iter().map(|e| e.tree_size).sum();

        let header_size =
            DIR_HEADER_SIZE as usize + self.entries.len() * DIR_INDEX_ENTRY_SIZE as usize;
        let mut blob = vec![0u8; header_size];

        let mut positions = Vec::with_capacity(self.entries.len());
        for pending in &self.entries {
            positions.push(blob.len() as u32);
            blob.extend(pending.entry.encode());
        }

        blob[0..4].copy_from_slice(&0u32.to_be_bytes());
        blob[4..8].copy_from_slice(&(self.entries.len() as u32).to_be_bytes());
        blob[8..16].copy_from_slice(&total_size.to_be_bytes());
        for (i, pending) in self.entries.iter().enumerate() {
            let at = DIR_HEADER_SIZE as usize + i * DIR_INDEX_ENTRY_SIZE as usize;
            blob[at..at + 4].copy_from_slice(&positions[i].to_be_bytes());
            blob[at + 4..at + 8].copy_from_slice(&pending.entry.name_crc.to_be_bytes());
        }

        BuiltDir {
            blob,
            deps: self.deps,
            tree_size: 1 + total_size,
        }
    }
}

fn read_index_entry<R: Read + Seek>(reader: &mut R, index: u32) -> Result<(u32, u32)> {
    reader.seek(SeekFrom::Start(
        DIR_HEADER_SIZE + DIR_INDEX_ENTRY_SIZE * index as u64,
    ))?;
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    let position = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let crc = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    Ok((position, crc))
}

fn decode_at<R: Read + Seek>(reader: &mut R, position: u32, name: &str) -> Result<Option<DirEntry>> {
    reader.seek(SeekFrom::Start(position as u64))?;
    let entry = DirEntry::decode_from(reader)?;
    if entry.file_name == name {
        Ok(Some(entry))
    } else {
        Ok(None)
    }
}

/// Find the entry for `name` in a directory blob, or `None`.
///
/// Safe for concurrent callers as long as each brings its own reader; the
/// blob itself is immutable.
pub fn lookup_child<R: Read + Seek>(reader: &mut R, name: &str) -> Result<Option<DirEntry>> {
    reader.seek(SeekFrom::Start(0))?;
    let mut header = [0u8; DIR_HEADER_SIZE as usize];
    reader.read_exact(&mut header)?;

    let flags = u32::from_be_bytes(header[0..4].try_into().unwrap());
    if flags != 0 {
        return Err(FsError::InvalidFormat("unexpected directory flags"));
    }
    let entry_count = u32::from_be_bytes(header[4..8].try_into().unwrap());

    let crc = crc32fast::hash(name.as_bytes());

    // Interpolation search: CRCs of real filenames are uniform enough that
    // guessing by linear proportion converges in a couple of probes.
    let mut lo = 0u32;
    let mut hi = entry_count;
    let mut lo_crc = 0u32;
    let mut hi_crc = u32::MAX;

    let (matched, position) = loop {
        if lo == hi {
            return Ok(None);
        }

        let span = (hi_crc - lo_crc) as u64;
        let mut index = if span == 0 {
            lo
        } else {
            lo + (((crc - lo_crc) as u64 * (hi - lo) as u64) / span) as u32
        };
        if index == hi {
            index -= 1;
        }

        let (position, entry_crc) = read_index_entry(reader, index)?;
        if entry_crc < crc {
            lo = index + 1;
            lo_crc = entry_crc;
        } else if entry_crc > crc {
            hi = index;
            hi_crc = entry_crc;
        } else {
            break (index, position);
        }
    };

    if let Some(entry) = decode_at(reader, position, name)? {
        return Ok(Some(entry));
    }

    // The guess landed somewhere inside a run of colliding CRCs; scan the
    // rest of the run in both directions.
    for index in matched + 1..hi {
        let (position, entry_crc) = read_index_entry(reader, index)?;
        if entry_crc != crc {
            break;
        }
        if let Some(entry) = decode_at(reader, position, name)? {
            return Ok(Some(entry));
        }
    }
    for index in (lo..matched).rev() {
        let (position, entry_crc) = read_index_entry(reader, index)?;
        if entry_crc != crc {
            break;
        }
        if let Some(entry) = decode_at(reader, position, name)? {
            return Ok(Some(entry));
        }
    }

    Ok(None)
}
