//! Inode metadata and the directory-entry record codec.
//!
//! Record layout (all integers big-endian):
//!
//! ```text
//! [0..4)    mode          [44..52)  size
//! [4..8)    uid           [52..84)  object name (zero when absent)
//! [8..12)   gid           [84..92)  parent-depth index
//! [12..20)  device        [92..96)  filename length
//! [20..28)  atime ns      [96..)    filename bytes, NUL-padded so the
//! [28..36)  mtime ns                record ends on an 8-byte boundary
//! [36..44)  ctime ns
//! ```

use std::io::Read;

use hcas_store::Name;

use crate::{validate_file_name, FsError, Result, NAME_MAX};

/// Directory blob header: flags, entry count, total subtree size.
pub const DIR_HEADER_SIZE: u64 = 16;
/// One index entry: record offset plus filename CRC32.
pub const DIR_INDEX_ENTRY_SIZE: u64 = 8;

const RECORD_FIXED_SIZE: usize = 96;

pub(crate) fn file_type_bits(mode: u32) -> u32 {
    mode & libc::S_IFMT
}

pub(crate) fn is_dir(mode: u32) -> bool {
    file_type_bits(mode) == libc::S_IFDIR
}

pub(crate) fn is_reg(mode: u32) -> bool {
    file_type_bits(mode) == libc::S_IFREG
}

/// Regular files, directories, and symlinks carry object data; device
/// nodes, FIFOs, and sockets are inode metadata only.
fn mode_has_object(mode: u32) -> bool {
    matches!(
        file_type_bits(mode),
        libc::S_IFREG | libc::S_IFDIR | libc::S_IFLNK
    )
}

/// Stat-shaped metadata stored for every directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeData {
    /// Unix type and permission bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Device number, for character and block devices.
    pub dev: u64,
    pub atime_ns: u64,
    pub mtime_ns: u64,
    pub ctime_ns: u64,
    pub size: u64,
    /// Backing object; present exactly for regular files, directories, and
    /// symlinks.
    pub obj: Option<Name>,
}

/// One decoded directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: InodeData,
    pub file_name: String,
    /// CRC32 (IEEE) of the filename; the directory index sort key.
    pub name_crc: u32,
    /// Pre-order offset of this entry's subtree root within the parent's
    /// subtree; added to a parent node id it yields the child's node id.
    pub parent_depth: u64,
}

impl DirEntry {
    pub(crate) fn encoded_len(&self) -> usize {
        (RECORD_FIXED_SIZE + self.file_name.len() + 7) & !7
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        buf[0..4].copy_from_slice(&self.inode.mode.to_be_bytes());
        buf[4..8].copy_from_slice(&self.inode.uid.to_be_bytes());
        buf[8..12].copy_from_slice(&self.inode.gid.to_be_bytes());
        buf[12..20].copy_from_slice(&self.inode.dev.to_be_bytes());
        buf[20..28].copy_from_slice(&self.inode.atime_ns.to_be_bytes());
        buf[28..36].copy_from_slice(&self.inode.mtime_ns.to_be_bytes());
        buf[36..44].copy_from_slice(&self.inode.ctime_ns.to_be_bytes());
        buf[44..52].copy_from_slice(&self.inode.size.to_be_bytes());
        if let Some(obj) = &self.inode.obj {
            buf[52..84].copy_from_slice(obj.as_bytes());
        }
        buf[84..92].copy_from_slice(&self.parent_depth.to_be_bytes());
        buf[92..96].copy_from_slice(&(self.file_name.len() as u32).to_be_bytes());
        buf[96..96 + self.file_name.len()].copy_from_slice(self.file_name.as_bytes());
        buf
    }

    /// Decode one record from a reader positioned at its start, consuming
    /// the trailing padding so sequential decodes stay aligned.
    pub fn decode_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut fixed = [0u8; RECORD_FIXED_SIZE];
        reader.read_exact(&mut fixed)?;

        let mode = u32::from_be_bytes(fixed[0..4].try_into().unwrap());
        let name_len = u32::from_be_bytes(fixed[92..96].try_into().unwrap()) as usize;
        if name_len == 0 || name_len > NAME_MAX {
            return Err(FsError::InvalidFormat("bad filename length"));
        }

        let obj = if mode_has_object(mode) {
            Some(Name::from_bytes(&fixed[52..84]).expect("slice is 32 bytes"))
        } else {
            None
        };

        let padded_len = (RECORD_FIXED_SIZE + name_len + 7) & !7;
        let mut tail = vec![0u8; padded_len - RECORD_FIXED_SIZE];
        reader.read_exact(&mut tail)?;
        tail.truncate(name_len);
        let file_name =
            String::from_utf8(tail).map_err(|_| FsError::InvalidFormat("non-UTF-8 filename"))?;
        if !validate_file_name(&file_name) {
            return Err(FsError::InvalidFormat("bad filename"));
        }
        let name_crc = crc32fast::hash(file_name.as_bytes());

        Ok(DirEntry {
            inode: InodeData {
                mode,
                uid: u32::from_be_bytes(fixed[4..8].try_into().unwrap()),
                gid: u32::from_be_bytes(fixed[8..12].try_into().unwrap()),
                dev: u64::from_be_bytes(fixed[12..20].try_into().unwrap()),
                atime_ns: u64::from_be_bytes(fixed[20..28].try_into().unwrap()),
                mtime_ns: u64::from_be_bytes(fixed[28..36].try_into().unwrap()),
                ctime_ns: u64::from_be_bytes(fixed[36..44].try_into().unwrap()),
                size: u64::from_be_bytes(fixed[44..52].try_into().unwrap()),
                obj,
            },
            file_name,
            name_crc,
            parent_depth: u64::from_be_bytes(fixed[84..92].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_inode(mode: u32, obj: Option<Name>) -> InodeData {
        InodeData {
            mode,
            uid: 1000,
            gid: 100,
            dev: 0,
            atime_ns: 1_700_000_000_123_456_789,
            mtime_ns: 1_700_000_001_000_000_000,
            ctime_ns: 1_700_000_002_999_999_999,
            size: 42,
            obj,
        }
    }

    #[test]
    fn record_roundtrip() {
        let obj = Name::compute(b"content", &[]);
        let entry = DirEntry {
            inode: sample_inode(libc::S_IFREG | 0o644, Some(obj)),
            file_name: "hello.txt".to_string(),
            name_crc: crc32fast::hash(b"hello.txt"),
            parent_depth: 7,
        };

        let encoded = entry.encode();
        assert_eq!(encoded.len() % 8, 0);

        let decoded = DirEntry::decode_from(&mut Cursor::new(&encoded)).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn device_entry_has_no_object() {
        let mut inode = sample_inode(libc::S_IFCHR | 0o600, None);
        inode.dev = (5 << 8) | 1;
        let entry = DirEntry {
            inode,
            file_name: "tty1".to_string(),
            name_crc: crc32fast::hash(b"tty1"),
            parent_depth: 1,
        };

        let decoded = DirEntry::decode_from(&mut Cursor::new(entry.encode())).unwrap();
        assert_eq!(decoded.inode.obj, None);
        assert_eq!(decoded.inode.dev, (5 << 8) | 1);
        assert_eq!(decoded, entry);
    }

    #[test]
    fn sequential_decode_stays_aligned() {
        // Name lengths chosen so each record carries nonzero padding.
        let names = ["a", "ab", "abcde"];
        let mut buf = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let entry = DirEntry {
                inode: sample_inode(libc::S_IFREG | 0o644, Some(Name::compute(b"x", &[]))),
                file_name: name.to_string(),
                name_crc: crc32fast::hash(name.as_bytes()),
                parent_depth: i as u64 + 1,
            };
            buf.extend(entry.encode());
        }

        let mut cursor = Cursor::new(&buf);
        for name in names {
            let decoded = DirEntry::decode_from(&mut cursor).unwrap();
            assert_eq!(decoded.file_name, name);
        }
    }

    #[test]
    fn invalid_filename_bytes_rejected() {
        // encode() trusts its caller; decode must still refuse a blob whose
        // filename carries a path separator.
        let entry = DirEntry {
            inode: sample_inode(libc::S_IFREG | 0o644, Some(Name::compute(b"x", &[]))),
            file_name: "evil/name".to_string(),
            name_crc: crc32fast::hash(b"evil/name"),
            parent_depth: 1,
        };
        let result = DirEntry::decode_from(&mut Cursor::new(entry.encode()));
        assert!(matches!(result, Err(FsError::InvalidFormat(_))));
    }

    #[test]
    fn truncated_record_fails() {
        let entry = DirEntry {
            inode: sample_inode(libc::S_IFREG | 0o644, Some(Name::compute(b"x", &[]))),
            file_name: "file".to_string(),
            name_crc: crc32fast::hash(b"file"),
            parent_depth: 1,
        };
        let encoded = entry.encode();
        let result = DirEntry::decode_from(&mut Cursor::new(&encoded[..40]));
        assert!(result.is_err());
    }
}
