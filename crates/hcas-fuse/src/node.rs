//! Kernel node id bookkeeping.
//!
//! The kernel refers to files by node ids it learned from `LOOKUP`
//! responses and releases them with `FORGET`. This table maps node ids to
//! inode metadata with a reference count per outstanding kernel lookup.
//! Child ids are derived as `parent_id + entry.parent_depth`, which is
//! collision-free within a mounted tree because parent-depth indices are
//! pre-order subtree offsets.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, UNIX_EPOCH};

use fuser::{FileAttr, FileType};
use tracing::warn;

use hcas_fs::InodeData;

pub(crate) const ROOT_NODE_ID: u64 = 1;

const BLOCK_SIZE: u64 = 1024;
/// Directories report a fixed synthetic size; their real blob length is a
/// codec detail the kernel has no use for.
const DIR_SYNTHETIC_SIZE: u64 = 1024;

struct InodeRef {
    inode: InodeData,
    ref_count: i64,
}

pub(crate) struct InodeTable {
    map: RwLock<HashMap<u64, InodeRef>>,
}

impl InodeTable {
    pub(crate) fn new(root: InodeData) -> Self {
        let mut map = HashMap::new();
        map.insert(
            ROOT_NODE_ID,
            InodeRef {
                inode: root,
                ref_count: 1,
            },
        );
        InodeTable {
            map: RwLock::new(map),
        }
    }

    pub(crate) fn get(&self, node_id: u64) -> Option<InodeData> {
        let map = self.map.read().expect("inode table lock poisoned");
        map.get(&node_id).map(|entry| entry.inode.clone())
    }

    /// Record one kernel reference to `node_id`. Must complete before the
    /// lookup response is sent, or a racing `FORGET` could target a node we
    /// don't know yet.
    pub(crate) fn track(&self, node_id: u64, inode: &InodeData) {
        let mut map = self.map.write().expect("inode table lock poisoned");
        match map.get_mut(&node_id) {
            Some(entry) => entry.ref_count += 1,
            None => {
                map.insert(
                    node_id,
                    InodeRef {
                        inode: inode.clone(),
                        ref_count: 1,
                    },
                );
            }
        }
    }

    pub(crate) fn forget(&self, node_id: u64, nlookup: u64) {
        let mut map = self.map.write().expect("inode table lock poisoned");
        let Some(entry) = map.get_mut(&node_id) else {
            warn!(node_id, "forget for unknown node");
            return;
        };
        entry.ref_count -= nlookup as i64;
        if entry.ref_count < 0 {
            warn!(node_id, ref_count = entry.ref_count, "negative node ref count");
        }
        if entry.ref_count <= 0 {
            map.remove(&node_id);
        }
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, node_id: u64) -> bool {
        self.map
            .read()
            .expect("inode table lock poisoned")
            .contains_key(&node_id)
    }
}

pub(crate) fn fuse_file_type(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn ns_to_system_time(ns: u64) -> std::time::SystemTime {
    UNIX_EPOCH + Duration::from_nanos(ns)
}

pub(crate) fn inode_attr(node_id: u64, inode: &InodeData) -> FileAttr {
    let size = if mode_is_dir(inode.mode) {
        DIR_SYNTHETIC_SIZE
    } else {
        inode.size
    };
    FileAttr {
        ino: node_id,
        size,
        blocks: (size + 511) >> 9,
        atime: ns_to_system_time(inode.atime_ns),
        mtime: ns_to_system_time(inode.mtime_ns),
        ctime: ns_to_system_time(inode.ctime_ns),
        crtime: ns_to_system_time(inode.ctime_ns),
        kind: fuse_file_type(inode.mode),
        perm: (inode.mode & 0o7777) as u16,
        nlink: 1,
        uid: inode.uid,
        gid: inode.gid,
        rdev: inode.dev as u32,
        flags: 0,
        blksize: BLOCK_SIZE as u32,
    }
}

fn mode_is_dir(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFDIR
}

/// POSIX access check against the inode's permission classes.
pub(crate) fn test_access(uid_match: bool, gid_match: bool, mode: u32, mask: u32) -> bool {
    let mut effective = mode & 0o7;
    if uid_match {
        effective |= (mode >> 6) & 0o7;
    }
    if gid_match {
        effective |= (mode >> 3) & 0o7;
    }
    mask & effective == mask
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir_inode() -> InodeData {
        InodeData {
            mode: libc::S_IFDIR | 0o755,
            uid: 0,
            gid: 0,
            dev: 0,
            atime_ns: 0,
            mtime_ns: 0,
            ctime_ns: 0,
            size: 0,
            obj: None,
        }
    }

    #[test]
    fn track_and_forget_balance() {
        let table = InodeTable::new(dir_inode());
        let inode = dir_inode();

        table.track(5, &inode);
        table.track(5, &inode);
        assert!(table.get(5).is_some());

        table.forget(5, 1);
        assert!(table.contains(5));
        table.forget(5, 1);
        assert!(!table.contains(5));

        // Root is tracked from the start.
        assert!(table.get(ROOT_NODE_ID).is_some());
    }

    #[test]
    fn forget_unknown_node_is_harmless() {
        let table = InodeTable::new(dir_inode());
        table.forget(99, 3);
        assert!(table.get(ROOT_NODE_ID).is_some());
    }

    #[test]
    fn batched_forget_removes_in_one_step() {
        let table = InodeTable::new(dir_inode());
        let inode = dir_inode();
        for _ in 0..4 {
            table.track(7, &inode);
        }
        table.forget(7, 4);
        assert!(!table.contains(7));
    }

    #[test]
    fn access_checks_permission_classes() {
        let mode = libc::S_IFREG | 0o640;
        // Owner: read+write, no execute.
        assert!(test_access(true, false, mode, 0o4));
        assert!(test_access(true, false, mode, 0o6));
        assert!(!test_access(true, false, mode, 0o1));
        // Group: read only.
        assert!(test_access(false, true, mode, 0o4));
        assert!(!test_access(false, true, mode, 0o2));
        // Other: nothing.
        assert!(!test_access(false, false, mode, 0o4));
        // Existence check always passes.
        assert!(test_access(false, false, mode, 0));
    }

    #[test]
    fn directory_attrs_use_synthetic_size() {
        let attr = inode_attr(1, &dir_inode());
        assert_eq!(attr.size, 1024);
        assert_eq!(attr.kind, FileType::Directory);

        let mut file = dir_inode();
        file.mode = libc::S_IFREG | 0o644;
        file.size = 3000;
        let attr = inode_attr(2, &file);
        assert_eq!(attr.size, 3000);
        assert_eq!(attr.blocks, (3000 + 511) >> 9);
        assert_eq!(attr.kind, FileType::RegularFile);
    }
}
