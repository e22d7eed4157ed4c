//! Import a tar stream into the store.
//!
//! The archive is consumed in one pass: file bodies stream straight into
//! object writers while an in-memory skeleton of the tree accumulates
//! inode metadata. Hard links resolve after the stream ends, then
//! directory blobs are built bottom-up so each directory depends on its
//! children's objects.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read};

use tar::{Archive, EntryType, Header};
use tracing::warn;

use hcas_store::{Name, Session};

use crate::dir::DirBuilder;
use crate::inode::{is_reg, InodeData};
use crate::{validate_file_name, FsError, Result};

#[derive(Clone)]
struct TreeNode {
    inode: InodeData,
    tree_size: u64,
}

enum Child {
    Leaf(TreeNode),
    /// A subdirectory, keyed by its full path in `dirs`.
    Subdir(String),
}

struct DirNode {
    inode: InodeData,
    children: BTreeMap<String, Child>,
}

struct PendingHardlink {
    dir_path: String,
    file_name: String,
    target: String,
}

fn tar_mode_bits(entry_type: EntryType) -> u32 {
    match entry_type {
        EntryType::Regular | EntryType::GNUSparse | EntryType::Continuous | EntryType::Link => {
            libc::S_IFREG
        }
        EntryType::Directory => libc::S_IFDIR,
        EntryType::Symlink => libc::S_IFLNK,
        EntryType::Char => libc::S_IFCHR,
        EntryType::Block => libc::S_IFBLK,
        EntryType::Fifo => libc::S_IFIFO,
        _ => libc::S_IFREG,
    }
}

fn inode_from_header(header: &Header, link_target: Option<&[u8]>) -> Result<InodeData> {
    let mtime_ns = header.mtime()? * 1_000_000_000;
    let (atime_ns, ctime_ns) = match header.as_gnu() {
        Some(gnu) => (
            gnu.atime().map(|t| t * 1_000_000_000).unwrap_or(mtime_ns),
            gnu.ctime().map(|t| t * 1_000_000_000).unwrap_or(mtime_ns),
        ),
        None => (mtime_ns, mtime_ns),
    };

    let size = match link_target {
        Some(target) => target.len() as u64,
        None => header.size()?,
    };

    Ok(InodeData {
        mode: (header.mode()? & 0o7777) | tar_mode_bits(header.entry_type()),
        uid: header.uid()? as u32,
        gid: header.gid()? as u32,
        dev: 0,
        atime_ns,
        mtime_ns,
        ctime_ns,
        size,
        obj: None,
    })
}

/// Normalise an archive path to an absolute `/a/b/c` form. Returns `None`
/// when any segment is not a valid filename.
fn clean_entry_path(raw: &str) -> Option<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                segments.pop();
            }
            name => {
                if !validate_file_name(name) {
                    return None;
                }
                segments.push(name);
            }
        }
    }
    Some(format!("/{}", segments.join("/")))
}

fn split_dir_file(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(at) => (path[..at].to_string(), path[at + 1..].to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

fn stream_tar_regular<R: Read>(session: &Session, entry: &mut tar::Entry<'_, R>) -> Result<Name> {
    let mut writer = session.stream_object(&[]);
    io::copy(entry, &mut writer)?;
    Ok(writer.commit()?)
}

fn default_root_inode() -> InodeData {
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

/// Import a tar archive, returning the root directory object.
///
/// Directories must be listed before their contents; an entry whose parent
/// has not been seen fails with [`FsError::OutOfOrderArchive`].
pub fn import_tar<R: Read>(session: &Session, reader: R) -> Result<Name> {
    let mut archive = Archive::new(reader);

    let mut dirs: HashMap<String, DirNode> = HashMap::new();
    dirs.insert(
        "/".to_string(),
        DirNode {
            inode: default_root_inode(),
            children: BTreeMap::new(),
        },
    );
    let mut hardlinks: Vec<PendingHardlink> = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let entry_type = entry.header().entry_type();

        let Some(path) = clean_entry_path(&raw_path) else {
            warn!(path = %raw_path, "skipping entry with invalid path");
            continue;
        };

        let link_target: Option<Vec<u8>> = entry.link_name_bytes().map(|t| t.into_owned());

        if path == "/" {
            // Metadata for the import root itself.
            if entry_type == EntryType::Directory {
                let inode = inode_from_header(entry.header(), None)?;
                dirs.get_mut("/").expect("root always present").inode = inode;
            } else {
                warn!(path = %raw_path, "skipping non-directory entry for the archive root");
            }
            continue;
        }

        let (dir_path, file_name) = split_dir_file(&path);
        let mut inode = inode_from_header(
            entry.header(),
            match entry_type {
                EntryType::Symlink => link_target.as_deref(),
                _ => None,
            },
        )?;

        let mut tree_node = None;
        match entry_type {
            EntryType::Regular | EntryType::GNUSparse | EntryType::Continuous => {
                inode.obj = Some(stream_tar_regular(session, &mut entry)?);
                tree_node = Some(TreeNode { inode, tree_size: 1 });
            }
            EntryType::Directory => {
                // Re-listed directories keep their children, new metadata.
                match dirs.entry(path.clone()) {
                    MapEntry::Occupied(mut existing) => existing.get_mut().inode = inode,
                    MapEntry::Vacant(vacant) => {
                        vacant.insert(DirNode {
                            inode,
                            children: BTreeMap::new(),
                        });
                    }
                }
            }
            EntryType::Symlink => {
                let target = link_target.unwrap_or_default();
                inode.obj = Some(session.create_object(&target, &[])?);
                tree_node = Some(TreeNode { inode, tree_size: 1 });
            }
            EntryType::Link => {
                let target = String::from_utf8_lossy(&link_target.unwrap_or_default()).into_owned();
                hardlinks.push(PendingHardlink {
                    dir_path: dir_path.clone(),
                    file_name: file_name.clone(),
                    target,
                });
                // Placeholder until the link resolves against its target.
                tree_node = Some(TreeNode { inode, tree_size: 1 });
            }
            EntryType::Char | EntryType::Block => {
                let major = entry.header().device_major()?.unwrap_or(0) as u64;
                let minor = entry.header().device_minor()?.unwrap_or(0) as u64;
                inode.dev = (major << 8) | minor;
                tree_node = Some(TreeNode { inode, tree_size: 1 });
            }
            EntryType::Fifo => {
                tree_node = Some(TreeNode { inode, tree_size: 1 });
            }
            other => {
                warn!(path = %raw_path, entry_type = ?other, "skipping unsupported entry type");
                continue;
            }
        }

        let parent = dirs
            .get_mut(&dir_path)
            .ok_or_else(|| FsError::OutOfOrderArchive(path.clone()))?;
        match tree_node {
            Some(node) => {
                parent.children.insert(file_name, Child::Leaf(node));
            }
            None => {
                parent.children.insert(file_name, Child::Subdir(path));
            }
        }
    }

    for (dir_path, file_name, node) in resolve_hardlinks(&dirs, &hardlinks)? {
        if let Some(parent) = dirs.get_mut(&dir_path) {
            parent.children.insert(file_name, Child::Leaf(node));
        }
    }

    build_tree(session, dirs)
}

/// Replace each hard link's inode with its target's, so both entries share
/// the object and metadata.
fn resolve_hardlinks(
    dirs: &HashMap<String, DirNode>,
    hardlinks: &[PendingHardlink],
) -> Result<Vec<(String, String, TreeNode)>> {
    let mut resolved = Vec::with_capacity(hardlinks.len());
    for link in hardlinks {
        let Some(target) = clean_entry_path(&format!("/{}", link.target)) else {
            return Err(FsError::BrokenHardLink(link.target.clone()));
        };
        let (target_dir, target_name) = split_dir_file(&target);

        let node = dirs
            .get(&target_dir)
            .and_then(|dir| dir.children.get(&target_name))
            .and_then(|child| match child {
                Child::Leaf(node) => Some(node.clone()),
                Child::Subdir(_) => None,
            })
            .ok_or_else(|| FsError::BrokenHardLink(link.target.clone()))?;

        if !is_reg(node.inode.mode) {
            return Err(FsError::BrokenHardLink(link.target.clone()));
        }
        resolved.push((link.dir_path.clone(), link.file_name.clone(), node));
    }
    Ok(resolved)
}

/// Build directory blobs bottom-up (longest paths first, so children exist
/// before their parents) and return the root object name.
fn build_tree(session: &Session, mut dirs: HashMap<String, DirNode>) -> Result<Name> {
    let mut paths: Vec<String> = dirs.keys().cloned().collect();
    paths.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| b.cmp(a)));

    let mut built: HashMap<String, TreeNode> = HashMap::new();
    for path in paths {
        let dir = dirs.remove(&path).expect("every path maps to a directory");
        let mut builder = DirBuilder::new();
        for (name, child) in dir.children {
            let node = match child {
                Child::Leaf(node) => node,
                Child::Subdir(subdir_path) => built
                    .remove(&subdir_path)
                    .expect("children are built before parents"),
            };
            builder.insert(&name, node.inode, node.tree_size);
        }

        let result = builder.build();
        let obj = session.create_object(&result.blob, &result.deps)?;

        let mut inode = dir.inode;
        inode.obj = Some(obj);
        built.insert(
            path,
            TreeNode {
                inode,
                tree_size: result.tree_size,
            },
        );
    }

    let root = built.remove("/").expect("root always present");
    Ok(root.inode.obj.expect("root was just built"))
}
