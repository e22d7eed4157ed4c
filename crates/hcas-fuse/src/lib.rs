//! # hcas-fuse
//!
//! Read-only FUSE server over an hcas file tree.
//!
//! The mounted root is a directory object in the store; every kernel
//! request translates into reads of immutable blobs under the store's
//! `data/` directory. Requests are dispatched to their own worker thread,
//! so handlers are free to block on file and metadata I/O; shared state is
//! limited to the reader-writer-locked inode and handle tables.

mod error;
mod handle;
mod node;

use std::ffi::OsStr;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fuser::{
    Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyXattr, Request,
};
use tracing::{debug, info};

use hcas_fs::{lookup_child, InodeData};
use hcas_store::{Name, Store};

use error::ServeError;
use handle::{DirHandle, Handle, HandleTable, RegHandle};
use node::{inode_attr, test_access, InodeTable};

/// How long the kernel may cache entries and attributes; the tree is
/// immutable for the lifetime of the mount.
const TTL: Duration = Duration::from_secs(60 * 60);

const GENERATION: u64 = 1;

/// Mount-time configuration.
#[derive(Debug, Clone, Default)]
pub struct MountConfig {
    /// Let users other than the mounting one access the mount.
    pub allow_other: bool,
}

struct MountState {
    data_dir: PathBuf,
    inodes: InodeTable,
    handles: HandleTable,
}

type ServeResult<T> = Result<T, ServeError>;

impl MountState {
    fn open_object(&self, name: &Name) -> ServeResult<File> {
        let hex = name.to_hex();
        let path = self.data_dir.join(&hex[..2]).join(&hex[2..]);
        Ok(File::open(path)?)
    }

    /// Open the blob behind an inode; absent objects (device nodes, FIFOs)
    /// have nothing to open.
    fn open_inode_object(&self, inode: &InodeData) -> ServeResult<File> {
        let name = inode.obj.as_ref().ok_or(ServeError::Errno(libc::EIO))?;
        self.open_object(name)
    }

    fn get_inode(&self, node_id: u64) -> ServeResult<InodeData> {
        self.inodes
            .get(node_id)
            .ok_or(ServeError::Errno(libc::ENOENT))
    }

    fn lookup(&self, parent: u64, name: &str) -> ServeResult<(u64, InodeData)> {
        let parent_inode = self.get_inode(parent)?;
        let mut dir_file = self.open_inode_object(&parent_inode)?;

        let entry =
            lookup_child(&mut dir_file, name)?.ok_or(ServeError::Errno(libc::ENOENT))?;
        let node_id = parent + entry.parent_depth;
        // Track before replying, or a prompt FORGET could miss the node.
        self.inodes.track(node_id, &entry.inode);
        Ok((node_id, entry.inode))
    }

    fn access(&self, node_id: u64, uid: u32, gid: u32, mask: i32) -> ServeResult<()> {
        let inode = self.get_inode(node_id)?;
        if test_access(
            uid == inode.uid,
            gid == inode.gid,
            inode.mode,
            mask as u32,
        ) {
            Ok(())
        } else {
            Err(ServeError::Errno(libc::EACCES))
        }
    }

    fn open_regular(&self, node_id: u64, flags: i32) -> ServeResult<u64> {
        reject_writable(flags)?;
        let inode = self.get_inode(node_id)?;
        match inode.mode & libc::S_IFMT {
            libc::S_IFREG => {
                let file = self.open_inode_object(&inode)?;
                Ok(self.handles.insert(Handle::Reg(RegHandle::new(file))))
            }
            libc::S_IFDIR => Err(ServeError::Errno(libc::EISDIR)),
            _ => Err(ServeError::Errno(libc::EINVAL)),
        }
    }

    fn open_directory(&self, node_id: u64, flags: i32) -> ServeResult<u64> {
        reject_writable(flags)?;
        let inode = self.get_inode(node_id)?;
        if inode.mode & libc::S_IFMT != libc::S_IFDIR {
            return Err(ServeError::Errno(libc::ENOTDIR));
        }
        let file = self.open_inode_object(&inode)?;
        let handle = DirHandle::open(file)?;
        Ok(self.handles.insert(Handle::Dir(handle)))
    }

    fn read(&self, handle_id: u64, offset: i64, size: u32) -> ServeResult<Vec<u8>> {
        let handle = self
            .handles
            .get(handle_id)
            .ok_or(ServeError::Errno(libc::EBADF))?;
        match handle.as_ref() {
            Handle::Reg(reg) => reg.read(offset as u64, size),
            Handle::Dir(_) => Err(ServeError::Errno(libc::EISDIR)),
        }
    }

    fn readdir(
        &self,
        node_id: u64,
        handle_id: u64,
        offset: i64,
        reply: &mut ReplyDirectory,
    ) -> ServeResult<()> {
        let handle = self
            .handles
            .get(handle_id)
            .ok_or(ServeError::Errno(libc::EBADF))?;
        match handle.as_ref() {
            Handle::Dir(dir) => dir.fill(node_id, offset, |ino, cookie, kind, name| {
                reply.add(ino, cookie, kind, name)
            }),
            Handle::Reg(_) => Err(ServeError::Errno(libc::ENOTDIR)),
        }
    }

    fn readlink(&self, node_id: u64) -> ServeResult<Vec<u8>> {
        let inode = self.get_inode(node_id)?;
        if inode.mode & libc::S_IFMT != libc::S_IFLNK {
            return Err(ServeError::Errno(libc::EINVAL));
        }
        let mut file = self.open_inode_object(&inode)?;
        let mut buf = vec![0u8; libc::PATH_MAX as usize + 1];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn release(&self, handle_id: u64) -> ServeResult<()> {
        self.handles
            .remove(handle_id)
            .map(|_| ())
            .ok_or(ServeError::Errno(libc::EBADF))
    }

    fn statfs(&self) -> ServeResult<nix::sys::statvfs::Statvfs> {
        Ok(nix::sys::statvfs::statvfs(&self.data_dir)
            .map_err(|errno| ServeError::Errno(errno as libc::c_int))?)
    }
}

fn reject_writable(flags: i32) -> ServeResult<()> {
    if flags & libc::O_ACCMODE != libc::O_RDONLY {
        return Err(ServeError::Errno(libc::EACCES));
    }
    Ok(())
}

/// The `fuser::Filesystem` glue: every callback moves its reply into a
/// worker thread and answers from there.
pub struct HcasFuse {
    state: Arc<MountState>,
}

impl HcasFuse {
    pub fn new(store: &Store, root_name: Name) -> Self {
        let root_inode = InodeData {
            mode: libc::S_IFDIR | 0o777,
            uid: 0,
            gid: 0,
            dev: 0,
            atime_ns: 0,
            mtime_ns: 0,
            ctime_ns: 0,
            size: 0,
            obj: Some(root_name),
        };
        HcasFuse {
            state: Arc::new(MountState {
                data_dir: store.data_dir(),
                inodes: InodeTable::new(root_inode),
                handles: HandleTable::default(),
            }),
        }
    }
}

impl Filesystem for HcasFuse {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let state = self.state.clone();
        let name = name.to_owned();
        thread::spawn(move || {
            let Some(name) = name.to_str() else {
                reply.error(libc::ENOENT);
                return;
            };
            match state.lookup(parent, name) {
                Ok((node_id, inode)) => {
                    reply.entry(&TTL, &inode_attr(node_id, &inode), GENERATION)
                }
                Err(err) => reply.error(err.errno()),
            }
        });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.state.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let state = self.state.clone();
        thread::spawn(move || match state.get_inode(ino) {
            Ok(inode) => reply.attr(&TTL, &inode_attr(ino, &inode)),
            Err(err) => reply.error(err.errno()),
        });
    }

    fn access(&mut self, req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let state = self.state.clone();
        let (uid, gid) = (req.uid(), req.gid());
        thread::spawn(move || match state.access(ino, uid, gid, mask) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let state = self.state.clone();
        thread::spawn(move || match state.open_regular(ino, flags) {
            Ok(handle_id) => reply.opened(handle_id, fuser::consts::FOPEN_KEEP_CACHE),
            Err(err) => reply.error(err.errno()),
        });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let state = self.state.clone();
        thread::spawn(move || match state.open_directory(ino, flags) {
            Ok(handle_id) => reply.opened(handle_id, fuser::consts::FOPEN_KEEP_CACHE),
            Err(err) => reply.error(err.errno()),
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let state = self.state.clone();
        thread::spawn(move || match state.read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err.errno()),
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let state = self.state.clone();
        thread::spawn(
            move || match state.readdir(ino, fh, offset, &mut reply) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.errno()),
            },
        );
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let state = self.state.clone();
        thread::spawn(move || match state.readlink(ino) {
            Ok(target) => reply.data(&target),
            Err(err) => reply.error(err.errno()),
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let state = self.state.clone();
        thread::spawn(move || match state.release(fh) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        });
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        let state = self.state.clone();
        thread::spawn(move || match state.release(fh) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        });
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        // Xattrs are not stored; report none.
        if size == 0 {
            reply.size(0);
        } else {
            reply.data(&[]);
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, size: u32, reply: ReplyXattr) {
        if size == 0 {
            reply.size(0);
        } else {
            reply.data(&[]);
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let state = self.state.clone();
        thread::spawn(move || match state.statfs() {
            Ok(stat) => reply.statfs(
                stat.blocks(),
                stat.blocks_free(),
                stat.blocks_available(),
                stat.files(),
                stat.files_free(),
                stat.block_size() as u32,
                stat.name_max() as u32,
                stat.fragment_size() as u32,
            ),
            Err(err) => reply.error(err.errno()),
        });
    }
}

/// Mount `root_name` read-only at `mount_point` and serve until unmounted.
pub fn mount(
    store: &Store,
    mount_point: &Path,
    root_name: Name,
    config: &MountConfig,
) -> std::io::Result<()> {
    let mut options = vec![
        MountOption::RO,
        MountOption::FSName("hcasfs".to_string()),
        MountOption::Subtype("hcasfs".to_string()),
        MountOption::AutoUnmount,
    ];
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }

    debug!(root = %root_name, mount_point = %mount_point.display(), "mounting");
    fuser::mount2(HcasFuse::new(store, root_name), mount_point, &options)?;
    info!(mount_point = %mount_point.display(), "unmounted");
    Ok(())
}
