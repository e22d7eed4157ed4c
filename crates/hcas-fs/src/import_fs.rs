//! Import a local directory tree into the store.
//!
//! The walk works on raw file descriptors: children are opened with
//! `O_NOFOLLOW` relative to their parent directory fd and verified against
//! the directory entry's type before their bytes are trusted, so a
//! concurrently mutated tree fails loudly instead of importing the wrong
//! content.

use std::io::Write;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::dir::{Dir, Type};
use nix::errno::Errno;
use nix::fcntl::{open, openat, readlinkat, OFlag};
use nix::sys::stat::{fstat, FileStat, Mode};
use nix::unistd::close;
use tracing::warn;

use hcas_store::{Name, Session};

use crate::dir::DirBuilder;
use crate::inode::{file_type_bits, is_dir, InodeData};
use crate::{validate_file_name, FsError, Result};

const READ_BUFFER_SIZE: usize = 1 << 16;

fn read_retrying(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
    loop {
        match nix::unistd::read(fd, buf) {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

fn stat_times_ns(st: &FileStat) -> (u64, u64, u64) {
    let ns = |secs: i64, nsecs: i64| secs as u64 * 1_000_000_000 + nsecs as u64;
    (
        ns(st.st_atime, st.st_atime_nsec),
        ns(st.st_mtime, st.st_mtime_nsec),
        ns(st.st_ctime, st.st_ctime_nsec),
    )
}

fn inode_from_stat(st: &FileStat, obj: Option<Name>) -> InodeData {
    let (atime_ns, mtime_ns, ctime_ns) = stat_times_ns(st);
    let mode = st.st_mode as u32;
    let dev = match file_type_bits(mode) {
        libc::S_IFCHR | libc::S_IFBLK => st.st_rdev,
        _ => 0,
    };
    InodeData {
        mode,
        uid: st.st_uid,
        gid: st.st_gid,
        dev,
        atime_ns,
        mtime_ns,
        ctime_ns,
        size: st.st_size as u64,
        obj,
    }
}

/// Stream a regular file's bytes into a new object.
fn import_regular(session: &Session, fd: RawFd) -> Result<(Name, u64)> {
    let mut writer = session.stream_object(&[]);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = read_retrying(fd, &mut buf)?;
        if n == 0 {
            break;
        }
        total += n as u64;
        writer.write_all(&buf[..n])?;
    }
    Ok((writer.commit()?, total))
}

/// Store a symlink's target string as an object.
fn import_symlink(session: &Session, fd: RawFd) -> Result<(Name, u64)> {
    let target = readlinkat(fd, "")?;
    let bytes = target.as_os_str().as_bytes();
    let name = session.create_object(bytes, &[])?;
    Ok((name, bytes.len() as u64))
}

fn entry_type_bits(entry_type: Type) -> u32 {
    match entry_type {
        Type::Fifo => libc::S_IFIFO,
        Type::CharacterDevice => libc::S_IFCHR,
        Type::Directory => libc::S_IFDIR,
        Type::BlockDevice => libc::S_IFBLK,
        Type::File => libc::S_IFREG,
        Type::Symlink => libc::S_IFLNK,
        Type::Socket => libc::S_IFSOCK,
    }
}

fn open_flags_for(type_bits: u32) -> OFlag {
    match type_bits {
        libc::S_IFREG => OFlag::O_RDONLY | OFlag::O_NOFOLLOW,
        libc::S_IFDIR => OFlag::O_RDONLY | OFlag::O_NOFOLLOW | OFlag::O_DIRECTORY,
        // Symlinks and special files are never opened for data.
        _ => OFlag::O_PATH | OFlag::O_NOFOLLOW,
    }
}

/// Import the directory behind `fd` (ownership of `fd` is taken), returning
/// the directory object's name and its subtree size.
fn import_directory(session: &Session, fd: RawFd) -> Result<(Name, u64)> {
    let mut dir = Dir::from_fd(fd)?;
    let dirfd = dir.as_raw_fd();
    let mut builder = DirBuilder::new();

    for entry in dir.iter() {
        let entry = entry?;
        let name_bytes = entry.file_name().to_bytes();
        if entry.ino() == 0 || name_bytes == b"." || name_bytes == b".." {
            continue;
        }
        let file_name = match std::str::from_utf8(name_bytes) {
            Ok(name) if validate_file_name(name) => name.to_owned(),
            _ => {
                warn!(name = ?String::from_utf8_lossy(name_bytes), "skipping entry with invalid name");
                continue;
            }
        };

        // Some filesystems don't fill d_type; fall back to a no-follow stat.
        let type_bits = match entry.file_type() {
            Some(entry_type) => entry_type_bits(entry_type),
            None => {
                let st = nix::sys::stat::fstatat(
                    dirfd,
                    file_name.as_str(),
                    nix::fcntl::AtFlags::AT_SYMLINK_NOFOLLOW,
                )?;
                file_type_bits(st.st_mode as u32)
            }
        };

        let child_fd = openat(
            dirfd,
            file_name.as_str(),
            open_flags_for(type_bits),
            Mode::empty(),
        )?;

        let (inode, tree_size) = match import_child(session, child_fd, type_bits) {
            Ok(done) => done,
            Err(err) => {
                if type_bits != libc::S_IFDIR {
                    let _ = close(child_fd);
                }
                return Err(err);
            }
        };
        if type_bits != libc::S_IFDIR {
            close(child_fd)?;
        }

        builder.insert(&file_name, inode, tree_size);
    }

    let built = builder.build();
    let name = session.create_object(&built.blob, &built.deps)?;
    Ok((name, built.tree_size))
}

/// Import one opened child; directories consume their fd on every path.
fn import_child(session: &Session, fd: RawFd, type_bits: u32) -> Result<(InodeData, u64)> {
    let st = match fstat(fd) {
        Ok(st) => st,
        Err(err) => {
            if type_bits == libc::S_IFDIR {
                let _ = close(fd);
            }
            return Err(err.into());
        }
    };
    if file_type_bits(st.st_mode as u32) != type_bits {
        if type_bits == libc::S_IFDIR {
            let _ = close(fd);
        }
        return Err(FsError::UnexpectedFileType);
    }

    match type_bits {
        libc::S_IFREG => {
            let (obj, bytes_read) = import_regular(session, fd)?;
            if bytes_read != st.st_size as u64 {
                return Err(FsError::SizeChanged);
            }
            Ok((inode_from_stat(&st, Some(obj)), 1))
        }
        libc::S_IFDIR => {
            let (obj, tree_size) = import_directory(session, fd)?;
            Ok((inode_from_stat(&st, Some(obj)), tree_size))
        }
        libc::S_IFLNK => {
            let (obj, target_len) = import_symlink(session, fd)?;
            if target_len != st.st_size as u64 {
                return Err(FsError::SizeChanged);
            }
            Ok((inode_from_stat(&st, Some(obj)), 1))
        }
        _ => Ok((inode_from_stat(&st, None), 1)),
    }
}

/// Import the directory at `path`, returning the root directory object.
pub fn import_path(session: &Session, path: impl AsRef<Path>) -> Result<Name> {
    let fd = open(
        path.as_ref(),
        OFlag::O_DIRECTORY | OFlag::O_RDONLY,
        Mode::empty(),
    )?;
    let st = match fstat(fd) {
        Ok(st) => st,
        Err(err) => {
            let _ = close(fd);
            return Err(err.into());
        }
    };
    if !is_dir(st.st_mode as u32) {
        let _ = close(fd);
        return Err(FsError::UnexpectedFileType);
    }

    let (name, _) = import_directory(session, fd)?;
    Ok(name)
}
