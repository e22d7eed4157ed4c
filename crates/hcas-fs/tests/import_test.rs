use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Read;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::time::Duration;

use tar::{Builder, EntryType, Header};
use tempfile::TempDir;

use hcas_fs::{import_path, import_tar, lookup_child, DirEntry, FsError};
use hcas_store::{Name, Store, StoreOptions};

fn test_store(dir: &TempDir) -> Store {
    Store::create_with(
        dir.path().join("store"),
        StoreOptions {
            object_lease: Duration::from_secs(3600),
        },
    )
    .unwrap()
}

fn open_dir_blob(store: &Store, name: &Name) -> File {
    store.object_open(name).unwrap()
}

fn read_object(store: &Store, name: &Name) -> Vec<u8> {
    let mut buf = Vec::new();
    store.object_open(name).unwrap().read_to_end(&mut buf).unwrap();
    buf
}

fn lookup(store: &Store, dir_name: &Name, child: &str) -> Option<DirEntry> {
    let mut file = open_dir_blob(store, dir_name);
    lookup_child(&mut file, child).unwrap()
}

mod local_import {
    use super::*;

    #[test]
    fn imports_files_dirs_and_symlinks() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        let session = store.session();

        let tree = tmp.path().join("tree");
        fs::create_dir(&tree).unwrap();
        fs::write(tree.join("hello.txt"), b"hello world").unwrap();
        fs::set_permissions(tree.join("hello.txt"), fs::Permissions::from_mode(0o644)).unwrap();
        fs::create_dir(tree.join("sub")).unwrap();
        fs::write(tree.join("sub").join("nested.bin"), vec![0xAB; 4096]).unwrap();
        symlink("hello.txt", tree.join("link")).unwrap();

        let root = import_path(&session, &tree).unwrap();

        let hello = lookup(&store, &root, "hello.txt").unwrap();
        assert_eq!(hello.inode.mode, libc::S_IFREG | 0o644);
        assert_eq!(hello.inode.size, 11);
        assert_eq!(read_object(&store, &hello.inode.obj.unwrap()), b"hello world");

        let link = lookup(&store, &root, "link").unwrap();
        assert_eq!(link.inode.mode & libc::S_IFMT, libc::S_IFLNK);
        assert_eq!(link.inode.size, "hello.txt".len() as u64);
        assert_eq!(read_object(&store, &link.inode.obj.unwrap()), b"hello.txt");

        let sub = lookup(&store, &root, "sub").unwrap();
        assert_eq!(sub.inode.mode & libc::S_IFMT, libc::S_IFDIR);
        let nested = lookup(&store, &sub.inode.obj.unwrap(), "nested.bin").unwrap();
        assert_eq!(nested.inode.size, 4096);

        assert!(lookup(&store, &root, "absent").is_none());
    }

    #[test]
    fn rejects_non_directory_root() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        let session = store.session();

        let file = tmp.path().join("plain");
        fs::write(&file, b"not a directory").unwrap();
        assert!(import_path(&session, &file).is_err());
    }

    /// Walk an imported tree collecting `root_id + parent_depth` for every
    /// entry; the derived ids must be unique and dense.
    fn collect_node_ids(store: &Store, dir_name: &Name, base_id: u64, ids: &mut Vec<u64>) {
        let mut file = store.object_open(dir_name).unwrap();
        let mut header = [0u8; 16];
        file.read_exact(&mut header).unwrap();
        let count = u32::from_be_bytes(header[4..8].try_into().unwrap());
        std::io::Seek::seek(&mut file, std::io::SeekFrom::Start(16 + 8 * count as u64)).unwrap();

        for _ in 0..count {
            let entry = DirEntry::decode_from(&mut file).unwrap();
            let node_id = base_id + entry.parent_depth;
            ids.push(node_id);
            if entry.inode.mode & libc::S_IFMT == libc::S_IFDIR {
                let child_name = entry.inode.obj.unwrap();
                collect_node_ids(store, &child_name, node_id, ids);
            }
        }
    }

    #[test]
    fn derived_node_ids_are_unique() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        let session = store.session();

        let tree = tmp.path().join("tree");
        fs::create_dir_all(tree.join("a/deep/nest")).unwrap();
        fs::create_dir_all(tree.join("b")).unwrap();
        for (path, data) in [
            ("a/one.txt", "1"),
            ("a/two.txt", "22"),
            ("a/deep/three.txt", "333"),
            ("a/deep/nest/four.txt", "4444"),
            ("b/five.txt", "55555"),
            ("six.txt", "666666"),
        ] {
            fs::write(tree.join(path), data).unwrap();
        }

        let root = import_path(&session, &tree).unwrap();

        let mut ids = Vec::new();
        collect_node_ids(&store, &root, 1, &mut ids);

        // 10 descendants: 4 directories + 6 files.
        assert_eq!(ids.len(), 10);
        let unique: HashSet<u64> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        // Dense: exactly the ids (1, root_subtree_size] shifted by root id 1.
        assert_eq!(*ids.iter().min().unwrap(), 2);
        assert_eq!(*ids.iter().max().unwrap(), 11);
    }
}

mod tar_import {
    use super::*;

    fn dir_header(mtime: u64) -> Header {
        let mut header = Header::new_ustar();
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o755);
        header.set_mtime(mtime);
        header.set_size(0);
        header.set_uid(0);
        header.set_gid(0);
        header
    }

    fn file_header(mtime: u64, size: u64) -> Header {
        let mut header = Header::new_ustar();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        header.set_size(size);
        header.set_uid(1000);
        header.set_gid(1000);
        header
    }

    #[test]
    fn imports_links_and_devices() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        let session = store.session();

        let mut tar = Builder::new(Vec::new());
        tar.append_data(&mut dir_header(100), "dir1", &[][..]).unwrap();
        tar.append_data(&mut file_header(101, 3), "dir1/a.txt", &b"AAA"[..])
            .unwrap();

        let mut hardlink = Header::new_ustar();
        hardlink.set_entry_type(EntryType::Link);
        hardlink.set_mode(0o644);
        hardlink.set_mtime(102);
        hardlink.set_size(0);
        tar.append_link(&mut hardlink, "dir1/b.txt", "dir1/a.txt").unwrap();

        let mut link = Header::new_ustar();
        link.set_entry_type(EntryType::Symlink);
        link.set_mode(0o777);
        link.set_mtime(103);
        link.set_size(0);
        tar.append_link(&mut link, "dir1/ln", "a.txt").unwrap();

        let mut dev = Header::new_ustar();
        dev.set_entry_type(EntryType::Char);
        dev.set_mode(0o600);
        dev.set_mtime(104);
        dev.set_size(0);
        dev.set_device_major(5).unwrap();
        dev.set_device_minor(1).unwrap();
        tar.append_data(&mut dev, "dir1/tty", &[][..]).unwrap();

        let data = tar.into_inner().unwrap();
        let root = import_tar(&session, &data[..]).unwrap();

        let dir1 = lookup(&store, &root, "dir1").unwrap();
        assert_eq!(dir1.inode.mode, libc::S_IFDIR | 0o755);
        assert_eq!(dir1.inode.mtime_ns, 100 * 1_000_000_000);
        let dir1_obj = dir1.inode.obj.unwrap();

        let a = lookup(&store, &dir1_obj, "a.txt").unwrap();
        assert_eq!(a.inode.size, 3);
        assert_eq!(read_object(&store, &a.inode.obj.unwrap()), b"AAA");

        // Hard link shares the target's entire inode.
        let b = lookup(&store, &dir1_obj, "b.txt").unwrap();
        assert_eq!(b.inode, a.inode);

        let ln = lookup(&store, &dir1_obj, "ln").unwrap();
        assert_eq!(ln.inode.mode & libc::S_IFMT, libc::S_IFLNK);
        assert_eq!(ln.inode.size, "a.txt".len() as u64);
        assert_eq!(read_object(&store, &ln.inode.obj.unwrap()), b"a.txt");

        let tty = lookup(&store, &dir1_obj, "tty").unwrap();
        assert_eq!(tty.inode.mode & libc::S_IFMT, libc::S_IFCHR);
        assert_eq!(tty.inode.dev, (5 << 8) | 1);
        assert_eq!(tty.inode.obj, None);
    }

    #[test]
    fn out_of_order_archive_fails() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        let session = store.session();

        let mut tar = Builder::new(Vec::new());
        tar.append_data(&mut file_header(1, 2), "missing/file.txt", &b"no"[..])
            .unwrap();
        let data = tar.into_inner().unwrap();

        assert!(matches!(
            import_tar(&session, &data[..]),
            Err(FsError::OutOfOrderArchive(_))
        ));
    }

    #[test]
    fn broken_hardlink_fails() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        let session = store.session();

        let mut tar = Builder::new(Vec::new());
        tar.append_data(&mut dir_header(1), "dir", &[][..]).unwrap();
        let mut hardlink = Header::new_ustar();
        hardlink.set_entry_type(EntryType::Link);
        hardlink.set_mode(0o644);
        hardlink.set_mtime(2);
        hardlink.set_size(0);
        tar.append_link(&mut hardlink, "dir/b.txt", "dir/nonexistent").unwrap();
        let data = tar.into_inner().unwrap();

        assert!(matches!(
            import_tar(&session, &data[..]),
            Err(FsError::BrokenHardLink(_))
        ));
    }

    #[test]
    fn hardlink_to_directory_fails() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        let session = store.session();

        let mut tar = Builder::new(Vec::new());
        tar.append_data(&mut dir_header(1), "dir", &[][..]).unwrap();
        tar.append_data(&mut dir_header(2), "dir/sub", &[][..]).unwrap();
        let mut hardlink = Header::new_ustar();
        hardlink.set_entry_type(EntryType::Link);
        hardlink.set_mode(0o644);
        hardlink.set_mtime(3);
        hardlink.set_size(0);
        tar.append_link(&mut hardlink, "dir/b", "dir/sub").unwrap();
        let data = tar.into_inner().unwrap();

        assert!(matches!(
            import_tar(&session, &data[..]),
            Err(FsError::BrokenHardLink(_))
        ));
    }

    #[test]
    fn identical_files_share_one_object() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        let session = store.session();

        let mut tar = Builder::new(Vec::new());
        tar.append_data(&mut dir_header(1), "d", &[][..]).unwrap();
        tar.append_data(&mut file_header(2, 5), "d/x", &b"same!"[..]).unwrap();
        tar.append_data(&mut file_header(3, 5), "d/y", &b"same!"[..]).unwrap();
        let data = tar.into_inner().unwrap();

        let root = import_tar(&session, &data[..]).unwrap();
        let d = lookup(&store, &root, "d").unwrap().inode.obj.unwrap();
        let x = lookup(&store, &d, "x").unwrap();
        let y = lookup(&store, &d, "y").unwrap();
        assert_eq!(x.inode.obj, y.inode.obj);
    }

    #[test]
    fn subtree_sizes_roll_up() {
        let tmp = TempDir::new().unwrap();
        let store = test_store(&tmp);
        let session = store.session();

        let mut tar = Builder::new(Vec::new());
        tar.append_data(&mut dir_header(1), "a", &[][..]).unwrap();
        tar.append_data(&mut dir_header(2), "a/b", &[][..]).unwrap();
        tar.append_data(&mut file_header(3, 1), "a/b/f1", &b"1"[..]).unwrap();
        tar.append_data(&mut file_header(4, 1), "a/b/f2", &b"2"[..]).unwrap();
        tar.append_data(&mut file_header(5, 1), "a/g", &b"3"[..]).unwrap();
        let data = tar.into_inner().unwrap();

        let root = import_tar(&session, &data[..]).unwrap();

        // Root header records the total subtree size below it: a(5).
        let mut root_blob = read_object(&store, &root);
        let total = u64::from_be_bytes(root_blob[8..16].try_into().unwrap());
        assert_eq!(total, 5);
        root_blob.clear();

        // a's blob: children b(3) and g(1).
        let a = lookup(&store, &root, "a").unwrap();
        let a_blob = read_object(&store, &a.inode.obj.unwrap());
        let a_total = u64::from_be_bytes(a_blob[8..16].try_into().unwrap());
        assert_eq!(a_total, 4);
    }
}
