use super::*;
use fs_core::{MonitorConfig, PeerFsHandles};
use fuser::FileType;

fn create_test_fs() -> (DhtFs, Runtime, PeerFsHandles) {
    let runtime = Runtime::new().expect("create runtime");
    let dht = Arc::new(MemoryDht::new());
    let stat = FsStat::new(fs_core::FsStatConfig::default());
    let (fs, handles) = {
        let _guard = runtime.enter();
        start_peer_fs(
            dht,
            stat,
            MonitorConfig::default(),
            Duration::from_secs(3600),
        )
    };
    (DhtFs::new(fs), runtime, handles)
}

#[test]
fn test_lookup_after_create() {
    let (daemon, _runtime, _handles) = create_test_fs();
    daemon.fs.create("/hello.txt").unwrap();

    let (ino, attr) = daemon.lookup_entry(1, "hello.txt").expect("lookup");
    assert_eq!(attr.kind, FileType::RegularFile);
    assert_eq!(attr.ino, ino);
    assert_eq!(attr.perm, 0o644);

    assert!(matches!(
        daemon.lookup_entry(1, "missing.txt"),
        Err(code) if code == ENOENT
    ));
}

#[test]
fn test_inode_stable_across_lookups() {
    let (daemon, _runtime, _handles) = create_test_fs();
    daemon.fs.mkdir("/dir").unwrap();

    let (first, _) = daemon.lookup_entry(1, "dir").unwrap();
    let (second, _) = daemon.lookup_entry(1, "dir").unwrap();
    assert_eq!(first, second);
    assert_eq!(daemon.inodes.get_path(first).as_deref(), Some("/dir"));
}

#[test]
fn test_readdir_entries_include_dot_and_children() {
    let (daemon, _runtime, _handles) = create_test_fs();
    daemon.fs.mkdir("/dir").unwrap();
    daemon.fs.create("/file.txt").unwrap();

    let entries = daemon.readdir_entries(1, 0).expect("readdir");
    let names: Vec<String> = entries.iter().map(|e| e.2.clone()).collect();
    assert_eq!(names, vec![".", "..", "dir", "file.txt"]);
    assert_eq!(entries[2].1, FileType::Directory);
    assert_eq!(entries[3].1, FileType::RegularFile);

    // offsets resume mid-listing
    let rest = daemon.readdir_entries(1, 3).expect("readdir offset");
    let rest_names: Vec<String> = rest.iter().map(|e| e.2.clone()).collect();
    assert_eq!(rest_names, vec!["file.txt"]);
}

#[test]
fn test_attr_reports_symlink_kind() {
    let (daemon, _runtime, _handles) = create_test_fs();
    daemon.fs.create("/real.txt").unwrap();
    daemon.fs.symlink("/real.txt", "/link.txt").unwrap();

    let (_ino, attr) = daemon.lookup_entry(1, "link.txt").unwrap();
    assert_eq!(attr.kind, FileType::Symlink);
    assert_eq!(attr.perm, 0o777);
}

#[test]
fn test_inode_table_rename_recursive() {
    let table = InodeTable::new();
    let dir = table.get_or_create("/old");
    let file = table.get_or_create("/old/f.txt");

    table.rename_recursive("/old", "/new");
    assert_eq!(table.get_path(dir).as_deref(), Some("/new"));
    assert_eq!(table.get_path(file).as_deref(), Some("/new/f.txt"));
    assert_eq!(table.get_or_create("/new"), dir);
}

#[test]
fn test_inode_table_remove_recursive() {
    let table = InodeTable::new();
    let dir = table.get_or_create("/dir");
    let file = table.get_or_create("/dir/f.txt");
    let other = table.get_or_create("/dirty"); // shares a prefix, not a parent

    table.remove_recursive("/dir");
    assert_eq!(table.get_path(dir), None);
    assert_eq!(table.get_path(file), None);
    assert_eq!(table.get_path(other).as_deref(), Some("/dirty"));
}

#[test]
fn test_build_attr_block_count() {
    let (daemon, _runtime, _handles) = create_test_fs();
    daemon.fs.create("/f.txt").unwrap();
    daemon.fs.write("/f.txt", &vec![1u8; 5000], 0).unwrap();

    let (_ino, attr) = daemon.lookup_entry(1, "f.txt").unwrap();
    assert_eq!(attr.size, 5000);
    assert_eq!(attr.blocks, 2);
}
