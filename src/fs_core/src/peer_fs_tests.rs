use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dht_store::{keys_location, DhtClient, DhtKey, MemoryDht};
use tokio::time::sleep;

use crate::archiver::version_folder;
use crate::fs_stat::{FsStat, FsStatConfig};
use crate::mirror::NodeType;
use crate::monitor::MonitorConfig;
use crate::paths;
use crate::peer_fs::{start_peer_fs, PeerFs, PeerFsHandles};
use crate::FsError;

const COUNTDOWN: u32 = 2;

/// Peers under test get an hour-long tick so nothing fires on its own;
/// tests drive the monitor and the syncer by hand and stay deterministic.
fn test_peer(dht: Arc<MemoryDht>) -> (Arc<PeerFs>, PeerFsHandles) {
    let stat = FsStat::new(FsStatConfig::default());
    start_peer_fs(
        dht,
        stat,
        MonitorConfig {
            initial_countdown: COUNTDOWN,
            tick_interval: Duration::from_secs(3600),
            idle_eviction: 1000,
        },
        Duration::from_secs(3600),
    )
}

/// Drain one quiescent burst: enough ticks to emit, then a pause for the
/// dispatcher and the writer to run.
async fn flush(handles: &PeerFsHandles) {
    for _ in 0..=COUNTDOWN {
        handles.monitor.tick();
    }
    settle().await;
}

async fn settle() {
    sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_single_peer_write_read() {
    let dht = Arc::new(MemoryDht::new());
    let (fs, handles) = test_peer(dht.clone());

    fs.create("/hello.txt").unwrap();
    assert_eq!(fs.write("/hello.txt", b"hi", 0).unwrap(), 2);

    // served from the monitor before the flush lands
    assert_eq!(fs.read("/hello.txt", 2, 0).unwrap(), vec![0x68, 0x69]);

    flush(&handles).await;
    assert_eq!(fs.read("/hello.txt", 2, 0).unwrap(), b"hi".to_vec());
    assert_eq!(
        dht.get(&DhtKey::from_str("/hello.txt")).await.unwrap(),
        Some(b"hi".to_vec())
    );
    let registered = dht.get_all_under(&keys_location()).await.unwrap();
    assert_eq!(
        registered.get(&DhtKey::from_str("/hello.txt")),
        Some(&b"/hello.txt".to_vec())
    );
}

#[tokio::test]
async fn test_read_after_write_returns_last_written_bytes() {
    let dht = Arc::new(MemoryDht::new());
    let (fs, _handles) = test_peer(dht);

    fs.create("/f.txt").unwrap();
    fs.write("/f.txt", b"aaaa", 0).unwrap();
    fs.write("/f.txt", b"bb", 1).unwrap();
    assert_eq!(fs.read("/f.txt", 10, 0).unwrap(), b"abba".to_vec());

    fs.write("/f.txt", b"zz", 6).unwrap();
    assert_eq!(fs.read("/f.txt", 10, 0).unwrap(), b"abba\0\0zz".to_vec());
}

#[tokio::test]
async fn test_unlink_then_getattr_is_enoent() {
    let dht = Arc::new(MemoryDht::new());
    let (fs, handles) = test_peer(dht.clone());

    fs.create("/gone.txt").unwrap();
    fs.write("/gone.txt", b"bye", 0).unwrap();
    flush(&handles).await;

    fs.unlink("/gone.txt").unwrap();
    assert!(matches!(fs.getattr("/gone.txt"), Err(FsError::NotFound(_))));
    assert!(matches!(fs.read("/gone.txt", 1, 0), Err(FsError::NotFound(_))));

    settle().await;
    assert_eq!(dht.get(&DhtKey::from_str("/gone.txt")).await.unwrap(), None);
    assert!(dht
        .get_all_under(&keys_location())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_rename_moves_attributes_and_dht_keys() {
    let dht = Arc::new(MemoryDht::new());
    let (fs, handles) = test_peer(dht.clone());

    fs.create("/a.txt").unwrap();
    fs.write("/a.txt", b"abc", 0).unwrap();
    flush(&handles).await;
    let before = fs.getattr("/a.txt").unwrap();

    fs.rename("/a.txt", "/b.txt").unwrap();
    assert!(matches!(fs.getattr("/a.txt"), Err(FsError::NotFound(_))));
    let after = fs.getattr("/b.txt").unwrap();
    assert_eq!(after.kind, before.kind);
    assert_eq!(after.size, 3);

    settle().await;
    assert_eq!(dht.get(&DhtKey::from_str("/a.txt")).await.unwrap(), None);

    flush(&handles).await;
    assert_eq!(
        dht.get(&DhtKey::from_str("/b.txt")).await.unwrap(),
        Some(b"abc".to_vec())
    );
}

#[tokio::test]
async fn test_rename_directory_re_registers_subtree() {
    let dht = Arc::new(MemoryDht::new());
    let (fs, handles) = test_peer(dht.clone());

    fs.mkdir("/old").unwrap();
    fs.create("/old/f.txt").unwrap();
    fs.write("/old/f.txt", b"data", 0).unwrap();
    flush(&handles).await;

    fs.rename("/old", "/new").unwrap();
    assert!(matches!(fs.getattr("/old/f.txt"), Err(FsError::NotFound(_))));
    assert_eq!(fs.read("/new/f.txt", 10, 0).unwrap(), b"data".to_vec());

    settle().await;
    flush(&handles).await;
    assert_eq!(dht.get(&DhtKey::from_str("/old/f.txt")).await.unwrap(), None);
    assert_eq!(
        dht.get(&DhtKey::from_str("/new/f.txt")).await.unwrap(),
        Some(b"data".to_vec())
    );
}

#[tokio::test]
async fn test_mkdir_rmdir_restores_previous_state() {
    let dht = Arc::new(MemoryDht::new());
    let (fs, _handles) = test_peer(dht);

    assert!(matches!(fs.getattr("/d"), Err(FsError::NotFound(_))));
    fs.mkdir("/d").unwrap();
    assert_eq!(fs.getattr("/d").unwrap().kind, NodeType::Directory);

    fs.rmdir("/d").unwrap();
    assert!(matches!(fs.getattr("/d"), Err(FsError::NotFound(_))));
}

#[tokio::test]
async fn test_rmdir_refuses_non_empty_directory() {
    let dht = Arc::new(MemoryDht::new());
    let (fs, _handles) = test_peer(dht);

    fs.mkdir("/d").unwrap();
    fs.create("/d/f.txt").unwrap();
    assert!(matches!(fs.rmdir("/d"), Err(FsError::NotEmpty(_))));
    assert!(matches!(fs.rmdir("/d/f.txt"), Err(FsError::NotADirectory(_))));
    assert!(matches!(fs.rmdir("/missing"), Err(FsError::NotFound(_))));
}

#[tokio::test]
async fn test_two_peer_convergence() {
    let dht = Arc::new(MemoryDht::new());
    let (fs_a, handles_a) = test_peer(dht.clone());
    let (fs_b, handles_b) = test_peer(dht.clone());

    fs_a.create("/shared.txt").unwrap();
    fs_a.write("/shared.txt", b"abc", 0).unwrap();
    flush(&handles_a).await;

    handles_b.syncer.sync_once().await;
    let stat = fs_b.getattr("/shared.txt").unwrap();
    assert_eq!(stat.kind, NodeType::File);
    assert_eq!(stat.size, 3);
    assert_eq!(fs_b.read("/shared.txt", 3, 0).unwrap(), b"abc".to_vec());
}

#[tokio::test]
async fn test_two_peer_unlink_converges() {
    let dht = Arc::new(MemoryDht::new());
    let (fs_a, handles_a) = test_peer(dht.clone());
    let (fs_b, handles_b) = test_peer(dht.clone());

    fs_a.create("/shared.txt").unwrap();
    fs_a.write("/shared.txt", b"abc", 0).unwrap();
    flush(&handles_a).await;
    handles_b.syncer.sync_once().await;
    assert!(fs_b.getattr("/shared.txt").is_ok());

    fs_a.unlink("/shared.txt").unwrap();
    settle().await;
    handles_b.syncer.sync_once().await;
    assert!(matches!(fs_b.getattr("/shared.txt"), Err(FsError::NotFound(_))));
}

#[tokio::test]
async fn test_versioning_keeps_exactly_prior_contents() {
    let dht = Arc::new(MemoryDht::new());
    let (fs, handles) = test_peer(dht.clone());

    fs.create("/v.txt").unwrap();
    fs.write("/v.txt", b"old", 0).unwrap();
    flush(&handles).await;
    fs.write("/v.txt", b"new", 0).unwrap();
    flush(&handles).await;

    let key = DhtKey::from_str("/v.txt");
    assert_eq!(dht.get(&key).await.unwrap(), Some(b"new".to_vec()));
    assert_eq!(dht.get_versions(&key).await.unwrap(), vec![0]);
    assert_eq!(
        dht.get_versioned(&key, 0).await.unwrap(),
        Some(b"old".to_vec())
    );

    // the version folder exposes exactly one file, named by chain index
    let folder = version_folder("/v.txt");
    let entries = fs.readdir(&folder).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, "0");
    assert_eq!(
        fs.read(&paths::join(&folder, "0"), 10, 0).unwrap(),
        b"old".to_vec()
    );
}

#[tokio::test]
async fn test_version_chain_length_tracks_flush_count() {
    let dht = Arc::new(MemoryDht::new());
    let (fs, handles) = test_peer(dht.clone());

    fs.create("/v.txt").unwrap();
    for content in [b"one".as_slice(), b"two", b"three"] {
        fs.write("/v.txt", content, 0).unwrap();
        flush(&handles).await;
    }

    // three flushes, two of which had a non-empty prior blob
    let key = DhtKey::from_str("/v.txt");
    assert_eq!(dht.get_versions(&key).await.unwrap(), vec![0, 1]);
}

#[tokio::test]
async fn test_unlink_removes_version_history_first() {
    let dht = Arc::new(MemoryDht::new());
    let (fs, handles) = test_peer(dht.clone());

    fs.create("/v.txt").unwrap();
    fs.write("/v.txt", b"old", 0).unwrap();
    flush(&handles).await;
    fs.write("/v.txt", b"new", 0).unwrap();
    flush(&handles).await;

    let folder = version_folder("/v.txt");
    assert!(fs.getattr(&folder).is_ok());

    fs.unlink("/v.txt").unwrap();
    assert!(matches!(fs.getattr(&folder), Err(FsError::NotFound(_))));

    settle().await;
    let key = DhtKey::from_str("/v.txt");
    assert!(dht.get_versions(&key).await.unwrap().is_empty());
    assert_eq!(dht.get(&key).await.unwrap(), None);
}

#[tokio::test]
async fn test_create_errors() {
    let dht = Arc::new(MemoryDht::new());
    let (fs, _handles) = test_peer(dht);

    fs.create("/a.txt").unwrap();
    assert!(matches!(fs.create("/a.txt"), Err(FsError::AlreadyExists(_))));
    assert!(matches!(
        fs.create("/missing/b.txt"),
        Err(FsError::NotFound(_))
    ));
    assert!(matches!(
        fs.create("/a.txt/under.txt"),
        Err(FsError::NotADirectory(_))
    ));
}

#[tokio::test]
async fn test_create_heuristic_picks_node_kind() {
    let dht = Arc::new(MemoryDht::new());
    let (fs, _handles) = test_peer(dht);

    fs.create("/notes.txt").unwrap();
    assert_eq!(fs.getattr("/notes.txt").unwrap().kind, NodeType::File);

    // no dot after the first character: the heuristic makes a directory
    fs.create("/archive").unwrap();
    assert_eq!(fs.getattr("/archive").unwrap().kind, NodeType::Directory);
}

#[tokio::test]
async fn test_truncate_updates_monitor_and_rejects_directories() {
    let dht = Arc::new(MemoryDht::new());
    let (fs, handles) = test_peer(dht);

    fs.create("/t.txt").unwrap();
    fs.write("/t.txt", b"abcdef", 0).unwrap();
    fs.truncate("/t.txt", 2).unwrap();
    assert_eq!(fs.getattr("/t.txt").unwrap().size, 2);
    assert_eq!(handles.monitor.get("/t.txt"), Some(b"ab".to_vec()));

    fs.mkdir("/d").unwrap();
    assert!(matches!(fs.truncate("/d", 0), Err(FsError::IsADirectory(_))));
    assert!(matches!(
        fs.truncate("/missing", 0),
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_symlink_and_readlink() {
    let dht = Arc::new(MemoryDht::new());
    let (fs, _handles) = test_peer(dht);

    fs.create("/real.txt").unwrap();
    fs.write("/real.txt", b"content", 0).unwrap();
    fs.symlink("/real.txt", "/link.txt").unwrap();

    assert_eq!(fs.getattr("/link.txt").unwrap().kind, NodeType::Symlink);
    assert_eq!(fs.readlink("/link.txt").unwrap(), "real.txt");
    assert!(matches!(
        fs.readlink("/real.txt"),
        Err(FsError::InvalidArgument(_))
    ));
    assert!(matches!(
        fs.symlink("/nowhere.txt", "/dangling.txt"),
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_readdir_lists_children() {
    let dht = Arc::new(MemoryDht::new());
    let (fs, _handles) = test_peer(dht);

    fs.mkdir("/d").unwrap();
    fs.create("/d/a.txt").unwrap();
    fs.mkdir("/d/sub").unwrap();

    let entries = fs.readdir("/d").unwrap();
    assert_eq!(
        entries,
        vec![
            ("a.txt".to_string(), NodeType::File),
            ("sub".to_string(), NodeType::Directory),
        ]
    );
    assert!(matches!(fs.readdir("/d/a.txt"), Err(FsError::NotADirectory(_))));
    assert!(matches!(fs.readdir("/missing"), Err(FsError::NotFound(_))));
}

#[tokio::test]
async fn test_read_write_reject_directories() {
    let dht = Arc::new(MemoryDht::new());
    let (fs, _handles) = test_peer(dht);

    fs.mkdir("/d").unwrap();
    assert!(matches!(fs.read("/d", 1, 0), Err(FsError::IsADirectory(_))));
    assert!(matches!(
        fs.write("/d", b"x", 0),
        Err(FsError::IsADirectory(_))
    ));
}

#[tokio::test]
async fn test_utimens_sets_timestamps() {
    let dht = Arc::new(MemoryDht::new());
    let (fs, _handles) = test_peer(dht);

    fs.create("/t.txt").unwrap();
    let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
    fs.utimens("/t.txt", stamp, stamp).unwrap();
    let stat = fs.getattr("/t.txt").unwrap();
    assert_eq!(stat.atime, stamp);
    assert_eq!(stat.mtime, stamp);

    assert!(matches!(
        fs.utimens("/missing", stamp, stamp),
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_statfs_reflects_usage() {
    let dht = Arc::new(MemoryDht::new());
    let (fs, _handles) = test_peer(dht);

    let empty = fs.statfs();
    assert_eq!(empty.bsize, 4000);
    assert_eq!(empty.bfree, empty.blocks);

    fs.create("/big.txt").unwrap();
    fs.write("/big.txt", &vec![7u8; 5000], 0).unwrap();
    let used = fs.statfs();
    assert_eq!(used.blocks - used.bfree, 2);
    assert_eq!(used.files - used.ffree, 1);
}

#[tokio::test]
async fn test_open_is_always_ok() {
    let dht = Arc::new(MemoryDht::new());
    let (fs, _handles) = test_peer(dht);

    assert!(fs.open("/missing.txt").is_ok());
    fs.create("/empty.txt").unwrap();
    assert!(fs.open("/empty.txt").is_ok());
}

#[tokio::test]
async fn test_handles_shutdown_within_grace() {
    let dht = Arc::new(MemoryDht::new());
    let (_fs, handles) = test_peer(dht);

    tokio::time::timeout(Duration::from_secs(3), handles.shutdown(Duration::from_secs(1)))
        .await
        .expect("shutdown exceeded its grace period");
}
