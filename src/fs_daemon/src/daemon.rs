use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, Request,
};
use libc::{EINVAL, ENOENT};
use log::{info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::runtime::Runtime;

use dht_store::{BootstrapClient, DhtClient, MemoryDht, PeerEndpoint};
use fs_core::{start_peer_fs, FileStat, FsStat, NodeType, PeerFs, ResizeOnPeerMapChange};

use crate::cli;
use crate::config::DaemonConfig;

const TTL: Duration = Duration::from_secs(1);
const BLKSIZE: u32 = 4096;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("config error: {0}")]
    Config(String),
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),
    #[error("mount failed: {0}")]
    Mount(String),
    #[error("I/O error: {0}")]
    Io(String),
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config_path: PathBuf,
    pub mountpoint: Option<PathBuf>,
    /// Join this `address:port` directly instead of asking the rendezvous.
    pub direct_peer: Option<String>,
}

/// inode ↔ path translation for the kernel. The kernel speaks inodes, the
/// rest of the system speaks absolute paths; entries accumulate as lookups
/// happen and follow renames/removals recursively.
struct InodeTable {
    next_inode: AtomicU64,
    inode_to_path: RwLock<HashMap<u64, String>>,
    path_to_inode: RwLock<HashMap<String, u64>>,
}

impl InodeTable {
    fn new() -> Self {
        let mut inode_to_path = HashMap::new();
        let mut path_to_inode = HashMap::new();
        inode_to_path.insert(1, "/".to_string());
        path_to_inode.insert("/".to_string(), 1);
        Self {
            next_inode: AtomicU64::new(2),
            inode_to_path: RwLock::new(inode_to_path),
            path_to_inode: RwLock::new(path_to_inode),
        }
    }

    fn get_path(&self, inode: u64) -> Option<String> {
        self.inode_to_path.read().ok()?.get(&inode).cloned()
    }

    fn get_or_create(&self, path: &str) -> u64 {
        if let Ok(map) = self.path_to_inode.read() {
            if let Some(inode) = map.get(path) {
                return *inode;
            }
        }
        let inode = self.next_inode.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut map) = self.inode_to_path.write() {
            map.insert(inode, path.to_string());
        }
        if let Ok(mut map) = self.path_to_inode.write() {
            map.insert(path.to_string(), inode);
        }
        inode
    }

    fn remove_recursive(&self, path: &str) {
        let (Ok(mut inode_to_path), Ok(mut path_to_inode)) =
            (self.inode_to_path.write(), self.path_to_inode.write())
        else {
            return;
        };
        let prefix = format!("{}/", path);
        let doomed: Vec<String> = path_to_inode
            .keys()
            .filter(|candidate| *candidate == path || candidate.starts_with(&prefix))
            .cloned()
            .collect();
        for removed in doomed {
            if let Some(inode) = path_to_inode.remove(&removed) {
                inode_to_path.remove(&inode);
            }
        }
    }

    fn rename_recursive(&self, old_path: &str, new_path: &str) {
        let (Ok(mut inode_to_path), Ok(mut path_to_inode)) =
            (self.inode_to_path.write(), self.path_to_inode.write())
        else {
            return;
        };
        let old_prefix = format!("{}/", old_path);
        let moved: Vec<(String, u64)> = path_to_inode
            .iter()
            .filter(|(path, _)| *path == old_path || path.starts_with(&old_prefix))
            .map(|(path, inode)| (path.clone(), *inode))
            .collect();
        for (old, inode) in moved {
            path_to_inode.remove(&old);
            let suffix = old.strip_prefix(old_path).unwrap_or("");
            let moved_path = format!("{}{}", new_path, suffix);
            path_to_inode.insert(moved_path.clone(), inode);
            inode_to_path.insert(inode, moved_path);
        }
    }
}

/// fuser adapter: kernel callbacks in, [`PeerFs`] operations out, positive
/// errnos back through `reply.error`.
pub struct DhtFs {
    fs: Arc<PeerFs>,
    inodes: InodeTable,
}

impl DhtFs {
    pub fn new(fs: Arc<PeerFs>) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
        }
    }

    fn path_from_parent(&self, parent: u64, name: &str) -> Option<String> {
        let parent_path = self.inodes.get_path(parent)?;
        Some(fs_core::paths::join(&parent_path, name))
    }

    fn build_attr(&self, inode: u64, stat: &FileStat) -> FileAttr {
        let (kind, perm, nlink) = match stat.kind {
            NodeType::Directory => (FileType::Directory, 0o755, 2),
            NodeType::File => (FileType::RegularFile, 0o644, 1),
            NodeType::Symlink => (FileType::Symlink, 0o777, 1),
        };
        FileAttr {
            ino: inode,
            size: stat.size,
            blocks: stat.size.div_ceil(BLKSIZE as u64),
            atime: stat.atime,
            mtime: stat.mtime,
            ctime: stat.mtime,
            crtime: stat.mtime,
            kind,
            perm,
            nlink,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            flags: 0,
            blksize: BLKSIZE,
        }
    }

    fn attr_for_path(&self, path: &str) -> Result<(u64, FileAttr), i32> {
        let stat = self.fs.getattr(path).map_err(|e| e.errno())?;
        let inode = self.inodes.get_or_create(path);
        Ok((inode, self.build_attr(inode, &stat)))
    }

    fn lookup_entry(&self, parent: u64, name: &str) -> Result<(u64, FileAttr), i32> {
        let path = self.path_from_parent(parent, name).ok_or(ENOENT)?;
        self.attr_for_path(&path)
    }

    fn readdir_entries(
        &self,
        ino: u64,
        offset: i64,
    ) -> Result<Vec<(u64, FileType, String, i64)>, i32> {
        let path = self.inodes.get_path(ino).ok_or(ENOENT)?;
        let children = self.fs.readdir(&path).map_err(|e| e.errno())?;

        let mut out = Vec::new();
        let mut idx: i64 = offset;
        if offset == 0 {
            out.push((ino, FileType::Directory, ".".to_string(), 1));
            out.push((ino, FileType::Directory, "..".to_string(), 2));
            idx = 2;
        }
        for (name, kind) in children.into_iter().skip((idx - 2).max(0) as usize) {
            let child_path = fs_core::paths::join(&path, &name);
            let inode = self.inodes.get_or_create(&child_path);
            let file_type = match kind {
                NodeType::Directory => FileType::Directory,
                NodeType::File => FileType::RegularFile,
                NodeType::Symlink => FileType::Symlink,
            };
            idx += 1;
            out.push((inode, file_type, name, idx));
        }
        Ok(out)
    }
}

impl Filesystem for DhtFs {
    fn lookup(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        reply: ReplyEntry,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.lookup_entry(parent, name) {
            Ok((_ino, attr)) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let path = match self.inodes.get_path(ino) {
            Some(v) => v,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        match self.attr_for_path(&path) {
            Ok((_ino, attr)) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.inodes.get_path(ino) {
            Some(v) => v,
            None => {
                reply.error(ENOENT);
                return;
            }
        };

        if let Some(new_size) = size {
            if let Err(e) = self.fs.truncate(&path, new_size) {
                reply.error(e.errno());
                return;
            }
        }
        if atime.is_some() || mtime.is_some() {
            let now = SystemTime::now();
            let resolve = |value: Option<fuser::TimeOrNow>| match value {
                Some(fuser::TimeOrNow::SpecificTime(t)) => Some(t),
                Some(fuser::TimeOrNow::Now) => Some(now),
                None => None,
            };
            let current = self.fs.getattr(&path).ok();
            let atime_new = resolve(atime)
                .or(current.as_ref().map(|s| s.atime))
                .unwrap_or(now);
            let mtime_new = resolve(mtime)
                .or(current.as_ref().map(|s| s.mtime))
                .unwrap_or(now);
            if let Err(e) = self.fs.utimens(&path, atime_new, mtime_new) {
                reply.error(e.errno());
                return;
            }
        }
        // mode/uid/gid are accepted and dropped; ownership is not persisted

        match self.attr_for_path(&path) {
            Ok((_ino, attr)) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        match self.readdir_entries(ino, offset) {
            Ok(entries) => {
                for (inode, file_type, name, next_offset) in entries {
                    if reply.add(inode, next_offset, file_type, name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(code) => reply.error(code),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        if let Some(path) = self.inodes.get_path(ino) {
            let _ = self.fs.open(&path);
        }
        reply.opened(0, 0);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        let path = match self.path_from_parent(parent, name) {
            Some(v) => v,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        if let Err(e) = self.fs.create(&path) {
            reply.error(e.errno());
            return;
        }
        match self.attr_for_path(&path) {
            Ok((_ino, attr)) => reply.created(&TTL, &attr, 0, 0, 0),
            Err(code) => reply.error(code),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.inodes.get_path(ino) {
            Some(v) => v,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        match self.fs.read(&path, size as u64, offset.max(0) as u64) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        let path = match self.inodes.get_path(ino) {
            Some(v) => v,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        match self.fs.write(&path, data, offset.max(0) as u64) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        let path = match self.path_from_parent(parent, name) {
            Some(v) => v,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        if let Err(e) = self.fs.mkdir(&path) {
            reply.error(e.errno());
            return;
        }
        match self.attr_for_path(&path) {
            Ok((_ino, attr)) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn unlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        reply: ReplyEmpty,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        let path = match self.path_from_parent(parent, name) {
            Some(v) => v,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        match self.fs.unlink(&path) {
            Ok(()) => {
                self.inodes.remove_recursive(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        reply: ReplyEmpty,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        let path = match self.path_from_parent(parent, name) {
            Some(v) => v,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        match self.fs.rmdir(&path) {
            Ok(()) => {
                self.inodes.remove_recursive(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        newparent: u64,
        newname: &std::ffi::OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
            reply.error(EINVAL);
            return;
        };
        let (Some(old_path), Some(new_path)) = (
            self.path_from_parent(parent, name),
            self.path_from_parent(newparent, newname),
        ) else {
            reply.error(ENOENT);
            return;
        };
        match self.fs.rename(&old_path, &new_path) {
            Ok(()) => {
                self.inodes.rename_recursive(&old_path, &new_path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &std::ffi::OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let (Some(link_name), Some(target)) = (link_name.to_str(), target.to_str()) else {
            reply.error(EINVAL);
            return;
        };
        let link_path = match self.path_from_parent(parent, link_name) {
            Some(v) => v,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        if let Err(e) = self.fs.symlink(target, &link_path) {
            reply.error(e.errno());
            return;
        }
        match self.attr_for_path(&link_path) {
            Ok((_ino, attr)) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = match self.inodes.get_path(ino) {
            Some(v) => v,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        match self.fs.readlink(&path) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let snapshot = self.fs.statfs();
        reply.statfs(
            snapshot.blocks,
            snapshot.bfree,
            snapshot.bavail,
            snapshot.files,
            snapshot.ffree,
            snapshot.bsize,
            255,
            snapshot.bsize,
        );
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn bmap(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _blocksize: u32,
        _idx: u64,
        reply: fuser::ReplyBmap,
    ) {
        reply.bmap(0);
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        // persistence rides on the monitor's coalescing, not on flush
        reply.ok();
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }
}

struct JoinedOverlay {
    remote_peers: usize,
    bootstrap: Option<(Arc<BootstrapClient>, PeerEndpoint)>,
}

/// Fetch known peers and join the overlay, or become its first peer.
fn join_overlay(
    runtime: &Runtime,
    config: &DaemonConfig,
    options: &RunOptions,
    dht: &Arc<MemoryDht>,
) -> Result<JoinedOverlay, DaemonError> {
    let local = PeerEndpoint::new(config.advertised_address.clone(), config.port);

    if let Some(peer) = &options.direct_peer {
        if !dht.join_peer(peer.clone()) {
            return Err(DaemonError::Bootstrap(format!(
                "could not join peer {}",
                peer
            )));
        }
        return Ok(JoinedOverlay {
            remote_peers: 1,
            bootstrap: None,
        });
    }

    let Some(url) = &config.bootstrap_url else {
        info!("no rendezvous configured, starting as bootstrap peer");
        return Ok(JoinedOverlay {
            remote_peers: 0,
            bootstrap: None,
        });
    };

    let client = Arc::new(
        BootstrapClient::new(url.clone()).map_err(|e| DaemonError::Bootstrap(e.to_string()))?,
    );
    // an unreachable rendezvous is not fatal: this peer starts alone
    let endpoints = match runtime.block_on(client.get_ips()) {
        Ok(endpoints) => endpoints,
        Err(e) => {
            warn!("rendezvous unreachable, starting as bootstrap peer: {}", e);
            Vec::new()
        }
    };

    let mut joined = 0usize;
    for endpoint in &endpoints {
        if *endpoint == local {
            continue;
        }
        if dht.join_peer(endpoint.to_authority()) {
            joined += 1;
        }
    }
    if !endpoints.iter().all(|e| *e == local) && joined == 0 {
        return Err(DaemonError::Bootstrap(
            "no known peer could be joined".to_string(),
        ));
    }

    if let Err(e) = runtime.block_on(client.register(&local)) {
        warn!("could not register with rendezvous: {}", e);
    }
    Ok(JoinedOverlay {
        remote_peers: joined,
        bootstrap: Some((client, local)),
    })
}

pub fn run_daemon(options: RunOptions) -> Result<(), DaemonError> {
    let mut config = DaemonConfig::load(&options.config_path).map_err(DaemonError::Config)?;
    if let Some(mountpoint) = &options.mountpoint {
        config.mount_point = mountpoint.clone();
    }

    let runtime = Runtime::new().map_err(|e| DaemonError::Io(e.to_string()))?;
    let dht = Arc::new(MemoryDht::with_local_endpoint(format!(
        "{}:{}",
        config.advertised_address, config.port
    )));

    let overlay = join_overlay(&runtime, &config, &options, &dht)?;

    let stat = FsStat::new(config.stat_config());
    stat.initial_size(overlay.remote_peers as u64 + 1);
    dht.add_peer_map_listener(Arc::new(ResizeOnPeerMapChange::new(stat.clone())));

    let keep_alive_task = overlay.bootstrap.as_ref().map(|(client, endpoint)| {
        let _guard = runtime.enter();
        client
            .clone()
            .spawn_keep_alive(endpoint.clone(), config.keep_alive_interval())
    });

    let (fs, handles) = {
        let _guard = runtime.enter();
        start_peer_fs(
            dht.clone(),
            stat,
            config.monitor_config(),
            config.sync_interval(),
        )
    };

    std::fs::create_dir_all(&config.mount_point).map_err(|e| {
        DaemonError::Io(format!(
            "create mountpoint {} failed: {}",
            config.mount_point.display(),
            e
        ))
    })?;

    let filesystem = DhtFs::new(fs.clone());
    let mount_options = vec![
        MountOption::FSName("dhtfs".to_string()),
        MountOption::DefaultPermissions,
    ];
    #[cfg(not(target_os = "macos"))]
    let mut mount_options = mount_options;
    #[cfg(not(target_os = "macos"))]
    mount_options.push(MountOption::AutoUnmount);

    info!(
        "mounting dhtfs at {} ({} remote peers)",
        config.mount_point.display(),
        overlay.remote_peers
    );
    let session = fuser::spawn_mount2(filesystem, &config.mount_point, &mount_options)
        .map_err(|e| DaemonError::Mount(e.to_string()))?;
    println!("dhtfs mounted at {}", config.mount_point.display());

    if config.start_cli {
        cli::run_repl(&runtime, dht.clone(), fs);
        drop(session);
    } else {
        session.join();
    }

    // unmounted: stop the loops, clear the mount dir, leave the overlay
    runtime.block_on(handles.shutdown(SHUTDOWN_GRACE));
    if let Some(task) = keep_alive_task {
        task.abort();
    }
    if let Err(e) = std::fs::remove_dir_all(&config.mount_point) {
        warn!(
            "could not remove mountpoint {}: {}",
            config.mount_point.display(),
            e
        );
    }
    if let Some((client, endpoint)) = overlay.bootstrap {
        if let Err(e) = runtime.block_on(client.deregister(&endpoint)) {
            warn!("could not deregister from rendezvous: {}", e);
        }
    }
    if let Err(e) = runtime.block_on(dht.shutdown()) {
        warn!("dht shutdown failed: {}", e);
    }
    info!("dhtfs shut down");
    Ok(())
}

#[cfg(test)]
mod daemon_tests;
