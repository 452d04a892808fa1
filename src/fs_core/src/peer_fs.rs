use log::{info, warn};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use dht_store::{keys_location, DhtClientRef, DhtKey};

use crate::archiver::{is_version_path, VersionArchiver};
use crate::events::EventBus;
use crate::fs_stat::{FsStat, FsStatSnapshot};
use crate::mirror::{FileStat, Mirror, MirrorRef, NodeKind, NodeType};
use crate::monitor::{FileMonitor, MonitorConfig};
use crate::paths;
use crate::syncer::{DhtSyncer, SyncTriggerListener};
use crate::writer::WriteBackListener;
use crate::{FsError, FsResult};

/// Prefix fetched on `open` of a not-yet-loaded file, forcing the lazy-load
/// path to materialize content before the first real `read`.
const LAZY_READ_SIZE: u64 = 1 << 20;

/// Path-level filesystem facade the VFS adapter drives.
///
/// Every operation is synchronous against the mirror and the monitor;
/// nothing here waits on the network. DHT removals ride on detached tasks
/// and persistence of new content flows through the monitor → bus → writer
/// pipeline.
pub struct PeerFs {
    mirror: MirrorRef,
    monitor: Arc<FileMonitor>,
    dht: DhtClientRef,
    archiver: Arc<VersionArchiver>,
    stat: Arc<FsStat>,
    runtime: tokio::runtime::Handle,
}

impl PeerFs {
    pub fn mirror(&self) -> &MirrorRef {
        &self.mirror
    }

    pub fn monitor(&self) -> &Arc<FileMonitor> {
        &self.monitor
    }

    fn read_mirror(&self) -> std::sync::RwLockReadGuard<'_, Mirror> {
        match self.mirror.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_mirror(&self) -> std::sync::RwLockWriteGuard<'_, Mirror> {
        match self.mirror.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Remove `paths` from the DHT off-thread. Failures are logged and left
    /// to the syncer; the mirror is already consistent.
    fn spawn_dht_remove(&self, paths: Vec<String>, with_chain: bool) {
        let dht = self.dht.clone();
        let archiver = self.archiver.clone();
        self.runtime.spawn(async move {
            for path in paths {
                if with_chain {
                    if let Err(e) = archiver.remove_chain(&path).await {
                        warn!("could not remove version chain of {}: {}", path, e);
                    }
                }
                let key = DhtKey::from_str(&path);
                if let Err(e) = dht.remove(&key).await {
                    warn!("could not remove content of {}: {}", path, e);
                }
                if let Err(e) = dht.remove_under(&keys_location(), &key).await {
                    warn!("could not deregister path {}: {}", path, e);
                }
            }
        });
    }

    pub fn getattr(&self, path: &str) -> FsResult<FileStat> {
        let mirror = self.read_mirror();
        let id = mirror
            .find(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        mirror.stat(id)
    }

    pub fn readdir(&self, path: &str) -> FsResult<Vec<(String, NodeType)>> {
        let mirror = self.read_mirror();
        let id = mirror
            .find(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        mirror.children(id)
    }

    /// `open` never fails; its one job is to poke empty files (or an empty
    /// symlink target) so a read is issued and the syncer's lazy-load path
    /// gets a chance to fill the buffer.
    pub fn open(&self, path: &str) -> FsResult<()> {
        let poke = {
            let mirror = self.read_mirror();
            match mirror.find(path).and_then(|id| mirror.node(id)) {
                Some(node) => match &node.kind {
                    NodeKind::File { content } if content.is_empty() => Some(path.to_string()),
                    NodeKind::Symlink { target } => {
                        let target_id = mirror
                            .find(target)
                            .or_else(|| mirror.find(&paths::join("/", paths::last_component(target))));
                        match target_id {
                            Some(tid) => match mirror.node(tid).map(|node| &node.kind) {
                                Some(NodeKind::File { content }) if content.is_empty() => {
                                    Some(mirror.path_of(tid))
                                }
                                _ => None,
                            },
                            None => None,
                        }
                    }
                    _ => None,
                },
                None => None,
            }
        };
        if let Some(target) = poke {
            let _ = self.read(&target, LAZY_READ_SIZE, 0);
        }
        Ok(())
    }

    pub fn read(&self, path: &str, size: u64, offset: u64) -> FsResult<Vec<u8>> {
        {
            let mirror = self.read_mirror();
            let id = mirror
                .find(path)
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
            if let Some(node) = mirror.node(id) {
                if node.node_type() == NodeType::Directory {
                    return Err(FsError::IsADirectory(path.to_string()));
                }
            }
        }

        // unflushed writes live in the monitor; serve those bytes first
        if let Some(snapshot) = self.monitor.get(path) {
            let len = snapshot.len() as u64;
            if offset >= len {
                return Ok(Vec::new());
            }
            let end = len.min(offset + size) as usize;
            return Ok(snapshot[offset as usize..end].to_vec());
        }

        let mut mirror = self.write_mirror();
        let id = mirror
            .find(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        mirror.read(id, size, offset)
    }

    pub fn write(&self, path: &str, data: &[u8], offset: u64) -> FsResult<usize> {
        let (written, content) = {
            let mut mirror = self.write_mirror();
            let id = mirror
                .find(path)
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
            let written = mirror.write(id, data, offset)?;
            (written, mirror.content(id)?)
        };
        if !is_version_path(path) {
            self.monitor.add(path, content);
        }
        Ok(written)
    }

    /// Create a file or a directory at `path`; the last component's name
    /// decides which (see [`paths::is_file_name`]).
    pub fn create(&self, path: &str) -> FsResult<()> {
        let name = paths::last_component(path).to_string();
        if name.is_empty() {
            return Err(FsError::InvalidArgument(path.to_string()));
        }
        let made_file = {
            let mut mirror = self.write_mirror();
            if mirror.find(path).is_some() {
                return Err(FsError::AlreadyExists(path.to_string()));
            }
            let parent = self.locate_parent(&mirror, path)?;
            if paths::is_file_name(&name) {
                mirror.mkfile(parent, &name)?;
                true
            } else {
                mirror.mkdir(parent, &name)?;
                false
            }
        };
        if made_file && !is_version_path(path) {
            self.monitor.add(path, Vec::new());
        }
        Ok(())
    }

    pub fn mkdir(&self, path: &str) -> FsResult<()> {
        let name = paths::last_component(path).to_string();
        if name.is_empty() {
            return Err(FsError::InvalidArgument(path.to_string()));
        }
        {
            let mut mirror = self.write_mirror();
            if mirror.find(path).is_some() {
                return Err(FsError::AlreadyExists(path.to_string()));
            }
            let parent = self.locate_parent(&mirror, path)?;
            mirror.mkdir(parent, &name)?;
        }
        // directories are registered in the DHT as empty content, which is
        // what makes them enumerable on other peers
        if !is_version_path(path) {
            self.monitor.add(path, Vec::new());
        }
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        {
            let mut mirror = self.write_mirror();
            let id = mirror
                .find(path)
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
            let node = mirror
                .node(id)
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
            if node.node_type() != NodeType::Directory {
                return Err(FsError::NotADirectory(path.to_string()));
            }
            if !mirror.children(id)?.is_empty() {
                return Err(FsError::NotEmpty(path.to_string()));
            }
            // drop any pending registration before the node goes away, or
            // the flush would resurrect the deleted path in the DHT
            self.monitor.remove(path);
            mirror.remove(id)?;
        }
        if !is_version_path(path) {
            self.spawn_dht_remove(vec![path.to_string()], false);
        }
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let node_type = {
            let mirror = self.read_mirror();
            let id = mirror
                .find(path)
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
            mirror
                .node(id)
                .map(|node| node.node_type())
                .ok_or_else(|| FsError::NotFound(path.to_string()))?
        };
        // drop any pending registration first so a later flush cannot
        // resurrect the deleted path in the DHT
        self.monitor.remove(path);

        let keeps_history = node_type != NodeType::Directory && !is_version_path(path);
        if keeps_history {
            // history goes before the path itself so the chain cannot be
            // orphaned once the content key is gone
            self.archiver.remove_local_folder(path);
        }
        {
            let mut mirror = self.write_mirror();
            if let Some(id) = mirror.find(path) {
                mirror.remove(id)?;
            }
        }
        if !is_version_path(path) {
            self.spawn_dht_remove(vec![path.to_string()], keeps_history);
        }
        info!("unlinked {}", path);
        Ok(())
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> FsResult<()> {
        if old_path == new_path {
            return Ok(());
        }
        let new_name = paths::last_component(new_path).to_string();
        if new_name.is_empty() {
            return Err(FsError::InvalidArgument(new_path.to_string()));
        }

        let (old_paths, new_entries, replaced) = {
            let mut mirror = self.write_mirror();
            let id = mirror
                .find(old_path)
                .ok_or_else(|| FsError::NotFound(old_path.to_string()))?;
            let new_parent = self.locate_parent(&mirror, new_path)?;

            // an existing target is replaced, as the kernel expects
            let mut replaced = None;
            if let Some(existing) = mirror.find(new_path) {
                if existing == id {
                    return Ok(());
                }
                mirror.remove(existing)?;
                replaced = Some(new_path.to_string());
            }

            let old_paths: Vec<String> = mirror
                .subtree_paths(id)
                .into_iter()
                .map(|(_, path)| path)
                .collect();
            mirror.detach(id)?;
            mirror.attach(id, new_parent, &new_name)?;
            let new_entries: Vec<(String, Vec<u8>)> = mirror
                .subtree_paths(id)
                .into_iter()
                .filter_map(|(node_id, path)| {
                    mirror.content(node_id).ok().map(|content| (path, content))
                })
                .collect();
            (old_paths, new_entries, replaced)
        };

        for path in &old_paths {
            self.monitor.remove(path);
        }
        if let Some(replaced) = &replaced {
            self.monitor.remove(replaced);
        }
        let mut doomed: Vec<String> = old_paths;
        doomed.extend(replaced);
        self.spawn_dht_remove(doomed, false);

        // the moved subtree re-enters the monitor under its new paths, so
        // the writer re-registers every entry and the other peers' syncers
        // never mistake the move for a deletion
        for (path, content) in new_entries {
            if !is_version_path(&path) {
                self.monitor.add(&path, content);
            }
        }
        info!("moved {} to {}", old_path, new_path);
        Ok(())
    }

    pub fn truncate(&self, path: &str, size: u64) -> FsResult<()> {
        let content = {
            let mut mirror = self.write_mirror();
            let id = mirror
                .find(path)
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
            mirror.truncate(id, size)?;
            mirror.content(id)?
        };
        if !is_version_path(path) {
            self.monitor.add(path, content);
        }
        Ok(())
    }

    /// Create a symlink at `link_path` aliasing `existing`. Only the last
    /// component of `existing` is resolved (from the root); cross-directory
    /// targets are not fully supported.
    pub fn symlink(&self, existing: &str, link_path: &str) -> FsResult<()> {
        if existing.is_empty() {
            return Err(FsError::NotFound(existing.to_string()));
        }
        let link_name = paths::last_component(link_path).to_string();
        if link_name.is_empty() {
            return Err(FsError::InvalidArgument(link_path.to_string()));
        }
        let target_path = {
            let mut mirror = self.write_mirror();
            let existing_id = mirror
                .find(&paths::join("/", paths::last_component(existing)))
                .ok_or_else(|| FsError::NotFound(existing.to_string()))?;
            let target_path = mirror.path_of(existing_id);
            let parent = self.locate_parent(&mirror, link_path)?;
            mirror.mksymlink(parent, &link_name, &target_path)?;
            target_path
        };
        if !is_version_path(link_path) {
            self.monitor.add(link_path, target_path.into_bytes());
        }
        Ok(())
    }

    /// Name of the node a symlink aliases, for the kernel to re-resolve.
    pub fn readlink(&self, path: &str) -> FsResult<String> {
        let mirror = self.read_mirror();
        let id = mirror
            .find(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        match mirror.node(id).map(|node| &node.kind) {
            Some(NodeKind::Symlink { target }) => {
                Ok(paths::last_component(target).to_string())
            }
            Some(_) => Err(FsError::InvalidArgument(path.to_string())),
            None => Err(FsError::NotFound(path.to_string())),
        }
    }

    pub fn utimens(&self, path: &str, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        let mut mirror = self.write_mirror();
        let id = mirror
            .find(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        mirror.set_times(id, atime, mtime)
    }

    pub fn statfs(&self) -> FsStatSnapshot {
        let (used_bytes, used_files) = self.read_mirror().usage();
        self.stat.record_usage(used_bytes, used_files);
        self.stat.snapshot()
    }

    fn locate_parent(&self, mirror: &Mirror, path: &str) -> FsResult<crate::mirror::NodeId> {
        let parent_path = paths::parent_path(path);
        let parent = mirror
            .find(parent_path)
            .ok_or_else(|| FsError::NotFound(parent_path.to_string()))?;
        match mirror.node(parent).map(|node| node.node_type()) {
            Some(NodeType::Directory) => Ok(parent),
            Some(_) => Err(FsError::NotADirectory(parent_path.to_string())),
            None => Err(FsError::NotFound(parent_path.to_string())),
        }
    }
}

/// Background tasks behind a running [`PeerFs`].
pub struct PeerFsHandles {
    pub monitor: Arc<FileMonitor>,
    pub syncer: Arc<DhtSyncer>,
    pub monitor_task: JoinHandle<()>,
    pub syncer_task: JoinHandle<()>,
    pub bus_task: JoinHandle<()>,
}

impl PeerFsHandles {
    /// Stop the monitor and syncer loops, waiting up to `grace` for each
    /// before cancelling outright. The bus is cancelled last.
    pub async fn shutdown(self, grace: Duration) {
        self.monitor.terminate();
        self.syncer.terminate();
        let monitor_abort = self.monitor_task.abort_handle();
        if timeout(grace, self.monitor_task).await.is_err() {
            warn!("file monitor did not stop within {:?}, cancelling", grace);
            monitor_abort.abort();
        }
        let syncer_abort = self.syncer_task.abort_handle();
        if timeout(grace, self.syncer_task).await.is_err() {
            warn!("dht syncer did not stop within {:?}, cancelling", grace);
            syncer_abort.abort();
        }
        self.bus_task.abort();
    }
}

/// Wire up mirror, monitor, bus, listeners and syncer around `dht`, start
/// the background loops, and hand back the facade plus the task handles.
/// Must run inside a tokio runtime.
pub fn start_peer_fs(
    dht: DhtClientRef,
    stat: Arc<FsStat>,
    monitor_config: MonitorConfig,
    sync_interval: Duration,
) -> (Arc<PeerFs>, PeerFsHandles) {
    let mirror = Mirror::new_shared();
    let archiver = Arc::new(VersionArchiver::new(dht.clone(), mirror.clone()));
    let trigger = Arc::new(Notify::new());

    let mut bus = EventBus::new();
    bus.register(Arc::new(WriteBackListener::new(
        dht.clone(),
        archiver.clone(),
        mirror.clone(),
    )));
    bus.register(Arc::new(SyncTriggerListener::new(trigger.clone())));
    let (bus_handle, bus_task) = bus.spawn();

    let monitor = FileMonitor::new(bus_handle, monitor_config);
    let monitor_task = monitor.spawn();

    let syncer = DhtSyncer::new(
        dht.clone(),
        mirror.clone(),
        monitor.clone(),
        archiver.clone(),
        trigger,
    );
    let syncer_task = syncer.spawn(sync_interval);

    let fs = Arc::new(PeerFs {
        mirror,
        monitor: monitor.clone(),
        dht,
        archiver,
        stat,
        runtime: tokio::runtime::Handle::current(),
    });
    let handles = PeerFsHandles {
        monitor,
        syncer,
        monitor_task,
        syncer_task,
        bus_task,
    };
    (fs, handles)
}
