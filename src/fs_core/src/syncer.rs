use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use dht_store::{keys_location, DhtClientRef, DhtKey};

use crate::archiver::{is_version_path, VersionArchiver};
use crate::events::{FsEvent, FsEventListener, COMPLETE_WRITE_EVENT};
use crate::mirror::{MirrorRef, NodeId, NodeKind, ROOT_ID};
use crate::monitor::FileMonitor;
use crate::paths;

/// Reconciles the DHT's view of the namespace into the local mirror.
///
/// Each cycle enumerates the path bucket, materializes paths other peers
/// registered, backfills content for lazily-loaded files, pulls version
/// chains into version folders, and drops local paths whose DHT entries
/// vanished. All mirror writes here bypass the monitor; syncer-originated
/// changes must never flow back out as fresh commits.
pub struct DhtSyncer {
    dht: DhtClientRef,
    mirror: MirrorRef,
    monitor: Arc<FileMonitor>,
    archiver: Arc<VersionArchiver>,
    trigger: Arc<Notify>,
    stop: AtomicBool,
}

impl DhtSyncer {
    pub fn new(
        dht: DhtClientRef,
        mirror: MirrorRef,
        monitor: Arc<FileMonitor>,
        archiver: Arc<VersionArchiver>,
        trigger: Arc<Notify>,
    ) -> Arc<Self> {
        Arc::new(Self {
            dht,
            mirror,
            monitor,
            archiver,
            trigger,
            stop: AtomicBool::new(false),
        })
    }

    /// Run a reconcile cycle now instead of waiting for the next interval.
    pub fn trigger_sync(&self) {
        self.trigger.notify_one();
    }

    pub fn terminate(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.trigger.notify_one();
    }

    pub fn spawn(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let syncer = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = syncer.trigger.notified() => {}
                }
                if syncer.stop.load(Ordering::SeqCst) {
                    break;
                }
                syncer.sync_once().await;
            }
            info!("dht syncer loop stopped");
        })
    }

    pub async fn sync_once(&self) {
        let entries = match self.dht.get_all_under(&keys_location()).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("path enumeration failed, skipping sync cycle: {}", e);
                return;
            }
        };

        let mut remote_paths = BTreeSet::new();
        for (key, raw) in entries {
            match String::from_utf8(raw) {
                Ok(path) if path.starts_with('/') => {
                    remote_paths.insert(path);
                }
                Ok(path) => warn!("skipping non-absolute path entry {:?} under {}", path, key),
                Err(e) => warn!("skipping undecodable path entry under {}: {}", key, e),
            }
        }

        self.materialize_missing(&remote_paths);
        self.install_pending_content(&remote_paths).await;
        self.sync_version_chains(&remote_paths).await;
        self.remove_vanished(&remote_paths);
    }

    /// Create mirror nodes for remote paths not present locally. Parents
    /// come first out of the ordered set; missing intermediates become
    /// directories, the leaf is decided by the name heuristic.
    fn materialize_missing(&self, remote_paths: &BTreeSet<String>) {
        let mut mirror = match self.mirror.write() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        for path in remote_paths {
            if mirror.find(path).is_some() {
                continue;
            }
            let mut current = ROOT_ID;
            let mut walked = String::new();
            let component_count = paths::components(path).count();
            for (index, component) in paths::components(path).enumerate() {
                walked = paths::join(
                    if walked.is_empty() { "/" } else { walked.as_str() },
                    component,
                );
                if let Some(existing) = mirror.find(&walked) {
                    current = existing;
                    continue;
                }
                let is_leaf = index + 1 == component_count;
                let created = if is_leaf && paths::is_file_name(component) {
                    mirror.mkfile(current, component)
                } else {
                    mirror.mkdir(current, component)
                };
                match created {
                    Ok(id) => {
                        debug!("materialized remote path {}", walked);
                        current = id;
                    }
                    Err(e) => {
                        warn!("could not materialize {}: {}", walked, e);
                        break;
                    }
                }
            }
        }
    }

    /// Fetch content for local files that are still empty while the DHT
    /// holds bytes for them. Paths with unflushed local writes are left
    /// alone.
    async fn install_pending_content(&self, remote_paths: &BTreeSet<String>) {
        let mut pending = Vec::new();
        {
            let mirror = match self.mirror.read() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            for path in remote_paths {
                if self.monitor.contains(path) {
                    continue;
                }
                if let Some(id) = mirror.find(path) {
                    if let Some(node) = mirror.node(id) {
                        if matches!(&node.kind, NodeKind::File { content } if content.is_empty()) {
                            pending.push((id, path.clone()));
                        }
                    }
                }
            }
        }

        for (id, path) in pending {
            let data = match self.dht.get(&DhtKey::from_str(&path)).await {
                Ok(Some(data)) if !data.is_empty() => data,
                Ok(_) => continue,
                Err(e) => {
                    warn!("could not fetch content of {}: {}", path, e);
                    continue;
                }
            };
            let mut mirror = match self.mirror.write() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            // the file may have been written or removed while we fetched
            if self.monitor.contains(&path) || mirror.find(&path) != Some(id) {
                continue;
            }
            let still_empty = mirror
                .node(id)
                .map(|node| matches!(&node.kind, NodeKind::File { content } if content.is_empty()))
                .unwrap_or(false);
            if still_empty {
                if let Err(e) = mirror.set_content(id, data) {
                    warn!("could not install content of {}: {}", path, e);
                } else {
                    info!("installed remote content for {}", path);
                }
            }
        }
    }

    /// Mirror version chains written by other peers into local version
    /// folders. Chain blobs travel through the versioned keyspace only, so
    /// they never appear in the path bucket themselves.
    async fn sync_version_chains(&self, remote_paths: &BTreeSet<String>) {
        for path in remote_paths {
            if is_version_path(path) {
                continue;
            }
            let key = DhtKey::from_str(path);
            let versions = match self.dht.get_versions(&key).await {
                Ok(versions) if !versions.is_empty() => versions,
                Ok(_) => continue,
                Err(e) => {
                    warn!("could not list versions of {}: {}", path, e);
                    continue;
                }
            };
            let local: BTreeSet<u64> = self.archiver.local_versions(path).into_iter().collect();
            for version in versions {
                if local.contains(&version) {
                    continue;
                }
                match self.dht.get_versioned(&key, version).await {
                    Ok(Some(blob)) => self.archiver.materialize_version(path, version, &blob),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("could not fetch version {} of {}: {}", version, path, e);
                    }
                }
            }
        }
    }

    /// Drop local paths whose DHT registration disappeared: another peer
    /// unlinked them. Keeps the root, version folders (reconciled from
    /// chains, not from the bucket), monitored paths with unflushed writes,
    /// and ancestors of anything still registered.
    fn remove_vanished(&self, remote_paths: &BTreeSet<String>) {
        let mut protected: BTreeSet<String> = BTreeSet::new();
        for path in remote_paths {
            let mut cursor = path.as_str();
            loop {
                if !protected.insert(cursor.to_string()) {
                    break;
                }
                if cursor == "/" {
                    break;
                }
                cursor = paths::parent_path(cursor);
            }
        }

        let mut doomed: Vec<(NodeId, String)> = Vec::new();
        {
            let mirror = match self.mirror.read() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            for (path, _kind) in mirror.all_paths() {
                if path == "/" || is_version_path(&path) {
                    continue;
                }
                if protected.contains(&path) || self.monitor.contains(&path) {
                    continue;
                }
                // children go with their subtree root; skip nested entries
                if doomed
                    .iter()
                    .any(|(_, ancestor)| path.starts_with(&format!("{}/", ancestor)))
                {
                    continue;
                }
                if let Some(id) = mirror.find(&path) {
                    doomed.push((id, path));
                }
            }
        }

        if doomed.is_empty() {
            return;
        }
        let mut mirror = match self.mirror.write() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        for (id, path) in doomed {
            if mirror.find(&path) != Some(id) {
                continue;
            }
            if let Err(e) = mirror.remove(id) {
                warn!("could not remove vanished path {}: {}", path, e);
            } else {
                info!("removed {} after it vanished from the dht", path);
            }
        }
    }
}

/// Bus listener that nudges the syncer after every flush, so a freshly
/// committed write converges without waiting out the full interval.
pub struct SyncTriggerListener {
    trigger: Arc<Notify>,
}

impl SyncTriggerListener {
    pub fn new(trigger: Arc<Notify>) -> Self {
        Self { trigger }
    }
}

#[async_trait]
impl FsEventListener for SyncTriggerListener {
    fn event_name(&self) -> &'static str {
        COMPLETE_WRITE_EVENT
    }

    async fn handle_event(&self, _event: &FsEvent) {
        self.trigger.notify_one();
    }
}
