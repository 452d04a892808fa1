use async_trait::async_trait;
use log::info;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};
use tokio::sync::RwLock;

use crate::{DhtClient, DhtError, DhtKey, DhtResult, PeerMapChangeListener};

/// Process-local DHT engine.
///
/// The Kademlia overlay itself lives behind the [`DhtClient`] trait; this
/// engine backs a single process with plain, versioned and bucketed
/// keyspaces and a simulated peer map that feeds the same listener interface
/// a routed overlay would. It is the store the daemon runs on and the one
/// the test suites exercise.
pub struct MemoryDht {
    plain: RwLock<HashMap<DhtKey, Vec<u8>>>,
    versioned: RwLock<HashMap<DhtKey, BTreeMap<u64, Vec<u8>>>>,
    buckets: RwLock<HashMap<DhtKey, HashMap<DhtKey, Vec<u8>>>>,
    peers: StdRwLock<Vec<String>>,
    listeners: Mutex<Vec<Arc<dyn PeerMapChangeListener>>>,
    local_endpoint: Option<String>,
    shut_down: AtomicBool,
}

impl MemoryDht {
    pub fn new() -> Self {
        Self {
            plain: RwLock::new(HashMap::new()),
            versioned: RwLock::new(HashMap::new()),
            buckets: RwLock::new(HashMap::new()),
            peers: StdRwLock::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            local_endpoint: None,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_local_endpoint(endpoint: impl Into<String>) -> Self {
        let mut dht = Self::new();
        dht.local_endpoint = Some(endpoint.into());
        dht
    }

    fn ensure_running(&self) -> DhtResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(DhtError::ShutDown);
        }
        Ok(())
    }

    fn notify_peer_map_change(&self) {
        let count = self.peer_count();
        let listeners = match self.listeners.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => return,
        };
        for listener in listeners {
            listener.on_peer_map_change(count);
        }
    }

    /// Record a remote peer in the peer map. Returns false if the endpoint
    /// was already known.
    pub fn join_peer(&self, endpoint: impl Into<String>) -> bool {
        let endpoint = endpoint.into();
        let added = {
            let mut peers = match self.peers.write() {
                Ok(guard) => guard,
                Err(_) => return false,
            };
            if peers.contains(&endpoint) {
                false
            } else {
                peers.push(endpoint.clone());
                true
            }
        };
        if added {
            info!("peer joined: {}", endpoint);
            self.notify_peer_map_change();
        }
        added
    }

    /// Drop a remote peer from the peer map.
    pub fn leave_peer(&self, endpoint: &str) {
        let removed = {
            let mut peers = match self.peers.write() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            match peers.iter().position(|p| p == endpoint) {
                Some(pos) => {
                    peers.remove(pos);
                    true
                }
                None => false,
            }
        };
        if removed {
            info!("peer left: {}", endpoint);
            self.notify_peer_map_change();
        }
    }
}

impl Default for MemoryDht {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DhtClient for MemoryDht {
    async fn put(&self, key: DhtKey, data: Vec<u8>) -> DhtResult<()> {
        self.ensure_running()?;
        self.plain.write().await.insert(key, data);
        Ok(())
    }

    async fn get(&self, key: &DhtKey) -> DhtResult<Option<Vec<u8>>> {
        self.ensure_running()?;
        Ok(self.plain.read().await.get(key).cloned())
    }

    async fn remove(&self, key: &DhtKey) -> DhtResult<()> {
        self.ensure_running()?;
        self.plain.write().await.remove(key);
        Ok(())
    }

    async fn put_versioned(&self, key: &DhtKey, version: u64, data: Vec<u8>) -> DhtResult<()> {
        self.ensure_running()?;
        self.versioned
            .write()
            .await
            .entry(*key)
            .or_default()
            .insert(version, data);
        Ok(())
    }

    async fn get_versioned(&self, key: &DhtKey, version: u64) -> DhtResult<Option<Vec<u8>>> {
        self.ensure_running()?;
        Ok(self
            .versioned
            .read()
            .await
            .get(key)
            .and_then(|chain| chain.get(&version).cloned()))
    }

    async fn remove_versioned(&self, key: &DhtKey, version: u64) -> DhtResult<()> {
        self.ensure_running()?;
        let mut versioned = self.versioned.write().await;
        if let Some(chain) = versioned.get_mut(key) {
            chain.remove(&version);
            if chain.is_empty() {
                versioned.remove(key);
            }
        }
        Ok(())
    }

    async fn get_versions(&self, key: &DhtKey) -> DhtResult<Vec<u64>> {
        self.ensure_running()?;
        Ok(self
            .versioned
            .read()
            .await
            .get(key)
            .map(|chain| chain.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn put_under(
        &self,
        location: &DhtKey,
        content_key: DhtKey,
        data: Vec<u8>,
    ) -> DhtResult<()> {
        self.ensure_running()?;
        self.buckets
            .write()
            .await
            .entry(*location)
            .or_default()
            .insert(content_key, data);
        Ok(())
    }

    async fn get_all_under(&self, location: &DhtKey) -> DhtResult<HashMap<DhtKey, Vec<u8>>> {
        self.ensure_running()?;
        Ok(self
            .buckets
            .read()
            .await
            .get(location)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_under(&self, location: &DhtKey, content_key: &DhtKey) -> DhtResult<()> {
        self.ensure_running()?;
        let mut buckets = self.buckets.write().await;
        if let Some(bucket) = buckets.get_mut(location) {
            bucket.remove(content_key);
            if bucket.is_empty() {
                buckets.remove(location);
            }
        }
        Ok(())
    }

    fn add_peer_map_listener(&self, listener: Arc<dyn PeerMapChangeListener>) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(listener);
        }
    }

    fn peer_count(&self) -> usize {
        self.peers.read().map(|peers| peers.len()).unwrap_or(0)
    }

    fn local_endpoint(&self) -> Option<String> {
        self.local_endpoint.clone()
    }

    async fn shutdown(&self) -> DhtResult<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        info!("dht engine shut down");
        Ok(())
    }
}
