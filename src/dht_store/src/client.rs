use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::{DhtKey, DhtResult};

/// Notified whenever the overlay's peer map changes. `peer_count` is the
/// number of known remote peers, not counting the local one.
pub trait PeerMapChangeListener: Send + Sync {
    fn on_peer_map_change(&self, peer_count: usize);
}

/// Key/value boundary of the peer overlay.
///
/// Three keyspaces: plain entries (file content), versioned entries (the
/// per-path history chain), and location buckets (`put_under`), of which the
/// path-enumeration bucket at [`crate::keys_location`] is the only one this
/// system uses. A removed plain entry takes no version history with it;
/// version entries are removed one by one.
#[async_trait]
pub trait DhtClient: Send + Sync {
    async fn put(&self, key: DhtKey, data: Vec<u8>) -> DhtResult<()>;
    async fn get(&self, key: &DhtKey) -> DhtResult<Option<Vec<u8>>>;
    async fn remove(&self, key: &DhtKey) -> DhtResult<()>;

    async fn put_versioned(&self, key: &DhtKey, version: u64, data: Vec<u8>) -> DhtResult<()>;
    async fn get_versioned(&self, key: &DhtKey, version: u64) -> DhtResult<Option<Vec<u8>>>;
    async fn remove_versioned(&self, key: &DhtKey, version: u64) -> DhtResult<()>;
    /// Version ids present for `key`, ascending.
    async fn get_versions(&self, key: &DhtKey) -> DhtResult<Vec<u64>>;

    async fn put_under(&self, location: &DhtKey, content_key: DhtKey, data: Vec<u8>)
        -> DhtResult<()>;
    async fn get_all_under(&self, location: &DhtKey) -> DhtResult<HashMap<DhtKey, Vec<u8>>>;
    async fn remove_under(&self, location: &DhtKey, content_key: &DhtKey) -> DhtResult<()>;

    fn add_peer_map_listener(&self, listener: Arc<dyn PeerMapChangeListener>);
    fn peer_count(&self) -> usize;
    fn local_endpoint(&self) -> Option<String>;

    async fn shutdown(&self) -> DhtResult<()>;
}

pub type DhtClientRef = Arc<dyn DhtClient>;
