use log::info;
use std::sync::{Arc, RwLock};

use dht_store::PeerMapChangeListener;

#[derive(Debug, Clone)]
pub struct FsStatConfig {
    pub bsize: u32,
    /// Reported capacity contributed by each peer, in blocks.
    pub blocks_per_peer: u64,
    pub files_per_peer: u64,
}

impl Default for FsStatConfig {
    fn default() -> Self {
        Self {
            bsize: 4000,
            blocks_per_peer: 250_000,
            files_per_peer: 50_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStatSnapshot {
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
}

#[derive(Debug, Default)]
struct FsStatState {
    blocks: u64,
    files: u64,
    used_blocks: u64,
    used_files: u64,
}

/// Source of `statfs` numbers.
///
/// Capacity is a linear function of overlay size: every peer that joins
/// grows the reported filesystem, and a shrinking peer map never pulls the
/// reported capacity below what is already in use.
pub struct FsStat {
    config: FsStatConfig,
    state: RwLock<FsStatState>,
}

impl FsStat {
    pub fn new(config: FsStatConfig) -> Arc<Self> {
        let state = FsStatState {
            blocks: config.blocks_per_peer,
            files: config.files_per_peer,
            ..Default::default()
        };
        Arc::new(Self {
            config,
            state: RwLock::new(state),
        })
    }

    /// Set capacity for `peer_count` peers at startup (the local peer
    /// included in the count).
    pub fn initial_size(&self, peer_count: u64) {
        self.apply_peer_count(peer_count.max(1));
    }

    /// React to a peer-map change; `peer_count` counts remote peers only.
    pub fn resize_for_peers(&self, peer_count: u64) {
        self.apply_peer_count(peer_count + 1);
    }

    fn apply_peer_count(&self, total_peers: u64) {
        let mut state = match self.state.write() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        state.blocks = (self.config.blocks_per_peer * total_peers).max(state.used_blocks);
        state.files = (self.config.files_per_peer * total_peers).max(state.used_files);
        info!(
            "fs capacity resized for {} peers: {} blocks",
            total_peers, state.blocks
        );
    }

    /// Record current mirror usage so free counts and the shrink floor stay
    /// honest.
    pub fn record_usage(&self, used_bytes: u64, used_files: u64) {
        if let Ok(mut state) = self.state.write() {
            state.used_blocks = used_bytes.div_ceil(self.config.bsize as u64);
            state.used_files = used_files;
            state.blocks = state.blocks.max(state.used_blocks);
            state.files = state.files.max(state.used_files);
        }
    }

    pub fn snapshot(&self) -> FsStatSnapshot {
        let state = match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        FsStatSnapshot {
            bsize: self.config.bsize,
            blocks: state.blocks,
            bfree: state.blocks - state.used_blocks,
            bavail: state.blocks - state.used_blocks,
            files: state.files,
            ffree: state.files - state.used_files,
        }
    }
}

/// Grows the reported filesystem whenever the overlay gains peers.
pub struct ResizeOnPeerMapChange {
    stat: Arc<FsStat>,
}

impl ResizeOnPeerMapChange {
    pub fn new(stat: Arc<FsStat>) -> Self {
        Self { stat }
    }
}

impl PeerMapChangeListener for ResizeOnPeerMapChange {
    fn on_peer_map_change(&self, peer_count: usize) {
        self.stat.resize_for_peers(peer_count as u64);
    }
}
