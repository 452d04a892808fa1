use log::info;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs_core::{FsStatConfig, MonitorConfig};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/dhtfs/daemon.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub mount_point: PathBuf,
    /// Local peer listen port, advertised to the rendezvous service.
    pub port: u16,
    pub advertised_address: String,
    /// Spin a command REPL on stdin after mounting.
    pub start_cli: bool,

    pub block_size: u32,
    /// statfs capacity contributed per peer, in blocks.
    pub initial_blocks: u64,
    pub initial_files: u64,

    pub monitor_initial_countdown: u32,
    pub monitor_tick_interval_ms: u64,
    pub monitor_idle_eviction: u32,

    pub sync_interval_ms: u64,
    pub keep_alive_interval_ms: u64,
    /// Base URL of the bootstrap rendezvous service; without one the peer
    /// starts alone as its own bootstrap peer.
    pub bootstrap_url: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            mount_point: PathBuf::from("/tmp/dhtfs"),
            port: 7700,
            advertised_address: "127.0.0.1".to_string(),
            start_cli: false,
            block_size: 4000,
            initial_blocks: 250_000,
            initial_files: 50_000,
            monitor_initial_countdown: 3,
            monitor_tick_interval_ms: 1000,
            monitor_idle_eviction: 10,
            sync_interval_ms: 10_000,
            keep_alive_interval_ms: 30_000,
            bootstrap_url: None,
        }
    }
}

impl DaemonConfig {
    /// Load from a JSON file; a missing file yields the defaults, anything
    /// unreadable or unparsable is an error.
    pub fn load(path: &Path) -> Result<Self, String> {
        if !path.exists() {
            info!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("could not read config {}: {}", path.display(), e))?;
        serde_json::from_str(&raw)
            .map_err(|e| format!("could not parse config {}: {}", path.display(), e))
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            initial_countdown: self.monitor_initial_countdown,
            tick_interval: Duration::from_millis(self.monitor_tick_interval_ms),
            idle_eviction: self.monitor_idle_eviction,
        }
    }

    pub fn stat_config(&self) -> FsStatConfig {
        FsStatConfig {
            bsize: self.block_size,
            blocks_per_peer: self.initial_blocks,
            files_per_peer: self.initial_files,
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }
}
