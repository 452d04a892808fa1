use log::{debug, warn};

use dht_store::{DhtClientRef, DhtKey, DhtResult};

use crate::mirror::{MirrorRef, ROOT_ID};
use crate::paths;

const VERSION_FOLDER_PREFIX: &str = ".v";
const VERSION_FOLDER_HEX_LEN: usize = 16;

/// On-mount directory exposing the history of `path`, derived from the
/// content key so every peer computes the same name.
pub fn version_folder(path: &str) -> String {
    format!(
        "/{}{}",
        VERSION_FOLDER_PREFIX,
        DhtKey::from_str(path).short_hex()
    )
}

pub fn is_version_folder_name(name: &str) -> bool {
    name.len() == VERSION_FOLDER_PREFIX.len() + VERSION_FOLDER_HEX_LEN
        && name.starts_with(VERSION_FOLDER_PREFIX)
        && name[VERSION_FOLDER_PREFIX.len()..]
            .bytes()
            .all(|b| b.is_ascii_hexdigit())
}

/// True when `path` is a version folder or lives inside one. Such paths
/// never enter the file monitor; a flush there would mint versions of
/// versions without end.
pub fn is_version_path(path: &str) -> bool {
    paths::components(path).any(is_version_folder_name)
}

/// Keeper of per-path history.
///
/// Old content blobs go into the DHT's versioned keyspace under the path's
/// content key, indexed by an ever-growing chain position, and are mirrored
/// as plain files inside the version folder so history is browsable on the
/// mount. Chain entries only ever hold superseded content, never the
/// current one.
pub struct VersionArchiver {
    dht: DhtClientRef,
    mirror: MirrorRef,
}

impl VersionArchiver {
    pub fn new(dht: DhtClientRef, mirror: MirrorRef) -> Self {
        Self { dht, mirror }
    }

    /// Append `old_blob` to the chain for `path` and expose it locally.
    /// Returns the chain index it was stored under.
    pub async fn archive(&self, path: &str, old_blob: Vec<u8>) -> DhtResult<u64> {
        let key = DhtKey::from_str(path);
        let versions = self.dht.get_versions(&key).await?;
        let next = versions.last().map(|v| v + 1).unwrap_or(0);
        self.dht.put_versioned(&key, next, old_blob.clone()).await?;
        debug!("archived {} as version {}", path, next);
        self.materialize_version(path, next, &old_blob);
        Ok(next)
    }

    /// Install one historical blob as `V(path)/<index>` in the mirror,
    /// bypassing the monitor. Also used by the syncer when it pulls chains
    /// written by other peers.
    pub fn materialize_version(&self, path: &str, version: u64, blob: &[u8]) {
        let folder = version_folder(path);
        let folder_name = paths::last_component(&folder).to_string();
        let file_name = version.to_string();

        let mut mirror = match self.mirror.write() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let folder_id = match mirror.find(&folder) {
            Some(id) => id,
            None => match mirror.mkdir(ROOT_ID, &folder_name) {
                Ok(id) => id,
                Err(e) => {
                    warn!("could not create version folder {}: {}", folder, e);
                    return;
                }
            },
        };
        let file_id = match mirror.find(&paths::join(&folder, &file_name)) {
            Some(id) => id,
            None => match mirror.mkfile(folder_id, &file_name) {
                Ok(id) => id,
                Err(e) => {
                    warn!("could not create version file {}/{}: {}", folder, file_name, e);
                    return;
                }
            },
        };
        if let Err(e) = mirror.set_content(file_id, blob.to_vec()) {
            warn!("could not fill version file {}/{}: {}", folder, file_name, e);
        }
    }

    /// Chain indexes already materialized locally for `path`.
    pub fn local_versions(&self, path: &str) -> Vec<u64> {
        let folder = version_folder(path);
        let mirror = match self.mirror.read() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };
        let folder_id = match mirror.find(&folder) {
            Some(id) => id,
            None => return Vec::new(),
        };
        match mirror.children(folder_id) {
            Ok(children) => children
                .into_iter()
                .filter_map(|(name, _)| name.parse::<u64>().ok())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Delete every chain entry for `path` from the DHT. Runs before the
    /// path's own content key goes away so the chain cannot be orphaned.
    pub async fn remove_chain(&self, path: &str) -> DhtResult<()> {
        let key = DhtKey::from_str(path);
        for version in self.dht.get_versions(&key).await? {
            self.dht.remove_versioned(&key, version).await?;
        }
        debug!("removed version chain for {}", path);
        Ok(())
    }

    /// Drop the on-mount version folder for `path`, if present.
    pub fn remove_local_folder(&self, path: &str) {
        let folder = version_folder(path);
        let mut mirror = match self.mirror.write() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if let Some(id) = mirror.find(&folder) {
            if let Err(e) = mirror.remove(id) {
                warn!("could not remove version folder {}: {}", folder, e);
            }
        }
    }
}
