use async_trait::async_trait;
use log::{error, info};
use std::sync::Arc;

use dht_store::{keys_location, DhtClientRef, DhtKey};

use crate::archiver::VersionArchiver;
use crate::events::{FsEvent, FsEventListener, COMPLETE_WRITE_EVENT};
use crate::mirror::{MirrorRef, NodeType};

/// Persists a coalesced write: archive the superseded blob, then store the
/// new content under the path's content key and register the path in the
/// enumeration bucket.
///
/// DHT failures are logged and go no further. By the time this listener
/// runs the kernel has long been told the write succeeded, and the mirror
/// already holds the bytes; the syncer re-converges whatever a lost put
/// left behind.
pub struct WriteBackListener {
    dht: DhtClientRef,
    archiver: Arc<VersionArchiver>,
    mirror: MirrorRef,
}

impl WriteBackListener {
    pub fn new(dht: DhtClientRef, archiver: Arc<VersionArchiver>, mirror: MirrorRef) -> Self {
        Self {
            dht,
            archiver,
            mirror,
        }
    }

    fn is_directory(&self, path: &str) -> bool {
        let mirror = match self.mirror.read() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        mirror
            .find(path)
            .and_then(|id| mirror.node(id))
            .map(|node| node.node_type() == NodeType::Directory)
            .unwrap_or(false)
    }
}

#[async_trait]
impl FsEventListener for WriteBackListener {
    fn event_name(&self) -> &'static str {
        COMPLETE_WRITE_EVENT
    }

    async fn handle_event(&self, event: &FsEvent) {
        let FsEvent::CompleteWrite { path, content } = event;
        let content_key = DhtKey::from_str(path);

        if !content.is_empty() {
            match self.dht.get(&content_key).await {
                Ok(Some(old_blob)) if !old_blob.is_empty() && !self.is_directory(path) => {
                    if let Err(e) = self.archiver.archive(path, old_blob).await {
                        error!("could not archive prior content of {}: {}", path, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("could not fetch prior content of {}: {}", path, e);
                }
            }
        }

        if let Err(e) = self.dht.put(content_key, content.clone()).await {
            error!("could not store content of {}: {}", path, e);
            return;
        }
        if let Err(e) = self
            .dht
            .put_under(&keys_location(), content_key, path.as_bytes().to_vec())
            .await
        {
            error!("could not register path {}: {}", path, e);
            return;
        }
        info!("wrote whole file {} ({} bytes) to dht", path, content.len());
    }
}
