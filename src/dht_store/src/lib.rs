mod bootstrap;
mod client;
mod key;
mod memory_dht;

pub use bootstrap::{BootstrapClient, PeerEndpoint};
pub use client::{DhtClient, DhtClientRef, PeerMapChangeListener};
pub use key::{keys_location, DhtKey};
pub use memory_dht::MemoryDht;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DhtError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("key not found: {0}")]
    NotFound(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("peer is shut down")]
    ShutDown,
}

pub type DhtResult<T> = Result<T, DhtError>;
