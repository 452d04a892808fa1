use sha2::{Digest, Sha256};
use std::fmt;

/// Key into the DHT keyspace. Both file content and path-index entries are
/// addressed by the SHA-256 of the absolute path string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DhtKey([u8; 32]);

/// Location of the global path-enumeration bucket. Every stored path is
/// registered under this location with its own path hash as content key, so
/// any peer can list all paths currently present in the DHT.
pub fn keys_location() -> DhtKey {
    DhtKey::from_str("keys")
}

impl DhtKey {
    pub fn from_str(value: &str) -> Self {
        Self::from_bytes(value.as_bytes())
    }

    pub fn from_bytes(value: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(value);
        Self(hasher.finalize().into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex form used where a full digest would be unwieldy, e.g. in
    /// version-folder names.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for DhtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for DhtKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhtKey({})", self.short_hex())
    }
}
