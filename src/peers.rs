//! Defines the boundary between cache groups and the peer transport.
//!
//! A [Group](crate::group::Group) itself has no notion of a network. It only knows two small
//! abstractions: a [PeerPicker] which answers "who owns this key?" and a [PeerGetter] which
//! fetches the authoritative bytes from that owner. The transport layer (see
//! [pool](crate::pool) and [server](crate::server)) implements both on top of TCP - but any
//! other transport can be plugged in by implementing these two traits.
use std::sync::Arc;

/// Determines the peer which owns a given key.
pub trait PeerPicker: Send + Sync {
    /// Returns a getter for the peer owning the given key.
    ///
    /// Returns **None** if the key is owned by the local node (or if no peer is reachable), in
    /// which case the caller must load the value locally.
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>>;
}

/// Fetches the authoritative bytes for a key from the peer owning it.
#[async_trait::async_trait]
pub trait PeerGetter: Send + Sync {
    /// Fetches the value stored for the given key within the given group from the remote peer.
    ///
    /// An error makes the calling group fall back to loading the value from its local origin.
    async fn fetch(&self, group: &str, key: &str) -> anyhow::Result<Vec<u8>>;
}
