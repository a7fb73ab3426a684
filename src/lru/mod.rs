//! Provides a size constrained LRU cache.
//!
//! An LRU cache drops the least recently used entry once it is about to grow beyond the given
//! memory limit. The cache is generic over its values: everything for which the
//! [ByteSize](ByteSize) trait is implemented can be stored, which permits the cache to perform
//! exact byte accounting without dictating a value representation.
//!
//! Note that the cache itself performs no locking at all. The [Group](crate::group::Group)
//! wraps it into a mutex where concurrent access is required.
mod lru_cache;

pub use lru_cache::ByteSize;
pub use lru_cache::EvictionCallback;
pub use lru_cache::LRUCache;
