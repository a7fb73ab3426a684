//! Provides named cache groups - the heart of the cache cluster.
//!
//! A [Group] is a namespace with its own memory budget and its own way of obtaining values:
//! a caller supplied [Getter] which fetches the authoritative bytes for a key from the source
//! of truth (a database, a file, a service, ...). Reading from a group via [Group::get] follows
//! a fixed escalation path:
//!
//! 1. Consult the local cache. A hit is returned right away.
//! 2. On a miss, ask the registered [PeerPicker](crate::peers::PeerPicker) (if any) whether
//!    another node owns the key. If so, fetch the value from that peer.
//! 3. If no peer owns the key (or the peer failed), invoke the origin [Getter] and store the
//!    result in the local cache.
//!
//! Steps 2 and 3 run under a [SingleFlight](crate::flight::SingleFlight), therefore a
//! thundering herd of concurrent misses for one key triggers at most one peer request or one
//! origin load per node.
//!
//! Note that a value fetched from a peer is deliberately *not* inserted into the local cache:
//! the owning node already caches it, and caching it here as well would multiply the memory
//! footprint of popular keys across the cluster. Each node pays the (cheap, coalesced) peer
//! round-trip instead.
//!
//! Groups are kept in a [GroupRegistry] so that the server can resolve them by name when a
//! request for `group/key` arrives over the wire.
//!
//! # Examples
//! ```
//! # use ganymede::group::{FnGetter, GroupRegistry};
//! # use futures::FutureExt;
//! # use std::sync::Arc;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = GroupRegistry::new();
//! let scores = registry.create(
//!     "scores",
//!     2048,
//!     Arc::new(FnGetter::new(|key| {
//!         let key = key.to_owned();
//!         async move { Ok(format!("score of {}", key).into_bytes()) }.boxed()
//!     })),
//! );
//!
//! let value = scores.get("Tom").await.unwrap();
//! assert_eq!(value.to_string(), "score of Tom");
//! # }
//! ```
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use futures::future::BoxFuture;

use crate::flight::SingleFlight;
use crate::lru::LRUCache;
use crate::peers::PeerPicker;
use crate::platform::Platform;
use crate::view::ByteView;

/// Obtains the authoritative bytes for a key from the source of truth.
///
/// This is the capability each group is built around: whenever neither the local cache nor a
/// peer can provide a value, the getter is invoked. It may block or suspend arbitrarily (e.g.
/// to query a database) - the group never holds a lock while calling it.
#[async_trait::async_trait]
pub trait Getter: Send + Sync {
    /// Fetches the value for the given key from the source of truth.
    async fn fetch(&self, key: &str) -> anyhow::Result<Vec<u8>>;
}

/// Adapts a closure into a [Getter].
///
/// Many origins are most naturally expressed as a simple function. This adapter saves such
/// callers from declaring a carrier type just to implement the trait.
///
/// # Examples
/// ```
/// # use ganymede::group::{FnGetter, Getter};
/// # use futures::FutureExt;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let getter = FnGetter::new(|key| {
///     let key = key.to_owned();
///     async move { Ok(key.into_bytes()) }.boxed()
/// });
///
/// assert_eq!(getter.fetch("Tom").await.unwrap(), b"Tom".to_vec());
/// # }
/// ```
pub struct FnGetter {
    task: Box<dyn Fn(&str) -> BoxFuture<'static, anyhow::Result<Vec<u8>>> + Send + Sync>,
}

impl FnGetter {
    /// Wraps the given closure into a [Getter].
    pub fn new<F>(task: F) -> Self
    where
        F: Fn(&str) -> BoxFuture<'static, anyhow::Result<Vec<u8>>> + Send + Sync + 'static,
    {
        FnGetter {
            task: Box::new(task),
        }
    }
}

#[async_trait::async_trait]
impl Getter for FnGetter {
    async fn fetch(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        (self.task)(key).await
    }
}

/// Guards the LRU cache of a group with a mutex.
///
/// The cache itself is constructed lazily on the first write: a group which is never written
/// never allocates and a read before the first write is a pure miss.
struct MainCache {
    cache_bytes: usize,
    lru: Mutex<Option<LRUCache<ByteView>>>,
}

impl MainCache {
    fn new(cache_bytes: usize) -> Self {
        MainCache {
            cache_bytes,
            lru: Mutex::new(None),
        }
    }

    fn get(&self, key: &str) -> Option<ByteView> {
        self.lru
            .lock()
            .unwrap()
            .as_mut()
            .and_then(|lru| lru.get(key).cloned())
    }

    fn put(&self, key: &str, value: ByteView) {
        let mut guard = self.lru.lock().unwrap();
        guard
            .get_or_insert_with(|| LRUCache::new(self.cache_bytes))
            .put(key.to_owned(), value);
    }

    fn stats(&self) -> CacheStats {
        match self.lru.lock().unwrap().as_ref() {
            Some(lru) => CacheStats {
                entries: lru.len(),
                allocated_memory: lru.allocated_memory(),
                max_memory: lru.max_memory(),
                reads: lru.reads(),
                writes: lru.writes(),
                hit_rate: lru.hit_rate(),
            },
            None => CacheStats {
                entries: 0,
                allocated_memory: 0,
                max_memory: self.cache_bytes,
                reads: 0,
                writes: 0,
                hit_rate: 0.,
            },
        }
    }
}

/// Provides a point in time snapshot of the cache metrics of a group.
pub struct CacheStats {
    /// Contains the number of entries currently being cached.
    pub entries: usize,
    /// Contains the memory in bytes allocated by the cached keys and values.
    pub allocated_memory: usize,
    /// Contains the memory budget of the group in bytes (0 = unbounded).
    pub max_memory: usize,
    /// Contains the number of reads performed against the local cache.
    pub reads: usize,
    /// Contains the number of writes performed against the local cache.
    pub writes: usize,
    /// Contains the cache hit rate in percent.
    pub hit_rate: f32,
}

/// Represents a named cache namespace with its own budget, origin and peer awareness.
///
/// Groups are created via [GroupRegistry::create] and handed around as **Arc**. All methods
/// take a shared reference, therefore any number of tasks can read from the same group
/// concurrently.
pub struct Group {
    name: String,
    getter: Arc<dyn Getter>,
    main_cache: Arc<MainCache>,
    loader: SingleFlight<ByteView>,
    peers: OnceLock<Arc<dyn PeerPicker>>,
}

impl Group {
    /// Returns the name of this group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers the peer picker which routes keys to the nodes owning them.
    ///
    /// # Panics
    /// Panics if a picker has already been registered, as silently swapping the cluster
    /// topology underneath a running group is always a programming error.
    pub fn register_peers(&self, peers: Arc<dyn PeerPicker>) {
        if self.peers.set(peers).is_err() {
            panic!(
                "register_peers was called more than once for group '{}'!",
                self.name
            );
        }
    }

    /// Returns the value cached for the given key, obtaining it if necessary.
    ///
    /// On a local cache miss the value is either fetched from the peer owning the key or
    /// loaded via the origin getter of this group (see the module documentation for the exact
    /// escalation path). Concurrent lookups for the same key are coalesced into a single load.
    ///
    /// # Errors
    /// Fails if the key is empty or if the value had to be loaded from the origin and the
    /// getter reported an error. Errors are never cached - a subsequent lookup starts over.
    pub async fn get(&self, key: &str) -> anyhow::Result<ByteView> {
        if key.is_empty() {
            return Err(anyhow::anyhow!("A key is required."));
        }

        if let Some(view) = self.main_cache.get(key) {
            log::debug!("Cache hit for '{}' in group '{}'...", key, self.name);
            return Ok(view);
        }

        self.load(key).await
    }

    /// Loads the given key via the single-flight, consulting peers before the local origin.
    ///
    /// Note that the shared parts of the group are cloned into the task, as the single-flight
    /// might hand the very same task to any number of concurrently attached callers.
    async fn load(&self, key: &str) -> anyhow::Result<ByteView> {
        let name = self.name.clone();
        let getter = self.getter.clone();
        let main_cache = self.main_cache.clone();
        let peers = self.peers.get().cloned();
        let lookup_key = key.to_owned();

        self.loader
            .execute(key, async move {
                if let Some(peers) = peers {
                    if let Some(peer) = peers.pick_peer(&lookup_key) {
                        match peer.fetch(&name, &lookup_key).await {
                            Ok(bytes) => return Ok(ByteView::from(bytes)),
                            Err(error) => log::warn!(
                                "Failed to fetch '{}' from the owning peer: {}. \
                                 Falling back to the local origin...",
                                lookup_key,
                                error
                            ),
                        }
                    }
                }

                // Load from the origin and populate the local cache...
                let bytes = getter.fetch(&lookup_key).await?;
                let view = ByteView::from(bytes);
                main_cache.put(&lookup_key, view.clone());

                Ok(view)
            })
            .await
            .map_err(|error| anyhow::anyhow!(error))
    }

    /// Provides a snapshot of the cache metrics of this group.
    pub fn stats(&self) -> CacheStats {
        self.main_cache.stats()
    }
}

/// Keeps track of all groups of this node, indexed by their unique name.
///
/// The registry is read-mostly: groups are registered once during startup and then looked up
/// for every incoming request, therefore a readers-writer lock is used. Groups are never
/// removed.
pub struct GroupRegistry {
    groups: RwLock<HashMap<String, Arc<Group>>>,
}

impl GroupRegistry {
    /// Creates a new and empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(GroupRegistry {
            groups: RwLock::new(HashMap::new()),
        })
    }

    /// Creates a registry and registers it within the given platform.
    ///
    /// Note that this is called by the [Builder](crate::builder::Builder), therefore the
    /// registry can commonly be obtained via `platform.require::<GroupRegistry>()`.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let registry = GroupRegistry::new();
        platform.register::<GroupRegistry>(registry.clone());

        registry
    }

    /// Creates a group with the given name, memory budget (in bytes) and origin getter.
    ///
    /// # Panics
    /// Panics if a group with the given name has already been registered - group names are
    /// used for routing on the wire and must therefore be unique per node.
    pub fn create(&self, name: &str, cache_bytes: usize, getter: Arc<dyn Getter>) -> Arc<Group> {
        let group = Arc::new(Group {
            name: name.to_owned(),
            getter,
            main_cache: Arc::new(MainCache::new(cache_bytes)),
            loader: SingleFlight::new(),
            peers: OnceLock::new(),
        });

        {
            let mut groups = self.groups.write().unwrap();
            if groups.contains_key(name) {
                panic!("A group named '{}' has already been registered!", name);
            }
            let _ = groups.insert(name.to_owned(), group.clone());
        }

        log::info!(
            "Created cache group '{}' with a budget of {}.",
            name,
            crate::fmt::format_size(cache_bytes)
        );

        group
    }

    /// Resolves the group with the given name.
    pub fn find(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.read().unwrap().get(name).cloned()
    }

    /// Lists the names of all registered groups in alphabetical order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.read().unwrap().keys().cloned().collect();
        names.sort();

        names
    }
}
