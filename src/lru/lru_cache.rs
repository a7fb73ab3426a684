use linked_hash_map::LinkedHashMap;

/// Returns the allocated memory in bytes.
pub trait ByteSize {
    /// Returns the amount of allocated memory in bytes.
    ///
    /// Note that most probably this is an approximation and not the exact byte value. However,
    /// it should represent the "largest" part of an instance. (E.g. for a string, this would
    /// be the bytes allocated on the heap and might discard the fields allocated on the stack
    /// used to store the length and capacity as well as the pointer itself.)
    fn allocated_size(&self) -> usize;
}

impl ByteSize for String {
    fn allocated_size(&self) -> usize {
        self.capacity()
    }
}

impl ByteSize for Vec<u8> {
    fn allocated_size(&self) -> usize {
        self.capacity()
    }
}

/// Invoked with the exact key and value of each entry which is dropped by the eviction policy.
pub type EvictionCallback<V> = Box<dyn FnMut(String, V) + Send>;

/// Provides a size constrained LRU cache.
///
/// A cache behaves just like a **Map** as long as there is no shortage in storage. However, once
/// the memory allocated by its keys and values exceeds the given limit, old (least recently used)
/// entries will be evicted - hence the name LRU cache.
///
/// The accounted size of an entry is the length of its key plus the
/// [allocated_size](ByteSize::allocated_size) of its value. A limit of **0** disables the
/// constraint entirely, the cache then grows without bounds.
///
/// Note that a single oversized entry is evicted right away: if a freshly inserted entry alone
/// exceeds the limit, enforcing the constraint will remove it again. Callers must therefore
/// tolerate that a key which has just been put into the cache might already be gone when
/// performing the next **get**.
///
/// # Examples
/// ```
/// # use ganymede::lru::LRUCache;
/// // Specifies a cache which can allocate up to 32 bytes of memory...
/// let mut lru = LRUCache::new(32);
///
/// lru.put("Foo".to_owned(), "Bar".to_owned());
/// assert_eq!(lru.get("Foo").unwrap(), &"Bar".to_owned());
///
/// // this will still fit..
/// lru.put("Foo1".to_owned(), "X".repeat(16));
/// assert_eq!(lru.get("Foo").is_some(), true);
/// assert_eq!(lru.get("Foo1").is_some(), true);
///
/// // this will hit the memory constraint and throw the two others out...
/// lru.put("Foo2".to_owned(), "X".repeat(24));
/// assert_eq!(lru.get("Foo").is_some(), false);
/// assert_eq!(lru.get("Foo1").is_some(), false);
/// assert_eq!(lru.get("Foo2").is_some(), true);
/// ```
pub struct LRUCache<V: ByteSize> {
    max_memory: usize,
    allocated_memory: usize,
    reads: usize,
    hits: usize,
    writes: usize,
    map: LinkedHashMap<String, Entry<V>>,
    on_evict: Option<EvictionCallback<V>>,
}

struct Entry<V: ByteSize> {
    mem_size: usize,
    value: V,
}

impl<V: ByteSize> LRUCache<V> {
    /// Creates a new cache which can store entries allocating up to **max_memory** bytes.
    ///
    /// Passing **0** as limit creates an unbounded cache.
    pub fn new(max_memory: usize) -> Self {
        LRUCache {
            max_memory,
            allocated_memory: 0,
            reads: 0,
            hits: 0,
            writes: 0,
            map: LinkedHashMap::new(),
            on_evict: None,
        }
    }

    /// Attaches a callback which is invoked for each entry dropped by the eviction policy.
    ///
    /// The callback receives the exact key and value which were live in the cache. Entries are
    /// always reported in eviction order (least recently used first).
    ///
    /// # Examples
    /// ```
    /// # use ganymede::lru::LRUCache;
    /// # use std::sync::{Arc, Mutex};
    /// let evicted = Arc::new(Mutex::new(Vec::new()));
    /// let keys = evicted.clone();
    ///
    /// let mut lru =
    ///     LRUCache::new(10).on_evict(move |key, _value: String| keys.lock().unwrap().push(key));
    ///
    /// lru.put("key1".to_owned(), "123456".to_owned());
    /// lru.put("key2".to_owned(), "123456".to_owned());
    /// lru.put("key3".to_owned(), "123456".to_owned());
    ///
    /// // Each put allocates 10 bytes, therefore the first two entries had to go...
    /// assert_eq!(*evicted.lock().unwrap(), vec!["key1".to_owned(), "key2".to_owned()]);
    /// assert_eq!(lru.len(), 1);
    /// ```
    pub fn on_evict(mut self, callback: impl FnMut(String, V) + Send + 'static) -> Self {
        self.on_evict = Some(Box::new(callback));
        self
    }

    /// Stores the given value for the given key.
    ///
    /// If the key is already present, its value is replaced and the entry is marked as most
    /// recently used. Afterwards the memory constraint is enforced by evicting the least
    /// recently used entries until the cache fits within its limit again.
    pub fn put(&mut self, key: String, value: V) {
        let mem_size = key.len() + value.allocated_size();

        self.writes += 1;
        self.allocated_memory += mem_size;
        if let Some(previous) = self.map.insert(key, Entry { mem_size, value }) {
            self.allocated_memory -= previous.mem_size;
        }

        self.enforce_memory_constraint();
    }

    fn enforce_memory_constraint(&mut self) {
        while self.max_memory != 0 && self.allocated_memory > self.max_memory {
            self.remove_oldest();
        }
    }

    /// Returns the value which has previously been stored for the given key or **None** if
    /// no value is present.
    ///
    /// A successful lookup marks the entry as most recently used and thereby protects it from
    /// being evicted for a while. A miss leaves the cache entirely untouched.
    ///
    /// # Examples
    /// ```
    /// # use ganymede::lru::LRUCache;
    /// let mut lru = LRUCache::new(1024);
    ///
    /// // After inserting a value...
    /// lru.put("Foo".to_owned(), "Bar".to_owned());
    /// // ..it can be retrieved.
    /// assert_eq!(lru.get("Foo").unwrap(), &"Bar".to_owned());
    /// assert_eq!(lru.get("Unknown"), None);
    /// ```
    pub fn get(&mut self, key: &str) -> Option<&V> {
        self.reads += 1;

        match self.map.get_refresh(key) {
            Some(entry) => {
                self.hits += 1;
                Some(&entry.value)
            }
            None => None,
        }
    }

    /// Removes the least recently used entry from the cache.
    ///
    /// If an eviction callback is present, it is invoked with the removed key and value. Calling
    /// this on an empty cache does nothing.
    pub fn remove_oldest(&mut self) {
        if let Some((key, entry)) = self.map.pop_front() {
            self.allocated_memory -= entry.mem_size;
            if let Some(callback) = self.on_evict.as_mut() {
                callback(key, entry.value);
            }
        }
    }

    /// Returns the number of entries in the cache.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Determines if the cache is completely empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the amount of memory allocated to store the data of the keys and values of this
    /// cache.
    ///
    /// The returned value is in bytes.
    pub fn allocated_memory(&self) -> usize {
        self.allocated_memory
    }

    /// Returns the maximal amount of memory to be (roughly) occupied by this cache.
    ///
    /// A value of **0** indicates that the cache is unbounded.
    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    /// Returns the total number of reads performed on this cache.
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Returns the total number of writes performed on this cache.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Returns the cache hit rate in percent.
    pub fn hit_rate(&self) -> f32 {
        match self.reads {
            0 => 0.,
            n => self.hits as f32 / n as f32 * 100.,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::lru::LRUCache;
    use crate::view::ByteView;
    use std::sync::{Arc, Mutex};

    #[test]
    fn max_memory_is_enforced() {
        let mut lru = LRUCache::new(12 * 4);

        // We expect 4 entries with a size of 12 bytes each to fully fit in the cache....
        lru.put("Hello0".to_owned(), ByteView::from("World0".as_bytes()));
        lru.put("Hello1".to_owned(), ByteView::from("World1".as_bytes()));
        lru.put("Hello2".to_owned(), ByteView::from("World2".as_bytes()));
        lru.put("Hello3".to_owned(), ByteView::from("World3".as_bytes()));
        assert_eq!(lru.len(), 4);
        assert_eq!(lru.allocated_memory(), 12 * 4);

        // If we replace an entry, the used memory is corrected...
        lru.put("Hello1".to_owned(), ByteView::from("".as_bytes()));
        assert_eq!(lru.allocated_memory(), 12 * 4 - 6);
        assert_eq!(lru.len(), 4);

        // Restore the original entry, so that the cache has four entries with 12 bytes each...
        lru.put("Hello1".to_owned(), ByteView::from("World1".as_bytes()));
        assert_eq!(lru.allocated_memory(), 12 * 4);

        // If we now replace an entry with a value which is one byte longer, the budget is
        // exceeded and one entry has to be dropped...
        lru.put("Hello0".to_owned(), ByteView::from("World00".as_bytes()));
        assert_eq!(lru.allocated_memory(), 12 * 3 + 1);
        assert_eq!(lru.len(), 3);
        // "Hello2" was the least recently touched/modified, so it will have been evicted to make
        // room for our grown entry...
        assert_eq!(lru.get("Hello2"), None);
    }

    #[test]
    fn recently_used_entries_survive() {
        let mut lru = LRUCache::new(12 * 2);

        lru.put("Hello0".to_owned(), ByteView::from("World0".as_bytes()));
        lru.put("Hello1".to_owned(), ByteView::from("World1".as_bytes()));

        // "Using" the older entry protects it, so that the insertion below evicts
        // "Hello1" instead...
        assert_eq!(lru.get("Hello0").is_some(), true);
        lru.put("Hello2".to_owned(), ByteView::from("World2".as_bytes()));

        assert_eq!(lru.get("Hello0").is_some(), true);
        assert_eq!(lru.get("Hello1"), None);
        assert_eq!(lru.get("Hello2").is_some(), true);
    }

    #[test]
    fn evictions_are_reported_in_order() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let log = evicted.clone();

        let mut lru = LRUCache::new(10).on_evict(move |key, value: ByteView| {
            log.lock().unwrap().push((key, value.to_string()));
        });

        lru.put("key1".to_owned(), ByteView::from("123456".as_bytes()));
        lru.put("key2".to_owned(), ByteView::from("123456".as_bytes()));
        lru.put("key3".to_owned(), ByteView::from("123456".as_bytes()));

        // Each entry occupies 10 bytes, therefore each insertion evicted its predecessor. The
        // callback observed the exact entries in eviction order...
        assert_eq!(
            *evicted.lock().unwrap(),
            vec![
                ("key1".to_owned(), "123456".to_owned()),
                ("key2".to_owned(), "123456".to_owned())
            ]
        );
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.get("key3").is_some(), true);
    }

    #[test]
    fn an_oversized_entry_is_evicted_immediately() {
        let mut lru = LRUCache::new(8);

        lru.put("key".to_owned(), ByteView::from("0123456789".as_bytes()));

        // The entry alone exceeds the limit of the whole cache, therefore it was dropped
        // right away...
        assert_eq!(lru.get("key"), None);
        assert_eq!(lru.len(), 0);
        assert_eq!(lru.allocated_memory(), 0);
    }

    #[test]
    fn an_unbounded_cache_never_evicts() {
        let mut lru = LRUCache::new(0);

        for index in 0..100 {
            lru.put(
                format!("key{}", index),
                ByteView::from("X".repeat(64).into_bytes()),
            );
        }

        assert_eq!(lru.len(), 100);
        assert_eq!(lru.get("key0").is_some(), true);
    }

    #[test]
    fn metrics_are_computed_correctly() {
        let mut lru = LRUCache::new(1024);

        lru.put("A".to_owned(), ByteView::from("A".as_bytes()));
        lru.put("B".to_owned(), ByteView::from("B".as_bytes()));
        lru.put("C".to_owned(), ByteView::from("C".as_bytes()));

        // Perform 4 reads, of which 3 hit a cache entry...
        assert_eq!(lru.get("A").is_some(), true);
        assert_eq!(lru.get("B").is_some(), true);
        assert_eq!(lru.get("C").is_some(), true);
        assert_eq!(lru.get("D").is_none(), true);

        // ... therefore we had 3 writes, 4 reads of which 3 hit a value which
        // yields a hit rate of 75%
        assert_eq!(lru.writes(), 3);
        assert_eq!(lru.reads(), 4);
        assert_eq!(lru.hit_rate().round() as i32, 75);
        assert_eq!(lru.allocated_memory(), 6);
    }
}
