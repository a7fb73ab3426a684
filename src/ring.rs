//! Maps cache keys to the peer which owns them.
//!
//! All nodes of a cache cluster derive the very same key placement from the list of known
//! peers using consistent hashing: each peer is projected onto a ring of **u32** hash values
//! via a number of virtual points, and a key belongs to the peer owning the first point at or
//! after the key's own hash (wrapping around at the end of the ring).
//!
//! Virtual points serve two purposes. They smooth the load distribution (a single point per
//! peer would partition the ring very unevenly) and they keep the re-mapping minimal when the
//! peer set changes: only the keys falling into the segments of an added peer move.
//!
//! The default hash is CRC32 (IEEE polynomial) and the virtual points of a peer are derived
//! from the decimal replica index concatenated with the peer identifier. Both choices are
//! externally observable - every node which derives the ring from the same peer set must
//! arrive at the identical placement, bit for bit.
use std::collections::HashMap;

/// Computes a **u32** hash for the given bytes.
pub type HashFn = Box<dyn Fn(&[u8]) -> u32 + Send + Sync>;

/// Maps keys to peer identifiers using consistent hashing with virtual points.
///
/// Note that a ring is additive: peers can be added but never removed. The transport layer
/// simply builds a fresh ring whenever the peer set changes.
///
/// # Examples
/// ```
/// # use ganymede::ring::HashRing;
/// let mut ring = HashRing::new(50);
/// ring.add(vec!["10.0.0.1:2420", "10.0.0.2:2420", "10.0.0.3:2420"]);
///
/// // Every key is owned by exactly one peer...
/// let owner = ring.get("user/42").unwrap();
///
/// // ...and a second ring built from the same peer set agrees on the placement.
/// let mut other = HashRing::new(50);
/// other.add(vec!["10.0.0.1:2420", "10.0.0.2:2420", "10.0.0.3:2420"]);
/// assert_eq!(other.get("user/42").unwrap(), owner);
/// ```
pub struct HashRing {
    replicas: usize,
    hash: HashFn,
    points: Vec<u32>,
    owners: HashMap<u32, String>,
}

impl HashRing {
    /// Creates a new ring which projects each peer onto **replicas** virtual points.
    ///
    /// The ring uses CRC32-IEEE as hash function. Use [with_hash](HashRing::with_hash) to
    /// supply a custom one.
    pub fn new(replicas: usize) -> Self {
        HashRing::with_hash(replicas, Box::new(crc32fast::hash))
    }

    /// Creates a new ring using the given hash function.
    pub fn with_hash(replicas: usize, hash: HashFn) -> Self {
        HashRing {
            replicas,
            hash,
            points: Vec::new(),
            owners: HashMap::new(),
        }
    }

    /// Adds the given peers to the ring.
    ///
    /// For each peer, one virtual point per replica is derived by hashing the decimal replica
    /// index concatenated with the peer identifier. In the astronomically rare case that two
    /// virtual points collide, the peer added later owns the point.
    pub fn add<I, P>(&mut self, peers: I)
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        for peer in peers {
            let peer = peer.as_ref();
            for replica in 0..self.replicas {
                let point = (self.hash)(format!("{}{}", replica, peer).as_bytes());
                self.points.push(point);
                let _ = self.owners.insert(point, peer.to_owned());
            }
        }

        self.points.sort_unstable();
    }

    /// Determines the peer which owns the given key.
    ///
    /// This performs a binary search for the first virtual point at or after the hash of the
    /// key, wrapping around to the start of the ring if the key hashes beyond the last point.
    /// An empty ring yields **None**.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            log::warn!("Trying to resolve '{}' against an empty hash ring...", key);
            return None;
        }

        let hash = (self.hash)(key.as_bytes());
        let index = self.points.partition_point(|&point| point < hash) % self.points.len();

        self.owners
            .get(&self.points[index])
            .map(|owner| owner.as_str())
    }

    /// Determines if any peers have been added to the ring.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::ring::HashRing;

    /// Uses a hash which simply parses the given bytes as decimal number. This makes the
    /// placement of the virtual points fully predictable: peer "6" e.g. yields the points
    /// 06, 16 and 26 for three replicas.
    fn predictable_ring() -> HashRing {
        HashRing::with_hash(
            3,
            Box::new(|data| {
                std::str::from_utf8(data)
                    .expect("Received a non UTF-8 key")
                    .parse()
                    .expect("Received a non numeric key")
            }),
        )
    }

    #[test]
    fn keys_are_mapped_onto_the_expected_peers() {
        let mut ring = predictable_ring();
        ring.add(vec!["6", "4", "2"]);

        // The ring now contains the points 2, 4, 6, 12, 14, 16, 22, 24 and 26...
        assert_eq!(ring.get("2").unwrap(), "2");
        assert_eq!(ring.get("11").unwrap(), "2");
        assert_eq!(ring.get("23").unwrap(), "4");

        // 27 lies beyond the last point and therefore wraps around to the first one...
        assert_eq!(ring.get("27").unwrap(), "2");
    }

    #[test]
    fn adding_a_peer_only_moves_the_expected_keys() {
        let mut ring = predictable_ring();
        ring.add(vec!["6", "4", "2"]);

        // 27 wraps around to the very first point which belongs to "2"...
        assert_eq!(ring.get("27").unwrap(), "2");

        // Once "8" joins (with the points 8, 18 and 28), it takes over the keys right
        // before its points - all other keys stay put.
        ring.add(vec!["8"]);
        assert_eq!(ring.get("27").unwrap(), "8");
        assert_eq!(ring.get("2").unwrap(), "2");
        assert_eq!(ring.get("11").unwrap(), "2");
        assert_eq!(ring.get("23").unwrap(), "4");
    }

    #[test]
    fn identically_built_rings_agree_on_placement() {
        let peers = vec!["10.0.0.1:2420", "10.0.0.2:2420", "10.0.0.3:2420"];

        let mut first = HashRing::new(50);
        first.add(&peers);
        let mut second = HashRing::new(50);
        second.add(&peers);

        for index in 0..250 {
            let key = format!("key-{}", index);
            let owner = first.get(&key).unwrap();
            assert_eq!(second.get(&key).unwrap(), owner);
            assert_eq!(peers.contains(&owner), true);
        }
    }

    #[test]
    fn the_default_hash_is_crc32_ieee() {
        // Nodes re-deriving the ring (possibly from other languages) rely on the exact hash,
        // therefore we pin it against a well known reference checksum...
        assert_eq!(crc32fast::hash(b"hello"), 0x3610A686);
    }

    #[test]
    fn an_empty_ring_yields_no_peer() {
        let ring = HashRing::new(50);
        assert_eq!(ring.get("anything"), None);
        assert_eq!(ring.is_empty(), true);
    }
}
