//! Routes keys to the cache nodes owning them.
//!
//! A [CachePool] is the transport side counterpart of a [Group](crate::group::Group): it knows
//! the addresses of all nodes of the cluster (including the own one), projects them onto a
//! [HashRing](crate::ring::HashRing) and keeps one [CacheClient] per remote node. Registered
//! via [Group::register_peers](crate::group::Group::register_peers), it answers the central
//! routing question for every cache miss: "does another node own this key?".
//!
//! The clients speak the wire protocol served by [Server](crate::server::Server), therefore a
//! cluster is formed by simply starting several identically configured nodes and passing the
//! full address list to the pool of each.
//!
//! # Examples
//! ```no_run
//! # use ganymede::builder::Builder;
//! # use ganymede::group::{FnGetter, GroupRegistry};
//! # use ganymede::pool::CachePool;
//! # use futures::FutureExt;
//! # use std::sync::Arc;
//! # #[tokio::main]
//! # async fn main() {
//! let platform = Builder::new().enable_all().build().await;
//!
//! let group = platform.require::<GroupRegistry>().create(
//!     "scores",
//!     64 * 1024 * 1024,
//!     Arc::new(FnGetter::new(|key| {
//!         let key = key.to_owned();
//!         async move { Ok(key.into_bytes()) }.boxed()
//!     })),
//! );
//!
//! // This node is 10.0.0.1 - keys owned by the two other nodes are fetched remotely...
//! let pool = CachePool::new("10.0.0.1:2420");
//! pool.set_peers(vec!["10.0.0.1:2420", "10.0.0.2:2420", "10.0.0.3:2420"]);
//! group.register_peers(pool);
//! # }
//! ```
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use anyhow::Context;

use crate::peers::{PeerGetter, PeerPicker};
use crate::protocol::{self, Reply};
use crate::ring::HashRing;

/// Contains the number of virtual points each node contributes to the hash ring.
///
/// All nodes of a cluster must use the same value, as otherwise they would disagree on the
/// placement of keys.
pub const DEFAULT_REPLICAS: usize = 50;

/// Limits how long a fetch from a peer may take before we give up on it.
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Picks the owning peer for a key and hands out clients to reach it.
pub struct CachePool {
    self_address: String,
    state: Mutex<PoolState>,
}

struct PoolState {
    ring: HashRing,
    clients: HashMap<String, Arc<CacheClient>>,
}

impl CachePool {
    /// Creates a new pool for the node reachable under the given address.
    ///
    /// The own address is required so that keys owned by this very node are loaded locally
    /// instead of being routed through a connection to ourselves.
    pub fn new(self_address: &str) -> Arc<Self> {
        Arc::new(CachePool {
            self_address: self_address.to_owned(),
            state: Mutex::new(PoolState {
                ring: HashRing::new(DEFAULT_REPLICAS),
                clients: HashMap::new(),
            }),
        })
    }

    /// Specifies the addresses of all nodes of the cluster (including the own one).
    ///
    /// This replaces the previously known peer set: a fresh hash ring is built and one client
    /// per node is created. Note that keys change their owner only in proportion to the
    /// change of the peer set - that is the whole point of consistent hashing.
    pub fn set_peers<I, P>(&self, peers: I)
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        let peers: Vec<String> = peers
            .into_iter()
            .map(|peer| peer.as_ref().to_owned())
            .collect();

        let mut ring = HashRing::new(DEFAULT_REPLICAS);
        ring.add(&peers);

        let mut clients = HashMap::new();
        for peer in peers {
            let client = Arc::new(CacheClient {
                address: peer.clone(),
            });
            let _ = clients.insert(peer, client);
        }

        let mut state = self.state.lock().unwrap();
        state.ring = ring;
        state.clients = clients;
    }
}

impl PeerPicker for CachePool {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>> {
        let state = self.state.lock().unwrap();

        match state.ring.get(key) {
            Some(peer) if peer != self.self_address => {
                log::debug!("Picked peer {} for key '{}'...", peer, key);
                let client = state.clients.get(peer)?;
                Some(client.clone())
            }
            _ => None,
        }
    }
}

/// Fetches values from a single remote node by speaking the cache protocol.
///
/// A client is intentionally stateless: each fetch opens a fresh connection. Peers are only
/// consulted on local cache misses (which are coalesced per key anyway), therefore connection
/// churn is low and the simplicity wins over a pooled connection.
pub struct CacheClient {
    address: String,
}

impl CacheClient {
    async fn perform_fetch(&self, group: &str, key: &str) -> anyhow::Result<Vec<u8>> {
        let mut stream = TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("Failed to connect to peer {}", self.address))?;

        let mut request = BytesMut::new();
        protocol::write_command(
            &mut request,
            &[b"CACHE.GET", group.as_bytes(), key.as_bytes()],
        );
        stream.write_all(request.as_ref()).await?;
        stream.flush().await?;

        let mut input = BytesMut::with_capacity(8192);
        loop {
            let bytes_read = stream.read_buf(&mut input).await?;

            if let Some((reply, _)) = Reply::parse(&input)? {
                return match reply {
                    Reply::Bulk(data) => Ok(data.to_vec()),
                    Reply::Error(message) => {
                        Err(anyhow::anyhow!("Peer {} reported: {}", self.address, message))
                    }
                    Reply::Nil => {
                        Err(anyhow::anyhow!("Peer {} did not provide a value.", self.address))
                    }
                    Reply::Simple(message) => Err(anyhow::anyhow!(
                        "Peer {} sent an unexpected reply: {}",
                        self.address,
                        message
                    )),
                };
            }

            if bytes_read == 0 {
                return Err(anyhow::anyhow!(
                    "Peer {} closed the connection before sending a full reply.",
                    self.address
                ));
            }
        }
    }
}

#[async_trait::async_trait]
impl PeerGetter for CacheClient {
    async fn fetch(&self, group: &str, key: &str) -> anyhow::Result<Vec<u8>> {
        match tokio::time::timeout(FETCH_TIMEOUT, self.perform_fetch(group, key)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "Peer {} did not reply within {:?}.",
                self.address,
                FETCH_TIMEOUT
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::pool::CachePool;
    use crate::ring::HashRing;

    #[test]
    fn keys_owned_by_the_local_node_are_loaded_locally() {
        let peers = vec!["10.0.0.1:2420", "10.0.0.2:2420", "10.0.0.3:2420"];

        let pool = CachePool::new("10.0.0.1:2420");
        pool.set_peers(&peers);

        let mut ring = HashRing::new(crate::pool::DEFAULT_REPLICAS);
        ring.add(&peers);

        use crate::peers::PeerPicker;
        for index in 0..100 {
            let key = format!("key-{}", index);
            let owner = ring.get(&key).unwrap();

            // The pool returns a client exactly for the keys which are owned by another
            // node...
            assert_eq!(pool.pick_peer(&key).is_some(), owner != "10.0.0.1:2420");
        }
    }

    #[test]
    fn an_empty_pool_never_picks_a_peer() {
        use crate::peers::PeerPicker;

        let pool = CachePool::new("10.0.0.1:2420");
        assert_eq!(pool.pick_peer("anything").is_none(), true);
    }
}
