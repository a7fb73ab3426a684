//! Ganymede is a library for running clusters of cooperating in-memory caches.
//!
//! # Introduction
//! **Ganymede** provides a distributed key→bytes cache which is organized as a peer group of
//! identical nodes. Each node holds a bounded local cache. A miss is either answered by the
//! application supplied origin (a database, a service, a file, ...) or redirected to the single
//! node which owns the key - the owner is determined via consistent hashing, therefore the
//! placement of keys stays stable even when the cluster topology changes.
//!
//! Three properties make this setup scale:
//! * **Strict byte accounting**: every cache group enforces a hard memory budget by evicting
//!   its least recently used entries.
//! * **Request coalescing**: concurrent misses for the same key trigger at most one origin
//!   load or peer request per node, no matter how many callers pile up.
//! * **Stable placement**: nodes derive the owner of a key independently and still agree, as
//!   the hash ring is built bit-identically on every node.
//!
//! # Features
//! * **Simple core abstractions** - a [Group](group::Group) is a named cache namespace with
//!   its own budget and origin; a [ByteView](view::ByteView) is an immutable value handed to
//!   any number of concurrent readers. Everything else plugs into these two.
//! * **100% Async/Await** - the whole system builds upon [tokio](https://tokio.rs/) and
//!   async/await primitives as provided by Rust. Origins and peer fetches may suspend freely,
//!   no lock is ever held across them.
//! * **RESP based wire protocol** - nodes talk to each other (and to their clients) using a
//!   subset of the protocol defined by Redis. It is binary safe, trivial to parse and for
//!   nearly every platform there is already a compatible client available - even redis-cli
//!   works for poking around.
//! * **Reload-aware config facility** which permits to update the configuration during
//!   operation. Therefore no restart is required, even when changing the IP binding or port -
//!   kind of important for an in-memory application with an expensive warm-up.
//!
//! # Modules
//! * **lru**: the size constrained recency cache backing each group: [lru::LRUCache]
//! * **group**: named cache namespaces and their registry: [group::Group],
//!   [group::GroupRegistry]
//! * **flight**: coalesces concurrent identical loads: [flight::SingleFlight]
//! * **ring**: consistent hashing with virtual points: [ring::HashRing]
//! * **view**: the immutable value carrier: [view::ByteView]
//! * **peers / pool / server / protocol**: the peer transport - who owns a key, and how to
//!   fetch it from that owner over the wire.
//!
//! # Example
//! ```no_run
//! use futures::FutureExt;
//! use ganymede::builder::Builder;
//! use ganymede::group::{FnGetter, GroupRegistry};
//! use ganymede::pool::CachePool;
//! use ganymede::server::Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Enable all features and build the platform...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Define a cache group which loads scores from the (slow) source of truth...
//!     let scores = platform.require::<GroupRegistry>().create(
//!         "scores",
//!         64 * 1024 * 1024,
//!         Arc::new(FnGetter::new(|key| {
//!             let key = key.to_owned();
//!             async move { Ok(format!("score of {}", key).into_bytes()) }.boxed()
//!         })),
//!     );
//!
//!     // Make the group cluster aware...
//!     let pool = CachePool::new("10.0.0.1:2420");
//!     pool.set_peers(vec!["10.0.0.1:2420", "10.0.0.2:2420"]);
//!     scores.register_peers(pool);
//!
//!     // Start the main event loop of the server...
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod builder;
pub mod config;
pub mod flight;
pub mod fmt;
pub mod group;
pub mod lru;
pub mod peers;
pub mod platform;
pub mod pool;
pub mod protocol;
pub mod ring;
pub mod server;
pub mod signals;
pub mod view;

/// Contains the version of the Ganymede library.
pub const GANYMEDE_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the Ganymede build being used.
pub const GANYMEDE_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up
/// the framework, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the integration tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned join handle to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate ganymede;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    use redis::{Connection, RedisError};
    use std::sync::Mutex;
    use tokio::time::Duration;

    lazy_static::lazy_static! {
        /// Provides a global lock which has to be acquired if a test operates on shared
        /// resources - most notably the ports on which we start local servers for
        /// integration tests. Using this lock, we can still execute all other tests in
        /// parallel and only block if required.
        pub static ref SHARED_TEST_RESOURCES: Mutex<()> = Mutex::new(());
    }

    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }

    /// Executes a blocking Redis query in an async fashion.
    ///
    /// This is required as we must not block tokio in any way. Using an off the shelf Redis
    /// client doubles as a compatibility check for our wire protocol.
    pub async fn query_redis_async<T, Q>(port: u16, query: Q) -> Option<T>
    where
        Q: FnOnce(&mut Connection) -> Result<T, RedisError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let result = tokio::task::spawn_blocking(move || {
            let client = redis::Client::open(format!("redis://127.0.0.1:{}", port)).unwrap();
            let mut con = client
                .get_connection_with_timeout(Duration::from_secs(5))
                .unwrap();
            query(&mut con)
        })
        .await;

        match result {
            Ok(Ok(result)) => Some(result),
            _ => None,
        }
    }
}
