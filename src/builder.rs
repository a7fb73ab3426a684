//! Provides a builder which can be used to set up and initialize a cache node.
//!
//! This creates and wires the central parts of the system: logging, signal handling, the
//! config facility, the [GroupRegistry](crate::group::GroupRegistry) and the server. As some
//! of these are optional (especially in embedded or test scenarios), a builder permits to
//! selectively enable or disable them.
//!
//! # Example
//! Setting up a node with all features enabled:
//! ```no_run
//! # use ganymede::builder::Builder;
//! # use ganymede::server::Server;
//! #[tokio::main]
//! async fn main() {
//!     // Enable all features and build the platform...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Register cache groups here...
//!
//!     // Start the main event loop of the server...
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
use std::sync::Arc;

use crate::group::GroupRegistry;
use crate::platform::Platform;
use crate::{init_logging, GANYMEDE_REVISION, GANYMEDE_VERSION};

/// Initializes a cache node by creating and registering the enabled components.
///
/// The [GroupRegistry](crate::group::GroupRegistry) is always installed, as a node without
/// groups cannot serve anything at all.
#[derive(Default)]
pub struct Builder {
    setup_logging: bool,
    enable_signals: bool,
    setup_config: bool,
    setup_server: bool,
}

impl Builder {
    /// Creates a new builder with all optional components disabled.
    pub fn new() -> Self {
        Builder {
            setup_logging: false,
            enable_signals: false,
            setup_config: false,
            setup_server: false,
        }
    }

    /// Enables all features.
    ///
    /// Note that using this method (and then maybe disabling selected components) is quite
    /// convenient, but be aware that new components which might be added in a library update
    /// will then also be enabled by default. This might or might not be the expected
    /// behaviour.
    pub fn enable_all(mut self) -> Self {
        self.setup_logging = true;
        self.enable_signals = true;
        self.setup_config = true;
        self.setup_server = true;

        self
    }

    /// Enables the automatic setup of the logging system.
    ///
    /// Using this, we properly initialize **simplelog** to log to stdout. As we intend cache
    /// nodes to run in docker containers, this is all that is needed for proper logging.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Disables the automatic setup of the logging system after
    /// [enable_all()](Builder::enable_all) has been used.
    pub fn disable_logging(mut self) -> Self {
        self.setup_logging = false;
        self
    }

    /// Installs a signal listener which terminates the node once **CTRL-C** or **SIGHUP**
    /// is received.
    ///
    /// For more details see: [signals](crate::signals)
    pub fn enable_signals(mut self) -> Self {
        self.enable_signals = true;
        self
    }

    /// Disables installing the signal listener after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_signals(mut self) -> Self {
        self.enable_signals = false;
        self
    }

    /// Installs [Config](crate::config::Config) and loads the **settings.yml**.
    ///
    /// For more details see: [config](crate::config)
    pub fn enable_config(mut self) -> Self {
        self.setup_config = true;
        self
    }

    /// Disables setting up a **Config** instance after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_config(mut self) -> Self {
        self.setup_config = false;
        self
    }

    /// Creates and installs a [Server](crate::server::Server) instance.
    ///
    /// Note that the main event loop still has to be invoked manually via:
    /// `platform.require::<Server>().event_loop().await`.
    pub fn enable_server(mut self) -> Self {
        self.setup_server = true;
        self
    }

    /// Disables setting up a **Server** instance after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_server(mut self) -> Self {
        self.setup_server = false;
        self
    }

    /// Builds the [Platform](crate::platform::Platform) with all the enabled components
    /// being registered.
    pub async fn build(self) -> Arc<Platform> {
        let platform = Platform::new();

        if self.setup_logging {
            init_logging();
        }

        log::info!(
            "||. GANYMEDE (v {} - rev {}) running on {} core(s) in {} CPU(s)",
            GANYMEDE_VERSION,
            GANYMEDE_REVISION,
            num_cpus::get(),
            num_cpus::get_physical()
        );

        if self.enable_signals {
            crate::signals::install(platform.clone());
        }

        if self.setup_config {
            crate::config::install(platform.clone()).await;
        }

        let _ = GroupRegistry::install(&platform);

        if self.setup_server {
            let _ = crate::server::Server::install(&platform);
        }

        platform
    }
}
