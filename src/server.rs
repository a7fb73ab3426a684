//! Contains the server component of a cache node.
//!
//! Opens a server socket on the specified port (**server.port** in the config or 2420 as
//! fallback) and binds it to the selected IP (**server.host** in the config or 0.0.0.0 as
//! fallback). Each incoming connection is expected to send requests as specified in
//! [protocol](crate::protocol) and will be provided with the appropriate replies. Both, peer
//! nodes fetching values for keys they do not own themselves and ordinary clients, use this
//! very endpoint.
//!
//! Note that in order to achieve zero downtime / ultra high availability demands, the server
//! will periodically try to bind the socket to the selected port, therefore a "new" instance
//! can be started and the "old" one can bleed out and the port will be "handed through" with
//! minimal downtime. Also, this will listen to change events of the config and will relocate
//! to another port or host if changed.
//!
//! # Commands
//! * **PING**: `PING` simply answers with `+PONG` and can be used for health checks.
//! * **CACHE.GET**: `CACHE.GET group key` resolves the given group and performs a cache read
//!   for the given key. The value bytes are returned as bulk string; an unknown group, an
//!   empty key or a failing origin yields an error reply.
//! * **CACHE.STATS**: `CACHE.STATS` provides an overview of all groups of this node.
//!   `CACHE.STATS group` provides detailed metrics about the given group.
//!
//! # Example
//!
//! ```no_run
//! use ganymede::builder::Builder;
//! use ganymede::config::Config;
//! use ganymede::server::Server;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Setup and create a platform...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Specify a minimal config so that we run on a different port than a
//!     // production instance.
//!     let _ = platform.require::<Config>().load_from_string("
//!         server:
//!             port: 1503
//!     ", None);
//!
//!     // Run the platform...
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::Config;
use crate::fmt::format_size;
use crate::group::GroupRegistry;
use crate::platform::Platform;
use crate::protocol::{self, Command};
use crate::spawn;

/// Specifies the timeout when waiting for incoming data on a client connection.
///
/// When waiting for incoming data we need to interrupt this every once in a while to check
/// if the platform is being shut down.
const READ_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Determines the pre-allocated receive buffer size for incoming requests. Most requests will
/// fit into this buffer so that no additional allocations are required when handling a command.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Specifies the timeout when waiting for a new incoming connection.
///
/// When waiting for a new connection we need to interrupt this every once in a while so that
/// we can check if the platform has been shut down.
const CONNECT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Used to visually separate sections within the tabular output of **CACHE.STATS**.
const SEPARATOR: &str = "----------------------------------------------------------------------\n";

/// Represents a server which handles all incoming connections.
pub struct Server {
    running: AtomicBool,
    current_address: Mutex<Option<String>>,
    platform: Arc<Platform>,
}

impl Server {
    /// Creates and installs a **Server** into the given **Platform**.
    ///
    /// Note that this is called by the [Builder](crate::builder::Builder) unless disabled.
    ///
    /// Also note, that this will not technically start the server. This has to be done manually
    /// via [event_loop](Server::event_loop) as it is most probably done in the main thread.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let server = Arc::new(Server {
            running: AtomicBool::new(false),
            current_address: Mutex::new(None),
            platform: platform.clone(),
        });

        platform.register::<Server>(server.clone());

        server
    }

    /// Determines if the server socket should keep listening for incoming connections.
    ///
    /// In contrast to **Platform::is_running** this is not used to control the shutdown of the
    /// server. Rather we toggle this flag to false if a config and therefore address change was
    /// detected. This way **server_loop** will exit and a new server socket for the appropriate
    /// address will be set up by the **event_loop**.
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Determines the server address based on the current configuration.
    ///
    /// If no, an invalid or a partial config is present, fallback values are used. By default
    /// we use port 2420 and bind to "0.0.0.0".
    fn address(&self) -> String {
        self.platform
            .find::<Config>()
            .map(|config| {
                let handle = config.current();
                format!(
                    "{}:{}",
                    handle.config()["server"]["host"].as_str().unwrap_or("0.0.0.0"),
                    handle.config()["server"]["port"]
                        .as_i64()
                        .filter(|port| port > &0 && port <= &(u16::MAX as i64))
                        .unwrap_or(2420)
                )
            })
            .unwrap_or_else(|| "0.0.0.0:2420".to_owned())
    }

    /// Starts the event loop in a separate thread.
    ///
    /// This is most probably used by test scenarios where the tests itself run in the main
    /// thread.
    pub fn fork(server: &Arc<Server>) {
        let cloned_server = server.clone();
        spawn!(async move {
            cloned_server.event_loop().await;
        });
    }

    /// Starts the event loop in a separate thread and waits until the server is up and running.
    ///
    /// Just like **fork** this is intended to be used in test environments.
    pub async fn fork_and_await(server: &Arc<Server>) {
        Server::fork(server);

        while !server.is_running() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Tries to open a server socket on the specified address to serve incoming connections.
    ///
    /// The task of this loop is to bind the server socket to the specified address. Once this
    /// was successful, we enter the [server_loop](Server::server_loop) to actually handle
    /// incoming connections. Once this loop returns, either the platform is no longer running
    /// and we should exit, or the config has changed and we should try to bind the server to
    /// the new address.
    pub async fn event_loop(&self) {
        let mut address = String::new();
        let mut last_bind_error_reported = Instant::now();

        while self.platform.is_running() {
            // If the server is started for the first time or if it has been restarted due to a
            // config change, we need to reload the address...
            if !self.is_running() {
                address = self.address();
                self.running.store(true, Ordering::Release);
            }

            // Bind and hopefully enter the server_loop...
            if let Ok(listener) = TcpListener::bind(&address).await {
                log::info!("Opened server socket on {}...", &address);
                *self.current_address.lock().unwrap() = Some(address.clone());
                self.server_loop(&listener).await;
                log::info!("Closing server socket on {}.", &address);
            } else {
                // If we were unable to bind to the server, we log this every once in a while
                // (every 5s). Otherwise we would jam the log as we retry every 500ms.
                if Instant::now()
                    .duration_since(last_bind_error_reported)
                    .as_secs()
                    > 5
                {
                    log::error!(
                        "Cannot open server address: {}. Retrying every 500ms...",
                        &address
                    );
                    last_bind_error_reported = Instant::now();
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }

    /// Runs the main server loop which processes incoming connections.
    ///
    /// This also listens on config changes and exits to the event_loop if necessary (server
    /// address changed...).
    async fn server_loop(&self, listener: &TcpListener) {
        let mut config_changed_flag = self.platform.require::<Config>().notifier();

        while self.platform.is_running() && self.is_running() {
            tokio::select! {
                // We use a timeout here so that the while condition (esp. platform.is_running())
                // is checked every once in a while...
                timeout_stream = tokio::time::timeout(CONNECT_WAIT_TIMEOUT, listener.accept()) => {
                    // We're only interested in a positive result here, as an Err simply
                    // indicates that the timeout was hit - in this case we do nothing as the
                    // while condition is all that needs to be checked...
                    if let Ok(stream) = timeout_stream {
                        if let Ok((stream, _)) = stream {
                            self.handle_new_connection(stream);
                        } else {
                            // The socket has been closed, therefore we exit to the event_loop
                            // which will either completely exit or try to re-create the socket.
                            return;
                        }
                    }
                }
                _ = config_changed_flag.recv() => {
                    // If the config was changed, we need to check if the address itself
                    // changed...
                    let new_address = self.address();
                    if let Some(current_address) = &*self.current_address.lock().unwrap() {
                        if current_address != &new_address {
                            log::info!("Server address has changed. Restarting server socket...");

                            // Force the event_loop to re-evaluate the expected server address...
                            self.running.store(false, Ordering::Release);

                            // Return to event_loop so that the server socket is re-created...
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Handles a new incoming connection.
    ///
    /// This forks a "thread" which executes the **command_loop** for this connection.
    fn handle_new_connection(&self, stream: TcpStream) {
        let platform = self.platform.clone();
        spawn!(async move {
            let peer_address = stream
                .peer_addr()
                .map(|address| address.to_string())
                .unwrap_or_else(|_| "<unknown>".to_owned());
            log::debug!("Opened connection from {}...", peer_address);

            if let Err(error) = command_loop(platform, stream).await {
                log::debug!(
                    "An IO error occurred in connection {}: {}",
                    peer_address,
                    error
                );
            }

            log::debug!("Closing connection to {}...", peer_address);
        });
    }
}

/// Executed per connection to process incoming commands.
async fn command_loop(platform: Arc<Platform>, mut stream: TcpStream) -> anyhow::Result<()> {
    // Mark the connection as nodelay, as we already optimize all writes as far as possible.
    let _ = stream.set_nodelay(true);

    // Pre-allocate a buffer for incoming requests. This will only be re-allocated if a request
    // was larger than 8 KB...
    let mut input_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
    let (mut reader, mut writer) = stream.split();

    while platform.is_running() {
        // We apply a timeout here, so that the condition of the while loop is checked every
        // once in a while...
        match tokio::time::timeout(READ_WAIT_TIMEOUT, reader.read_buf(&mut input_buffer)).await {
            // Best case, we read some bytes from the socket...
            Ok(Ok(bytes_read)) if bytes_read > 0 => loop {
                match Command::parse(&input_buffer) {
                    // aaand a full command was present in the buffer...
                    Ok(Some(command)) => {
                        log::debug!("Received {}", command.name());

                        let mut output = BytesMut::new();
                        handle_command(&platform, &command, &mut output).await;
                        writer.write_all(output.as_ref()).await?;
                        writer.flush().await?;

                        let _ = input_buffer.split_to(command.len());
                        if input_buffer.is_empty() {
                            break;
                        }
                    }
                    // A partial command is present - keep on reading...
                    Ok(None) => break,
                    Err(error) => {
                        // A malformed request leaves the connection in an undefined state,
                        // therefore we report the problem and close it...
                        let message = error.to_string().replace(['\r', '\n'], " ");
                        writer
                            .write_all(
                                format!("-ERR Received a malformed request: {}\r\n", message)
                                    .as_bytes(),
                            )
                            .await?;
                        writer.flush().await?;
                        return Ok(());
                    }
                }
            },

            // Reading from the client returned a zero length result -> the client wants to
            // close the connection. We therefore return from this loop.
            Ok(Ok(_)) => return Ok(()),

            // An IO error occurred while reading - notify our caller and abort...
            Ok(Err(error)) => {
                return Err(anyhow::anyhow!(
                    "An error occurred while reading from the client: {}",
                    error
                ));
            }

            // The timeout elapsed before any data was read => do nothing, all we want to do is
            // to re-evaluate our while condition anyway...
            _ => (),
        }

        // If the input buffer has grown in order to accommodate a large request, we shrink it
        // here again so that a single large request doesn't pin the memory forever...
        if input_buffer.capacity() > DEFAULT_BUFFER_SIZE && input_buffer.is_empty() {
            input_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
        }
    }

    Ok(())
}

/// Dispatches a single command and writes the appropriate reply into the given buffer.
async fn handle_command(platform: &Arc<Platform>, command: &Command, output: &mut BytesMut) {
    let result = if command.name().eq_ignore_ascii_case("PING") {
        protocol::write_simple(output, "PONG");
        Ok(())
    } else if command.name().eq_ignore_ascii_case("CACHE.GET") {
        cache_get_command(platform, command, output).await
    } else if command.name().eq_ignore_ascii_case("CACHE.STATS") {
        cache_stats_command(platform, command, output)
    } else {
        Err(anyhow::anyhow!("Unknown command: {}", command.name()))
    };

    if let Err(error) = result {
        protocol::write_error(output, &error.to_string());
    }
}

/// Implements the CACHE.GET command.
async fn cache_get_command(
    platform: &Arc<Platform>,
    command: &Command,
    output: &mut BytesMut,
) -> anyhow::Result<()> {
    let group_name = command.str_argument(0)?;
    let key = command.str_argument(1)?;

    let group = platform
        .require::<GroupRegistry>()
        .find(group_name)
        .ok_or_else(|| anyhow::anyhow!("No such group: {}", group_name))?;

    let view = group.get(key).await?;
    protocol::write_bulk(output, &view.to_vec());

    Ok(())
}

/// Delegates the CACHE.STATS command to the proper implementation based on its arguments.
fn cache_stats_command(
    platform: &Arc<Platform>,
    command: &Command,
    output: &mut BytesMut,
) -> anyhow::Result<()> {
    let registry = platform.require::<GroupRegistry>();

    let result = if command.argument_count() == 0 {
        all_stats(&registry)
    } else {
        group_stats(&registry, command.str_argument(0)?)?
    };

    protocol::write_bulk(output, result.as_bytes());

    Ok(())
}

/// Renders the overview of all groups for `CACHE.STATS`.
fn all_stats(registry: &GroupRegistry) -> String {
    let mut result = String::new();

    result += "Use 'CACHE.STATS <group>' for detailed metrics.\n\n";
    result += format!(
        "{:<30} {:>12} {:>20}\n",
        "Name", "Num Entries", "Allocated Memory"
    )
    .as_str();
    result += SEPARATOR;

    for name in registry.names() {
        if let Some(group) = registry.find(&name) {
            let stats = group.stats();
            result += format!(
                "{:<30} {:>12} {:>20}\n",
                name,
                stats.entries,
                format_size(stats.allocated_memory)
            )
            .as_str();
        }
    }
    result += SEPARATOR;

    result
}

/// Renders the detailed metrics of a single group for `CACHE.STATS group`.
fn group_stats(registry: &GroupRegistry, name: &str) -> anyhow::Result<String> {
    let group = registry
        .find(name)
        .ok_or_else(|| anyhow::anyhow!("No such group: {}", name))?;
    let stats = group.stats();

    let mut result = String::new();
    result += format!("{:<30} {:>20}\n", "Num Entries", stats.entries).as_str();
    result += format!(
        "{:<30} {:>20}\n",
        "Allocated Memory",
        format_size(stats.allocated_memory)
    )
    .as_str();
    result += format!(
        "{:<30} {:>20}\n",
        "Max Memory",
        format_size(stats.max_memory)
    )
    .as_str();
    result += format!("{:<30} {:>20}\n", "Reads", stats.reads).as_str();
    result += format!("{:<30} {:>20}\n", "Writes", stats.writes).as_str();
    result += format!("{:<30} {:>18.2} %\n", "Hit Rate", stats.hit_rate).as_str();

    Ok(result)
}
