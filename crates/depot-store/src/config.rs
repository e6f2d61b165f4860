//! Centralized configuration for the depot store protocol.

use std::net::SocketAddr;
use std::time::Duration;

/// Protocol-level limits and defaults shared by client and server.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Maximum size of a single wire frame.
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    /// Default ceiling on concurrently outstanding client requests.
    pub const DEFAULT_CONCURRENCY: usize = 100;
    /// Fixed delay between transient-failure retry attempts.
    pub const RETRY_DELAY: Duration = Duration::from_millis(100);
    /// Timeout for establishing one TCP connection.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default ceiling on concurrently served connections.
    pub const MAX_CONNECTIONS: usize = 512;
}

/// Options for connecting a [`StoreClient`](crate::StoreClient).
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Address of the store server.
    pub addr: SocketAddr,
    /// Ceiling on concurrently outstanding requests.
    pub concurrency: usize,
    /// Delay between transient-failure retry attempts.
    pub retry_delay: Duration,
    /// Share one wire exchange between concurrent `request_package` calls
    /// that ask for the identical dependency with identical options.
    ///
    /// Off by default: whether a second caller should reuse the first
    /// caller's in-flight response is a deployment decision, not a protocol
    /// guarantee.
    pub dedupe_requests: bool,
}

impl ConnectOptions {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            concurrency: ProtocolConfig::DEFAULT_CONCURRENCY,
            retry_delay: ProtocolConfig::RETRY_DELAY,
            dedupe_requests: false,
        }
    }

    /// Set the ceiling on concurrently outstanding requests.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the delay between transient-failure retry attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Enable or disable in-flight request deduplication.
    pub fn with_dedupe_requests(mut self, dedupe: bool) -> Self {
        self.dedupe_requests = dedupe;
        self
    }
}

/// Options for starting a [`StoreServer`](crate::StoreServer).
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address to listen on. Port 0 lets the OS pick one.
    pub bind: SocketAddr,
    /// Reject remote `stop` requests instead of shutting down.
    pub ignore_stop_requests: bool,
    /// Ceiling on concurrently served connections.
    pub max_connections: usize,
}

impl ServerOptions {
    pub fn new() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            ignore_stop_requests: false,
            max_connections: ProtocolConfig::MAX_CONNECTIONS,
        }
    }

    /// Set the listen address.
    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    /// Reject remote `stop` requests instead of shutting down.
    pub fn with_ignore_stop_requests(mut self, ignore: bool) -> Self {
        self.ignore_stop_requests = ignore;
        self
    }

    /// Set the ceiling on concurrently served connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::new()
    }
}
