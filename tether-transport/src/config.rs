//! Connection and listener configuration.

use std::net::SocketAddr;
use std::time::Duration;
use tether_protocol::{DEFAULT_PORT, PROTOCOL_VERSION};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;
pub const MIN_READ_BUFFER_SIZE: usize = 1024;
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Outgoing connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Primary address to dial.
    pub addr: SocketAddr,
    /// Optional second address tried when the primary fails.
    pub fallback_addr: Option<SocketAddr>,
    /// Bound on dialing plus the handshake round trip.
    pub connect_timeout: Duration,
    /// How long a silent connection is considered alive.
    pub idle_timeout: Duration,
    /// Protocol version offered in the identification packet.
    pub version: i32,
    /// Display name requested from the accepting side.
    pub name: String,
    /// Opaque client data forwarded untouched in the handshake.
    pub client_data: Vec<u8>,
    /// Whether an HTTP GET probe is answered instead of dropped.
    pub http_enabled: bool,
    /// Disables Nagle's algorithm on the socket.
    pub low_latency: bool,
    /// Size of the chunk buffer used by the read loop.
    pub read_buffer_size: usize,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        ConnectionConfig {
            addr,
            fallback_addr: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            version: PROTOCOL_VERSION,
            name: String::from("Guest"),
            client_data: Vec::new(),
            http_enabled: false,
            low_latency: true,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_fallback(mut self, addr: SocketAddr) -> Self {
        self.fallback_addr = Some(addr);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_client_data(mut self, data: Vec<u8>) -> Self {
        self.client_data = data;
        self
    }

    pub fn with_http_enabled(mut self, enabled: bool) -> Self {
        self.http_enabled = enabled;
        self
    }

    pub fn with_low_latency(mut self, enabled: bool) -> Self {
        self.low_latency = enabled;
        self
    }

    /// Sets the read chunk size, clamped to a sane range.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

/// Accepting side settings.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: SocketAddr,
    /// Protocol version required of connecting peers.
    pub version: i32,
    /// Whether web browser probes get a plain-text reply packet.
    pub http_enabled: bool,
    pub idle_timeout: Duration,
    /// Cap on simultaneously open connections, verified or still in the
    /// handshake; sockets past it are dropped at accept.
    pub max_connections: usize,
    pub low_latency: bool,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        ListenerConfig {
            bind_addr,
            version: PROTOCOL_VERSION,
            http_enabled: true,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            low_latency: true,
        }
    }

    pub fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    pub fn with_http_enabled(mut self, enabled: bool) -> Self {
        self.http_enabled = enabled;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_low_latency(mut self, enabled: bool) -> Self {
        self.low_latency = enabled;
        self
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig::new(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:5127".parse().unwrap()
    }

    #[test]
    fn test_connection_defaults() {
        let config = ConnectionConfig::new(addr());
        assert_eq!(config.version, PROTOCOL_VERSION);
        assert_eq!(config.name, "Guest");
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert!(config.low_latency);
        assert!(!config.http_enabled);
        assert!(config.fallback_addr.is_none());
    }

    #[test]
    fn test_read_buffer_size_clamped() {
        let config = ConnectionConfig::new(addr()).with_read_buffer_size(16);
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config = ConnectionConfig::new(addr()).with_read_buffer_size(usize::MAX);
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);

        let config = ConnectionConfig::new(addr()).with_read_buffer_size(64 * 1024);
        assert_eq!(config.read_buffer_size, 64 * 1024);
    }

    #[test]
    fn test_listener_defaults() {
        let config = ListenerConfig::default();
        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.version, PROTOCOL_VERSION);
        assert!(config.http_enabled);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
    }
}
