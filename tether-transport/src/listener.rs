//! Accepting side: TCP listener and the verified-peer registry.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpListener;

use tether_protocol::{BufferPool, PooledBuffer};

use crate::config::{ConnectionConfig, ListenerConfig};
use crate::connection::{epoch_ms, Connection, Role};
use crate::error::TransportError;

/// Verified connections by id.
///
/// Connections insert themselves once the handshake completes and remove
/// themselves on teardown, so the registry only ever holds peers in the
/// Connected stage.
pub struct PeerRegistry {
    peers: DashMap<i32, Arc<Connection>>,
    next_id: AtomicI32,
    /// Sockets currently attached, verified or still in the handshake.
    live: AtomicUsize,
}

impl PeerRegistry {
    pub(crate) fn new() -> Self {
        PeerRegistry {
            peers: DashMap::new(),
            // Zero means unverified, so ids start at one.
            next_id: AtomicI32::new(1),
            live: AtomicUsize::new(0),
        }
    }

    pub(crate) fn socket_opened(&self) {
        self.live.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn socket_closed(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    /// Open connections, including those still verifying. This is what the
    /// connection cap is checked against.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn next_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn insert(&self, id: i32, conn: Arc<Connection>) {
        self.peers.insert(id, conn);
    }

    pub(crate) fn remove(&self, id: i32) {
        self.peers.remove(&id);
    }

    pub fn count(&self) -> usize {
        self.peers.len()
    }

    pub fn get(&self, id: i32) -> Option<Arc<Connection>> {
        self.peers.get(&id).map(|entry| entry.value().clone())
    }

    /// Queues one framed packet to every verified peer, retaining the
    /// buffer once per recipient. Peers mid-teardown are skipped.
    pub fn broadcast(&self, buffer: PooledBuffer, instant: bool) {
        for entry in self.peers.iter() {
            let _ = entry.value().send_packet(buffer.retain(), instant);
        }
        buffer.release();
    }
}

/// Accepts sockets and wraps each in a server-role [`Connection`].
pub struct Listener {
    inner: TcpListener,
    config: ListenerConfig,
    pool: BufferPool,
    registry: Arc<PeerRegistry>,
    start_time: i64,
}

impl Listener {
    pub async fn bind(config: ListenerConfig, pool: BufferPool) -> Result<Self, TransportError> {
        let inner = TcpListener::bind(config.bind_addr).await?;
        let local = inner.local_addr()?;
        tracing::info!(addr = %local, version = config.version, "listening");
        Ok(Listener {
            inner,
            config,
            pool,
            registry: Arc::new(PeerRegistry::new()),
            start_time: epoch_ms(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.inner.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn peer_count(&self) -> usize {
        self.registry.count()
    }

    /// When this listener started, milliseconds since the Unix epoch. Sent
    /// to every peer in the identification response.
    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    /// Accepts the next socket and returns it as a connection in the
    /// Verifying stage. The handshake runs on the connection's own tasks;
    /// sockets past the connection cap (counting unverified ones) are
    /// dropped immediately.
    pub async fn accept(&self) -> Result<Arc<Connection>, TransportError> {
        loop {
            let (stream, addr) = self.inner.accept().await?;
            if self.registry.live_count() >= self.config.max_connections {
                tracing::warn!(%addr, limit = self.config.max_connections, "connection limit reached, dropping");
                drop(stream);
                continue;
            }
            tracing::debug!(%addr, "socket accepted");
            let conn_config = ConnectionConfig::new(addr)
                .with_version(self.config.version)
                .with_http_enabled(self.config.http_enabled)
                .with_idle_timeout(self.config.idle_timeout)
                .with_low_latency(self.config.low_latency);
            let role = Role::Server {
                registry: self.registry.clone(),
                start_time: self.start_time,
            };
            // Balanced by socket_closed in the connection's teardown.
            self.registry.socket_opened();
            return Ok(Connection::accept(conn_config, self.pool.clone(), role, stream));
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.inner.local_addr().ok())
            .field("peers", &self.registry.count())
            .finish()
    }
}
