//! Per-connection state machine and send/receive pipelines.
//!
//! Each connection owns two tokio tasks: a read loop that feeds the
//! reassembler and dispatches recovered packets, and a write loop that
//! drains an ordered outbound queue onto the socket. Application code never
//! touches the socket; it builds packets through [`Connection::begin_send`]
//! and drains the inbound queue with [`Connection::try_receive`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use tether_protocol::{
    Buffer, BufferPool, Opcode, PooledBuffer, ProtocolError, Reassembled, Reassembler, RequestId,
    ResponseId, ResponsePing,
};

use crate::config::ConnectionConfig;
use crate::error::TransportError;
use crate::identity::Identity;
use crate::listener::PeerRegistry;
use crate::transport::CustomTransport;

/// Lifecycle stage of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// No socket, or torn down.
    NotConnected,
    /// Dialing.
    Connecting,
    /// Socket open, handshake in flight.
    Verifying,
    /// Handshake complete; application packets flow.
    Connected,
    /// The peer turned out to be a plain HTTP client.
    WebBrowser,
}

/// Milliseconds since the Unix epoch, the clock the handshake carries.
pub(crate) fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) enum Role {
    Client,
    Server {
        registry: Arc<PeerRegistry>,
        start_time: i64,
    },
}

struct Outgoing {
    buffer: PooledBuffer,
    instant: bool,
}

type CloseCallback = Box<dyn FnOnce(i32) + Send>;

pub struct Connection {
    config: ConnectionConfig,
    pool: BufferPool,
    role: Role,
    stage: Mutex<Stage>,
    identity: Mutex<Identity>,
    inbound: Mutex<VecDeque<PooledBuffer>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
    custom: Mutex<Option<Box<dyn CustomTransport>>>,
    handshake: Mutex<Option<oneshot::Sender<Result<i32, TransportError>>>>,
    on_close: Mutex<Option<CloseCallback>>,
    last_received: Mutex<Instant>,
    peer_addr: Mutex<Option<SocketAddr>>,
    closed: AtomicBool,
}

impl Connection {
    fn new(config: ConnectionConfig, pool: BufferPool, role: Role) -> Arc<Self> {
        Arc::new(Connection {
            config,
            pool,
            role,
            stage: Mutex::new(Stage::NotConnected),
            identity: Mutex::new(Identity::default()),
            inbound: Mutex::new(VecDeque::new()),
            outbound: Mutex::new(None),
            custom: Mutex::new(None),
            handshake: Mutex::new(None),
            on_close: Mutex::new(None),
            last_received: Mutex::new(Instant::now()),
            peer_addr: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Dials the configured address (falling back if one is set), performs
    /// the identification handshake, and returns the verified connection.
    pub async fn connect(
        config: ConnectionConfig,
        pool: BufferPool,
    ) -> Result<Arc<Self>, TransportError> {
        let conn = Connection::new(config, pool, Role::Client);
        conn.set_stage(Stage::Connecting);

        let stream = match dial(conn.config.addr, conn.config.connect_timeout).await {
            Ok(stream) => stream,
            Err(err) => match conn.config.fallback_addr {
                Some(fallback) => {
                    tracing::info!(
                        primary = %conn.config.addr,
                        %fallback,
                        error = %err,
                        "primary connect failed, trying fallback"
                    );
                    match dial(fallback, conn.config.connect_timeout).await {
                        Ok(stream) => stream,
                        Err(err) => {
                            conn.set_stage(Stage::NotConnected);
                            return Err(err);
                        }
                    }
                }
                None => {
                    conn.set_stage(Stage::NotConnected);
                    return Err(err);
                }
            },
        };

        let (tx, rx) = oneshot::channel();
        *conn.handshake.lock() = Some(tx);
        conn.set_stage(Stage::Verifying);
        conn.clone().attach(stream);

        let hello = RequestId {
            version: conn.config.version,
            name: conn.config.name.clone(),
            data: conn.config.client_data.clone(),
        };
        let sent = {
            let mut writer = conn.begin_send(Opcode::RequestId);
            match writer.with_buffer(|buf| hello.write_to(buf)) {
                Ok(()) => writer.instant().end_send(),
                Err(err) => Err(err),
            }
        };
        if let Err(err) = sent {
            conn.disconnect(false);
            return Err(err);
        }

        match tokio::time::timeout(conn.config.connect_timeout, rx).await {
            Ok(Ok(Ok(id))) => {
                tracing::info!(id, addr = %conn.config.addr, "connected");
                Ok(conn)
            }
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                conn.disconnect(false);
                Err(TransportError::Timeout)
            }
        }
    }

    /// Wraps an already-accepted socket. The peer is expected to open with
    /// an identification packet (or an HTTP probe).
    pub(crate) fn accept(
        config: ConnectionConfig,
        pool: BufferPool,
        role: Role,
        stream: TcpStream,
    ) -> Arc<Self> {
        let conn = Connection::new(config, pool, role);
        conn.set_stage(Stage::Verifying);
        conn.clone().attach(stream);
        conn
    }

    /// Builds a connection that exchanges packets over a user-supplied
    /// channel instead of a socket. It starts out Connected; the handshake
    /// is the channel's business.
    pub fn with_custom_transport(
        pool: BufferPool,
        transport: Box<dyn CustomTransport>,
    ) -> Arc<Self> {
        let config = ConnectionConfig::new(SocketAddr::from(([0, 0, 0, 0], 0)));
        let conn = Connection::new(config, pool, Role::Client);
        *conn.custom.lock() = Some(transport);
        conn.set_stage(Stage::Connected);
        conn
    }

    /// Splits the socket and spawns the read and write loops.
    fn attach(self: Arc<Self>, stream: TcpStream) {
        if let Err(err) = stream.set_nodelay(self.config.low_latency) {
            tracing::debug!(error = %err, "set_nodelay failed");
        }
        *self.peer_addr.lock() = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock() = Some(tx);
        tokio::spawn(self.clone().write_loop(write_half, rx));
        tokio::spawn(self.read_loop(read_half));
    }

    pub fn stage(&self) -> Stage {
        *self.stage.lock()
    }

    fn set_stage(&self, stage: Stage) {
        *self.stage.lock() = stage;
    }

    pub fn is_connected(&self) -> bool {
        match self.custom.lock().as_ref() {
            Some(custom) => custom.is_connected(),
            None => self.stage() == Stage::Connected,
        }
    }

    /// Id assigned by the handshake, zero before verification.
    pub fn id(&self) -> i32 {
        self.identity.lock().id
    }

    pub fn identity(&self) -> Identity {
        self.identity.lock().clone()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Time since the last byte arrived from the peer.
    pub fn idle_duration(&self) -> Duration {
        self.last_received.lock().elapsed()
    }

    /// Registers a callback fired exactly once when the connection tears
    /// down, with the connection id.
    pub fn on_close(&self, callback: impl FnOnce(i32) + Send + 'static) {
        *self.on_close.lock() = Some(Box::new(callback));
    }

    /// Starts an outgoing packet. Finish it with [`PacketWriter::end_send`];
    /// dropping the writer abandons the packet and recycles its buffer.
    pub fn begin_send(&self, opcode: impl Into<u8>) -> PacketWriter<'_> {
        let buffer = self.pool.acquire();
        buffer.lock().begin_packet(opcode.into());
        PacketWriter {
            conn: self,
            buffer: Some(buffer),
            instant: false,
        }
    }

    /// Queues a fully framed packet for delivery. Ownership of the buffer
    /// reference passes to the pipeline; callers wanting to reuse the packet
    /// (fan-out) retain before sending.
    ///
    /// `instant` flushes the socket right after this packet instead of
    /// letting the OS coalesce writes.
    pub fn send_packet(&self, buffer: PooledBuffer, instant: bool) -> Result<(), TransportError> {
        // The custom lock must be gone before fail() runs; teardown takes
        // it again.
        let custom_result = self
            .custom
            .lock()
            .as_ref()
            .map(|custom| custom.send_packet(&buffer));
        if let Some(delivered) = custom_result {
            buffer.release();
            if !delivered {
                self.fail(TransportError::ConnectionClosed);
                return Err(TransportError::ConnectionClosed);
            }
            return Ok(());
        }
        if self.closed.load(Ordering::SeqCst) {
            buffer.release();
            return Err(TransportError::NotConnected);
        }
        let guard = self.outbound.lock();
        match guard.as_ref() {
            Some(tx) => match tx.send(Outgoing { buffer, instant }) {
                Ok(()) => Ok(()),
                Err(err) => {
                    err.0.buffer.release();
                    Err(TransportError::NotConnected)
                }
            },
            None => {
                buffer.release();
                Err(TransportError::NotConnected)
            }
        }
    }

    /// Pops the next inbound packet without blocking. Caller owns the
    /// returned buffer reference and must release it.
    pub fn try_receive(&self) -> Option<PooledBuffer> {
        if let Some(custom) = self.custom.lock().as_ref() {
            if let Some(packet) = custom.try_receive() {
                return Some(packet);
            }
        }
        self.inbound.lock().pop_front()
    }

    /// Closes the connection. With `notify` the peer gets a disconnect
    /// packet first; queued outbound packets drain either way.
    pub fn disconnect(&self, notify: bool) {
        self.teardown(notify, true);
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<Outgoing>,
    ) {
        while let Some(out) = rx.recv().await {
            let bytes = out.buffer.frame_bytes();
            let result = write_all(&mut writer, &bytes).await;
            out.buffer.release();
            match result {
                Ok(()) => {
                    if out.instant {
                        if let Err(err) = writer.flush().await {
                            drain_outbound(&mut rx);
                            self.fail(TransportError::Io(err));
                            return;
                        }
                    }
                }
                Err(err) => {
                    drain_outbound(&mut rx);
                    if !self.closed.load(Ordering::SeqCst) {
                        self.fail(err);
                    }
                    return;
                }
            }
        }
        // Sender gone: local teardown already ran and the queue is drained.
        let _ = writer.shutdown().await;
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut chunk = vec![0u8; self.config.read_buffer_size];
        let mut reassembler = Reassembler::new(self.config.http_enabled);
        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) => {
                    if !self.closed.load(Ordering::SeqCst) {
                        tracing::debug!(id = self.id(), "peer closed the stream");
                        self.push_synthetic(Opcode::Disconnect, None);
                        self.teardown(false, false);
                    }
                    return;
                }
                Ok(n) => n,
                Err(err) => {
                    if !self.closed.load(Ordering::SeqCst) {
                        self.fail(TransportError::Io(err));
                    }
                    return;
                }
            };
            *self.last_received.lock() = Instant::now();
            reassembler.push(&chunk[..n]);
            loop {
                match reassembler.next(&self.pool) {
                    Ok(Some(item)) => {
                        if let Err(err) = Self::dispatch(&self, item) {
                            self.fail(err);
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        self.fail(err.into());
                        return;
                    }
                }
            }
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    /// Routes one reassembled packet: control packets are handled here,
    /// everything else lands on the inbound queue.
    fn dispatch(this: &Arc<Self>, item: Reassembled) -> Result<(), TransportError> {
        let packet = match item {
            Reassembled::HttpRequest(packet) => {
                tracing::info!(peer = ?this.peer_addr(), "peer looks like a web browser");
                this.set_stage(Stage::WebBrowser);
                this.inbound.lock().push_back(packet);
                return Ok(());
            }
            Reassembled::Packet(packet) => packet,
        };

        let op = packet.lock().peek_u8()?;
        match Opcode::from_u8(op) {
            // Keepalive; the read loop already refreshed the idle clock.
            Some(Opcode::Empty) => {
                packet.release();
                Ok(())
            }
            Some(Opcode::Disconnect) => {
                packet.release();
                tracing::info!(id = this.id(), "peer requested disconnect");
                this.push_synthetic(Opcode::Disconnect, None);
                this.teardown(false, false);
                Ok(())
            }
            Some(Opcode::RequestId) => Self::handle_request_id(this, packet),
            Some(Opcode::ResponseId) => this.handle_response_id(packet),
            Some(Opcode::RequestPing) => this.handle_request_ping(packet),
            Some(Opcode::Error) if this.stage() == Stage::Verifying => {
                let message = {
                    let mut buf = packet.lock();
                    buf.read_u8().and_then(|_| buf.read_str())
                };
                packet.release();
                Err(TransportError::HandshakeFailed(message?))
            }
            _ => {
                if this.stage() == Stage::Verifying {
                    // Data before the handshake completed.
                    packet.release();
                    return Err(ProtocolError::UnexpectedOpcode(op).into());
                }
                this.inbound.lock().push_back(packet);
                Ok(())
            }
        }
    }

    /// Accepting side of the handshake: version check, id assignment,
    /// identification response.
    fn handle_request_id(this: &Arc<Self>, packet: PooledBuffer) -> Result<(), TransportError> {
        let Role::Server {
            registry,
            start_time,
        } = &this.role
        else {
            packet.release();
            return Err(ProtocolError::UnexpectedOpcode(Opcode::RequestId.into()).into());
        };
        if this.stage() != Stage::Verifying {
            packet.release();
            return Err(ProtocolError::UnexpectedOpcode(Opcode::RequestId.into()).into());
        }

        // Recycle before propagating so a malformed handshake does not leak
        // the buffer.
        let request = {
            let mut buf = packet.lock();
            buf.read_u8().and_then(|_| RequestId::read_from(&mut buf))
        };
        packet.release();
        let request = request?;

        if request.version != this.config.version {
            tracing::warn!(
                ours = this.config.version,
                theirs = request.version,
                "handshake version mismatch"
            );
            this.reject(&format!(
                "version mismatch: server speaks {}, client speaks {}",
                this.config.version, request.version
            ));
            return Ok(());
        }

        let id = registry.next_id();
        {
            let mut identity = this.identity.lock();
            identity.id = id;
            identity.name = request.name;
            identity.data = request.data;
        }

        let response = ResponseId {
            version: this.config.version,
            id,
            server_time: epoch_ms(),
            start_time: *start_time,
        };
        let mut writer = this.begin_send(Opcode::ResponseId);
        writer.with_buffer(|buf| {
            response.write_to(buf);
            Ok(())
        })?;
        writer.instant().end_send()?;

        this.set_stage(Stage::Connected);
        registry.insert(id, this.clone());
        tracing::info!(id, peer = ?this.peer_addr(), "peer verified");
        Ok(())
    }

    /// Connecting side of the handshake: version check, id adoption.
    fn handle_response_id(&self, packet: PooledBuffer) -> Result<(), TransportError> {
        if !matches!(self.role, Role::Client) || self.stage() != Stage::Verifying {
            packet.release();
            return Err(ProtocolError::UnexpectedOpcode(Opcode::ResponseId.into()).into());
        }

        let response = {
            let mut buf = packet.lock();
            buf.read_u8().and_then(|_| ResponseId::read_from(&mut buf))
        };
        packet.release();
        let response = response?;

        if response.version != self.config.version {
            return Err(ProtocolError::VersionMismatch {
                ours: self.config.version,
                theirs: response.version,
            }
            .into());
        }

        self.identity.lock().id = response.id;
        self.set_stage(Stage::Connected);
        tracing::debug!(
            id = response.id,
            server_time = response.server_time,
            "handshake complete"
        );
        if let Some(tx) = self.handshake.lock().take() {
            let _ = tx.send(Ok(response.id));
        }
        Ok(())
    }

    fn handle_request_ping(&self, packet: PooledBuffer) -> Result<(), TransportError> {
        packet.release();
        let peer_count = match &self.role {
            Role::Server { registry, .. } => registry.count() as i32,
            Role::Client => 0,
        };
        let pong = ResponsePing {
            server_time: epoch_ms(),
            peer_count,
        };
        let mut writer = self.begin_send(Opcode::ResponsePing);
        writer.with_buffer(|buf| {
            pong.write_to(buf);
            Ok(())
        })?;
        writer.instant().end_send()
    }

    /// Tells the peer why it is being dropped, then tears down. The error
    /// and disconnect packets drain before the socket closes.
    fn reject(&self, message: &str) {
        let mut writer = self.begin_send(Opcode::Error);
        let _ = writer.write_str(message);
        let _ = writer.end_send();
        let _ = self.begin_send(Opcode::Disconnect).instant().end_send();
        self.fail(TransportError::HandshakeFailed(message.to_string()));
    }

    /// Fatal-path teardown: the application observes a synthetic error
    /// packet followed by a synthetic disconnect, then the closed state.
    pub(crate) fn fail(&self, err: TransportError) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match &err {
            TransportError::Protocol(violation) if violation.is_violation() => {
                tracing::warn!(id = self.id(), error = %err, "peer protocol violation");
            }
            _ => {
                tracing::warn!(id = self.id(), error = %err, "connection failed");
            }
        }
        let message = err.to_string();
        if let Some(tx) = self.handshake.lock().take() {
            let _ = tx.send(Err(err));
        }
        self.push_synthetic(Opcode::Error, Some(&message));
        self.push_synthetic(Opcode::Disconnect, None);
        self.teardown(false, false);
    }

    /// Fabricates an inbound packet, framed exactly like one off the wire.
    fn push_synthetic(&self, opcode: Opcode, message: Option<&str>) {
        let packet = self.pool.acquire();
        {
            let mut buf = packet.lock();
            buf.begin_write(false);
            buf.write_u8(opcode.into());
            if let Some(message) = message {
                // Truncation cannot happen here; error strings are short.
                let _ = buf.write_str(message);
            }
            buf.end_write();
        }
        self.inbound.lock().push_back(packet);
    }

    /// Idempotent teardown. Closes the outbound queue (the write loop
    /// drains what is already queued, then shuts the socket down), leaves
    /// the registry, and fires the close callback.
    fn teardown(&self, notify: bool, drain_inbound: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if notify {
            if let Some(tx) = self.outbound.lock().as_ref() {
                let packet = self.pool.acquire();
                {
                    let mut buf = packet.lock();
                    buf.begin_packet(Opcode::Disconnect.into());
                    let _ = buf.end_packet();
                }
                if let Err(err) = tx.send(Outgoing {
                    buffer: packet,
                    instant: true,
                }) {
                    err.0.buffer.release();
                }
            }
        }
        *self.outbound.lock() = None;
        if drain_inbound {
            let mut inbound = self.inbound.lock();
            while let Some(packet) = inbound.pop_front() {
                packet.release();
            }
        }
        let id = self.identity.lock().id;
        if let Role::Server { registry, .. } = &self.role {
            if id != 0 {
                registry.remove(id);
            }
            registry.socket_closed();
        }
        self.set_stage(Stage::NotConnected);
        if let Some(tx) = self.handshake.lock().take() {
            let _ = tx.send(Err(TransportError::ConnectionClosed));
        }
        // Guards must be released before invoking either hook.
        let custom = self.custom.lock().take();
        let callback = self.on_close.lock().take();
        if let Some(custom) = custom {
            custom.on_disconnect();
        }
        if let Some(callback) = callback {
            callback(id);
        }
        tracing::info!(id, "disconnected");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Both task handles hold an Arc, so by the time this runs the loops
        // are gone. Recycle whatever the application left unread.
        let mut inbound = self.inbound.lock();
        while let Some(packet) = inbound.pop_front() {
            packet.release();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("stage", &self.stage())
            .field("peer_addr", &self.peer_addr())
            .finish()
    }
}

/// In-progress outgoing packet.
///
/// Wraps a pooled buffer already positioned past the opcode. `end_send`
/// frames it and hands it to the pipeline; dropping the writer instead
/// abandons the packet.
pub struct PacketWriter<'a> {
    conn: &'a Connection,
    buffer: Option<PooledBuffer>,
    instant: bool,
}

impl PacketWriter<'_> {
    /// Marks the packet for an immediate socket flush once written.
    pub fn instant(mut self) -> Self {
        self.instant = true;
        self
    }

    pub fn write_u8(&mut self, v: u8) {
        if let Some(buffer) = &self.buffer {
            buffer.lock().write_u8(v);
        }
    }

    pub fn write_u16(&mut self, v: u16) {
        if let Some(buffer) = &self.buffer {
            buffer.lock().write_u16(v);
        }
    }

    pub fn write_i32(&mut self, v: i32) {
        if let Some(buffer) = &self.buffer {
            buffer.lock().write_i32(v);
        }
    }

    pub fn write_i64(&mut self, v: i64) {
        if let Some(buffer) = &self.buffer {
            buffer.lock().write_i64(v);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if let Some(buffer) = &self.buffer {
            buffer.lock().write_bytes(bytes);
        }
    }

    pub fn write_str(&mut self, s: &str) -> Result<(), TransportError> {
        self.with_buffer(|buf| buf.write_str(s))
    }

    /// Runs a closure against the underlying buffer, for payload types with
    /// their own codecs.
    pub fn with_buffer<F>(&mut self, f: F) -> Result<(), TransportError>
    where
        F: FnOnce(&mut Buffer) -> Result<(), ProtocolError>,
    {
        match &self.buffer {
            Some(buffer) => f(&mut buffer.lock()).map_err(Into::into),
            None => Err(TransportError::NotConnected),
        }
    }

    /// Patches the length prefix and queues the packet. Returns once the
    /// packet is owned by the pipeline; delivery order matches the order of
    /// `end_send` returns across the whole connection.
    pub fn end_send(mut self) -> Result<(), TransportError> {
        let buffer = match self.buffer.take() {
            Some(buffer) => buffer,
            None => return Err(TransportError::NotConnected),
        };
        let framed = buffer.lock().end_packet();
        match framed {
            Ok(_) => self.conn.send_packet(buffer, self.instant),
            Err(err) => {
                buffer.release();
                Err(err.into())
            }
        }
    }
}

impl Drop for PacketWriter<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            buffer.release();
        }
    }
}

async fn dial(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, TransportError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(TransportError::Io(err)),
        Err(_) => Err(TransportError::Timeout),
    }
}

/// Writes the whole frame, continuing across partial writes.
async fn write_all(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> Result<(), TransportError> {
    let mut written = 0;
    while written < bytes.len() {
        let n = writer.write(&bytes[written..]).await?;
        if n == 0 {
            return Err(TransportError::Io(std::io::ErrorKind::WriteZero.into()));
        }
        written += n;
    }
    Ok(())
}

/// Recycles whatever is still queued after a write failure.
fn drain_outbound(rx: &mut mpsc::UnboundedReceiver<Outgoing>) {
    rx.close();
    while let Ok(out) = rx.try_recv() {
        out.buffer.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifying_server(pool: &BufferPool) -> Arc<Connection> {
        let registry = Arc::new(PeerRegistry::new());
        registry.socket_opened();
        let conn = Connection::new(
            ConnectionConfig::new(SocketAddr::from(([127, 0, 0, 1], 0))),
            pool.clone(),
            Role::Server {
                registry,
                start_time: epoch_ms(),
            },
        );
        conn.set_stage(Stage::Verifying);
        conn
    }

    fn inbound_packet(pool: &BufferPool, opcode: Opcode, payload: &[u8]) -> PooledBuffer {
        let packet = pool.acquire();
        {
            let mut buf = packet.lock();
            buf.begin_write(false);
            buf.write_u8(opcode.into());
            buf.write_bytes(payload);
            buf.end_write();
        }
        packet
    }

    #[test]
    fn test_truncated_identification_recycles_packet() {
        let pool = BufferPool::new();
        let conn = verifying_server(&pool);

        // One byte where a four-byte version belongs.
        let packet = inbound_packet(&pool, Opcode::RequestId, &[5]);
        let extra = packet.retain();

        let result = Connection::dispatch(&conn, Reassembled::Packet(packet));
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::ReadPastEnd { .. }))
        ));

        // Dispatch gave its reference back; only the test's remains.
        assert_eq!(extra.ref_count(), 1);
        extra.release();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_truncated_handshake_error_recycles_packet() {
        let pool = BufferPool::new();
        let conn = Connection::new(
            ConnectionConfig::new(SocketAddr::from(([127, 0, 0, 1], 0))),
            pool.clone(),
            Role::Client,
        );
        conn.set_stage(Stage::Verifying);

        // Error packet whose string length prefix is cut off.
        let packet = inbound_packet(&pool, Opcode::Error, &[7]);
        let extra = packet.retain();

        let result = Connection::dispatch(&conn, Reassembled::Packet(packet));
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::ReadPastEnd { .. }))
        ));

        assert_eq!(extra.ref_count(), 1);
        extra.release();
        assert_eq!(pool.outstanding(), 0);
    }
}
