//! Pluggable transport trait for non-TCP channels.

use tether_protocol::PooledBuffer;

/// A user-supplied channel that replaces the socket on a connection.
///
/// When a connection carries a custom transport, every outgoing packet is
/// handed to [`send_packet`](CustomTransport::send_packet) instead of the
/// write loop, and the application pumps incoming packets through
/// [`try_receive`](CustomTransport::try_receive). Framing, pooling, and the
/// opcode catalog stay exactly as on TCP.
///
/// Implementations must not call back into the owning connection from
/// inside these methods.
pub trait CustomTransport: Send + Sync {
    /// Whether the underlying channel can still carry packets.
    fn is_connected(&self) -> bool;

    /// Sends a fully framed packet. The caller keeps ownership of the
    /// buffer; copy out what you need. Returns false when the channel is
    /// gone, which fails the connection.
    fn send_packet(&self, buffer: &PooledBuffer) -> bool;

    /// Pops the next incoming packet, if any. Buffers returned here must
    /// come framed the same way the reassembler produces them: opcode
    /// first, read cursor at zero.
    fn try_receive(&self) -> Option<PooledBuffer>;

    /// Called exactly once when the owning connection tears down.
    fn on_disconnect(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, Stage};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tether_protocol::{BufferPool, Opcode};

    #[derive(Default)]
    struct Shared {
        connected: AtomicBool,
        sent: Mutex<Vec<Vec<u8>>>,
        queued: Mutex<Vec<PooledBuffer>>,
        disconnects: AtomicUsize,
    }

    struct ChannelTransport(Arc<Shared>);

    impl CustomTransport for ChannelTransport {
        fn is_connected(&self) -> bool {
            self.0.connected.load(Ordering::SeqCst)
        }

        fn send_packet(&self, buffer: &PooledBuffer) -> bool {
            if !self.is_connected() {
                return false;
            }
            self.0.sent.lock().push(buffer.lock().framed().to_vec());
            true
        }

        fn try_receive(&self) -> Option<PooledBuffer> {
            self.0.queued.lock().pop()
        }

        fn on_disconnect(&self) {
            self.0.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn channel_connection() -> (Arc<Connection>, Arc<Shared>, BufferPool) {
        let pool = BufferPool::new();
        let shared = Arc::new(Shared::default());
        shared.connected.store(true, Ordering::SeqCst);
        let conn =
            Connection::with_custom_transport(pool.clone(), Box::new(ChannelTransport(shared.clone())));
        (conn, shared, pool)
    }

    #[test]
    fn test_send_routes_through_channel() {
        let (conn, shared, _pool) = channel_connection();
        assert!(conn.is_connected());

        conn.begin_send(Opcode::RequestPing).end_send().unwrap();

        let sent = shared.sent.lock();
        assert_eq!(sent.len(), 1);
        // Framed: little-endian length (opcode only) then the opcode byte.
        assert_eq!(sent[0], vec![1, 0, 0, 0, u8::from(Opcode::RequestPing)]);
    }

    #[test]
    fn test_receive_pulls_from_channel() {
        let (conn, shared, pool) = channel_connection();

        let packet = pool.acquire();
        {
            let mut buf = packet.lock();
            buf.begin_write(false);
            buf.write_u8(200);
            buf.write_i32(7);
            buf.end_write();
        }
        shared.queued.lock().push(packet);

        let received = conn.try_receive().unwrap();
        {
            let mut buf = received.lock();
            assert_eq!(buf.read_u8().unwrap(), 200);
            assert_eq!(buf.read_i32().unwrap(), 7);
        }
        received.release();
        assert!(conn.try_receive().is_none());
    }

    #[test]
    fn test_failed_send_tears_down() {
        let (conn, shared, _pool) = channel_connection();
        shared.connected.store(false, Ordering::SeqCst);

        let result = conn.begin_send(Opcode::RequestPing).end_send();
        assert!(matches!(result, Err(crate::TransportError::ConnectionClosed)));
        assert_eq!(shared.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(conn.stage(), Stage::NotConnected);

        // The application observes the failure as a synthetic error packet
        // followed by a synthetic disconnect.
        let error = conn.try_receive().unwrap();
        assert_eq!(error.lock().peek_u8().unwrap(), u8::from(Opcode::Error));
        error.release();
        let disconnect = conn.try_receive().unwrap();
        assert_eq!(
            disconnect.lock().peek_u8().unwrap(),
            u8::from(Opcode::Disconnect)
        );
        disconnect.release();
    }

    #[test]
    fn test_disconnect_fires_hooks_once() {
        let (conn, shared, _pool) = channel_connection();
        let closes = Arc::new(AtomicUsize::new(0));
        let counter = closes.clone();
        conn.on_close(move |_id| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        conn.disconnect(false);
        conn.disconnect(true);

        assert_eq!(shared.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(conn.stage(), Stage::NotConnected);
    }
}
