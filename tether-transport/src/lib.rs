//! # tether-transport
//!
//! TCP transport core for tether: per-connection state machine, ordered
//! send pipeline, receive pipeline with stream reassembly, and the
//! listener/registry pair for the accepting side.
//!
//! ## Quick tour
//!
//! ```no_run
//! use tether_protocol::BufferPool;
//! use tether_transport::{Connection, ConnectionConfig, Listener, ListenerConfig};
//!
//! # async fn run() -> Result<(), tether_transport::TransportError> {
//! let pool = BufferPool::new();
//!
//! // Accepting side.
//! let listener = Listener::bind(ListenerConfig::default(), pool.clone()).await?;
//!
//! // Connecting side.
//! let addr = "127.0.0.1:5127".parse().unwrap();
//! let conn = Connection::connect(ConnectionConfig::new(addr), pool.clone()).await?;
//!
//! // Application packets use opcodes at or above USER_OPCODE_START.
//! let mut writer = conn.begin_send(128u8);
//! writer.write_i32(42);
//! writer.end_send()?;
//!
//! while let Some(packet) = conn.try_receive() {
//!     let _opcode = packet.lock().peek_u8()?;
//!     // ... interpret, then hand the reference back:
//!     packet.release();
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod listener;
pub mod transport;

pub use config::{ConnectionConfig, ListenerConfig};
pub use connection::{Connection, PacketWriter, Stage};
pub use error::TransportError;
pub use identity::Identity;
pub use listener::{Listener, PeerRegistry};
pub use transport::CustomTransport;

pub use tether_protocol as protocol;
