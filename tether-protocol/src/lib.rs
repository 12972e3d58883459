//! # tether-protocol
//!
//! Wire protocol implementation for tether.
//!
//! This crate provides:
//! - Pooled, dual-mode (read/write) byte buffers with explicit refcounting
//! - Length-prefixed binary packet framing
//! - The closed opcode catalog and handshake payload types
//! - Stream reassembly that recovers whole packets from arbitrary TCP chunks

pub mod buffer;
pub mod error;
pub mod handshake;
pub mod opcode;
pub mod reassembly;

pub use buffer::{Buffer, BufferPool, PooledBuffer};
pub use error::ProtocolError;
pub use handshake::{RequestId, ResponseId, ResponsePing};
pub use opcode::{Opcode, USER_OPCODE_START};
pub use reassembly::{Reassembled, Reassembler};

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: i32 = 5;

/// Default port for tether servers.
pub const DEFAULT_PORT: u16 = 5127;

/// Size of the little-endian length prefix preceding every packet.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum declared packet length accepted off the wire (16 MiB).
///
/// A peer announcing anything larger is treated as corrupt or hostile and
/// disconnected before any allocation happens.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// The little-endian i32 value of the ASCII bytes `"GET "`.
///
/// A fresh stream starting with these four bytes is an HTTP probe, not a
/// protocol peer; the value is never a valid packet length.
pub const HTTP_GET_SENTINEL: i32 = 542_393_671;
