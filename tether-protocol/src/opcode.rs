//! The opcode catalog.
//!
//! One byte on the wire identifies every packet's semantic type. The catalog
//! is closed below [`USER_OPCODE_START`]; values at or above it are reserved
//! for application-defined packets and pass through the transport opaquely.

use std::fmt;

/// First opcode value available to applications.
pub const USER_OPCODE_START: u8 = 128;

/// Packet opcodes owned by the transport core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Keepalive no-op. Refreshes the receive timestamp, nothing else.
    Empty = 0,
    /// A string error message.
    Error = 1,
    /// Sever the connection immediately. No payload.
    Disconnect = 2,
    /// Handshake request: i32 version, string name, opaque client data.
    RequestId = 3,
    /// Handshake response: i32 version, i32 assigned id, i64 server time,
    /// i64 server start time.
    ResponseId = 4,
    /// Liveness probe. No payload.
    RequestPing = 5,
    /// Liveness reply: i64 server time, i32 active peer count.
    ResponsePing = 6,
    /// Synthesized locally when a fresh stream opens with an HTTP request
    /// line. Never sent on the wire.
    HttpGet = 7,
    /// Relay: forward the payload to every peer.
    ForwardToAll = 8,
    /// Relay: forward to every peer except the sender.
    ForwardToOthers = 9,
    /// Relay: forward to the host peer.
    ForwardToHost = 10,
    /// Relay: forward to one peer by id.
    ForwardToPlayer = 11,
    /// Relay: forward to one peer by name.
    ForwardByName = 12,
    /// Relay: broadcast to all connected peers.
    Broadcast = 13,
    /// Relay: broadcast to privileged peers only.
    BroadcastAdmin = 14,
}

impl Opcode {
    /// Decodes a wire byte into a catalog opcode. Application-defined values
    /// (and unassigned gaps below the boundary) return `None`.
    pub fn from_u8(value: u8) -> Option<Opcode> {
        Some(match value {
            0 => Opcode::Empty,
            1 => Opcode::Error,
            2 => Opcode::Disconnect,
            3 => Opcode::RequestId,
            4 => Opcode::ResponseId,
            5 => Opcode::RequestPing,
            6 => Opcode::ResponsePing,
            7 => Opcode::HttpGet,
            8 => Opcode::ForwardToAll,
            9 => Opcode::ForwardToOthers,
            10 => Opcode::ForwardToHost,
            11 => Opcode::ForwardToPlayer,
            12 => Opcode::ForwardByName,
            13 => Opcode::Broadcast,
            14 => Opcode::BroadcastAdmin,
            _ => return None,
        })
    }

    /// Whether this is one of the opaque relay opcodes. The transport only
    /// validates framing for these, never contents: the payload starts with
    /// a sender id and routing target consumed by the higher-level
    /// dispatcher.
    pub fn is_relay(&self) -> bool {
        matches!(
            self,
            Opcode::ForwardToAll
                | Opcode::ForwardToOthers
                | Opcode::ForwardToHost
                | Opcode::ForwardToPlayer
                | Opcode::ForwardByName
                | Opcode::Broadcast
                | Opcode::BroadcastAdmin
        )
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_roundtrip() {
        for value in 0..USER_OPCODE_START {
            if let Some(op) = Opcode::from_u8(value) {
                assert_eq!(op as u8, value);
            }
        }
    }

    #[test]
    fn test_user_range_is_open() {
        assert!(Opcode::from_u8(USER_OPCODE_START).is_none());
        assert!(Opcode::from_u8(200).is_none());
        assert!(Opcode::from_u8(255).is_none());
    }

    #[test]
    fn test_relay_family() {
        assert!(Opcode::ForwardToAll.is_relay());
        assert!(Opcode::Broadcast.is_relay());
        assert!(!Opcode::Empty.is_relay());
        assert!(!Opcode::RequestId.is_relay());
    }
}
