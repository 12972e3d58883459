//! Handshake and liveness payload types.
//!
//! Both sides of the transport share these codecs so the byte layout is
//! defined exactly once. Each type reads from / writes to a [`Buffer`]
//! positioned just after the opcode byte.

use crate::buffer::Buffer;
use crate::error::ProtocolError;

/// Identification request sent by the connecting side immediately after the
/// socket opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId {
    /// Protocol version the client speaks.
    pub version: i32,
    /// Requested display name.
    pub name: String,
    /// Opaque client data blob, passed through to the application.
    pub data: Vec<u8>,
}

impl RequestId {
    pub fn write_to(&self, buf: &mut Buffer) -> Result<(), ProtocolError> {
        buf.write_i32(self.version);
        buf.write_str(&self.name)?;
        buf.write_bytes(&self.data);
        Ok(())
    }

    pub fn read_from(buf: &mut Buffer) -> Result<Self, ProtocolError> {
        Ok(Self {
            version: buf.read_i32()?,
            name: buf.read_str()?,
            data: buf.read_remaining()?.to_vec(),
        })
    }
}

/// Identification response sent by the accepting side once the version
/// check passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseId {
    /// Protocol version the server speaks.
    pub version: i32,
    /// Connection id assigned to the peer.
    pub id: i32,
    /// Server clock, milliseconds since the Unix epoch.
    pub server_time: i64,
    /// When the server started, same clock.
    pub start_time: i64,
}

impl ResponseId {
    pub fn write_to(&self, buf: &mut Buffer) {
        buf.write_i32(self.version);
        buf.write_i32(self.id);
        buf.write_i64(self.server_time);
        buf.write_i64(self.start_time);
    }

    pub fn read_from(buf: &mut Buffer) -> Result<Self, ProtocolError> {
        Ok(Self {
            version: buf.read_i32()?,
            id: buf.read_i32()?,
            server_time: buf.read_i64()?,
            start_time: buf.read_i64()?,
        })
    }
}

/// Liveness reply carrying the server clock and how many peers are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponsePing {
    pub server_time: i64,
    pub peer_count: i32,
}

impl ResponsePing {
    pub fn write_to(&self, buf: &mut Buffer) {
        buf.write_i64(self.server_time);
        buf.write_i32(self.peer_count);
    }

    pub fn read_from(buf: &mut Buffer) -> Result<Self, ProtocolError> {
        Ok(Self {
            server_time: buf.read_i64()?,
            peer_count: buf.read_i32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_roundtrip() {
        let req = RequestId {
            version: 5,
            name: "Guest".to_string(),
            data: vec![0xDE, 0xAD],
        };

        let mut buf = Buffer::new();
        buf.begin_write(false);
        req.write_to(&mut buf).unwrap();
        buf.end_write();

        assert_eq!(RequestId::read_from(&mut buf).unwrap(), req);
    }

    #[test]
    fn test_request_id_empty_blob() {
        let req = RequestId {
            version: 5,
            name: String::new(),
            data: Vec::new(),
        };

        let mut buf = Buffer::new();
        buf.begin_write(false);
        req.write_to(&mut buf).unwrap();
        buf.end_write();

        assert_eq!(RequestId::read_from(&mut buf).unwrap(), req);
    }

    #[test]
    fn test_response_id_roundtrip() {
        let resp = ResponseId {
            version: 5,
            id: 42,
            server_time: 1_700_000_000_000,
            start_time: 1_699_999_000_000,
        };

        let mut buf = Buffer::new();
        buf.begin_write(false);
        resp.write_to(&mut buf);
        buf.end_write();

        assert_eq!(ResponseId::read_from(&mut buf).unwrap(), resp);
    }

    #[test]
    fn test_response_ping_roundtrip() {
        let ping = ResponsePing {
            server_time: 123_456,
            peer_count: 7,
        };

        let mut buf = Buffer::new();
        buf.begin_write(false);
        ping.write_to(&mut buf);
        buf.end_write();

        assert_eq!(ResponsePing::read_from(&mut buf).unwrap(), ping);
    }

    #[test]
    fn test_truncated_response_id() {
        let mut buf = Buffer::new();
        buf.begin_write(false);
        buf.write_i32(5);
        buf.end_write();

        assert!(matches!(
            ResponseId::read_from(&mut buf),
            Err(ProtocolError::ReadPastEnd { .. })
        ));
    }
}
