//! Stream reassembly.
//!
//! TCP delivers bytes, not packets: a packet may arrive split across N
//! reads, several packets may arrive in one read, or both at once. The
//! [`Reassembler`] accumulates raw chunks and slices completed packets back
//! out, retaining partial state across calls.

use crate::buffer::{BufferPool, PooledBuffer};
use crate::error::ProtocolError;
use crate::opcode::Opcode;
use crate::{HTTP_GET_SENTINEL, LENGTH_PREFIX_SIZE, MAX_PACKET_SIZE};
use bytes::{Buf, BytesMut};

/// Longest HTTP request line accepted before the terminating newline.
///
/// An HTTP stream carries no length prefix, so this is its own ceiling:
/// accumulation past it is treated like any other oversized input and fails
/// the connection.
pub const MAX_HTTP_LINE: usize = 8 * 1024;

/// One item recovered from the stream.
#[derive(Debug)]
pub enum Reassembled {
    /// A complete protocol packet: opcode byte plus payload, read cursor
    /// at the opcode.
    Packet(PooledBuffer),
    /// The synthetic packet emitted when a fresh stream turns out to be a
    /// plain HTTP client: opcode [`Opcode::HttpGet`] plus the raw request
    /// line.
    HttpRequest(PooledBuffer),
}

/// Converts raw socket bytes into zero or more complete packets.
///
/// Each call to [`Reassembler::next`] yields at most one item; callers loop
/// until it returns `Ok(None)`. Any error is a protocol violation and fatal
/// to the connection.
pub struct Reassembler {
    acc: BytesMut,
    /// Cached declared length of the next packet, once its prefix arrived.
    expected: Option<usize>,
    /// First four bytes of the stream already classified.
    started: bool,
    http_enabled: bool,
    /// Stream turned out to be an HTTP client.
    http: bool,
    http_emitted: bool,
}

impl Reassembler {
    pub fn new(http_enabled: bool) -> Self {
        Self {
            acc: BytesMut::with_capacity(8192),
            expected: None,
            started: false,
            http_enabled,
            http: false,
            http_emitted: false,
        }
    }

    /// Appends freshly received bytes to the accumulation buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.acc.extend_from_slice(data);
    }

    /// Bytes accumulated but not yet sliced into packets.
    pub fn buffered(&self) -> usize {
        self.acc.len()
    }

    /// Whether the stream was recognized as an HTTP client.
    pub fn is_http(&self) -> bool {
        self.http
    }

    /// Attempts to slice the next complete packet out of the accumulated
    /// bytes, acquiring the output buffer from `pool`.
    pub fn next(&mut self, pool: &BufferPool) -> Result<Option<Reassembled>, ProtocolError> {
        if self.http {
            return self.next_http(pool);
        }

        if !self.started {
            if self.acc.len() < LENGTH_PREFIX_SIZE {
                return Ok(None);
            }
            let head = i32::from_le_bytes([self.acc[0], self.acc[1], self.acc[2], self.acc[3]]);
            if head == HTTP_GET_SENTINEL {
                if !self.http_enabled {
                    return Err(ProtocolError::HttpRejected);
                }
                tracing::debug!("stream opens with an HTTP request line");
                self.http = true;
                return self.next_http(pool);
            }
            self.started = true;
        }

        if self.acc.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let expected = match self.expected {
            Some(n) => n,
            None => {
                let declared = i32::from_le_bytes([
                    self.acc[0],
                    self.acc[1],
                    self.acc[2],
                    self.acc[3],
                ]);
                if declared < 1 {
                    return Err(ProtocolError::InvalidLength(declared));
                }
                let declared = declared as usize;
                if declared > MAX_PACKET_SIZE {
                    return Err(ProtocolError::PacketTooLarge {
                        size: declared,
                        max: MAX_PACKET_SIZE,
                    });
                }
                self.expected = Some(declared);
                declared
            }
        };

        if self.acc.len() - LENGTH_PREFIX_SIZE < expected {
            // Partial packet: wait for the next receive completion.
            return Ok(None);
        }

        self.acc.advance(LENGTH_PREFIX_SIZE);
        let body = self.acc.split_to(expected);
        self.expected = None;

        let handle = pool.acquire();
        {
            let mut buf = handle.lock();
            buf.begin_write(false);
            buf.write_bytes(&body);
            buf.end_write();
        }
        Ok(Some(Reassembled::Packet(handle)))
    }

    /// Once a stream is classified as HTTP, exactly one synthetic packet is
    /// produced (the request line); everything after is swallowed. A line
    /// that never terminates is cut off at [`MAX_HTTP_LINE`] so the
    /// accumulation buffer stays bounded.
    fn next_http(&mut self, pool: &BufferPool) -> Result<Option<Reassembled>, ProtocolError> {
        if self.http_emitted {
            self.acc.clear();
            return Ok(None);
        }
        let newline = match self.acc.iter().position(|&b| b == b'\n') {
            Some(n) => n,
            None => {
                if self.acc.len() > MAX_HTTP_LINE {
                    return Err(ProtocolError::HttpLineTooLong(self.acc.len()));
                }
                return Ok(None);
            }
        };
        if newline > MAX_HTTP_LINE {
            return Err(ProtocolError::HttpLineTooLong(newline));
        }
        let mut line = self.acc.split_to(newline + 1);
        while line.last() == Some(&b'\r') || line.last() == Some(&b'\n') {
            line.truncate(line.len() - 1);
        }
        self.http_emitted = true;
        self.acc.clear();

        let handle = pool.acquire();
        {
            let mut buf = handle.lock();
            buf.begin_write(false);
            buf.write_u8(Opcode::HttpGet as u8);
            buf.write_bytes(&line);
            buf.end_write();
        }
        Ok(Some(Reassembled::HttpRequest(handle)))
    }
}
