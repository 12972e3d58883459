//! Pooled binary buffers.
//!
//! A [`Buffer`] is the unit of I/O for every send and receive: a growable
//! byte region with a single cursor that is either in write mode (the cursor
//! tracks where the next byte lands) or read mode (`size` is fixed and the
//! cursor walks from 0 towards it). Buffers are checked out of a
//! [`BufferPool`] as refcounted [`PooledBuffer`] handles and recycled when
//! the last reference is released.

use crate::error::ProtocolError;
use crate::{LENGTH_PREFIX_SIZE, MAX_PACKET_SIZE};
use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Default number of recycled buffers a pool retains.
pub const DEFAULT_MAX_POOLED: usize = 64;

/// Backing storage above this capacity is discarded on recycle instead of
/// being kept around, bounding worst-case pool memory.
pub const LARGE_RECYCLE_CAPACITY: usize = 1024 * 1024;

/// A dual-mode binary buffer.
///
/// Invariant: in read mode `0 <= position <= size`; in write mode `size` is
/// unspecified until [`Buffer::end_write`] or [`Buffer::end_packet`]
/// finalizes it.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    position: usize,
    size: usize,
    writing: bool,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of valid payload (distinct from capacity).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current cursor offset.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Capacity of the backing storage.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn is_writing(&self) -> bool {
        self.writing
    }

    /// Unread bytes left in read mode.
    pub fn remaining(&self) -> usize {
        self.size.saturating_sub(self.position)
    }

    /// The finalized frame, length prefix included if one was written.
    pub fn framed(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// Switches to write mode, either from scratch or appending at the
    /// current end of payload.
    pub fn begin_write(&mut self, append: bool) {
        if append {
            self.data.truncate(self.size);
            self.position = self.size;
        } else {
            self.data.clear();
            self.position = 0;
        }
        self.writing = true;
    }

    /// Finalizes write mode: fixes `size`, rewinds to 0, switches to read
    /// mode. Returns the payload size.
    pub fn end_write(&mut self) -> usize {
        self.size = self.position;
        self.position = 0;
        self.writing = false;
        self.size
    }

    /// Starts a framed packet: reserves the 4-byte length prefix, then
    /// writes the opcode byte.
    pub fn begin_packet(&mut self, opcode: u8) {
        self.begin_write(false);
        self.write_bytes(&[0u8; LENGTH_PREFIX_SIZE]);
        self.write_u8(opcode);
    }

    /// Finalizes a framed packet: patches `size - 4` into the length prefix
    /// (little-endian, fixed width -- the patch happens after the fact at a
    /// known offset) and rewinds for transmission.
    pub fn end_packet(&mut self) -> Result<usize, ProtocolError> {
        if !self.writing || self.position < LENGTH_PREFIX_SIZE + 1 {
            return Err(ProtocolError::WrongMode);
        }
        let total = self.end_write();
        let len = total - LENGTH_PREFIX_SIZE;
        if len > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                size: len,
                max: MAX_PACKET_SIZE,
            });
        }
        self.data[..LENGTH_PREFIX_SIZE].copy_from_slice(&(len as i32).to_le_bytes());
        Ok(total)
    }

    pub fn write_u8(&mut self, v: u8) {
        debug_assert!(self.writing, "write on a buffer in read mode");
        self.data.push(v);
        self.position += 1;
    }

    pub fn write_u16(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.writing, "write on a buffer in read mode");
        self.data.extend_from_slice(bytes);
        self.position += bytes.len();
    }

    /// Writes a u16-length-prefixed UTF-8 string.
    pub fn write_str(&mut self, s: &str) -> Result<(), ProtocolError> {
        if s.len() > u16::MAX as usize {
            return Err(ProtocolError::StringTooLong(s.len()));
        }
        self.write_u16(s.len() as u16);
        self.write_bytes(s.as_bytes());
        Ok(())
    }

    fn take(&mut self, needed: usize) -> Result<&[u8], ProtocolError> {
        if self.writing {
            return Err(ProtocolError::WrongMode);
        }
        if self.position + needed > self.size {
            return Err(ProtocolError::ReadPastEnd {
                needed,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.position..self.position + needed];
        self.position += needed;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_le_bytes(raw))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&[u8], ProtocolError> {
        self.take(n)
    }

    /// Reads everything left between the cursor and `size`.
    pub fn read_remaining(&mut self) -> Result<&[u8], ProtocolError> {
        self.take(self.remaining())
    }

    /// Reads a u16-length-prefixed UTF-8 string.
    pub fn read_str(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Inspects the byte at the cursor without advancing it.
    pub fn peek_u8(&self) -> Result<u8, ProtocolError> {
        self.peek(1).map(|b| b[0])
    }

    /// Inspects the next four bytes as a little-endian i32 without advancing
    /// the cursor. Used by the reassembler to read a length prefix before
    /// deciding whether the full packet has arrived.
    pub fn peek_i32(&self) -> Result<i32, ProtocolError> {
        let b = self.peek(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn peek(&self, needed: usize) -> Result<&[u8], ProtocolError> {
        if self.writing {
            return Err(ProtocolError::WrongMode);
        }
        if self.position + needed > self.size {
            return Err(ProtocolError::ReadPastEnd {
                needed,
                available: self.remaining(),
            });
        }
        Ok(&self.data[self.position..self.position + needed])
    }

    /// Logically empties the buffer. Backing storage is retained.
    pub fn clear(&mut self) {
        self.data.clear();
        self.position = 0;
        self.size = 0;
        self.writing = false;
    }
}

struct PoolShared {
    free: Mutex<Vec<Buffer>>,
    max_pooled: usize,
    outstanding: AtomicUsize,
    acquired_total: AtomicU64,
    recycled_total: AtomicU64,
}

impl PoolShared {
    fn recycle(&self, mut buf: Buffer) {
        buf.clear();
        if buf.capacity() > LARGE_RECYCLE_CAPACITY {
            // Replace unusually large backing storage to bound pool memory.
            buf = Buffer::new();
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        self.recycled_total.fetch_add(1, Ordering::Relaxed);
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }
}

/// A process-scoped (but dependency-injected, never global) pool of
/// recyclable buffers.
///
/// Cloning the pool is cheap and yields another handle to the same free
/// list. The free list lock is coarse and short: enqueue/dequeue only, no
/// I/O ever happens while holding it.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_POOLED)
    }

    /// Creates a pool retaining at most `max_pooled` recycled buffers;
    /// excess buffers are dropped on release instead.
    pub fn with_capacity(max_pooled: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(Vec::new()),
                max_pooled,
                outstanding: AtomicUsize::new(0),
                acquired_total: AtomicU64::new(0),
                recycled_total: AtomicU64::new(0),
            }),
        }
    }

    /// Checks a buffer out of the pool (or allocates a fresh one) with its
    /// refcount initialized to 1. Every acquire must be balanced by exactly
    /// one [`PooledBuffer::release`] per handle.
    pub fn acquire(&self) -> PooledBuffer {
        let buf = self.shared.free.lock().pop().unwrap_or_default();
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        self.shared.acquired_total.fetch_add(1, Ordering::Relaxed);
        PooledBuffer {
            inner: Arc::new(PooledInner {
                pool: Arc::downgrade(&self.shared),
                refs: AtomicU32::new(1),
                buf: Mutex::new(buf),
            }),
        }
    }

    /// Buffers currently sitting in the free list.
    pub fn pooled(&self) -> usize {
        self.shared.free.lock().len()
    }

    /// Buffers checked out and not yet fully released. Zero when every
    /// acquire has been balanced -- the leak-detection hook for tests.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    pub fn acquired_total(&self) -> u64 {
        self.shared.acquired_total.load(Ordering::Relaxed)
    }

    pub fn recycled_total(&self) -> u64 {
        self.shared.recycled_total.load(Ordering::Relaxed)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

struct PooledInner {
    pool: Weak<PoolShared>,
    refs: AtomicU32,
    buf: Mutex<Buffer>,
}

impl Drop for PooledInner {
    fn drop(&mut self) {
        // All handles gone without the refcount reaching zero: a caller bug,
        // not a network condition.
        let refs = self.refs.load(Ordering::Acquire);
        if refs != 0 {
            tracing::warn!(refs, "pooled buffer leaked without release");
            if let Some(pool) = self.pool.upgrade() {
                pool.recycle(std::mem::take(&mut *self.buf.lock()));
            }
        }
    }
}

/// Refcounted handle to a pooled [`Buffer`].
///
/// Multiple logical holders (e.g. one physical packet queued to several
/// connections during a broadcast) are expressed purely through
/// [`PooledBuffer::retain`]; the interior lock only arbitrates short,
/// non-overlapping accesses, never concurrent writers.
pub struct PooledBuffer {
    inner: Arc<PooledInner>,
}

impl PooledBuffer {
    /// Locks the underlying buffer for reading or writing. Locks are held
    /// briefly; never across I/O.
    pub fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.inner.buf.lock()
    }

    /// Increments the refcount and returns another handle to the same
    /// physical buffer.
    pub fn retain(&self) -> PooledBuffer {
        self.inner.refs.fetch_add(1, Ordering::AcqRel);
        PooledBuffer {
            inner: self.inner.clone(),
        }
    }

    /// Decrements the refcount; at zero the buffer is cleared and returned
    /// to its pool.
    pub fn release(self) {
        let prev = self.inner.refs.fetch_sub(1, Ordering::AcqRel);
        match prev {
            0 => {
                // Already fully released: a developer error, not fatal.
                self.inner.refs.fetch_add(1, Ordering::AcqRel);
                tracing::warn!("release of an already-recycled buffer");
            }
            1 => {
                if let Some(pool) = self.inner.pool.upgrade() {
                    pool.recycle(std::mem::take(&mut *self.inner.buf.lock()));
                }
            }
            _ => {}
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.inner.refs.load(Ordering::Acquire)
    }

    /// Copies the finalized frame out for transmission, so no lock is held
    /// across the socket write.
    pub fn frame_bytes(&self) -> Bytes {
        let guard = self.inner.buf.lock();
        Bytes::copy_from_slice(guard.framed())
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.inner.buf.lock();
        f.debug_struct("PooledBuffer")
            .field("refs", &self.ref_count())
            .field("size", &guard.size())
            .field("position", &guard.position())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;

    #[test]
    fn test_packet_write_patches_length() {
        let mut buf = Buffer::new();
        buf.begin_packet(Opcode::Error as u8);
        buf.write_bytes(b"hello");
        let total = buf.end_packet().unwrap();

        assert_eq!(total, 4 + 1 + 5);
        assert_eq!(buf.position(), 0);
        assert!(!buf.is_writing());

        // Length counts the opcode byte but not the prefix itself.
        assert_eq!(buf.peek_i32().unwrap(), 6);
        let framed = buf.framed();
        assert_eq!(framed[4], Opcode::Error as u8);
        assert_eq!(&framed[5..], b"hello");
    }

    #[test]
    fn test_end_packet_without_begin() {
        let mut buf = Buffer::new();
        assert!(matches!(buf.end_packet(), Err(ProtocolError::WrongMode)));
    }

    #[test]
    fn test_typed_roundtrip() {
        let mut buf = Buffer::new();
        buf.begin_write(false);
        buf.write_u8(7);
        buf.write_u16(512);
        buf.write_i32(-42);
        buf.write_i64(1 << 40);
        buf.write_str("Guest").unwrap();
        buf.write_bytes(&[1, 2, 3]);
        buf.end_write();

        assert_eq!(buf.read_u8().unwrap(), 7);
        assert_eq!(buf.read_u16().unwrap(), 512);
        assert_eq!(buf.read_i32().unwrap(), -42);
        assert_eq!(buf.read_i64().unwrap(), 1 << 40);
        assert_eq!(buf.read_str().unwrap(), "Guest");
        assert_eq!(buf.read_remaining().unwrap(), &[1, 2, 3]);
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    fn test_peek_does_not_advance() {
        let mut buf = Buffer::new();
        buf.begin_write(false);
        buf.write_i32(1234);
        buf.end_write();

        assert_eq!(buf.peek_i32().unwrap(), 1234);
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.peek_u8().unwrap(), 1234i32.to_le_bytes()[0]);
        assert_eq!(buf.read_i32().unwrap(), 1234);
    }

    #[test]
    fn test_append_mode() {
        let mut buf = Buffer::new();
        buf.begin_write(false);
        buf.write_bytes(b"abc");
        buf.end_write();

        buf.begin_write(true);
        buf.write_bytes(b"def");
        buf.end_write();

        assert_eq!(buf.read_remaining().unwrap(), b"abcdef");
    }

    #[test]
    fn test_read_past_end() {
        let mut buf = Buffer::new();
        buf.begin_write(false);
        buf.write_u8(1);
        buf.end_write();

        buf.read_u8().unwrap();
        assert!(matches!(
            buf.read_i32(),
            Err(ProtocolError::ReadPastEnd { needed: 4, .. })
        ));
    }

    #[test]
    fn test_read_in_write_mode() {
        let mut buf = Buffer::new();
        buf.begin_write(false);
        buf.write_u8(1);
        assert!(matches!(buf.read_u8(), Err(ProtocolError::WrongMode)));
    }

    #[test]
    fn test_string_too_long() {
        let mut buf = Buffer::new();
        buf.begin_write(false);
        let long = "x".repeat(70_000);
        assert!(matches!(
            buf.write_str(&long),
            Err(ProtocolError::StringTooLong(70_000))
        ));
    }

    #[test]
    fn test_pool_recycles_cleared() {
        let pool = BufferPool::new();
        let handle = pool.acquire();
        {
            let mut buf = handle.lock();
            buf.begin_write(false);
            buf.write_bytes(b"residual data");
            buf.end_write();
        }
        assert_eq!(pool.outstanding(), 1);
        handle.release();
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.pooled(), 1);

        // The same object may come back, but no residual data is visible.
        let handle = pool.acquire();
        let buf = handle.lock();
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.position(), 0);
        drop(buf);
        handle.release();
    }

    #[test]
    fn test_retain_release_refcount() {
        let pool = BufferPool::new();
        let a = pool.acquire();
        let b = a.retain();
        assert_eq!(a.ref_count(), 2);

        a.release();
        // Still held by b: nothing recycled yet.
        assert_eq!(pool.pooled(), 0);
        assert_eq!(b.ref_count(), 1);

        b.release();
        assert_eq!(pool.pooled(), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_pool_capacity_bound() {
        let pool = BufferPool::with_capacity(1);
        let a = pool.acquire();
        let b = pool.acquire();
        a.release();
        b.release();
        // The second release overflows the free list and is dropped.
        assert_eq!(pool.pooled(), 1);
        assert_eq!(pool.recycled_total(), 2);
    }

    #[test]
    fn test_large_backing_dropped_on_recycle() {
        let pool = BufferPool::new();
        let handle = pool.acquire();
        {
            let mut buf = handle.lock();
            buf.begin_write(false);
            buf.write_bytes(&vec![0u8; LARGE_RECYCLE_CAPACITY + 1]);
            buf.end_write();
        }
        handle.release();

        let handle = pool.acquire();
        assert!(handle.lock().capacity() <= LARGE_RECYCLE_CAPACITY);
        handle.release();
    }

    #[test]
    fn test_frame_bytes_copies_frame() {
        let pool = BufferPool::new();
        let handle = pool.acquire();
        {
            let mut buf = handle.lock();
            buf.begin_packet(Opcode::Empty as u8);
            buf.end_packet().unwrap();
        }
        let bytes = handle.frame_bytes();
        assert_eq!(&bytes[..], &[1, 0, 0, 0, Opcode::Empty as u8]);
        handle.release();
    }
}
