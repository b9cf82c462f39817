//! Bounds-checked read and write views over protocol bytes.
//!
//! `bytes::Buf` getters panic when the buffer runs short; every accessor here
//! returns `BufferExhausted` / `BufferOverflow` instead so that a malformed
//! message from the server fails the read instead of the process.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PgError, PgResult};

// ============================================================================
// Read Buffer
// ============================================================================

/// A read cursor over an immutable message body.
#[derive(Debug, Clone)]
pub struct ReadBuffer {
    buf: Bytes,
}

impl ReadBuffer {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    fn ensure(&self, needed: usize) -> PgResult<()> {
        if self.buf.remaining() < needed {
            return Err(PgError::BufferExhausted {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> PgResult<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_i16(&mut self) -> PgResult<i16> {
        self.ensure(2)?;
        Ok(self.buf.get_i16())
    }

    pub fn read_i32(&mut self) -> PgResult<i32> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn read_i64(&mut self) -> PgResult<i64> {
        self.ensure(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn read_f64(&mut self) -> PgResult<f64> {
        self.ensure(8)?;
        Ok(self.buf.get_f64())
    }

    /// Read exactly `n` bytes without copying.
    pub fn read_exact(&mut self, n: usize) -> PgResult<Bytes> {
        self.ensure(n)?;
        Ok(self.buf.split_to(n))
    }

    /// Take everything that is left.
    pub fn read_rest(&mut self) -> Bytes {
        self.buf.split_off(0)
    }

    /// Read a null-terminated string.
    /// Tries direct UTF-8 first, falls back to lossy only if invalid.
    /// Running out of input before the terminator is `BufferExhausted`.
    pub fn read_cstring(&mut self) -> PgResult<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or(PgError::BufferExhausted {
                needed: self.buf.len() + 1,
                remaining: self.buf.len(),
            })?;

        let s = std::str::from_utf8(&self.buf[..end])
            .map(|s| s.to_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&self.buf[..end]).into_owned());

        self.buf.advance(end + 1);
        Ok(s)
    }
}

// ============================================================================
// Write Buffer
// ============================================================================

/// A growable or fixed-capacity sink for outgoing messages.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    buf: BytesMut,
    limit: Option<usize>,
}

impl WriteBuffer {
    /// An unbounded buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer that refuses writes past `capacity` bytes.
    pub fn with_limit(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            limit: Some(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Drop everything written after the first `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Take the written bytes, leaving the buffer empty.
    pub fn split(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    #[inline]
    fn reserve(&mut self, n: usize) -> PgResult<()> {
        if let Some(capacity) = self.limit {
            if self.buf.len() + n > capacity {
                return Err(PgError::BufferOverflow {
                    requested: n,
                    capacity,
                });
            }
        }
        Ok(())
    }

    pub fn write_u8(&mut self, v: u8) -> PgResult<()> {
        self.reserve(1)?;
        self.buf.put_u8(v);
        Ok(())
    }

    pub fn write_i16(&mut self, v: i16) -> PgResult<()> {
        self.reserve(2)?;
        self.buf.put_i16(v);
        Ok(())
    }

    pub fn write_i32(&mut self, v: i32) -> PgResult<()> {
        self.reserve(4)?;
        self.buf.put_i32(v);
        Ok(())
    }

    pub fn write_i64(&mut self, v: i64) -> PgResult<()> {
        self.reserve(8)?;
        self.buf.put_i64(v);
        Ok(())
    }

    pub fn write_f64(&mut self, v: f64) -> PgResult<()> {
        self.reserve(8)?;
        self.buf.put_f64(v);
        Ok(())
    }

    pub fn write_bytes(&mut self, v: &[u8]) -> PgResult<()> {
        self.reserve(v.len())?;
        self.buf.put_slice(v);
        Ok(())
    }

    /// Write a string followed by a null terminator.
    pub fn write_cstring(&mut self, v: &str) -> PgResult<()> {
        if v.as_bytes().contains(&0) {
            return Err(PgError::Usage(
                "strings sent to the server cannot contain NUL bytes".to_string(),
            ));
        }
        self.reserve(v.len() + 1)?;
        self.buf.put_slice(v.as_bytes());
        self.buf.put_u8(0);
        Ok(())
    }

    /// Reserve a 4-byte length, run `f`, then back-patch the length.
    ///
    /// The length counts itself and everything `f` wrote, which is the
    /// PostgreSQL convention (the tag byte in front is not counted).
    pub fn write_length_prefixed<F>(&mut self, f: F) -> PgResult<()>
    where
        F: FnOnce(&mut Self) -> PgResult<()>,
    {
        let start = self.buf.len();
        self.write_i32(0)?;
        f(self)?;
        let len = i32::try_from(self.buf.len() - start)
            .map_err(|_| PgError::Usage("message exceeds the protocol size limit".to_string()))?;
        self.buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_past_end_is_exhausted() {
        let mut buf = ReadBuffer::new(Bytes::from_static(&[0, 1, 2]));
        assert_eq!(buf.read_i16().unwrap(), 1);
        match buf.read_i32() {
            Err(PgError::BufferExhausted { needed, remaining }) => {
                assert_eq!(needed, 4);
                assert_eq!(remaining, 1);
            }
            other => panic!("expected BufferExhausted, got {other:?}"),
        }
        // A failed read consumes nothing
        assert_eq!(buf.read_u8().unwrap(), 2);
    }

    #[test]
    fn test_read_cstring() {
        let mut buf = ReadBuffer::new(Bytes::from_static(b"user\0postgres\0"));
        assert_eq!(buf.read_cstring().unwrap(), "user");
        assert_eq!(buf.read_cstring().unwrap(), "postgres");
        assert!(buf.is_empty());

        let mut unterminated = ReadBuffer::new(Bytes::from_static(b"abc"));
        assert!(matches!(
            unterminated.read_cstring(),
            Err(PgError::BufferExhausted { needed: 4, remaining: 3 })
        ));
        assert_eq!(unterminated.remaining(), 3);
    }

    #[test]
    fn test_length_prefix_backpatch() {
        let mut buf = WriteBuffer::new();
        buf.write_u8(b'Q').unwrap();
        buf.write_length_prefixed(|b| b.write_cstring("SELECT 1"))
            .unwrap();

        let bytes = buf.as_slice();
        assert_eq!(bytes[0], b'Q');
        let len = i32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        assert_eq!(len, 13);
        assert_eq!(bytes.len(), 14);
    }

    #[test]
    fn test_fixed_capacity_overflow() {
        let mut buf = WriteBuffer::with_limit(6);
        buf.write_i32(7).unwrap();
        assert!(matches!(
            buf.write_i32(8),
            Err(PgError::BufferOverflow { requested: 4, capacity: 6 })
        ));
        buf.write_i16(9).unwrap();
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn test_cstring_rejects_nul() {
        let mut buf = WriteBuffer::new();
        assert!(matches!(buf.write_cstring("a\0b"), Err(PgError::Usage(_))));
    }
}
