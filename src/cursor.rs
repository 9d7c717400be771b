//! Bounds-checked byte cursor used by every wire-format reader/writer in
//! [`crate::frame`].
//!
//! Every read advances the cursor and returns either the decoded value or a
//! [`FramingError`], never panics on a short buffer. See DESIGN NOTES on
//! replacing raw pointer arithmetic with explicit cursor reads.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FramingError;

/// A read cursor over a byte slice.
pub struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    /// Wraps a byte slice for bounds-checked reading.
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes left unread.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn require(&self, need: usize) -> Result<(), FramingError> {
        let len = self.buf.remaining();
        if len < need {
            Err(FramingError::TooShort { len, need })
        } else {
            Ok(())
        }
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> Result<u8, FramingError> {
        self.require(1)?;
        Ok(self.buf.get_u8())
    }

    /// Reads a big-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16, FramingError> {
        self.require(2)?;
        Ok(self.buf.get_u16())
    }

    /// Reads a big-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, FramingError> {
        self.require(4)?;
        Ok(self.buf.get_u32())
    }

    /// Reads exactly `n` bytes, returning a zero-copy slice.
    pub fn read_slice(&mut self, n: usize) -> Result<&'a [u8], FramingError> {
        self.require(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// Reads exactly `n` bytes, returning an owned [`Bytes`].
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes, FramingError> {
        self.read_slice(n).map(|s| Bytes::copy_from_slice(s))
    }

    /// Consumes and returns whatever is left.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }
}

/// A write cursor over a growable buffer.
#[derive(Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty writer with reserved capacity.
    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(cap),
        }
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Writes a single byte.
    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    /// Writes a big-endian `u16`.
    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    /// Writes a big-endian `u32`.
    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    /// Writes a raw byte slice.
    pub fn write_slice(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    /// Finalizes the buffer into immutable [`Bytes`].
    #[must_use]
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    /// Returns the written bytes without consuming the writer.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let mut w = Writer::new();
        w.write_u8(0xAB);
        w.write_u16(0x1234);
        w.write_u32(0xDEAD_BEEF);
        w.write_slice(b"hi");
        let bytes = w.freeze();

        let mut c = Cursor::new(&bytes);
        assert_eq!(c.read_u8().unwrap(), 0xAB);
        assert_eq!(c.read_u16().unwrap(), 0x1234);
        assert_eq!(c.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(c.read_slice(2).unwrap(), b"hi");
        assert_eq!(c.remaining(), 0);
    }

    #[test]
    fn short_read_errors() {
        let data = [0u8; 1];
        let mut c = Cursor::new(&data);
        assert!(matches!(
            c.read_u32(),
            Err(FramingError::TooShort { len: 1, need: 4 })
        ));
    }
}
