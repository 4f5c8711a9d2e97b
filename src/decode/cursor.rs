//! Read window over the bytes received so far.
//!
//! A [`Cursor`] borrows the connection's input buffer and keeps a tentative
//! read position. Stages read through it; nothing is removed from the
//! underlying `BytesMut` until the decode loop commits the position, which
//! only happens on a `Transition` or `Produce` outcome. An `Incomplete`
//! outcome (or an error) leaves the buffer exactly as it was.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use stagewire::decode::Cursor;
//!
//! let mut buf = BytesMut::from(&[0x00, 0x2A, b'h', b'i'][..]);
//! let mut cursor = Cursor::new(&mut buf);
//!
//! assert_eq!(cursor.take_u16(), Some(42));
//! assert_eq!(cursor.take(2).as_deref(), Some(&b"hi"[..]));
//! assert_eq!(cursor.take_u8(), None);
//! assert_eq!(cursor.consumed(), 4);
//! ```

use bytes::{Buf, Bytes, BytesMut};

/// Tentative read window over an input buffer.
#[derive(Debug)]
pub struct Cursor<'a> {
    buf: &'a mut BytesMut,
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Create a cursor positioned at the start of `buf`.
    pub fn new(buf: &'a mut BytesMut) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes read so far through this cursor.
    #[inline]
    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// Bytes still available to read.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Unread bytes, without moving the position.
    #[inline]
    pub fn chunk(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Look at the next `n` bytes without consuming them.
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        if self.remaining() < n {
            return None;
        }
        Some(&self.buf[self.pos..self.pos + n])
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.peek(1).map(|b| b[0])
    }

    pub fn peek_u16(&self) -> Option<u16> {
        self.peek(2).map(|mut b| b.get_u16())
    }

    pub fn peek_u32(&self) -> Option<u32> {
        self.peek(4).map(|mut b| b.get_u32())
    }

    /// Consume `n` bytes, returning them as an owned `Bytes`.
    ///
    /// Returns `None` (and consumes nothing) if fewer than `n` bytes are
    /// available.
    pub fn take(&mut self, n: usize) -> Option<Bytes> {
        let bytes = Bytes::copy_from_slice(self.peek(n)?);
        self.pos += n;
        Some(bytes)
    }

    /// Consume `n` bytes without copying them out.
    pub fn skip(&mut self, n: usize) -> Option<()> {
        if self.remaining() < n {
            return None;
        }
        self.pos += n;
        Some(())
    }

    pub fn take_u8(&mut self) -> Option<u8> {
        let v = self.peek_u8()?;
        self.pos += 1;
        Some(v)
    }

    /// Consume a big-endian `u16`.
    pub fn take_u16(&mut self) -> Option<u16> {
        let v = self.peek_u16()?;
        self.pos += 2;
        Some(v)
    }

    /// Consume a big-endian `u32`.
    pub fn take_u32(&mut self) -> Option<u32> {
        let v = self.peek_u32()?;
        self.pos += 4;
        Some(v)
    }

    /// Find the first occurrence of `byte` in the unread window, relative to
    /// the current position.
    pub fn position_of(&self, byte: u8) -> Option<usize> {
        self.chunk().iter().position(|&b| b == byte)
    }

    /// Drop the committed bytes from the underlying buffer and return how
    /// many were removed.
    pub(crate) fn commit(self) -> usize {
        let n = self.pos;
        self.buf.advance(n);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peek_does_not_consume() {
        let mut buf = BytesMut::from(&b"abcd"[..]);
        let cursor = Cursor::new(&mut buf);

        assert_eq!(cursor.peek(2), Some(&b"ab"[..]));
        assert_eq!(cursor.peek(5), None);
        assert_eq!(cursor.consumed(), 0);
        assert_eq!(cursor.remaining(), 4);
    }

    #[test]
    fn test_big_endian_reads() {
        let mut buf = BytesMut::from(&[0x00, 0x00, 0x01, 0x02, 0xAB, 0xCD][..]);
        let mut cursor = Cursor::new(&mut buf);

        assert_eq!(cursor.peek_u32(), Some(0x0102));
        assert_eq!(cursor.take_u32(), Some(0x0102));
        assert_eq!(cursor.take_u16(), Some(0xABCD));
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_short_read_consumes_nothing() {
        let mut buf = BytesMut::from(&[0x01, 0x02, 0x03][..]);
        let mut cursor = Cursor::new(&mut buf);

        assert_eq!(cursor.take_u32(), None);
        assert_eq!(cursor.take(4), None);
        assert_eq!(cursor.skip(4), None);
        assert_eq!(cursor.consumed(), 0);
    }

    #[test]
    fn test_dropping_cursor_leaves_buffer_untouched() {
        let mut buf = BytesMut::from(&b"hello"[..]);
        {
            let mut cursor = Cursor::new(&mut buf);
            cursor.take(3).unwrap();
        }
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn test_commit_advances_buffer() {
        let mut buf = BytesMut::from(&b"hello"[..]);
        let mut cursor = Cursor::new(&mut buf);
        cursor.skip(2).unwrap();

        assert_eq!(cursor.commit(), 2);
        assert_eq!(&buf[..], b"llo");
    }

    #[test]
    fn test_position_of() {
        let mut buf = BytesMut::from(&b"ab\ncd"[..]);
        let mut cursor = Cursor::new(&mut buf);

        assert_eq!(cursor.position_of(b'\n'), Some(2));
        cursor.skip(3).unwrap();
        assert_eq!(cursor.position_of(b'\n'), None);
        assert_eq!(cursor.chunk(), b"cd");
    }
}
