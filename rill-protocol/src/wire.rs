//! Big-endian cursor helpers for message bodies.
//!
//! Strings carry an i16 length prefix, byte blobs an i32 length prefix;
//! a negative length means an empty value. Every read is bounds-checked
//! and truncation surfaces as an error, never a panic.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Checked reader over a message body region.
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            Err(ProtocolError::Truncated {
                needed: n - self.buf.remaining(),
            })
        } else {
            Ok(())
        }
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn i16(&mut self) -> Result<i16, ProtocolError> {
        self.need(2)?;
        Ok(self.buf.get_i16())
    }

    pub fn i32(&mut self) -> Result<i32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn i64(&mut self) -> Result<i64, ProtocolError> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn skip(&mut self, n: usize) -> Result<(), ProtocolError> {
        self.need(n)?;
        self.buf.advance(n);
        Ok(())
    }

    /// Reads an i32-length-prefixed byte blob. Negative length means empty.
    pub fn bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let size = self.i32()?;
        if size < 0 {
            return Ok(Bytes::new());
        }
        let size = size as usize;
        self.need(size)?;
        Ok(self.buf.split_to(size))
    }

    /// Reads an i16-length-prefixed UTF-8 string. Negative length means empty.
    pub fn string(&mut self) -> Result<String, ProtocolError> {
        let size = self.i16()?;
        if size < 0 {
            return Ok(String::new());
        }
        let size = size as usize;
        self.need(size)?;
        let raw = self.buf.split_to(size);
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Reads an i32 array length. Negative counts collapse to zero.
    pub fn array_size(&mut self) -> Result<usize, ProtocolError> {
        let size = self.i32()?;
        Ok(size.max(0) as usize)
    }

    /// Borrows `len` bytes at the cursor without consuming them.
    pub fn peek_slice(&self, len: usize) -> Result<&[u8], ProtocolError> {
        self.need(len)?;
        Ok(&self.buf[..len])
    }

    /// First byte at the cursor, unconsumed.
    pub fn peek_u8(&self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.buf[0])
    }
}

/// Mirror-image writer for message bodies.
#[derive(Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn u8(&mut self, n: u8) {
        self.buf.put_u8(n);
    }

    pub fn u16(&mut self, n: u16) {
        self.buf.put_u16(n);
    }

    pub fn u32(&mut self, n: u32) {
        self.buf.put_u32(n);
    }

    pub fn u64(&mut self, n: u64) {
        self.buf.put_u64(n);
    }

    pub fn i16(&mut self, n: i16) {
        self.buf.put_i16(n);
    }

    pub fn i32(&mut self, n: i32) {
        self.buf.put_i32(n);
    }

    pub fn i64(&mut self, n: i64) {
        self.buf.put_i64(n);
    }

    pub fn bytes(&mut self, data: &[u8]) {
        self.buf.put_i32(data.len() as i32);
        self.buf.put_slice(data);
    }

    /// Appends raw bytes with no length prefix.
    pub fn raw(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    pub fn string(&mut self, s: &str) {
        self.buf.put_i16(s.len() as i16);
        self.buf.put_slice(s.as_bytes());
    }

    pub fn array_size(&mut self, n: usize) {
        self.buf.put_i32(n as i32);
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_roundtrip() {
        let mut w = WireWriter::new();
        w.u8(0xab);
        w.u16(0x1234);
        w.u32(0xdead_beef);
        w.u64(0x0102_0304_0506_0708);
        w.i64(-42);

        let mut r = WireReader::new(w.into_bytes());
        assert_eq!(r.u8().unwrap(), 0xab);
        assert_eq!(r.u16().unwrap(), 0x1234);
        assert_eq!(r.u32().unwrap(), 0xdead_beef);
        assert_eq!(r.u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(r.i64().unwrap(), -42);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn string_and_bytes_roundtrip() {
        let mut w = WireWriter::new();
        w.string("test-stream");
        w.bytes(b"payload");

        let mut r = WireReader::new(w.into_bytes());
        assert_eq!(r.string().unwrap(), "test-stream");
        assert_eq!(r.bytes().unwrap().as_ref(), b"payload");
    }

    #[test]
    fn negative_lengths_mean_empty() {
        let mut w = WireWriter::new();
        w.i16(-1);
        w.i32(-1);

        let mut r = WireReader::new(w.into_bytes());
        assert_eq!(r.string().unwrap(), "");
        assert!(r.bytes().unwrap().is_empty());
    }

    #[test]
    fn truncation_is_an_error() {
        let mut r = WireReader::new(Bytes::from_static(&[0x00, 0x01]));
        assert!(matches!(r.u32(), Err(ProtocolError::Truncated { .. })));

        // Declared string length past the end of the buffer.
        let mut w = WireWriter::new();
        w.i16(10);
        w.u8(b'x');
        let mut r = WireReader::new(w.into_bytes());
        assert!(matches!(r.string(), Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn peek_does_not_consume() {
        let mut r = WireReader::new(Bytes::from_static(b"abcd"));
        assert_eq!(r.peek_u8().unwrap(), b'a');
        assert_eq!(r.peek_slice(4).unwrap(), b"abcd");
        assert_eq!(r.u8().unwrap(), b'a');
    }
}
