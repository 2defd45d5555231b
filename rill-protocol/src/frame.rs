//! Frame envelope and incremental stream framer.
//!
//! Frame layout (all big-endian):
//!
//! ```text
//! +---------+--------+----------+------------+---------+
//! | size    | key    | version  | [corrId]   | body    |
//! | 4 bytes | 2 bytes| 2 bytes  | 4 bytes    | ...     |
//! +---------+--------+----------+------------+---------+
//! ```
//!
//! `size` counts everything after itself. The top bit of `key` marks a
//! response; the correlation id is present only on requests and responses
//! and is treated as part of the payload here.

use crate::command::Command;
use crate::error::ProtocolError;
use crate::wire::WireWriter;
use crate::RESPONSE_FLAG;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Smallest valid declared frame size: key + version.
const MIN_FRAME_SIZE: usize = 4;

/// One decoded frame. `payload` is everything after the version word,
/// including the correlation id when the command carries one.
#[derive(Debug, Clone)]
pub struct Frame {
    pub key: u16,
    pub version: u16,
    pub payload: Bytes,
}

impl Frame {
    /// Key with the response bit stripped.
    pub fn command_key(&self) -> u16 {
        self.key & !RESPONSE_FLAG
    }

    pub fn is_response(&self) -> bool {
        self.key & RESPONSE_FLAG != 0
    }
}

fn finish(key: u16, version: u16, head: impl FnOnce(&mut WireWriter), body: WireWriter) -> Bytes {
    let mut w = WireWriter::new();
    w.u16(key);
    w.u16(version);
    head(&mut w);
    let head_bytes = w.into_bytes();
    let body_bytes = body.into_bytes();

    let size = head_bytes.len() + body_bytes.len();
    let mut out = BytesMut::with_capacity(4 + size);
    out.put_u32(size as u32);
    out.put_slice(&head_bytes);
    out.put_slice(&body_bytes);
    out.freeze()
}

/// Encodes an uncorrelated command frame.
pub fn command_frame(cmd: Command, version: u16, build: impl FnOnce(&mut WireWriter)) -> Bytes {
    let mut body = WireWriter::new();
    build(&mut body);
    finish(cmd.key(), version, |_| {}, body)
}

/// Encodes a correlated request frame.
pub fn request_frame(
    cmd: Command,
    version: u16,
    corr_id: u32,
    build: impl FnOnce(&mut WireWriter),
) -> Bytes {
    let mut body = WireWriter::new();
    build(&mut body);
    finish(cmd.key(), version, |w| w.u32(corr_id), body)
}

/// Encodes a client response to a server-initiated request, carrying the
/// server's correlation id and a status code.
pub fn response_frame(
    cmd: Command,
    version: u16,
    corr_id: u32,
    code: u16,
    build: impl FnOnce(&mut WireWriter),
) -> Bytes {
    let mut body = WireWriter::new();
    build(&mut body);
    finish(
        cmd.response_key(),
        version,
        |w| {
            w.u32(corr_id);
            w.u16(code);
        },
        body,
    )
}

/// Incremental framer over an arbitrarily fragmented byte stream.
///
/// Feed it raw reads; it emits only fully-buffered frames and keeps any
/// trailing partial frame for the next feed. No frame is ever emitted
/// partially.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Attempts to slice the next complete frame out of the buffer.
    ///
    /// Returns `Ok(None)` when more data is needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }

        let size = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if self.buf.len() < 4 + size {
            return Ok(None);
        }
        if size < MIN_FRAME_SIZE {
            return Err(ProtocolError::FrameTooShort { size });
        }

        self.buf.advance(4);
        let mut payload = self.buf.split_to(size).freeze();
        if self.buf.is_empty() {
            // Release the accumulation buffer between bursts.
            self.buf = BytesMut::new();
        }

        let key = payload.get_u16();
        let version = payload.get_u16();
        Ok(Some(Frame {
            key,
            version,
            payload,
        }))
    }
}
