//! # rill-protocol
//!
//! Wire protocol implementation for the RabbitMQ Stream protocol.
//!
//! This crate provides:
//! - Binary framing with a big-endian length prefix
//! - An incremental frame decoder for fragmented byte streams
//! - Typed encoders/decoders for every client and server command
//! - The delivery-chunk parser with CRC-32 validation and pluggable
//!   sub-batch decompression
//!
//! It is runtime-agnostic: nothing here performs I/O.

pub mod command;
pub mod deliver;
pub mod error;
pub mod frame;
pub mod messages;
pub mod wire;

pub use command::{Command, ResponseCode};
pub use deliver::{ChunkHeader, CompressionRegistry, ParsedChunk, SubBatchJob};
pub use error::ProtocolError;
pub use frame::{Frame, FrameDecoder};
pub use wire::{WireReader, WireWriter};

/// Default port a stream broker listens on.
pub const DEFAULT_PORT: u16 = 5552;

/// Bit set in the key of every response frame.
pub const RESPONSE_FLAG: u16 = 0x8000;

/// Largest assignable correlation id; the allocator wraps past it.
pub const MAX_CORRELATION_ID: u32 = 0xFFFF_FFFF;

/// Status code for a successful response.
pub const RESPONSE_CODE_OK: u16 = 0x01;
