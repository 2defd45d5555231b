//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding, framing, or parsing protocol data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("truncated message: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("frame too short for a command header: {size} bytes")]
    FrameTooShort { size: usize },

    #[error("unknown command key {0:#06x}")]
    UnknownCommand(u16),

    #[error("unsupported version {version} for command key {key:#06x}")]
    UnsupportedCommandVersion { key: u16, version: u16 },

    #[error("unexpected response with correlation id {0}")]
    UnexpectedResponse(u32),

    #[error(
        "response key/version mismatch: expected {expected_key:#06x} v{expected_version}, \
         got {actual_key:#06x} v{actual_version}"
    )]
    ResponseMismatch {
        expected_key: u16,
        expected_version: u16,
        actual_key: u16,
        actual_version: u16,
    },

    #[error("invalid chunk type {0}")]
    BadChunkType(u8),

    #[error("chunk checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("compression type {0} not supported")]
    UnsupportedCompression(u8),

    #[error("sub-batch record count overflows the chunk record table")]
    RecordIndexOutOfRange,

    #[error("chunk declared {expected} records but decoded {actual}")]
    RecordCountMismatch { expected: u32, actual: u32 },

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("decompression failed: {0}")]
    Decompression(String),
}
