//! Client error types.

use rill_protocol::{ProtocolError, ResponseCode};
use thiserror::Error;

/// Errors surfaced by the client.
///
/// Request-scoped errors (server status, mismatches, request timeout)
/// reject only the caller that issued the request. Connect, tune, and
/// heartbeat timeouts are fatal to the whole connection.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    RequestTimeout,

    #[error("connect timeout")]
    ConnectTimeout,

    #[error("tune timeout")]
    TuneTimeout,

    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    #[error("frame too large: {size} bytes (negotiated max {max})")]
    FrameTooLarge { size: usize, max: u32 },

    #[error("server error: {}", .code.reason())]
    Server { code: ResponseCode },

    #[error("no usable SASL mechanism: server offers {offered:?}")]
    AuthMechanismUnavailable { offered: Vec<String> },

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl ClientError {
    /// Server error for a non-OK response status.
    pub(crate) fn server(code: ResponseCode) -> Self {
        ClientError::Server { code }
    }
}
