//! Command keys and response status codes.
//!
//! These values are fixed protocol constants shared by both peers.

use crate::error::ProtocolError;
use crate::RESPONSE_FLAG;
use std::fmt;

/// Protocol command keys.
///
/// `CreditResponse` is the one key with the response bit baked into the
/// constant itself: the broker pushes it without a correlation id, so it
/// never goes through normal response routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    DeclarePublisher = 0x0001,
    Publish = 0x0002,
    PublishConfirm = 0x0003,
    PublishError = 0x0004,
    QueryPublisherSequence = 0x0005,
    DeletePublisher = 0x0006,
    Subscribe = 0x0007,
    Deliver = 0x0008,
    Credit = 0x0009,
    CreditResponse = 0x8009,
    StoreOffset = 0x000a,
    QueryOffset = 0x000b,
    Unsubscribe = 0x000c,
    Create = 0x000d,
    Delete = 0x000e,
    Metadata = 0x000f,
    MetadataUpdate = 0x0010,
    PeerProperties = 0x0011,
    SaslHandshake = 0x0012,
    SaslAuthenticate = 0x0013,
    Tune = 0x0014,
    Open = 0x0015,
    Close = 0x0016,
    Heartbeat = 0x0017,
    Route = 0x0018,
    Partitions = 0x0019,
    ConsumerUpdate = 0x001a,
    ExchangeCommandVersions = 0x001b,
    StreamStats = 0x001c,
}

impl Command {
    pub fn key(self) -> u16 {
        self as u16
    }

    /// Key with the response bit set, as carried by a response frame.
    pub fn response_key(self) -> u16 {
        self.key() | RESPONSE_FLAG
    }
}

impl TryFrom<u16> for Command {
    type Error = ProtocolError;

    fn try_from(key: u16) -> Result<Self, ProtocolError> {
        Ok(match key {
            0x0001 => Command::DeclarePublisher,
            0x0002 => Command::Publish,
            0x0003 => Command::PublishConfirm,
            0x0004 => Command::PublishError,
            0x0005 => Command::QueryPublisherSequence,
            0x0006 => Command::DeletePublisher,
            0x0007 => Command::Subscribe,
            0x0008 => Command::Deliver,
            0x0009 => Command::Credit,
            0x8009 => Command::CreditResponse,
            0x000a => Command::StoreOffset,
            0x000b => Command::QueryOffset,
            0x000c => Command::Unsubscribe,
            0x000d => Command::Create,
            0x000e => Command::Delete,
            0x000f => Command::Metadata,
            0x0010 => Command::MetadataUpdate,
            0x0011 => Command::PeerProperties,
            0x0012 => Command::SaslHandshake,
            0x0013 => Command::SaslAuthenticate,
            0x0014 => Command::Tune,
            0x0015 => Command::Open,
            0x0016 => Command::Close,
            0x0017 => Command::Heartbeat,
            0x0018 => Command::Route,
            0x0019 => Command::Partitions,
            0x001a => Command::ConsumerUpdate,
            0x001b => Command::ExchangeCommandVersions,
            0x001c => Command::StreamStats,
            other => return Err(ProtocolError::UnknownCommand(other)),
        })
    }
}

/// Status code carried in the response body prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseCode(pub u16);

impl ResponseCode {
    pub const OK: ResponseCode = ResponseCode(0x01);

    pub fn is_ok(self) -> bool {
        self.0 == 0x01
    }

    /// Human-readable reason for this status code.
    pub fn reason(self) -> String {
        let reason = match self.0 {
            0x01 => "OK",
            0x02 => "Stream does not exist",
            0x03 => "Subscription ID already exists",
            0x04 => "Subscription ID does not exist",
            0x05 => "Stream already exists",
            0x06 => "Stream not available",
            0x07 => "SASL mechanism not supported",
            0x08 => "Authentication failure",
            0x09 => "SASL error",
            0x0a => "SASL challenge",
            0x0b => "SASL authentication failure loopback",
            0x0c => "Virtual host access failure",
            0x0d => "Unknown frame",
            0x0e => "Frame too large",
            0x0f => "Internal error",
            0x10 => "Access refused",
            0x11 => "Precondition failed",
            0x12 => "Publisher does not exist",
            0x13 => "No offset",
            other => return format!("Unknown error, code={:#04x}", other),
        };
        reason.to_string()
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_roundtrip() {
        for key in [0x0001u16, 0x0008, 0x8009, 0x0014, 0x001c] {
            assert_eq!(Command::try_from(key).unwrap().key(), key);
        }
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert!(matches!(
            Command::try_from(0x00ff),
            Err(ProtocolError::UnknownCommand(0x00ff))
        ));
    }

    #[test]
    fn response_key_sets_the_flag() {
        assert_eq!(Command::Metadata.response_key(), 0x800f);
        assert_eq!(Command::Open.response_key(), 0x8015);
    }

    #[test]
    fn response_code_reasons() {
        assert!(ResponseCode::OK.is_ok());
        assert_eq!(ResponseCode(0x02).reason(), "Stream does not exist");
        assert_eq!(ResponseCode(0x13).reason(), "No offset");
        assert!(ResponseCode(0x99).reason().contains("0x99"));
    }
}
