//! Typed encoders and decoders for the fixed-shape protocol commands.
//!
//! Outbound messages are pure encode functions composed over the generic
//! envelope writers in [`crate::frame`]; inbound bodies are parsed with
//! [`WireReader`] constructors. Each body operates on the payload region
//! after the frame envelope (and, for responses, after the correlation id
//! and status code prefix consumed by the session layer).

use crate::command::Command;
use crate::error::ProtocolError;
use crate::frame::{command_frame, request_frame, response_frame};
use crate::wire::{WireReader, WireWriter};
use bytes::Bytes;
use std::collections::HashMap;

/// Protocol version used by every command except Deliver (which also has v2).
pub const VERSION_1: u16 = 1;

/// Consumer-update response code telling the broker the subscription has no
/// attachable stream.
pub const CONSUMER_UPDATE_NO_STREAM: u16 = 0x02;

fn write_properties(w: &mut WireWriter, props: &[(String, String)]) {
    w.array_size(props.len());
    for (key, value) in props {
        w.string(key);
        w.string(value);
    }
}

fn read_properties(r: &mut WireReader) -> Result<HashMap<String, String>, ProtocolError> {
    let size = r.array_size()?;
    let mut props = HashMap::with_capacity(size);
    for _ in 0..size {
        let key = r.string()?;
        let value = r.string()?;
        props.insert(key, value);
    }
    Ok(props)
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Client-identifying key/value pairs sent as the first handshake step.
pub struct PeerPropertiesRequest {
    props: Vec<(String, String)>,
}

impl PeerPropertiesRequest {
    pub fn new(connection_name: Option<&str>) -> Self {
        let mut props = vec![
            ("product".to_string(), "rill".to_string()),
            ("version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
            ("platform".to_string(), "Rust".to_string()),
        ];
        if let Some(name) = connection_name {
            props.push(("connection_name".to_string(), name.to_string()));
        }
        Self { props }
    }

    pub fn encode(&self, corr_id: u32) -> Bytes {
        request_frame(Command::PeerProperties, VERSION_1, corr_id, |w| {
            write_properties(w, &self.props)
        })
    }
}

pub struct PeerPropertiesResponse {
    pub properties: HashMap<String, String>,
}

impl PeerPropertiesResponse {
    pub fn parse(r: &mut WireReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            properties: read_properties(r)?,
        })
    }
}

pub struct SaslHandshakeRequest;

impl SaslHandshakeRequest {
    pub fn encode(corr_id: u32) -> Bytes {
        request_frame(Command::SaslHandshake, VERSION_1, corr_id, |_| {})
    }
}

pub struct SaslHandshakeResponse {
    pub mechanisms: Vec<String>,
}

impl SaslHandshakeResponse {
    pub fn parse(r: &mut WireReader) -> Result<Self, ProtocolError> {
        let size = r.array_size()?;
        let mut mechanisms = Vec::with_capacity(size);
        for _ in 0..size {
            mechanisms.push(r.string()?);
        }
        Ok(Self { mechanisms })
    }
}

/// SASL authenticate request for the two mechanisms the client speaks.
pub enum SaslAuthenticateRequest {
    Plain { username: String, password: String },
    External,
}

impl SaslAuthenticateRequest {
    pub fn encode(&self, corr_id: u32) -> Bytes {
        request_frame(Command::SaslAuthenticate, VERSION_1, corr_id, |w| match self {
            SaslAuthenticateRequest::Plain { username, password } => {
                w.string("PLAIN");
                let blob = format!("\0{}\0{}", username, password);
                w.bytes(blob.as_bytes());
            }
            SaslAuthenticateRequest::External => {
                w.string("EXTERNAL");
            }
        })
    }
}

/// The broker's Tune push: its side of the frame-size/heartbeat negotiation.
#[derive(Debug, Clone, Copy)]
pub struct TuneFrame {
    pub frame_max: u32,
    pub heartbeat: u32,
}

impl TuneFrame {
    pub fn parse(r: &mut WireReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            frame_max: r.u32()?,
            heartbeat: r.u32()?,
        })
    }

    /// The client's Tune acknowledgement, carrying the negotiated values.
    /// Uncorrelated by design.
    pub fn encode(&self) -> Bytes {
        command_frame(Command::Tune, VERSION_1, |w| {
            w.u32(self.frame_max);
            w.u32(self.heartbeat);
        })
    }
}

pub struct OpenRequest<'a> {
    pub vhost: &'a str,
}

impl OpenRequest<'_> {
    pub fn encode(&self, corr_id: u32) -> Bytes {
        request_frame(Command::Open, VERSION_1, corr_id, |w| w.string(self.vhost))
    }
}

pub struct OpenResponse {
    pub properties: HashMap<String, String>,
}

impl OpenResponse {
    pub fn parse(r: &mut WireReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            properties: read_properties(r)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Connection close
// ---------------------------------------------------------------------------

/// Server-initiated close, pushed as a correlated request.
pub struct CloseRequest {
    pub corr_id: u32,
    pub code: u16,
    pub reason: String,
}

impl CloseRequest {
    pub fn parse(r: &mut WireReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            corr_id: r.u32()?,
            code: r.u16()?,
            reason: r.string()?,
        })
    }

    /// Acknowledgement carrying the server's correlation id.
    pub fn encode_ack(&self) -> Bytes {
        response_frame(Command::Close, VERSION_1, self.corr_id, crate::RESPONSE_CODE_OK, |_| {})
    }
}

/// Client-initiated close request.
pub struct ClientCloseRequest<'a> {
    pub code: u16,
    pub reason: &'a str,
}

impl ClientCloseRequest<'_> {
    pub fn encode(&self, corr_id: u32) -> Bytes {
        request_frame(Command::Close, VERSION_1, corr_id, |w| {
            w.u16(self.code);
            w.string(self.reason);
        })
    }
}

// ---------------------------------------------------------------------------
// Stream management
// ---------------------------------------------------------------------------

pub struct CreateStreamRequest<'a> {
    pub stream: &'a str,
    pub arguments: &'a [(String, String)],
}

impl CreateStreamRequest<'_> {
    pub fn encode(&self, corr_id: u32) -> Bytes {
        request_frame(Command::Create, VERSION_1, corr_id, |w| {
            w.string(self.stream);
            write_properties(w, self.arguments);
        })
    }
}

pub struct DeleteStreamRequest<'a> {
    pub stream: &'a str,
}

impl DeleteStreamRequest<'_> {
    pub fn encode(&self, corr_id: u32) -> Bytes {
        request_frame(Command::Delete, VERSION_1, corr_id, |w| w.string(self.stream))
    }
}

// ---------------------------------------------------------------------------
// Metadata, route, partitions, stats
// ---------------------------------------------------------------------------

pub struct MetadataRequest<'a> {
    pub streams: &'a [String],
}

impl MetadataRequest<'_> {
    pub fn encode(&self, corr_id: u32) -> Bytes {
        request_frame(Command::Metadata, VERSION_1, corr_id, |w| {
            w.array_size(self.streams.len());
            for stream in self.streams {
                w.string(stream);
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broker {
    pub host: String,
    pub port: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMetadata {
    pub code: u16,
    pub leader_ref: u16,
    pub replica_refs: Vec<u16>,
}

/// Metadata response. Carries a correlation id but no status code on the
/// wire; per-stream status lives in each [`StreamMetadata::code`].
#[derive(Debug, Clone)]
pub struct MetadataResponse {
    pub brokers: HashMap<u16, Broker>,
    pub streams: HashMap<String, StreamMetadata>,
}

impl MetadataResponse {
    pub fn parse(r: &mut WireReader) -> Result<Self, ProtocolError> {
        let broker_count = r.array_size()?;
        let mut brokers = HashMap::with_capacity(broker_count);
        for _ in 0..broker_count {
            let reference = r.u16()?;
            brokers.insert(
                reference,
                Broker {
                    host: r.string()?,
                    port: r.u32()?,
                },
            );
        }

        let stream_count = r.array_size()?;
        let mut streams = HashMap::with_capacity(stream_count);
        for _ in 0..stream_count {
            let stream = r.string()?;
            let code = r.u16()?;
            let leader_ref = r.u16()?;
            let replica_count = r.array_size()?;
            let mut replica_refs = Vec::with_capacity(replica_count);
            for _ in 0..replica_count {
                replica_refs.push(r.u16()?);
            }
            streams.insert(
                stream,
                StreamMetadata {
                    code,
                    leader_ref,
                    replica_refs,
                },
            );
        }

        Ok(Self { brokers, streams })
    }
}

/// Topology-change push.
#[derive(Debug, Clone)]
pub struct MetadataUpdate {
    pub code: u16,
    pub stream: String,
}

impl MetadataUpdate {
    pub fn parse(r: &mut WireReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            code: r.u16()?,
            stream: r.string()?,
        })
    }
}

pub struct RouteRequest<'a> {
    pub routing_key: &'a str,
    pub super_stream: &'a str,
}

impl RouteRequest<'_> {
    pub fn encode(&self, corr_id: u32) -> Bytes {
        request_frame(Command::Route, VERSION_1, corr_id, |w| {
            w.string(self.routing_key);
            w.string(self.super_stream);
        })
    }
}

pub struct RouteResponse {
    pub streams: Vec<String>,
}

impl RouteResponse {
    pub fn parse(r: &mut WireReader) -> Result<Self, ProtocolError> {
        let size = r.array_size()?;
        let mut streams = Vec::with_capacity(size);
        for _ in 0..size {
            streams.push(r.string()?);
        }
        Ok(Self { streams })
    }
}

pub struct PartitionsRequest<'a> {
    pub super_stream: &'a str,
}

impl PartitionsRequest<'_> {
    pub fn encode(&self, corr_id: u32) -> Bytes {
        request_frame(Command::Partitions, VERSION_1, corr_id, |w| {
            w.string(self.super_stream)
        })
    }
}

pub struct PartitionsResponse {
    pub streams: Vec<String>,
}

impl PartitionsResponse {
    pub fn parse(r: &mut WireReader) -> Result<Self, ProtocolError> {
        let size = r.array_size()?;
        let mut streams = Vec::with_capacity(size);
        for _ in 0..size {
            streams.push(r.string()?);
        }
        Ok(Self { streams })
    }
}

pub struct StreamStatsRequest<'a> {
    pub stream: &'a str,
}

impl StreamStatsRequest<'_> {
    pub fn encode(&self, corr_id: u32) -> Bytes {
        request_frame(Command::StreamStats, VERSION_1, corr_id, |w| {
            w.string(self.stream)
        })
    }
}

pub struct StreamStatsResponse {
    pub stats: HashMap<String, i64>,
}

impl StreamStatsResponse {
    pub fn parse(r: &mut WireReader) -> Result<Self, ProtocolError> {
        let size = r.array_size()?;
        let mut stats = HashMap::with_capacity(size);
        for _ in 0..size {
            let key = r.string()?;
            stats.insert(key, r.i64()?);
        }
        Ok(Self { stats })
    }
}

// ---------------------------------------------------------------------------
// Publishers
// ---------------------------------------------------------------------------

pub struct DeclarePublisherRequest<'a> {
    pub publisher_id: u8,
    pub publisher_ref: &'a str,
    pub stream: &'a str,
}

impl DeclarePublisherRequest<'_> {
    pub fn encode(&self, corr_id: u32) -> Bytes {
        request_frame(Command::DeclarePublisher, VERSION_1, corr_id, |w| {
            w.u8(self.publisher_id);
            w.string(self.publisher_ref);
            w.string(self.stream);
        })
    }
}

/// Uncorrelated message batch for a declared publisher.
pub struct PublishFrame<'a> {
    pub publisher_id: u8,
    pub messages: &'a [(u64, Bytes)],
}

impl PublishFrame<'_> {
    pub fn encode(&self) -> Bytes {
        command_frame(Command::Publish, VERSION_1, |w| {
            w.u8(self.publisher_id);
            w.array_size(self.messages.len());
            for (id, payload) in self.messages {
                w.u64(*id);
                w.bytes(payload);
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct PublishConfirm {
    pub publisher_id: u8,
    pub message_ids: Vec<u64>,
}

impl PublishConfirm {
    pub fn parse(r: &mut WireReader) -> Result<Self, ProtocolError> {
        let publisher_id = r.u8()?;
        let size = r.array_size()?;
        let mut message_ids = Vec::with_capacity(size);
        for _ in 0..size {
            message_ids.push(r.u64()?);
        }
        Ok(Self {
            publisher_id,
            message_ids,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PublishError {
    pub publisher_id: u8,
    pub errors: Vec<(u64, u16)>,
}

impl PublishError {
    pub fn parse(r: &mut WireReader) -> Result<Self, ProtocolError> {
        let publisher_id = r.u8()?;
        let size = r.array_size()?;
        let mut errors = Vec::with_capacity(size);
        for _ in 0..size {
            let id = r.u64()?;
            let code = r.u16()?;
            errors.push((id, code));
        }
        Ok(Self {
            publisher_id,
            errors,
        })
    }
}

pub struct QueryPublisherSequenceRequest<'a> {
    pub publisher_ref: &'a str,
    pub stream: &'a str,
}

impl QueryPublisherSequenceRequest<'_> {
    pub fn encode(&self, corr_id: u32) -> Bytes {
        request_frame(Command::QueryPublisherSequence, VERSION_1, corr_id, |w| {
            w.string(self.publisher_ref);
            w.string(self.stream);
        })
    }
}

pub struct QueryPublisherSequenceResponse {
    pub sequence: u64,
}

impl QueryPublisherSequenceResponse {
    pub fn parse(r: &mut WireReader) -> Result<Self, ProtocolError> {
        Ok(Self { sequence: r.u64()? })
    }
}

pub struct DeletePublisherRequest {
    pub publisher_id: u8,
}

impl DeletePublisherRequest {
    pub fn encode(&self, corr_id: u32) -> Bytes {
        request_frame(Command::DeletePublisher, VERSION_1, corr_id, |w| {
            w.u8(self.publisher_id)
        })
    }
}

// ---------------------------------------------------------------------------
// Consumers
// ---------------------------------------------------------------------------

/// Where a new subscription attaches in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetSpec {
    First,
    Last,
    Next,
    Offset(u64),
    Timestamp(i64),
}

impl OffsetSpec {
    fn type_code(self) -> u16 {
        match self {
            OffsetSpec::First => 1,
            OffsetSpec::Last => 2,
            OffsetSpec::Next => 3,
            OffsetSpec::Offset(_) => 4,
            OffsetSpec::Timestamp(_) => 5,
        }
    }

    fn write(self, w: &mut WireWriter) {
        w.u16(self.type_code());
        match self {
            OffsetSpec::Offset(value) => w.u64(value),
            OffsetSpec::Timestamp(value) => w.i64(value),
            _ => {}
        }
    }
}

pub struct SubscribeRequest<'a> {
    pub subscription_id: u8,
    pub stream: &'a str,
    pub offset: OffsetSpec,
    pub credit: u16,
    pub properties: &'a [(String, String)],
}

impl SubscribeRequest<'_> {
    pub fn encode(&self, corr_id: u32) -> Bytes {
        request_frame(Command::Subscribe, VERSION_1, corr_id, |w| {
            w.u8(self.subscription_id);
            w.string(self.stream);
            self.offset.write(w);
            w.u16(self.credit);
            write_properties(w, self.properties);
        })
    }
}

pub struct UnsubscribeRequest {
    pub subscription_id: u8,
}

impl UnsubscribeRequest {
    pub fn encode(&self, corr_id: u32) -> Bytes {
        request_frame(Command::Unsubscribe, VERSION_1, corr_id, |w| {
            w.u8(self.subscription_id)
        })
    }
}

/// Flow-control top-up, uncorrelated.
pub struct CreditFrame {
    pub subscription_id: u8,
    pub credit: u16,
}

impl CreditFrame {
    pub fn encode(&self) -> Bytes {
        command_frame(Command::Credit, VERSION_1, |w| {
            w.u8(self.subscription_id);
            w.u16(self.credit);
        })
    }
}

/// Broker reaction to a bad credit command. Push-shaped: no correlation id.
#[derive(Debug, Clone, Copy)]
pub struct CreditResponse {
    pub code: u16,
    pub subscription_id: u8,
}

impl CreditResponse {
    pub fn parse(r: &mut WireReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            code: r.u16()?,
            subscription_id: r.u8()?,
        })
    }
}

pub struct StoreOffsetFrame<'a> {
    pub reference: &'a str,
    pub stream: &'a str,
    pub offset: u64,
}

impl StoreOffsetFrame<'_> {
    pub fn encode(&self) -> Bytes {
        command_frame(Command::StoreOffset, VERSION_1, |w| {
            w.string(self.reference);
            w.string(self.stream);
            w.u64(self.offset);
        })
    }
}

pub struct QueryOffsetRequest<'a> {
    pub reference: &'a str,
    pub stream: &'a str,
}

impl QueryOffsetRequest<'_> {
    pub fn encode(&self, corr_id: u32) -> Bytes {
        request_frame(Command::QueryOffset, VERSION_1, corr_id, |w| {
            w.string(self.reference);
            w.string(self.stream);
        })
    }
}

pub struct QueryOffsetResponse {
    pub offset: u64,
}

impl QueryOffsetResponse {
    pub fn parse(r: &mut WireReader) -> Result<Self, ProtocolError> {
        Ok(Self { offset: r.u64()? })
    }
}

/// Consumer-rebalance push: the broker asks whether this subscription
/// becomes active, as a correlated request the client must answer.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerUpdateRequest {
    pub corr_id: u32,
    pub subscription_id: u8,
    pub active: bool,
}

impl ConsumerUpdateRequest {
    pub fn parse(r: &mut WireReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            corr_id: r.u32()?,
            subscription_id: r.u8()?,
            active: r.u8()? != 0,
        })
    }

    /// Accepts the update, telling the broker where to attach.
    pub fn encode_accept(&self, offset: OffsetSpec) -> Bytes {
        response_frame(
            Command::ConsumerUpdate,
            VERSION_1,
            self.corr_id,
            crate::RESPONSE_CODE_OK,
            |w| offset.write(w),
        )
    }

    /// Rejects the update: no stream to attach.
    pub fn encode_reject(&self) -> Bytes {
        response_frame(
            Command::ConsumerUpdate,
            VERSION_1,
            self.corr_id,
            CONSUMER_UPDATE_NO_STREAM,
            |_| {},
        )
    }
}

// ---------------------------------------------------------------------------
// Command-version exchange and heartbeat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandVersion {
    pub key: u16,
    pub min_version: u16,
    pub max_version: u16,
}

/// Versions this client implements, advertised to the broker.
pub fn supported_command_versions() -> Vec<CommandVersion> {
    fn v1(cmd: Command) -> CommandVersion {
        CommandVersion {
            key: cmd.key(),
            min_version: 1,
            max_version: 1,
        }
    }

    vec![
        v1(Command::DeclarePublisher),
        v1(Command::Publish),
        v1(Command::PublishConfirm),
        v1(Command::PublishError),
        v1(Command::QueryPublisherSequence),
        v1(Command::DeletePublisher),
        v1(Command::Subscribe),
        CommandVersion {
            key: Command::Deliver.key(),
            min_version: 1,
            max_version: 2,
        },
        v1(Command::Credit),
        v1(Command::CreditResponse),
        v1(Command::StoreOffset),
        v1(Command::QueryOffset),
        v1(Command::Unsubscribe),
        v1(Command::Create),
        v1(Command::Delete),
        v1(Command::Metadata),
        v1(Command::MetadataUpdate),
        v1(Command::PeerProperties),
        v1(Command::SaslHandshake),
        v1(Command::SaslAuthenticate),
        v1(Command::Tune),
        v1(Command::Open),
        v1(Command::Close),
        v1(Command::Heartbeat),
        v1(Command::Route),
        v1(Command::Partitions),
        v1(Command::ConsumerUpdate),
        v1(Command::ExchangeCommandVersions),
        v1(Command::StreamStats),
    ]
}

pub struct ExchangeCommandVersionsRequest;

impl ExchangeCommandVersionsRequest {
    pub fn encode(corr_id: u32) -> Bytes {
        let commands = supported_command_versions();
        request_frame(Command::ExchangeCommandVersions, VERSION_1, corr_id, |w| {
            w.array_size(commands.len());
            for cmd in &commands {
                w.u16(cmd.key);
                w.u16(cmd.min_version);
                w.u16(cmd.max_version);
            }
        })
    }
}

pub struct ExchangeCommandVersionsResponse {
    pub commands: Vec<CommandVersion>,
}

impl ExchangeCommandVersionsResponse {
    pub fn parse(r: &mut WireReader) -> Result<Self, ProtocolError> {
        let size = r.array_size()?;
        let mut commands = Vec::with_capacity(size);
        for _ in 0..size {
            commands.push(CommandVersion {
                key: r.u16()?,
                min_version: r.u16()?,
                max_version: r.u16()?,
            });
        }
        Ok(Self { commands })
    }
}

pub fn heartbeat_frame() -> Bytes {
    command_frame(Command::Heartbeat, VERSION_1, |_| {})
}
