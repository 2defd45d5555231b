//! High-level client API.
//!
//! One thin typed method per protocol operation. Deliveries, confirmations
//! and other pushes arrive on the event channel returned by
//! [`Client::connect`].

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::ClientError;
use crate::events::ClientEvent;
use bytes::Bytes;
use rill_protocol::messages::*;
use rill_protocol::{Command, WireReader};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// A stream-broker client over one multiplexed connection.
pub struct Client {
    conn: Connection,
}

impl Client {
    /// Connects and completes the handshake. The receiver carries every
    /// push event for the life of the connection, starting with
    /// [`ClientEvent::Open`].
    pub async fn connect(
        config: ClientConfig,
    ) -> Result<(Client, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
        let (conn, events) = Connection::connect(config).await?;
        Ok((Client { conn }, events))
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    /// Properties advertised by the broker, merged from the
    /// peer-properties exchange and the Open response.
    pub fn server_properties(&self) -> HashMap<String, String> {
        self.conn.server_properties()
    }

    /// Negotiated heartbeat interval in seconds (0 = disabled).
    pub fn heartbeat_interval(&self) -> u32 {
        self.conn.heartbeat_interval()
    }

    /// Closes the connection after notifying the broker.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close("client shutdown").await
    }

    // =========================================================================
    // Streams
    // =========================================================================

    pub async fn create_stream(
        &self,
        stream: &str,
        arguments: &[(String, String)],
    ) -> Result<(), ClientError> {
        let request = CreateStreamRequest { stream, arguments };
        self.conn
            .inner()
            .request(Command::Create, 1, |corr_id| request.encode(corr_id))
            .await?;
        Ok(())
    }

    pub async fn delete_stream(&self, stream: &str) -> Result<(), ClientError> {
        let request = DeleteStreamRequest { stream };
        self.conn
            .inner()
            .request(Command::Delete, 1, |corr_id| request.encode(corr_id))
            .await?;
        Ok(())
    }

    pub async fn metadata(&self, streams: &[String]) -> Result<MetadataResponse, ClientError> {
        let request = MetadataRequest { streams };
        let response = self
            .conn
            .inner()
            .request(Command::Metadata, 1, |corr_id| request.encode(corr_id))
            .await?;
        Ok(MetadataResponse::parse(&mut WireReader::new(response.body))?)
    }

    /// Streams behind a super-stream routing key.
    pub async fn route(
        &self,
        routing_key: &str,
        super_stream: &str,
    ) -> Result<Vec<String>, ClientError> {
        let request = RouteRequest {
            routing_key,
            super_stream,
        };
        let response = self
            .conn
            .inner()
            .request(Command::Route, 1, |corr_id| request.encode(corr_id))
            .await?;
        Ok(RouteResponse::parse(&mut WireReader::new(response.body))?.streams)
    }

    /// Partition streams of a super-stream.
    pub async fn partitions(&self, super_stream: &str) -> Result<Vec<String>, ClientError> {
        let request = PartitionsRequest { super_stream };
        let response = self
            .conn
            .inner()
            .request(Command::Partitions, 1, |corr_id| request.encode(corr_id))
            .await?;
        Ok(PartitionsResponse::parse(&mut WireReader::new(response.body))?.streams)
    }

    pub async fn stream_stats(&self, stream: &str) -> Result<HashMap<String, i64>, ClientError> {
        let request = StreamStatsRequest { stream };
        let response = self
            .conn
            .inner()
            .request(Command::StreamStats, 1, |corr_id| request.encode(corr_id))
            .await?;
        Ok(StreamStatsResponse::parse(&mut WireReader::new(response.body))?.stats)
    }

    pub async fn exchange_command_versions(
        &self,
    ) -> Result<Vec<CommandVersion>, ClientError> {
        let response = self
            .conn
            .inner()
            .request(
                Command::ExchangeCommandVersions,
                1,
                ExchangeCommandVersionsRequest::encode,
            )
            .await?;
        Ok(ExchangeCommandVersionsResponse::parse(&mut WireReader::new(response.body))?.commands)
    }

    // =========================================================================
    // Publishers
    // =========================================================================

    pub async fn declare_publisher(
        &self,
        publisher_id: u8,
        publisher_ref: &str,
        stream: &str,
    ) -> Result<(), ClientError> {
        let request = DeclarePublisherRequest {
            publisher_id,
            publisher_ref,
            stream,
        };
        self.conn
            .inner()
            .request(Command::DeclarePublisher, 1, |corr_id| request.encode(corr_id))
            .await?;
        Ok(())
    }

    /// Fire-and-forget message batch; confirmation arrives as a
    /// [`ClientEvent::PublishConfirm`] push.
    pub async fn publish(
        &self,
        publisher_id: u8,
        messages: &[(u64, Bytes)],
    ) -> Result<(), ClientError> {
        let frame = PublishFrame {
            publisher_id,
            messages,
        };
        self.conn.inner().send(&frame.encode()).await
    }

    pub async fn query_publisher_sequence(
        &self,
        publisher_ref: &str,
        stream: &str,
    ) -> Result<u64, ClientError> {
        let request = QueryPublisherSequenceRequest {
            publisher_ref,
            stream,
        };
        let response = self
            .conn
            .inner()
            .request(Command::QueryPublisherSequence, 1, |corr_id| {
                request.encode(corr_id)
            })
            .await?;
        Ok(QueryPublisherSequenceResponse::parse(&mut WireReader::new(response.body))?.sequence)
    }

    pub async fn delete_publisher(&self, publisher_id: u8) -> Result<(), ClientError> {
        let request = DeletePublisherRequest { publisher_id };
        self.conn
            .inner()
            .request(Command::DeletePublisher, 1, |corr_id| request.encode(corr_id))
            .await?;
        Ok(())
    }

    // =========================================================================
    // Consumers
    // =========================================================================

    /// Opens a subscription. Chunks arrive as [`ClientEvent::Delivery`]
    /// in receipt order; the engine tops up one credit per surfaced chunk.
    pub async fn subscribe(
        &self,
        subscription_id: u8,
        stream: &str,
        offset: OffsetSpec,
        credit: u16,
        properties: &[(String, String)],
    ) -> Result<(), ClientError> {
        let request = SubscribeRequest {
            subscription_id,
            stream,
            offset,
            credit,
            properties,
        };
        self.conn
            .inner()
            .request(Command::Subscribe, 1, |corr_id| request.encode(corr_id))
            .await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, subscription_id: u8) -> Result<(), ClientError> {
        let request = UnsubscribeRequest { subscription_id };
        self.conn
            .inner()
            .request(Command::Unsubscribe, 1, |corr_id| request.encode(corr_id))
            .await?;
        Ok(())
    }

    /// Grants the broker permission to push `credit` more chunks.
    pub async fn credit(&self, subscription_id: u8, credit: u16) -> Result<(), ClientError> {
        self.conn.inner().send_credit(subscription_id, credit).await
    }

    /// Persists a consumer offset under a reference name. Uncorrelated.
    pub async fn store_offset(
        &self,
        reference: &str,
        stream: &str,
        offset: u64,
    ) -> Result<(), ClientError> {
        let frame = StoreOffsetFrame {
            reference,
            stream,
            offset,
        };
        self.conn.inner().send(&frame.encode()).await
    }

    pub async fn query_offset(&self, reference: &str, stream: &str) -> Result<u64, ClientError> {
        let request = QueryOffsetRequest { reference, stream };
        let response = self
            .conn
            .inner()
            .request(Command::QueryOffset, 1, |corr_id| request.encode(corr_id))
            .await?;
        Ok(QueryOffsetResponse::parse(&mut WireReader::new(response.body))?.offset)
    }
}
