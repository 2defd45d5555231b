//! Application-facing events.
//!
//! Everything the broker pushes (and the connection lifecycle itself)
//! arrives as one typed variant on a single-consumer channel returned by
//! [`crate::Client::connect`].

use crate::connection::ConnectionInner;
use crate::error::ClientError;
use bytes::Bytes;
use rill_protocol::messages::{
    ConsumerUpdateRequest, CreditResponse, MetadataUpdate, OffsetSpec, PublishConfirm,
    PublishError,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Weak;

/// One decoded chunk, released in receipt order per subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subscription_id: u8,
    /// Zero on Deliver v1 frames.
    pub committed_chunk_id: u32,
    pub timestamp: i64,
    pub offset: u64,
    pub records: Vec<Bytes>,
}

/// A consumer-rebalance request from the broker, answered through the
/// dispatcher with the broker's own correlation id.
pub struct ConsumerUpdate {
    pub(crate) request: ConsumerUpdateRequest,
    pub(crate) conn: Weak<ConnectionInner>,
}

impl ConsumerUpdate {
    pub fn subscription_id(&self) -> u8 {
        self.request.subscription_id
    }

    /// Whether the broker is promoting this subscription to active.
    pub fn active(&self) -> bool {
        self.request.active
    }

    /// Accepts the update, telling the broker where the consumer attaches.
    pub async fn accept(self, offset: OffsetSpec) -> Result<(), ClientError> {
        let conn = self.conn.upgrade().ok_or(ClientError::ConnectionClosed)?;
        conn.send(&self.request.encode_accept(offset)).await
    }

    /// Rejects the update: this subscription has no stream to offer.
    pub async fn reject(self) -> Result<(), ClientError> {
        let conn = self.conn.upgrade().ok_or(ClientError::ConnectionClosed)?;
        conn.send(&self.request.encode_reject()).await
    }
}

impl fmt::Debug for ConsumerUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerUpdate")
            .field("subscription_id", &self.request.subscription_id)
            .field("active", &self.request.active)
            .finish()
    }
}

/// Events emitted over the connection's event channel.
#[derive(Debug)]
pub enum ClientEvent {
    /// The handshake reached `Open`; carries the merged server properties.
    Open {
        server_properties: HashMap<String, String>,
    },
    /// The connection is gone, locally or by the broker.
    Close { reason: String },
    /// A session-level error with no addressable requester.
    Error(ClientError),
    /// One chunk of records for a subscription.
    Delivery(Delivery),
    PublishConfirm(PublishConfirm),
    PublishError(PublishError),
    /// Broker reaction to a bad credit command.
    CreditError(CreditResponse),
    /// Stream topology changed.
    MetadataUpdate(MetadataUpdate),
    /// The broker asks this consumer to go active or standby.
    ConsumerUpdate(ConsumerUpdate),
}
