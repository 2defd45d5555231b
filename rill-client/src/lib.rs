//! # rill-client
//!
//! Asynchronous client for the RabbitMQ Stream protocol.
//!
//! This crate provides:
//! - A single multiplexed TCP/TLS connection with the full handshake
//!   (peer properties, SASL, tune negotiation, vhost open)
//! - Correlated requests with timeouts and a typed push-event channel
//! - Ordered, credit-managed chunk delivery per subscription

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;

mod delivery;
mod dispatch;
mod heartbeat;
mod session;
mod tls;
mod transport;

pub use client::Client;
pub use config::{ClientConfig, TlsClientConfig};
pub use connection::{Connection, ConnectionState};
pub use error::ClientError;
pub use events::{ClientEvent, ConsumerUpdate, Delivery};

pub use rill_protocol::messages::OffsetSpec;
