//! Uplink transport traits
//!
//! The client only needs a duplex text-frame socket. `WebSocketConnector`
//! provides the real one; `SimEndpoint` the scripted one used in tests.

use async_trait::async_trait;

use super::UplinkError;

/// A frame received from the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Text(String),
    Binary(Vec<u8>),
    /// The server closed the connection.
    Close,
}

/// One open connection to the endpoint.
#[async_trait]
pub trait UplinkSocket: Send + Sync {
    /// Send a single text frame.
    async fn send_text(&self, text: String) -> Result<(), UplinkError>;

    /// Wait for the next inbound frame.
    async fn recv(&self) -> Result<InboundMessage, UplinkError>;

    /// Start a graceful close.
    async fn close(&self) -> Result<(), UplinkError>;
}

/// Opens fresh connections to an endpoint URL.
#[async_trait]
pub trait UplinkConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn UplinkSocket>, UplinkError>;
}
