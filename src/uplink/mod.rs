//! Streaming uplink to the telemetry endpoint
//!
//! `StreamUplink` keeps one persistent text-frame connection open, sends the
//! latest sample on request and, when the connection fails, runs a single
//! reconnection routine with exponential backoff until it succeeds or the
//! uplink is disposed. Delivery is best-effort: a sample that cannot be sent
//! right away is dropped.

pub mod backoff;
pub mod client;
pub mod frame;
pub mod simulated;
pub mod transport;
pub mod websocket;

pub use backoff::ReconnectPolicy;
pub use client::{StreamUplink, UplinkSettings};
pub use frame::{resolve_endpoint, TelemetryFrame};
pub use transport::{InboundMessage, UplinkConnector, UplinkSocket};
pub use websocket::WebSocketConnector;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UplinkError {
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Send timed out")]
    SendTimeout,

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Uplink has been disposed")]
    Disposed,

    #[error("Error while closing: {0}")]
    DisposalError(String),
}

/// Connection state as seen from outside the uplink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}
