//! Heart-rate peripheral discovery and connection
//!
//! The connector scans for advertisements, picks the first heart-rate
//! capable peripheral, connects and subscribes to measurement
//! notifications. Parsed readings leave through an ordered [`DeviceFeed`]
//! channel; UI-facing notifications go out as [`ConnectorEvent`]s.

pub mod connector;

pub use connector::{ConnectorConfig, DeviceConnector};

use thiserror::Error;

use crate::ble::transport::{BleAddress, DiscoveredDevice};
use crate::ble::BleError;
use crate::types::Sample;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Scan failed: {0}")]
    ScanError(String),

    #[error("Connection attempt timed out")]
    ConnectTimeout,

    #[error("Heart rate service not found on device")]
    ServiceNotFound,

    #[error("Heart rate measurement characteristic not found")]
    CharacteristicNotFound,

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("A connection attempt is already in progress")]
    AlreadyConnecting,
}

impl From<BleError> for ConnectError {
    fn from(e: BleError) -> Self {
        match e {
            BleError::ScanError(msg) => ConnectError::ScanError(msg),
            BleError::AdapterUnavailable(msg) => ConnectError::ScanError(msg),
            BleError::Timeout => ConnectError::ConnectTimeout,
            other => ConnectError::ConnectFailed(other.to_string()),
        }
    }
}

/// Connector lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Idle,
    Scanning,
    /// A match was found and the scan is being torn down.
    Stopping,
    Connecting,
    Subscribed,
    Disconnected,
}

/// The peripheral currently providing samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub address: BleAddress,
    pub name: String,
}

impl DeviceHandle {
    /// Identifier persisted for later reconnection.
    pub fn identifier(&self) -> String {
        self.address.to_string()
    }
}

/// Notifications for UI and other observers. Lossy: slow receivers lag.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    StatusChanged(String),
    DeviceDiscovered(DiscoveredDevice),
    /// A measurement notification from the subscribed device.
    HeartRate(u16),
    /// Heart rate carried in a recognized device's advertisement.
    AdvertisedHeartRate(u16),
    Connected(DeviceHandle),
    /// A connection attempt ended without a subscription. The caller
    /// decides whether to scan again.
    ConnectFailed(ConnectError),
    Disconnected,
}

/// Ordered, lossless stream of what the session needs to see.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceFeed {
    Connected(DeviceHandle),
    Reading(Sample),
    Disconnected,
}
