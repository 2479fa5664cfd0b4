//! BLE layer for heart-rate peripherals
//!
//! Provides the central-role transport traits, the heart-rate measurement
//! codec, advertisement parsing and recognition, and an in-process simulator
//! for testing. A btleplug-backed central is available behind the
//! `ble-central` feature.

pub mod advertisement;
#[cfg(feature = "ble-central")]
pub mod btleplug_central;
pub mod gatt;
pub mod simulated;
pub mod transport;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,
}
