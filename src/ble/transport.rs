//! BLE transport trait definitions and core types
//!
//! Defines the abstract central-role interface that both the simulated
//! transport and the btleplug-backed central conform to.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::advertisement::{local_name, parse_records, AdvertisementRecord};
use super::BleError;

/// A BLE device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BleAddress {
    /// A real 6-byte BLE MAC address.
    Real([u8; 6]),
    /// A platform-assigned identifier (e.g. CoreBluetooth UUIDs on macOS).
    Platform(String),
    /// A simulated address identified by UUID.
    Simulated(Uuid),
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BleAddress::Real(bytes) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
            ),
            BleAddress::Platform(id) => write!(f, "{}", id),
            BleAddress::Simulated(id) => write!(f, "sim-{}", id),
        }
    }
}

/// A received BLE advertisement.
#[derive(Debug, Clone)]
pub struct BleAdvertisement {
    /// Raw advertisement data (AD structures).
    pub data: Vec<u8>,
    /// Received signal strength indicator (if available).
    pub rssi: Option<i16>,
    /// Address of the advertising device.
    pub source_address: BleAddress,
}

/// An advertisement decoded into records, as seen by the scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub address: BleAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub records: Vec<AdvertisementRecord>,
}

impl DiscoveredDevice {
    pub fn from_advertisement(adv: &BleAdvertisement) -> Self {
        let records = parse_records(&adv.data);
        Self {
            address: adv.source_address.clone(),
            name: local_name(&records),
            rssi: adv.rssi,
            records,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown device")
    }
}

/// Scan duty cycle requested from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    LowPower,
    Balanced,
    LowLatency,
}

/// Adapter availability as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Ready,
    PoweredOff,
    Unsupported,
}

/// A GATT service discovered on a connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// An active BLE connection to a peripheral.
#[async_trait]
pub trait BleConnection: Send + Sync {
    /// Enumerate the peripheral's GATT services.
    async fn discover_services(&self) -> Result<Vec<GattService>, BleError>;

    /// Enable notifications on a characteristic.
    ///
    /// Each notification value is delivered on the returned channel. The
    /// channel closes when the link is lost.
    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>, BleError>;

    /// Disconnect from the peer.
    async fn disconnect(&self) -> Result<(), BleError>;

    /// Get the peer's BLE address.
    fn peer_address(&self) -> &BleAddress;

    /// Check whether the connection is still active.
    fn is_connected(&self) -> bool;
}

/// BLE central role: scanning for advertisements and connecting to peripherals.
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Report whether the adapter can be used.
    async fn adapter_state(&self) -> AdapterState;

    /// Start scanning for BLE advertisements.
    async fn start_scan(&self, mode: ScanMode) -> Result<(), BleError>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Whether a scan is currently running.
    fn is_scanning(&self) -> bool;

    /// Subscribe to discovered advertisements.
    fn advertisements(&self) -> broadcast::Receiver<BleAdvertisement>;

    /// Connect to a peripheral at the given address.
    async fn connect(&self, address: &BleAddress) -> Result<Box<dyn BleConnection>, BleError>;
}
