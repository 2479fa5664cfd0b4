//! In-process BLE simulator
//!
//! Provides a simulated BLE network where heart-rate peripherals advertise
//! and push measurement notifications, and a central scans and connects to
//! them, entirely in-process. Used for integration testing and for the
//! runner's `--simulate` mode without requiring real BLE hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::advertisement::{encode_records, AdType, AdvertisementRecord};
use super::gatt::{HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_SHORT, HEART_RATE_SERVICE_UUID};
use super::transport::{
    AdapterState, BleAddress, BleAdvertisement, BleCentral, BleConnection, GattService, ScanMode,
};
use super::BleError;

/// How a simulated peripheral presents itself and behaves on connect.
#[derive(Clone, Debug)]
pub struct SimPeripheralConfig {
    pub name: Option<String>,
    /// Include the heart rate service in the 16-bit service list.
    pub advertise_service: bool,
    pub manufacturer_data: Option<Vec<u8>>,
    pub rssi: Option<i16>,
    /// GATT table exposed after connection.
    pub services: Vec<GattService>,
    /// Time the link layer takes to establish a connection.
    pub connect_delay: Duration,
    /// Time service discovery takes once connected.
    pub discovery_delay: Duration,
    pub refuse_connections: bool,
}

impl SimPeripheralConfig {
    /// A standard chest strap exposing the heart rate service.
    pub fn heart_rate_strap(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            advertise_service: true,
            manufacturer_data: None,
            rssi: Some(-55),
            services: vec![GattService {
                uuid: HEART_RATE_SERVICE_UUID,
                characteristics: vec![HEART_RATE_MEASUREMENT_UUID],
            }],
            connect_delay: Duration::ZERO,
            discovery_delay: Duration::ZERO,
            refuse_connections: false,
        }
    }

    /// A peripheral that is not a heart-rate sensor.
    pub fn generic(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            advertise_service: false,
            manufacturer_data: None,
            rssi: Some(-70),
            services: vec![],
            connect_delay: Duration::ZERO,
            discovery_delay: Duration::ZERO,
            refuse_connections: false,
        }
    }

    fn advertisement_data(&self) -> Vec<u8> {
        let mut records = vec![AdvertisementRecord::new(AdType::Flags, vec![0x06])];
        if self.advertise_service {
            records.push(AdvertisementRecord::uuids16(&[HEART_RATE_SERVICE_SHORT]));
        }
        if let Some(name) = &self.name {
            records.push(AdvertisementRecord::complete_name(name));
        }
        if let Some(data) = &self.manufacturer_data {
            records.push(AdvertisementRecord::new(AdType::ManufacturerData, data.clone()));
        }
        encode_records(&records)
    }
}

struct PeripheralShared {
    config: SimPeripheralConfig,
    subscribers: Mutex<Vec<mpsc::Sender<Vec<u8>>>>,
    connections: Mutex<Vec<Arc<AtomicBool>>>,
}

impl PeripheralShared {
    fn sever(&self) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        for flag in self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

/// The simulated "air": a shared medium through which all simulated
/// devices communicate.
pub struct SimBleNetwork {
    /// Broadcast channel for advertisements.
    adv_tx: broadcast::Sender<BleAdvertisement>,
    /// Registry of connectable peripherals.
    peripherals: Mutex<HashMap<BleAddress, Arc<PeripheralShared>>>,
}

impl SimBleNetwork {
    /// Create a new simulated BLE network.
    pub fn new() -> Arc<Self> {
        let (adv_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            adv_tx,
            peripherals: Mutex::new(HashMap::new()),
        })
    }

    /// Create a scanning central on this network.
    pub fn create_central(self: &Arc<Self>) -> SimCentral {
        SimCentral {
            network: Arc::clone(self),
            scanning: AtomicBool::new(false),
            state: Mutex::new(AdapterState::Ready),
        }
    }

    /// Register a peripheral on this network. It does not advertise until
    /// `advertise()` is called.
    pub fn add_peripheral(self: &Arc<Self>, config: SimPeripheralConfig) -> SimPeripheral {
        let address = BleAddress::Simulated(Uuid::new_v4());
        let shared = Arc::new(PeripheralShared {
            config,
            subscribers: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        });
        self.peripherals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.clone(), Arc::clone(&shared));
        SimPeripheral {
            address,
            network: Arc::clone(self),
            shared,
        }
    }

    fn lookup(&self, address: &BleAddress) -> Option<Arc<PeripheralShared>> {
        self.peripherals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }
}

/// Handle to a simulated peripheral, used to drive it from the outside.
pub struct SimPeripheral {
    address: BleAddress,
    network: Arc<SimBleNetwork>,
    shared: Arc<PeripheralShared>,
}

impl SimPeripheral {
    pub fn address(&self) -> &BleAddress {
        &self.address
    }

    /// Broadcast one advertisement.
    pub fn advertise(&self) {
        let adv = BleAdvertisement {
            data: self.shared.config.advertisement_data(),
            rssi: self.shared.config.rssi,
            source_address: self.address.clone(),
        };
        let _ = self.network.adv_tx.send(adv);
    }

    /// Push a raw measurement payload to every subscribed central.
    /// Returns the number of subscribers that received it.
    pub fn notify(&self, payload: &[u8]) -> usize {
        let mut subscribers = self
            .shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| !tx.is_closed());
        subscribers
            .iter()
            .filter(|tx| tx.try_send(payload.to_vec()).is_ok())
            .count()
    }

    /// Push an 8-bit format measurement.
    pub fn notify_bpm(&self, bpm: u8) -> usize {
        self.notify(&[0x00, bpm])
    }

    /// Drop every link to this peripheral, as if it went out of range.
    pub fn drop_links(&self) {
        self.shared.sever();
    }

    /// Links currently open to this peripheral.
    pub fn link_count(&self) -> usize {
        self.shared
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|flag| flag.load(Ordering::SeqCst))
            .count()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self
            .shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

/// A simulated central backed by the shared network.
pub struct SimCentral {
    network: Arc<SimBleNetwork>,
    scanning: AtomicBool,
    state: Mutex<AdapterState>,
}

impl SimCentral {
    /// Change the reported adapter state (e.g. to simulate Bluetooth off).
    pub fn set_adapter_state(&self, state: AdapterState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn current_state(&self) -> AdapterState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A simulated connection to one peripheral.
pub struct SimBleConnection {
    peer_address: BleAddress,
    shared: Arc<PeripheralShared>,
    connected: Arc<AtomicBool>,
}

#[async_trait]
impl BleConnection for SimBleConnection {
    async fn discover_services(&self) -> Result<Vec<GattService>, BleError> {
        if !self.shared.config.discovery_delay.is_zero() {
            tokio::time::sleep(self.shared.config.discovery_delay).await;
        }
        if !self.is_connected() {
            return Err(BleError::Disconnected);
        }
        Ok(self.shared.config.services.clone())
    }

    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>, BleError> {
        if !self.is_connected() {
            return Err(BleError::Disconnected);
        }
        let exists = self
            .shared
            .config
            .services
            .iter()
            .any(|s| s.uuid == service && s.characteristics.contains(&characteristic));
        if !exists {
            return Err(BleError::GattError(format!(
                "No characteristic {} in service {}",
                characteristic, service
            )));
        }

        let (tx, rx) = mpsc::channel(64);
        self.shared
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.connected.store(false, Ordering::SeqCst);
        self.shared.sever();
        Ok(())
    }

    fn peer_address(&self) -> &BleAddress {
        &self.peer_address
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BleCentral for SimCentral {
    async fn adapter_state(&self) -> AdapterState {
        self.current_state()
    }

    async fn start_scan(&self, _mode: ScanMode) -> Result<(), BleError> {
        match self.current_state() {
            AdapterState::Ready => {
                self.scanning.store(true, Ordering::SeqCst);
                Ok(())
            }
            other => Err(BleError::AdapterUnavailable(format!("{:?}", other))),
        }
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    fn advertisements(&self) -> broadcast::Receiver<BleAdvertisement> {
        self.network.adv_tx.subscribe()
    }

    async fn connect(&self, address: &BleAddress) -> Result<Box<dyn BleConnection>, BleError> {
        let shared = self.network.lookup(address).ok_or_else(|| {
            BleError::ConnectionError(format!("No peripheral at {}", address))
        })?;

        if shared.config.refuse_connections {
            return Err(BleError::ConnectionError(
                "Peripheral rejected the connection".to_string(),
            ));
        }
        if !shared.config.connect_delay.is_zero() {
            tokio::time::sleep(shared.config.connect_delay).await;
        }

        let connected = Arc::new(AtomicBool::new(true));
        shared
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&connected));

        Ok(Box::new(SimBleConnection {
            peer_address: address.clone(),
            shared,
            connected,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::transport::DiscoveredDevice;

    #[tokio::test]
    async fn test_advertisement_broadcast() {
        let network = SimBleNetwork::new();
        let central = network.create_central();
        let strap = network.add_peripheral(SimPeripheralConfig::heart_rate_strap("HRM Pro"));

        let mut rx = central.advertisements();
        strap.advertise();

        let adv = rx.recv().await.unwrap();
        assert_eq!(adv.source_address, *strap.address());
        let device = DiscoveredDevice::from_advertisement(&adv);
        assert_eq!(device.name.as_deref(), Some("HRM Pro"));
    }

    #[tokio::test]
    async fn test_connect_subscribe_and_notify() {
        let network = SimBleNetwork::new();
        let central = network.create_central();
        let strap = network.add_peripheral(SimPeripheralConfig::heart_rate_strap("HRM Pro"));

        let conn = central.connect(strap.address()).await.unwrap();
        assert!(conn.is_connected());

        let services = conn.discover_services().await.unwrap();
        assert_eq!(services[0].uuid, HEART_RATE_SERVICE_UUID);

        let mut rx = conn
            .subscribe(HEART_RATE_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID)
            .await
            .unwrap();
        assert_eq!(strap.notify_bpm(72), 1);
        assert_eq!(rx.recv().await.unwrap(), vec![0x00, 72]);
    }

    #[tokio::test]
    async fn test_subscribe_missing_characteristic() {
        let network = SimBleNetwork::new();
        let central = network.create_central();
        let speaker = network.add_peripheral(SimPeripheralConfig::generic("Speaker"));

        let conn = central.connect(speaker.address()).await.unwrap();
        let result = conn
            .subscribe(HEART_RATE_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID)
            .await;
        assert!(matches!(result, Err(BleError::GattError(_))));
    }

    #[tokio::test]
    async fn test_drop_links_closes_notification_stream() {
        let network = SimBleNetwork::new();
        let central = network.create_central();
        let strap = network.add_peripheral(SimPeripheralConfig::heart_rate_strap("HRM Pro"));

        let conn = central.connect(strap.address()).await.unwrap();
        let mut rx = conn
            .subscribe(HEART_RATE_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID)
            .await
            .unwrap();

        strap.drop_links();
        assert!(!conn.is_connected());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_scan_requires_ready_adapter() {
        let network = SimBleNetwork::new();
        let central = network.create_central();
        central.set_adapter_state(AdapterState::PoweredOff);

        let result = central.start_scan(ScanMode::LowLatency).await;
        assert!(matches!(result, Err(BleError::AdapterUnavailable(_))));
        assert!(!central.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_delay_uses_virtual_time() {
        let network = SimBleNetwork::new();
        let central = network.create_central();
        let mut config = SimPeripheralConfig::heart_rate_strap("Slow Strap");
        config.connect_delay = Duration::from_secs(3);
        let strap = network.add_peripheral(config);

        let before = tokio::time::Instant::now();
        central.connect(strap.address()).await.unwrap();
        assert!(before.elapsed() >= Duration::from_secs(3));
    }
}
