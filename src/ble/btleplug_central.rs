//! Real BLE central on top of btleplug
//!
//! Translates btleplug's peripheral properties back into raw advertisement
//! bytes so that discovery goes through the same record parsing as the
//! simulator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::advertisement::{encode_records, AdType, AdvertisementRecord};
use super::transport::{
    AdapterState, BleAddress, BleAdvertisement, BleCentral, BleConnection, GattService, ScanMode,
};
use super::BleError;

/// Expand-able SIG UUIDs share this base; only the 16 bits at 32..48 differ.
const SIG_BASE_MASK: u128 = 0xFFFF_0000_FFFF_FFFF_FFFF_FFFF_FFFF_FFFF;
const SIG_BASE: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

fn ble_error(e: btleplug::Error) -> BleError {
    BleError::ConnectionError(e.to_string())
}

fn address_of(addr: BDAddr) -> BleAddress {
    BleAddress::Real(addr.into_inner())
}

/// Rebuild AD structures from the properties btleplug has collected.
fn advertisement_from_properties(props: &PeripheralProperties) -> Vec<u8> {
    let mut records = Vec::new();

    let mut short_uuids = Vec::new();
    let mut long_uuids = Vec::new();
    for uuid in &props.services {
        let value = uuid.as_u128();
        if value & SIG_BASE_MASK == SIG_BASE {
            short_uuids.push(((value >> 96) & 0xFFFF) as u16);
        } else {
            long_uuids.extend(uuid.as_bytes().iter().rev());
        }
    }
    if !short_uuids.is_empty() {
        records.push(AdvertisementRecord::uuids16(&short_uuids));
    }
    if !long_uuids.is_empty() {
        records.push(AdvertisementRecord::new(AdType::Uuids128Complete, long_uuids));
    }
    if let Some(name) = &props.local_name {
        records.push(AdvertisementRecord::complete_name(name));
    }
    for (company, data) in &props.manufacturer_data {
        let mut value = company.to_le_bytes().to_vec();
        value.extend_from_slice(data);
        records.push(AdvertisementRecord::new(AdType::ManufacturerData, value));
    }

    encode_records(&records)
}

/// Central backed by the first adapter btleplug reports.
pub struct BtleplugCentral {
    adapter: Adapter,
    scanning: AtomicBool,
    adv_tx: broadcast::Sender<BleAdvertisement>,
    peripherals: Arc<Mutex<HashMap<BleAddress, Peripheral>>>,
    event_task: JoinHandle<()>,
}

impl BtleplugCentral {
    /// Open the first available adapter and start forwarding its events.
    pub async fn new() -> Result<Self, BleError> {
        let manager = Manager::new()
            .await
            .map_err(|e| BleError::AdapterUnavailable(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| BleError::AdapterUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::AdapterUnavailable("No Bluetooth adapter found".into()))?;

        let mut events = adapter
            .events()
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))?;

        let (adv_tx, _) = broadcast::channel(256);
        let peripherals = Arc::new(Mutex::new(HashMap::new()));

        let event_task = {
            let adapter = adapter.clone();
            let adv_tx = adv_tx.clone();
            let peripherals = Arc::clone(&peripherals);
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    let id = match event {
                        CentralEvent::DeviceDiscovered(id)
                        | CentralEvent::DeviceUpdated(id)
                        | CentralEvent::ServicesAdvertisement { id, .. }
                        | CentralEvent::ManufacturerDataAdvertisement { id, .. } => id,
                        _ => continue,
                    };
                    let Ok(peripheral) = adapter.peripheral(&id).await else {
                        continue;
                    };
                    let Ok(Some(props)) = peripheral.properties().await else {
                        continue;
                    };
                    let address = address_of(props.address);
                    let adv = BleAdvertisement {
                        data: advertisement_from_properties(&props),
                        rssi: props.rssi,
                        source_address: address.clone(),
                    };
                    peripherals
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(address, peripheral);
                    let _ = adv_tx.send(adv);
                }
                log::debug!("btleplug event stream ended");
            })
        };

        Ok(Self {
            adapter,
            scanning: AtomicBool::new(false),
            adv_tx,
            peripherals,
            event_task,
        })
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        self.event_task.abort();
    }
}

#[async_trait]
impl BleCentral for BtleplugCentral {
    async fn adapter_state(&self) -> AdapterState {
        match self.adapter.adapter_info().await {
            Ok(_) => AdapterState::Ready,
            Err(_) => AdapterState::Unsupported,
        }
    }

    async fn start_scan(&self, mode: ScanMode) -> Result<(), BleError> {
        // btleplug picks the duty cycle itself; the mode is advisory.
        log::debug!("Starting btleplug scan ({:?})", mode);
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))?;
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.scanning.store(false, Ordering::SeqCst);
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))
    }

    fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    fn advertisements(&self) -> broadcast::Receiver<BleAdvertisement> {
        self.adv_tx.subscribe()
    }

    async fn connect(&self, address: &BleAddress) -> Result<Box<dyn BleConnection>, BleError> {
        let peripheral = self
            .peripherals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
            .ok_or_else(|| BleError::ConnectionError(format!("Unknown peripheral {}", address)))?;

        peripheral.connect().await.map_err(ble_error)?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| BleError::GattError(e.to_string()))?;

        Ok(Box::new(BtleplugConnection {
            address: address.clone(),
            peripheral,
            forwarders: Mutex::new(Vec::new()),
        }))
    }
}

/// A connected btleplug peripheral.
pub struct BtleplugConnection {
    address: BleAddress,
    peripheral: Peripheral,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleplugConnection {
    fn abort_forwarders(&self) {
        for task in self
            .forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

#[async_trait]
impl BleConnection for BtleplugConnection {
    async fn discover_services(&self) -> Result<Vec<GattService>, BleError> {
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect())
    }

    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>, BleError> {
        let target = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
            .ok_or_else(|| {
                BleError::GattError(format!(
                    "No characteristic {} in service {}",
                    characteristic, service
                ))
            })?;

        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| BleError::GattError(e.to_string()))?;
        self.peripheral
            .subscribe(&target)
            .await
            .map_err(|e| BleError::GattError(e.to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != characteristic {
                    continue;
                }
                if tx.send(notification.value).await.is_err() {
                    break;
                }
            }
        });
        self.forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(forwarder);

        Ok(rx)
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.abort_forwarders();
        self.peripheral.disconnect().await.map_err(ble_error)
    }

    fn peer_address(&self) -> &BleAddress {
        &self.address
    }

    fn is_connected(&self) -> bool {
        self.forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|task| !task.is_finished())
    }
}

impl Drop for BtleplugConnection {
    fn drop(&mut self) {
        self.abort_forwarders();
    }
}
