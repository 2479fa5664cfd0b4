//! DeviceConnector: scan, recognize, connect and subscribe
//!
//! Drives a `BleCentral` through Idle -> Scanning -> Stopping -> Connecting
//! -> Subscribed -> Disconnected. The first heart-rate capable advertisement
//! of a scan wins; later advertisements in that scan are ignored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{ConnectError, ConnectorEvent, ConnectorState, DeviceFeed, DeviceHandle};
use crate::ble::advertisement::{is_heart_rate_capable, manufacturer_data};
use crate::ble::gatt::{parse_heart_rate, HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID};
use crate::ble::transport::{
    AdapterState, BleAddress, BleCentral, BleConnection, DiscoveredDevice, ScanMode,
};
use crate::ble::BleError;
use crate::host::{KeyValueStore, LAST_CONNECTED_DEVICE_KEY};
use crate::types::Sample;

/// Timing of the scan/connect sequence.
#[derive(Clone, Debug)]
pub struct ConnectorConfig {
    /// Pause after stopping a running scan before starting a new one.
    pub scan_settle: Duration,
    /// Pause between stopping the scan and issuing the connect.
    pub connect_settle: Duration,
    pub connect_timeout: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            scan_settle: Duration::from_millis(200),
            connect_settle: Duration::from_millis(300),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

struct Inner {
    state: ConnectorState,
    status: String,
    device: Option<DeviceHandle>,
    connection: Option<Arc<dyn BleConnection>>,
    scan_task: Option<JoinHandle<()>>,
    pump_task: Option<JoinHandle<()>>,
}

/// Clears the in-flight connection flag however the attempt ends.
struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Scanner and connector for a single heart-rate peripheral.
pub struct DeviceConnector {
    central: Arc<dyn BleCentral>,
    store: Arc<dyn KeyValueStore>,
    config: ConnectorConfig,
    inner: Mutex<Inner>,
    connecting: AtomicBool,
    events_tx: broadcast::Sender<ConnectorEvent>,
    feed_tx: mpsc::UnboundedSender<DeviceFeed>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DeviceConnector {
    /// Create a connector. The returned receiver carries connection changes
    /// and readings in the order they happened.
    pub fn new(
        central: Arc<dyn BleCentral>,
        store: Arc<dyn KeyValueStore>,
        config: ConnectorConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DeviceFeed>) {
        let (events_tx, _) = broadcast::channel(64);
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        let connector = Arc::new(Self {
            central,
            store,
            config,
            inner: Mutex::new(Inner {
                state: ConnectorState::Idle,
                status: String::new(),
                device: None,
                connection: None,
                scan_task: None,
                pump_task: None,
            }),
            connecting: AtomicBool::new(false),
            events_tx,
            feed_tx,
            shutdown_tx,
        });
        (connector, feed_rx)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.events_tx.subscribe()
    }

    pub fn state(&self) -> ConnectorState {
        self.lock().state
    }

    /// Latest human-readable status line.
    pub fn status(&self) -> String {
        self.lock().status.clone()
    }

    pub fn current_device(&self) -> Option<DeviceHandle> {
        self.lock().device.clone()
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::SeqCst)
    }

    /// Identifier of the last device a connection succeeded with, if any
    /// was ever recorded.
    pub fn last_connected_device(&self) -> Option<String> {
        self.store.get(LAST_CONNECTED_DEVICE_KEY)
    }

    fn set_status(&self, status: impl Into<String>) {
        let status = status.into();
        log::info!("{}", status);
        self.lock().status = status.clone();
        let _ = self.events_tx.send(ConnectorEvent::StatusChanged(status));
    }

    fn set_state(&self, state: ConnectorState) {
        let mut inner = self.lock();
        if inner.state != state {
            log::debug!("Connector {:?} -> {:?}", inner.state, state);
            inner.state = state;
        }
    }

    fn emit(&self, event: ConnectorEvent) {
        let _ = self.events_tx.send(event);
    }

    fn feed(&self, item: DeviceFeed) {
        if self.feed_tx.send(item).is_err() {
            log::debug!("Device feed receiver dropped");
        }
    }

    /// Report adapter availability as status text.
    pub async fn check_adapter(&self) -> AdapterState {
        let state = self.central.adapter_state().await;
        let status = match state {
            AdapterState::Ready => "Bluetooth is available",
            AdapterState::PoweredOff => "Bluetooth is turned off",
            AdapterState::Unsupported => "Bluetooth is not supported on this device",
        };
        self.set_status(status);
        state
    }

    /// Begin scanning for a heart-rate peripheral. Does nothing if a scan
    /// is already running.
    pub async fn start_scan(self: &Arc<Self>) -> Result<(), ConnectError> {
        {
            let mut inner = self.lock();
            if inner.state == ConnectorState::Scanning {
                log::debug!("Scan already running");
                return Ok(());
            }
            inner.state = ConnectorState::Scanning;
        }

        if self.central.is_scanning() {
            if let Err(e) = self.central.stop_scan().await {
                log::warn!("Failed to stop previous scan: {}", e);
            }
            tokio::time::sleep(self.config.scan_settle).await;
        }

        let mut advertisements = self.central.advertisements();
        if let Err(e) = self.central.start_scan(ScanMode::LowLatency).await {
            self.set_state(ConnectorState::Idle);
            let err = ConnectError::from(e);
            self.set_status(err.to_string());
            return Err(err);
        }
        self.set_status("Scanning for heart rate devices...");

        let connector = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = advertisements.recv() => match result {
                        Ok(adv) => {
                            let device = DiscoveredDevice::from_advertisement(&adv);
                            if !is_heart_rate_capable(&device.records, device.name.as_deref()) {
                                continue;
                            }
                            if connector.claim_match() {
                                connector.handle_match(device).await;
                            }
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::debug!("Scanner skipped {} advertisements", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
        });
        self.lock().scan_task = Some(task);
        Ok(())
    }

    /// Scanning -> Stopping, exactly once per scan.
    fn claim_match(&self) -> bool {
        let mut inner = self.lock();
        if inner.state == ConnectorState::Scanning {
            inner.state = ConnectorState::Stopping;
            true
        } else {
            false
        }
    }

    async fn handle_match(self: &Arc<Self>, device: DiscoveredDevice) {
        if let Err(e) = self.central.stop_scan().await {
            log::warn!("Failed to stop scan: {}", e);
        }
        log::info!(
            "Found heart rate device {} ({})",
            device.display_name(),
            device.address
        );
        self.emit(ConnectorEvent::DeviceDiscovered(device.clone()));

        if let Some(data) = manufacturer_data(&device.records).filter(|d| d.len() > 1) {
            self.emit(ConnectorEvent::AdvertisedHeartRate(u16::from(data[1])));
        }

        if let Err(e) = self.connect_and_subscribe(&device).await {
            log::warn!("Could not connect to {}: {}", device.display_name(), e);
        }
    }

    /// Scan again `delay` after the device goes away or a connect attempt
    /// fails. Runs until shutdown.
    pub fn spawn_rescan(self: &Arc<Self>, delay: Duration) -> JoinHandle<()> {
        let connector = Arc::clone(self);
        let mut events = self.events();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    result = events.recv() => match result {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::debug!("Rescan watcher skipped {} events", skipped);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.recv() => break,
                };
                if !matches!(
                    event,
                    ConnectorEvent::Disconnected | ConnectorEvent::ConnectFailed(_)
                ) {
                    continue;
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.recv() => break,
                }
                if connector.state() != ConnectorState::Disconnected {
                    continue;
                }
                if let Err(e) = connector.start_scan().await {
                    log::warn!("Rescan failed: {}", e);
                }
            }
        })
    }

    /// Stop a running scan without connecting.
    pub async fn stop_scan(&self) -> Result<(), ConnectError> {
        let task = {
            let mut inner = self.lock();
            if inner.state == ConnectorState::Scanning {
                inner.state = ConnectorState::Idle;
                inner.scan_task.take()
            } else {
                None
            }
        };
        if let Some(task) = task {
            task.abort();
        }
        self.central.stop_scan().await.map_err(ConnectError::from)
    }

    /// Connect to `device` and subscribe to heart rate measurements.
    ///
    /// Only one attempt runs at a time; a call made while another is in
    /// flight fails immediately with `AlreadyConnecting`.
    pub async fn connect_and_subscribe(
        self: &Arc<Self>,
        device: &DiscoveredDevice,
    ) -> Result<DeviceHandle, ConnectError> {
        if self
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!(
                "Dropping connect request for {}: attempt in flight",
                device.display_name()
            );
            return Err(ConnectError::AlreadyConnecting);
        }
        let _guard = ConnectingGuard(&self.connecting);

        match self.establish(device).await {
            Ok(handle) => {
                self.set_status(format!("Connected to {}", handle.name));
                Ok(handle)
            }
            Err(e) => {
                self.set_state(ConnectorState::Disconnected);
                self.set_status(e.to_string());
                self.emit(ConnectorEvent::ConnectFailed(e.clone()));
                Err(e)
            }
        }
    }

    async fn establish(self: &Arc<Self>, device: &DiscoveredDevice) -> Result<DeviceHandle, ConnectError> {
        if self.central.is_scanning() {
            if let Err(e) = self.central.stop_scan().await {
                log::warn!("Failed to stop scan before connecting: {}", e);
            }
        }
        if self.release_link().await.is_some() {
            self.feed(DeviceFeed::Disconnected);
            self.emit(ConnectorEvent::Disconnected);
        }

        self.set_state(ConnectorState::Connecting);
        self.set_status(format!("Connecting to {}...", device.display_name()));
        tokio::time::sleep(self.config.connect_settle).await;

        // One budget covers the link, service discovery and the subscription.
        let deadline = Instant::now() + self.config.connect_timeout;
        let connection: Arc<dyn BleConnection> =
            match tokio::time::timeout_at(deadline, self.central.connect(&device.address)).await {
                Err(_) => return Err(ConnectError::ConnectTimeout),
                Ok(Err(BleError::Timeout)) => return Err(ConnectError::ConnectTimeout),
                Ok(Err(e)) => return Err(ConnectError::ConnectFailed(e.to_string())),
                Ok(Ok(conn)) => Arc::from(conn),
            };

        let subscribed =
            match tokio::time::timeout_at(deadline, subscribe_measurements(connection.as_ref()))
                .await
            {
                Err(_) => Err(ConnectError::ConnectTimeout),
                Ok(result) => result,
            };
        let notifications = match subscribed {
            Ok(rx) => rx,
            Err(e) => {
                if let Err(close_err) = connection.disconnect().await {
                    log::debug!("Disconnect after failed subscribe: {}", close_err);
                }
                return Err(e);
            }
        };

        let handle = DeviceHandle {
            address: device.address.clone(),
            name: device.display_name().to_string(),
        };
        {
            let mut inner = self.lock();
            inner.connection = Some(connection);
            inner.device = Some(handle.clone());
            inner.state = ConnectorState::Subscribed;
        }

        if let Err(e) = self.store.set(LAST_CONNECTED_DEVICE_KEY, &handle.identifier()) {
            log::warn!("Failed to remember {}: {}", handle.name, e);
        }

        self.feed(DeviceFeed::Connected(handle.clone()));
        self.emit(ConnectorEvent::Connected(handle.clone()));

        let pump = self.spawn_pump(handle.address.clone(), notifications);
        {
            let mut inner = self.lock();
            if inner.device.as_ref() == Some(&handle) {
                inner.pump_task = Some(pump);
            }
        }

        Ok(handle)
    }

    fn spawn_pump(
        self: &Arc<Self>,
        address: BleAddress,
        mut notifications: mpsc::Receiver<Vec<u8>>,
    ) -> JoinHandle<()> {
        let connector = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    payload = notifications.recv() => match payload {
                        Some(payload) => connector.handle_notification(&payload),
                        None => {
                            connector.handle_link_lost(&address);
                            break;
                        }
                    },
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    fn handle_notification(&self, payload: &[u8]) {
        match parse_heart_rate(payload) {
            Ok(bpm) => {
                self.feed(DeviceFeed::Reading(Sample::new(bpm)));
                self.emit(ConnectorEvent::HeartRate(bpm));
            }
            Err(e) => log::debug!("Dropping measurement: {}", e),
        }
    }

    fn handle_link_lost(&self, address: &BleAddress) {
        let lost = {
            let mut inner = self.lock();
            if inner.device.as_ref().map(|d| &d.address) == Some(address) {
                inner.device = None;
                inner.connection = None;
                inner.pump_task = None;
                inner.state = ConnectorState::Disconnected;
                true
            } else {
                false
            }
        };
        if lost {
            self.set_status("Device disconnected");
            self.feed(DeviceFeed::Disconnected);
            self.emit(ConnectorEvent::Disconnected);
        }
    }

    /// Tear down the current link, returning the device it belonged to.
    async fn release_link(&self) -> Option<DeviceHandle> {
        let (connection, pump, device) = {
            let mut inner = self.lock();
            (
                inner.connection.take(),
                inner.pump_task.take(),
                inner.device.take(),
            )
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        if let Some(connection) = connection {
            if let Err(e) = connection.disconnect().await {
                log::warn!("Error while disconnecting: {}", e);
            }
        }
        device
    }

    /// Drop the subscription and the link to the current device, if any.
    pub async fn disconnect(&self) {
        if let Some(device) = self.release_link().await {
            self.set_state(ConnectorState::Disconnected);
            self.set_status(format!("Disconnected from {}", device.name));
            self.feed(DeviceFeed::Disconnected);
            self.emit(ConnectorEvent::Disconnected);
        }
    }

    /// Stop every background task, the scan and the link.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let scan_task = self.lock().scan_task.take();
        if let Some(task) = scan_task {
            task.abort();
        }
        if self.central.is_scanning() {
            if let Err(e) = self.central.stop_scan().await {
                log::warn!("Failed to stop scan during shutdown: {}", e);
            }
        }
        self.disconnect().await;
        self.set_state(ConnectorState::Idle);
    }
}

async fn subscribe_measurements(
    connection: &dyn BleConnection,
) -> Result<mpsc::Receiver<Vec<u8>>, ConnectError> {
    let services = connection
        .discover_services()
        .await
        .map_err(|e| ConnectError::ConnectFailed(e.to_string()))?;
    let service = services
        .iter()
        .find(|s| s.uuid == HEART_RATE_SERVICE_UUID)
        .ok_or(ConnectError::ServiceNotFound)?;
    if !service.characteristics.contains(&HEART_RATE_MEASUREMENT_UUID) {
        return Err(ConnectError::CharacteristicNotFound);
    }
    connection
        .subscribe(HEART_RATE_SERVICE_UUID, HEART_RATE_MEASUREMENT_UUID)
        .await
        .map_err(|e| ConnectError::ConnectFailed(e.to_string()))
}
