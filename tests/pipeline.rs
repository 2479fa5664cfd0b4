//! End-to-end pipeline tests
//!
//! Simulated strap -> DeviceConnector -> TelemetryOrchestrator ->
//! StreamUplink -> simulated endpoint, all in virtual time.
//!
//! Run with:
//!   cargo test --test pipeline

use std::sync::Arc;
use std::time::Duration;

use heartlink::ble::simulated::{SimBleNetwork, SimPeripheral, SimPeripheralConfig};
use heartlink::device::{ConnectorConfig, ConnectorState};
use heartlink::host::{
    JsonFileStore, KeyValueStore, MemoryStore, RecordingKeepAlive, RecordingNotificationSink,
    LAST_CONNECTED_DEVICE_KEY,
};
use heartlink::uplink::simulated::SimEndpoint;
use heartlink::uplink::{TelemetryFrame, UplinkSettings, UplinkState};
use heartlink::{
    DeviceConnector, PipelineContext, SessionAggregator, StreamUplink, TelemetryOrchestrator,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Pipeline {
    network: Arc<SimBleNetwork>,
    endpoint: SimEndpoint,
    sink: Arc<RecordingNotificationSink>,
    orchestrator: Arc<TelemetryOrchestrator>,
}

impl Pipeline {
    fn connector(&self) -> &Arc<DeviceConnector> {
        &self.orchestrator.context().connector
    }

    fn session(&self) -> &Arc<SessionAggregator> {
        &self.orchestrator.context().session
    }

    fn uplink(&self) -> &Arc<StreamUplink> {
        self.orchestrator.context().uplink.as_ref().unwrap()
    }
}

fn build_pipeline(store: Arc<dyn KeyValueStore>) -> Pipeline {
    let network = SimBleNetwork::new();
    let central = Arc::new(network.create_central());
    let (connector, feed) = DeviceConnector::new(central, store, ConnectorConfig::default());

    let endpoint = SimEndpoint::new();
    let sink = Arc::new(RecordingNotificationSink::new());
    let uplink = StreamUplink::new(
        Arc::new(endpoint.clone()),
        UplinkSettings {
            endpoint: "wss://telemetry.test/ws".to_string(),
            token: "t0k3n".to_string(),
            ..Default::default()
        },
        sink.clone(),
    );

    let orchestrator = TelemetryOrchestrator::new(
        PipelineContext {
            session: Arc::new(SessionAggregator::default()),
            connector,
            uplink: Some(uplink),
            notifier: sink.clone(),
            keep_alive: Arc::new(RecordingKeepAlive::default()),
        },
        Duration::from_secs(1),
    );
    orchestrator.start(feed);

    Pipeline {
        network,
        endpoint,
        sink,
        orchestrator,
    }
}

async fn wait_for_state(pipeline: &Pipeline, state: ConnectorState) {
    for _ in 0..200 {
        if pipeline.connector().state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "connector stuck in {:?}, expected {:?}",
        pipeline.connector().state(),
        state
    );
}

async fn connect_strap(pipeline: &Pipeline, name: &str) -> SimPeripheral {
    let strap = pipeline
        .network
        .add_peripheral(SimPeripheralConfig::heart_rate_strap(name));
    pipeline.connector().start_scan().await.unwrap();
    strap.advertise();
    wait_for_state(pipeline, ConnectorState::Subscribed).await;
    strap
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

fn last_frame(endpoint: &SimEndpoint) -> TelemetryFrame {
    let frames = endpoint.frames();
    serde_json::from_str(frames.last().expect("no frames received")).unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_readings_flow_from_strap_to_endpoint() {
    let pipeline = build_pipeline(Arc::new(MemoryStore::new()));
    let strap = connect_strap(&pipeline, "HRM Pro").await;

    for bpm in [60, 62, 65, 70, 68] {
        strap.notify_bpm(bpm);
        settle().await;
    }

    let snapshot = pipeline.session().snapshot();
    assert_eq!(snapshot.latest, 68);
    assert_eq!(snapshot.min, 60);
    assert_eq!(snapshot.max, 70);
    assert_eq!(snapshot.average, 65.0);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let frame = last_frame(&pipeline.endpoint);
    assert_eq!(frame.heart_rate, 68);
    assert_eq!(frame.device_name, "HRM Pro");
    assert_eq!(frame.token, "t0k3n");

    let status = pipeline.orchestrator.status();
    assert!(status.running);
    assert!(status.uplink_connected);
    assert_eq!(status.device_name.as_deref(), Some("HRM Pro"));
    assert_eq!(status.endpoint.as_deref(), Some("wss://telemetry.test/ws"));
}

#[tokio::test(start_paused = true)]
async fn test_new_device_starts_fresh_session() {
    let pipeline = build_pipeline(Arc::new(MemoryStore::new()));
    let first = connect_strap(&pipeline, "Old Strap").await;
    first.notify_bpm(120);
    first.notify_bpm(125);
    settle().await;
    assert_eq!(pipeline.session().len(), 2);

    first.drop_links();
    wait_for_state(&pipeline, ConnectorState::Disconnected).await;
    // Readings survive a lost link until another device connects.
    assert_eq!(pipeline.session().len(), 2);

    let second = connect_strap(&pipeline, "New Strap").await;
    settle().await;
    assert_eq!(pipeline.session().len(), 0);

    second.notify_bpm(64);
    settle().await;
    let snapshot = pipeline.session().snapshot();
    assert_eq!((snapshot.latest, snapshot.min, snapshot.max), (64, 64, 64));
}

#[tokio::test(start_paused = true)]
async fn test_endpoint_outage_alerts_once_and_recovers() {
    let pipeline = build_pipeline(Arc::new(MemoryStore::new()));
    pipeline.endpoint.set_accepting(false);
    let strap = connect_strap(&pipeline, "HRM Pro").await;
    strap.notify_bpm(90);
    settle().await;

    // Failures at 0 s, 5 s and 15 s; the third waits 20 s.
    tokio::time::sleep(Duration::from_secs(16)).await;
    let uplink = pipeline.uplink();
    assert_eq!(uplink.reconnect_attempts(), 3);
    let alerts = pipeline.sink.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].attempt, 3);
    assert!(pipeline.endpoint.frames().is_empty());

    // The session keeps going while the uplink is down.
    strap.notify_bpm(95);
    settle().await;
    assert_eq!(pipeline.session().latest().unwrap().heart_rate, 95);

    pipeline.endpoint.set_accepting(true);
    tokio::time::sleep(Duration::from_secs(22)).await;
    assert_eq!(uplink.state(), UplinkState::Open);
    assert_eq!(uplink.reconnect_attempts(), 0);
    assert_eq!(last_frame(&pipeline.endpoint).heart_rate, 95);
    assert_eq!(pipeline.sink.alerts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_releases_device_and_uplink() {
    let pipeline = build_pipeline(Arc::new(MemoryStore::new()));
    let strap = connect_strap(&pipeline, "HRM Pro").await;
    strap.notify_bpm(70);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(pipeline.endpoint.open_connections(), 1);

    pipeline.orchestrator.shutdown().await;

    assert_eq!(strap.subscriber_count(), 0);
    assert_eq!(pipeline.endpoint.open_connections(), 0);
    assert!(pipeline.uplink().is_disposed());
    assert_eq!(pipeline.connector().state(), ConnectorState::Idle);

    let frames_before = pipeline.endpoint.frames().len();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(pipeline.endpoint.frames().len(), frames_before);
}

#[tokio::test(start_paused = true)]
async fn test_last_device_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("state.json");

    let address = {
        let pipeline = build_pipeline(Arc::new(JsonFileStore::open(&state_file).unwrap()));
        let strap = connect_strap(&pipeline, "HRM Pro").await;
        pipeline.orchestrator.shutdown().await;
        strap.address().to_string()
    };

    let reopened = JsonFileStore::open(&state_file).unwrap();
    assert_eq!(reopened.get(LAST_CONNECTED_DEVICE_KEY), Some(address.clone()));

    let pipeline = build_pipeline(Arc::new(reopened));
    assert_eq!(pipeline.connector().last_connected_device(), Some(address));
}
