//! Headless heart-rate relay.
//!
//! Scans for the first heart-rate peripheral, streams its readings to the
//! configured endpoint and logs a periodic summary until Ctrl-C.
//!
//! Usage:
//!   cargo run --bin heartlink -- --simulate --endpoint ws://127.0.0.1:8080/ws
//!   cargo run --features ble-central --bin heartlink -- --token-file token.txt

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::LevelFilter;
use tokio::task::JoinHandle;

use heartlink::ble::simulated::{SimBleNetwork, SimPeripheral, SimPeripheralConfig};
use heartlink::ble::transport::{AdapterState, BleCentral};
use heartlink::host::{JsonFileStore, KeyValueStore, LogNotificationSink, NoopKeepAlive};
use heartlink::uplink::WebSocketConnector;
use heartlink::{
    DeviceConnector, PipelineContext, SessionAggregator, StreamUplink,
    TelemetryConfig, TelemetryOrchestrator,
};

/// Relay a BLE heart-rate strap to a WebSocket endpoint.
#[derive(Parser)]
#[command(name = "heartlink", about = "Stream BLE heart-rate readings to a telemetry endpoint")]
struct Cli {
    /// JSON config file; missing fields and a missing file use defaults.
    #[arg(long, short, default_value = "heartlink.json")]
    config: PathBuf,

    /// Telemetry endpoint (ws:// or wss://).
    #[arg(long, env = "HEARTLINK_ENDPOINT")]
    endpoint: Option<String>,

    /// Auth token sent with every reading.
    #[arg(long, env = "HEARTLINK_TOKEN")]
    token: Option<String>,

    /// Read the auth token from this file.
    #[arg(long)]
    token_file: Option<PathBuf>,

    /// Where to remember the last connected device.
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Use a simulated heart-rate strap instead of a Bluetooth adapter.
    #[arg(long)]
    simulate: bool,

    /// Collect readings without uploading them.
    #[arg(long)]
    no_upload: bool,

    /// Emit periodic status notifications.
    #[arg(long)]
    background: bool,

    /// Seconds between summary log lines.
    #[arg(long, default_value_t = 10)]
    summary_secs: u64,

    /// Debug logging for heartlink.
    #[arg(long, short)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if verbose {
        builder.filter_module("heartlink", LevelFilter::Debug);
    }
    builder.init();
}

fn apply_overrides(config: &mut TelemetryConfig, cli: &Cli) {
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(token) = &cli.token {
        config.token = Some(token.clone());
    }
    if let Some(path) = &cli.token_file {
        config.token_file = Some(path.clone());
    }
    if let Some(path) = &cli.state_file {
        config.state_file = path.clone();
    }
    if cli.no_upload {
        config.upload = false;
    }
    if cli.background {
        config.background = true;
    }
}

/// Advertise once a second and report a slowly wandering heart rate.
fn drive_simulated_strap(strap: SimPeripheral) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        let mut step: u32 = 0;
        loop {
            interval.tick().await;
            strap.advertise();
            let swing = (step % 40) as i32;
            let bpm = 68 + if swing < 20 { swing } else { 40 - swing };
            strap.notify_bpm(bpm as u8);
            step = step.wrapping_add(1);
        }
    })
}

#[cfg(feature = "ble-central")]
async fn hardware_central() -> anyhow::Result<Arc<dyn BleCentral>> {
    let central = heartlink::ble::btleplug_central::BtleplugCentral::new().await?;
    Ok(Arc::new(central))
}

#[cfg(not(feature = "ble-central"))]
async fn hardware_central() -> anyhow::Result<Arc<dyn BleCentral>> {
    anyhow::bail!("built without Bluetooth support; use --simulate or build with --features ble-central")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = TelemetryConfig::load_or_default(&cli.config)?;
    apply_overrides(&mut config, &cli);

    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::open(&config.state_file)?);
    let notifier = Arc::new(LogNotificationSink);

    let mut background_tasks: Vec<JoinHandle<()>> = Vec::new();
    let central: Arc<dyn BleCentral> = if cli.simulate {
        let network = SimBleNetwork::new();
        let central = Arc::new(network.create_central());
        let strap = network.add_peripheral(SimPeripheralConfig::heart_rate_strap("Simulated HR Strap"));
        background_tasks.push(drive_simulated_strap(strap));
        central as Arc<dyn BleCentral>
    } else {
        hardware_central().await?
    };

    let (connector, feed) = DeviceConnector::new(central, store, config.connector_config());
    if let Some(last) = connector.last_connected_device() {
        log::info!("Last connected device: {}", last);
    }

    let uplink = if config.upload {
        Some(StreamUplink::new(
            Arc::new(WebSocketConnector),
            config.uplink_settings()?,
            notifier.clone(),
        ))
    } else {
        log::info!("Upload disabled");
        None
    };

    let session = Arc::new(SessionAggregator::new(config.session_capacity));
    let orchestrator = TelemetryOrchestrator::new(
        PipelineContext {
            session: Arc::clone(&session),
            connector: Arc::clone(&connector),
            uplink: uplink.clone(),
            notifier,
            keep_alive: Arc::new(NoopKeepAlive),
        },
        config.tick_interval(),
    );
    orchestrator.start(feed);
    orchestrator.set_background(config.background);

    if let Some(uplink) = &uplink {
        if let Err(e) = uplink.connect().await {
            log::warn!("Endpoint {} not reachable yet: {}", uplink.endpoint(), e);
        }
    }

    match connector.check_adapter().await {
        AdapterState::Ready => {}
        other => anyhow::bail!("Bluetooth adapter not usable: {:?}", other),
    }
    connector.start_scan().await?;

    background_tasks.push(connector.spawn_rescan(Duration::from_secs(2)));

    {
        let orchestrator = Arc::clone(&orchestrator);
        let session = Arc::clone(&session);
        let period = Duration::from_secs(cli.summary_secs.max(1));
        background_tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let status = orchestrator.status();
                let snapshot = session.snapshot();
                if snapshot.is_empty() {
                    log::info!("{} (no readings yet)", status.status_message);
                    continue;
                }
                log::info!(
                    "{} | {} bpm (avg {:.0}, min {}, max {}) | uplink {}",
                    status.device_name.as_deref().unwrap_or("no device"),
                    snapshot.latest,
                    snapshot.average,
                    snapshot.min,
                    snapshot.max,
                    if status.uplink_connected { "connected" } else { "down" },
                );
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");

    for task in background_tasks {
        task.abort();
    }
    orchestrator.shutdown().await;

    let snapshot = session.snapshot();
    if !snapshot.is_empty() {
        log::info!(
            "Session: {} readings over {}s, avg {:.1} bpm",
            snapshot.len(),
            snapshot.duration().num_seconds(),
            snapshot.average
        );
    }
    Ok(())
}
