//! TelemetryOrchestrator: wires the device feed into the session and the
//! session into the uplink
//!
//! Two long-running tasks: one drains the device feed in order (reset on
//! connect, append on reading), the other ticks at a fixed period and hands
//! the latest sample to the uplink without waiting for the send to finish.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::device::{DeviceConnector, DeviceFeed};
use crate::host::{KeepAlive, NotificationSink, StatusNotification};
use crate::session::{SessionAggregator, SessionSnapshot};
use crate::uplink::StreamUplink;

const STATUS_TITLE: &str = "Heart rate monitor";

/// Everything the pipeline shares, built once by the caller.
pub struct PipelineContext {
    pub session: Arc<SessionAggregator>,
    pub connector: Arc<DeviceConnector>,
    /// `None` runs the pipeline without uploading.
    pub uplink: Option<Arc<StreamUplink>>,
    pub notifier: Arc<dyn NotificationSink>,
    pub keep_alive: Arc<dyn KeepAlive>,
}

/// Point-in-time view of the whole pipeline.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub running: bool,
    pub status_message: String,
    pub uplink_connected: bool,
    pub endpoint: Option<String>,
    pub device_name: Option<String>,
    pub last_update: Option<DateTime<Local>>,
}

struct OrchestratorState {
    running: bool,
    background: bool,
    device_name: Option<String>,
    last_update: Option<DateTime<Local>>,
    in_flight: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct TelemetryOrchestrator {
    ctx: PipelineContext,
    tick_interval: Duration,
    state: Mutex<OrchestratorState>,
    snapshots_tx: broadcast::Sender<SessionSnapshot>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TelemetryOrchestrator {
    pub fn new(ctx: PipelineContext, tick_interval: Duration) -> Arc<Self> {
        let (snapshots_tx, _) = broadcast::channel(16);
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            ctx,
            tick_interval,
            state: Mutex::new(OrchestratorState {
                running: false,
                background: false,
                device_name: None,
                last_update: None,
                in_flight: None,
                tasks: Vec::new(),
            }),
            snapshots_tx,
            shutdown_tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Session snapshots, published on ticks that found new data.
    pub fn snapshots(&self) -> broadcast::Receiver<SessionSnapshot> {
        self.snapshots_tx.subscribe()
    }

    /// Start draining `feed` and ticking.
    pub fn start(self: &Arc<Self>, feed: mpsc::UnboundedReceiver<DeviceFeed>) {
        let mut state = self.lock();
        if state.running {
            log::debug!("Orchestrator already running");
            return;
        }
        state.running = true;
        state.tasks.push(self.spawn_ingest(feed));
        state.tasks.push(self.spawn_ticker());
        log::info!("Telemetry pipeline started");
    }

    fn spawn_ingest(self: &Arc<Self>, mut feed: mpsc::UnboundedReceiver<DeviceFeed>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = feed.recv() => match item {
                        Some(item) => orchestrator.ingest(item),
                        None => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    fn spawn_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        orchestrator.tick();
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    /// Apply one item from the device feed.
    pub fn ingest(&self, item: DeviceFeed) {
        match item {
            DeviceFeed::Connected(handle) => {
                log::info!("New device {}, starting a fresh session", handle.name);
                self.ctx.session.reset();
                self.lock().device_name = Some(handle.name);
            }
            DeviceFeed::Reading(sample) => {
                self.ctx.session.push(sample);
                self.lock().last_update = Some(sample.timestamp);
            }
            DeviceFeed::Disconnected => {
                log::info!("Device gone, session kept until the next connection");
                self.lock().device_name = None;
            }
        }
    }

    /// One period of work. Returns whether a send was dispatched.
    ///
    /// At most one send is in flight; while it is pending, ticks skip the
    /// uplink and the next tick sends whatever is latest by then.
    pub fn tick(self: &Arc<Self>) -> bool {
        let session = &self.ctx.session;
        if session.consume_dirty_flag() {
            let _ = self.snapshots_tx.send(session.snapshot());
        }

        let background = self.lock().background;
        if background {
            self.publish_status();
        }

        let (Some(uplink), Some(latest)) = (self.ctx.uplink.as_ref(), session.latest()) else {
            return false;
        };

        let mut state = self.lock();
        if state
            .in_flight
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            log::debug!("Previous send still pending, skipping tick");
            return false;
        }
        let uplink = Arc::clone(uplink);
        let device_name = state.device_name.clone().unwrap_or_default();
        state.in_flight = Some(tokio::spawn(async move {
            if let Err(e) = uplink.send(&latest, &device_name).await {
                log::debug!("Sample {} bpm not sent: {}", latest.heart_rate, e);
            }
        }));
        true
    }

    fn publish_status(&self) {
        let snapshot = self.ctx.session.snapshot();
        if snapshot.is_empty() {
            return;
        }
        self.ctx.notifier.heart_rate_status(&StatusNotification {
            title: STATUS_TITLE.to_string(),
            current: snapshot.latest,
            average: snapshot.average,
            min: snapshot.min,
            max: snapshot.max,
            duration: snapshot.duration(),
        });
    }

    /// Switch periodic status notifications and the keep-alive on or off.
    pub fn set_background(&self, enabled: bool) {
        {
            let mut state = self.lock();
            if state.background == enabled {
                return;
            }
            state.background = enabled;
        }
        if enabled {
            self.ctx.keep_alive.start();
        } else {
            self.ctx.keep_alive.stop();
            self.ctx.notifier.cancel_status();
        }
    }

    pub fn is_background(&self) -> bool {
        self.lock().background
    }

    pub fn status(&self) -> PipelineStatus {
        let (running, last_update) = {
            let state = self.lock();
            (state.running, state.last_update)
        };
        PipelineStatus {
            running,
            status_message: self.ctx.connector.status(),
            uplink_connected: self
                .ctx
                .uplink
                .as_ref()
                .is_some_and(|uplink| uplink.is_connected()),
            endpoint: self.ctx.uplink.as_ref().map(|uplink| uplink.endpoint().to_string()),
            device_name: self.ctx.connector.current_device().map(|device| device.name),
            last_update,
        }
    }

    /// Stop the tasks, dispose the uplink and release the device.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let (tasks, in_flight, background) = {
            let mut state = self.lock();
            state.running = false;
            let background = std::mem::replace(&mut state.background, false);
            (std::mem::take(&mut state.tasks), state.in_flight.take(), background)
        };

        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    log::warn!("Pipeline task ended abnormally: {}", e);
                }
            }
        }
        if let Some(task) = in_flight {
            task.abort();
        }

        if let Some(uplink) = &self.ctx.uplink {
            uplink.dispose().await;
        }
        self.ctx.connector.shutdown().await;

        if background {
            self.ctx.keep_alive.stop();
            self.ctx.notifier.cancel_status();
        }
        log::info!("Telemetry pipeline stopped");
    }
}
