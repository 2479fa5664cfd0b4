//! StreamUplink: persistent connection, best-effort send, reconnection
//!
//! The connection object has one writer at a time: either the send path
//! while no reconnection is running, or the reconnection routine. The
//! attempt counter and current backoff belong to the reconnection routine
//! alone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::backoff::ReconnectPolicy;
use super::frame::{resolve_endpoint, TelemetryFrame};
use super::transport::{InboundMessage, UplinkConnector, UplinkSocket};
use super::{UplinkError, UplinkState};
use crate::host::NotificationSink;
use crate::types::Sample;

/// Endpoint used when the configured one is unusable.
pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8080/ws";

const ALERT_TITLE: &str = "Connection lost";

#[derive(Clone, Debug)]
pub struct UplinkSettings {
    pub endpoint: String,
    /// Auth token attached to every frame.
    pub token: String,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    /// Bound on the graceful close during dispose.
    pub close_timeout: Duration,
    pub policy: ReconnectPolicy,
}

impl Default for UplinkSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            token: String::new(),
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(2),
            policy: ReconnectPolicy::default(),
        }
    }
}

struct Link {
    state: UplinkState,
    socket: Option<Arc<dyn UplinkSocket>>,
    /// Bumped for every connection opened, so a stale receive loop cannot
    /// tear down its successor.
    generation: u64,
    receive_task: Option<JoinHandle<()>>,
}

struct Reconnect {
    in_flight: bool,
    attempts: u32,
    backoff_ms: u64,
    task: Option<JoinHandle<()>>,
}

pub struct StreamUplink {
    connector: Arc<dyn UplinkConnector>,
    settings: UplinkSettings,
    notifier: Arc<dyn NotificationSink>,
    link: Mutex<Link>,
    reconnect: Mutex<Reconnect>,
    disposed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl StreamUplink {
    /// Create a disconnected uplink. An unusable endpoint URL is replaced
    /// by [`DEFAULT_ENDPOINT`].
    pub fn new(
        connector: Arc<dyn UplinkConnector>,
        mut settings: UplinkSettings,
        notifier: Arc<dyn NotificationSink>,
    ) -> Arc<Self> {
        settings.endpoint = resolve_endpoint(&settings.endpoint, DEFAULT_ENDPOINT);
        let (shutdown_tx, _) = broadcast::channel(1);
        let initial_backoff = settings.policy.initial_delay_ms;

        Arc::new(Self {
            connector,
            settings,
            notifier,
            link: Mutex::new(Link {
                state: UplinkState::Disconnected,
                socket: None,
                generation: 0,
                receive_task: None,
            }),
            reconnect: Mutex::new(Reconnect {
                in_flight: false,
                attempts: 0,
                backoff_ms: initial_backoff,
                task: None,
            }),
            disposed: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reconnect_state(&self) -> MutexGuard<'_, Reconnect> {
        self.reconnect.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn endpoint(&self) -> &str {
        &self.settings.endpoint
    }

    pub fn state(&self) -> UplinkState {
        self.link().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == UplinkState::Open
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnect_state().in_flight
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_state().attempts
    }

    pub fn current_backoff_ms(&self) -> u64 {
        self.reconnect_state().backoff_ms
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Open the connection. On failure the reconnection routine takes over.
    pub async fn connect(self: &Arc<Self>) -> Result<(), UplinkError> {
        let result = self.open_connection().await;
        if let Err(e) = &result {
            if *e != UplinkError::NotConnected {
                self.trigger_reconnect();
            }
        }
        result
    }

    /// Send one sample as a text frame.
    ///
    /// Best-effort: if no connection can be had right now the sample is
    /// dropped and an error returned. Transport failures hand over to the
    /// reconnection routine.
    pub async fn send(self: &Arc<Self>, sample: &Sample, device_name: &str) -> Result<(), UplinkError> {
        if self.is_disposed() {
            return Err(UplinkError::Disposed);
        }
        if self.is_reconnecting() {
            log::debug!("Reconnection in progress, dropping {} bpm", sample.heart_rate);
            return Err(UplinkError::NotConnected);
        }

        let (socket, generation) = match self.open_socket() {
            Some(open) => open,
            None => {
                log::info!("Uplink not connected, connecting to {}", self.endpoint());
                if let Err(e) = self.connect().await {
                    log::warn!("Dropping {} bpm: {}", sample.heart_rate, e);
                    return Err(e);
                }
                self.open_socket().ok_or(UplinkError::NotConnected)?
            }
        };

        let text = TelemetryFrame::new(sample, device_name, &self.settings.token).to_json()?;

        let mut shutdown = self.shutdown_tx.subscribe();
        if self.is_disposed() {
            return Err(UplinkError::Disposed);
        }
        let result = tokio::select! {
            sent = tokio::time::timeout(self.settings.send_timeout, socket.send_text(text)) => {
                match sent {
                    Ok(result) => result,
                    Err(_) => Err(UplinkError::SendTimeout),
                }
            }
            _ = shutdown.recv() => return Err(UplinkError::Disposed),
        };

        if let Err(e) = &result {
            log::warn!("Send failed: {}", e);
            self.mark_disconnected(generation, true);
            self.trigger_reconnect();
        }
        result
    }

    fn open_socket(&self) -> Option<(Arc<dyn UplinkSocket>, u64)> {
        let link = self.link();
        match (&link.state, &link.socket) {
            (UplinkState::Open, Some(socket)) => Some((Arc::clone(socket), link.generation)),
            _ => None,
        }
    }

    /// Single connection attempt. Returns `NotConnected` without trying if
    /// another attempt is already underway.
    async fn open_connection(self: &Arc<Self>) -> Result<(), UplinkError> {
        if self.is_disposed() {
            return Err(UplinkError::Disposed);
        }
        {
            let mut link = self.link();
            match link.state {
                UplinkState::Open => return Ok(()),
                UplinkState::Connecting | UplinkState::Closing => {
                    return Err(UplinkError::NotConnected)
                }
                UplinkState::Disconnected => link.state = UplinkState::Connecting,
            }
        }

        let mut shutdown = self.shutdown_tx.subscribe();
        let result = if self.is_disposed() {
            Err(UplinkError::Disposed)
        } else {
            tokio::select! {
                opened = tokio::time::timeout(
                    self.settings.connect_timeout,
                    self.connector.connect(&self.settings.endpoint),
                ) => match opened {
                    Ok(result) => result,
                    Err(_) => Err(UplinkError::TransportError("Connect timed out".to_string())),
                },
                _ = shutdown.recv() => Err(UplinkError::Disposed),
            }
        };

        let socket: Arc<dyn UplinkSocket> = match result {
            Ok(socket) => Arc::from(socket),
            Err(e) => {
                self.set_state_if(UplinkState::Connecting, UplinkState::Disconnected);
                log::warn!("Failed to connect to {}: {}", self.endpoint(), e);
                return Err(e);
            }
        };

        let installed = {
            let mut link = self.link();
            if self.is_disposed() || link.state != UplinkState::Connecting {
                None
            } else {
                link.generation += 1;
                link.state = UplinkState::Open;
                link.socket = Some(Arc::clone(&socket));
                Some((link.generation, link.receive_task.take()))
            }
        };
        let Some((generation, stale_receiver)) = installed else {
            let _ = tokio::time::timeout(self.settings.close_timeout, socket.close()).await;
            return Err(UplinkError::Disposed);
        };
        if let Some(task) = stale_receiver {
            task.abort();
        }

        let receiver = self.spawn_receiver(socket, generation);
        {
            let mut link = self.link();
            if link.generation == generation {
                link.receive_task = Some(receiver);
            }
        }

        log::info!("Connected to {}", self.endpoint());
        Ok(())
    }

    fn set_state_if(&self, expected: UplinkState, next: UplinkState) {
        let mut link = self.link();
        if link.state == expected {
            link.state = next;
        }
    }

    /// Drop the connection of `generation` if it is still the current one.
    fn mark_disconnected(&self, generation: u64, abort_receiver: bool) -> bool {
        let receiver = {
            let mut link = self.link();
            if link.generation != generation || link.state != UplinkState::Open {
                return false;
            }
            link.state = UplinkState::Disconnected;
            link.socket = None;
            link.receive_task.take()
        };
        if let Some(task) = receiver {
            if abort_receiver {
                task.abort();
            }
        }
        true
    }

    fn spawn_receiver(self: &Arc<Self>, socket: Arc<dyn UplinkSocket>, generation: u64) -> JoinHandle<()> {
        let uplink = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match socket.recv().await {
                    Ok(InboundMessage::Text(text)) => log::info!("Endpoint message: {}", text),
                    Ok(InboundMessage::Binary(data)) => {
                        log::debug!("Ignoring {} byte binary frame", data.len())
                    }
                    Ok(InboundMessage::Close) => {
                        log::info!("Endpoint closed the connection");
                        let _ = tokio::time::timeout(uplink.settings.close_timeout, socket.close()).await;
                        break;
                    }
                    Err(e) => {
                        log::warn!("Receive failed: {}", e);
                        break;
                    }
                }
            }
            if uplink.mark_disconnected(generation, false) {
                uplink.trigger_reconnect();
            }
        })
    }

    /// Start the reconnection routine unless it is already running.
    fn trigger_reconnect(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }
        let mut reconnect = self.reconnect_state();
        if reconnect.in_flight {
            log::debug!("Reconnection already in progress");
            return;
        }
        reconnect.in_flight = true;
        let uplink = Arc::clone(self);
        reconnect.task = Some(tokio::spawn(async move { uplink.reconnect_loop().await }));
    }

    async fn reconnect_loop(self: Arc<Self>) {
        loop {
            if self.is_disposed() {
                break;
            }
            let (attempt, delay_ms) = {
                let mut reconnect = self.reconnect_state();
                reconnect.attempts += 1;
                reconnect.backoff_ms = self.settings.policy.delay_ms(reconnect.attempts);
                (reconnect.attempts, reconnect.backoff_ms)
            };
            log::info!("Reconnect attempt {}, waiting {} ms", attempt, delay_ms);

            if ReconnectPolicy::should_alert(attempt) {
                self.notifier.reconnection_alert(
                    ALERT_TITLE,
                    &format!("Server connection lost, reconnect attempt {}.", attempt),
                    attempt,
                );
            }

            let mut shutdown = self.shutdown_tx.subscribe();
            if self.is_disposed() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                _ = shutdown.recv() => break,
            }

            match self.open_connection().await {
                Ok(()) => {
                    {
                        let mut reconnect = self.reconnect_state();
                        reconnect.attempts = 0;
                        reconnect.backoff_ms = self.settings.policy.initial_delay_ms;
                        reconnect.in_flight = false;
                        reconnect.task = None;
                    }
                    log::info!("Reconnected after {} attempt(s)", attempt);
                    // A failure seen before the flag cleared was not acted on.
                    if !self.is_connected() {
                        self.trigger_reconnect();
                    }
                    return;
                }
                Err(UplinkError::Disposed) => break,
                Err(e) => log::warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }

        let mut reconnect = self.reconnect_state();
        reconnect.in_flight = false;
        reconnect.task = None;
    }

    /// Stop everything and close the connection. Never fails; close errors
    /// are logged.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());

        let reconnect_task = {
            let mut reconnect = self.reconnect_state();
            reconnect.in_flight = false;
            reconnect.task.take()
        };
        if let Some(task) = reconnect_task {
            task.abort();
        }

        let (socket, receiver) = {
            let mut link = self.link();
            link.state = UplinkState::Closing;
            (link.socket.take(), link.receive_task.take())
        };
        if let Some(task) = receiver {
            task.abort();
        }

        if let Some(socket) = socket {
            match tokio::time::timeout(self.settings.close_timeout, socket.close()).await {
                Ok(Ok(())) => log::debug!("Uplink closed cleanly"),
                Ok(Err(e)) => log::warn!("{}", UplinkError::DisposalError(e.to_string())),
                Err(_) => log::warn!(
                    "{}",
                    UplinkError::DisposalError("close timed out".to_string())
                ),
            }
        }

        self.link().state = UplinkState::Disconnected;
        log::info!("Uplink to {} disposed", self.endpoint());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RecordingNotificationSink;
    use crate::uplink::simulated::SimEndpoint;

    fn uplink_with(endpoint: &SimEndpoint) -> (Arc<StreamUplink>, Arc<RecordingNotificationSink>) {
        let sink = Arc::new(RecordingNotificationSink::new());
        let settings = UplinkSettings {
            endpoint: "ws://sim.local/ws".to_string(),
            token: "secret".to_string(),
            ..Default::default()
        };
        let uplink = StreamUplink::new(Arc::new(endpoint.clone()), settings, sink.clone());
        (uplink, sink)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_connects_lazily_and_delivers_frame() {
        let endpoint = SimEndpoint::new();
        let (uplink, _) = uplink_with(&endpoint);
        assert_eq!(uplink.state(), UplinkState::Disconnected);

        uplink.send(&Sample::new(72), "HRM Pro").await.unwrap();
        assert_eq!(uplink.state(), UplinkState::Open);
        assert_eq!(endpoint.connect_count(), 1);
        assert_eq!(endpoint.last_url().as_deref(), Some("ws://sim.local/ws"));

        uplink.send(&Sample::new(74), "HRM Pro").await.unwrap();
        assert_eq!(endpoint.connect_count(), 1);

        let frames = endpoint.frames();
        assert_eq!(frames.len(), 2);
        let frame: TelemetryFrame = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame.heart_rate, 72);
        assert_eq!(frame.device_name, "HRM Pro");
        assert_eq!(frame.token, "secret");
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_endpoint_falls_back() {
        let endpoint = SimEndpoint::new();
        let settings = UplinkSettings {
            endpoint: "https://not-a-stream.example".to_string(),
            ..Default::default()
        };
        let uplink = StreamUplink::new(
            Arc::new(endpoint.clone()),
            settings,
            Arc::new(RecordingNotificationSink::new()),
        );
        assert_eq!(uplink.endpoint(), DEFAULT_ENDPOINT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sequence_while_endpoint_down() {
        let endpoint = SimEndpoint::new();
        endpoint.set_accepting(false);
        let (uplink, _) = uplink_with(&endpoint);

        assert!(uplink.send(&Sample::new(70), "strap").await.is_err());
        settle().await;
        assert!(uplink.is_reconnecting());

        let mut observed = vec![uplink.current_backoff_ms()];
        for _ in 0..5 {
            let wait = uplink.current_backoff_ms();
            tokio::time::sleep(Duration::from_millis(wait)).await;
            settle().await;
            observed.push(uplink.current_backoff_ms());
        }
        assert_eq!(observed, vec![5000, 10000, 20000, 40000, 60000, 60000]);
        assert_eq!(uplink.reconnect_attempts(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alert_fires_once_at_third_attempt() {
        let endpoint = SimEndpoint::new();
        endpoint.set_accepting(false);
        let (uplink, sink) = uplink_with(&endpoint);

        assert!(uplink.send(&Sample::new(70), "strap").await.is_err());
        settle().await;
        assert_eq!(uplink.reconnect_attempts(), 1);

        // Attempt 2 begins once the first 5 s wait has failed.
        tokio::time::sleep(Duration::from_millis(5000)).await;
        settle().await;
        assert_eq!(uplink.reconnect_attempts(), 2);
        assert!(sink.alerts().is_empty());

        tokio::time::sleep(Duration::from_millis(10000)).await;
        settle().await;
        assert_eq!(uplink.reconnect_attempts(), 3);
        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].attempt, 3);
        assert_eq!(alerts[0].title, ALERT_TITLE);

        endpoint.set_accepting(true);
        tokio::time::sleep(Duration::from_millis(20000)).await;
        settle().await;
        assert_eq!(uplink.state(), UplinkState::Open);
        assert_eq!(uplink.reconnect_attempts(), 0);
        assert_eq!(uplink.current_backoff_ms(), 5000);
        assert!(!uplink.is_reconnecting());
        assert_eq!(sink.alerts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_reconnection_routine() {
        let endpoint = SimEndpoint::new();
        endpoint.set_accepting(false);
        let (uplink, _) = uplink_with(&endpoint);

        assert!(uplink.send(&Sample::new(70), "strap").await.is_err());
        settle().await;
        let attempts_before = endpoint.connect_attempts();

        for _ in 0..10 {
            assert_eq!(
                uplink.send(&Sample::new(71), "strap").await,
                Err(UplinkError::NotConnected)
            );
            uplink.trigger_reconnect();
        }
        assert_eq!(endpoint.connect_attempts(), attempts_before);
        assert_eq!(uplink.reconnect_attempts(), 1);

        tokio::time::sleep(Duration::from_millis(5000)).await;
        settle().await;
        assert_eq!(endpoint.connect_attempts(), attempts_before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_timeout_triggers_reconnect() {
        let endpoint = SimEndpoint::new();
        let (uplink, _) = uplink_with(&endpoint);
        uplink.connect().await.unwrap();

        endpoint.set_stall_sends(true);
        let started = tokio::time::Instant::now();
        let result = uplink.send(&Sample::new(70), "strap").await;
        assert_eq!(result, Err(UplinkError::SendTimeout));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(uplink.state(), UplinkState::Disconnected);
        assert!(uplink.is_reconnecting());

        endpoint.set_stall_sends(false);
        tokio::time::sleep(Duration::from_millis(5000)).await;
        settle().await;
        assert_eq!(uplink.state(), UplinkState::Open);
        assert_eq!(endpoint.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_close_triggers_reconnect() {
        let endpoint = SimEndpoint::new();
        let (uplink, _) = uplink_with(&endpoint);
        uplink.connect().await.unwrap();

        endpoint.push_text("welcome");
        endpoint.close_all();
        settle().await;
        assert_eq!(uplink.state(), UplinkState::Disconnected);
        assert!(uplink.is_reconnecting());

        tokio::time::sleep(Duration::from_millis(5000)).await;
        settle().await;
        assert_eq!(uplink.state(), UplinkState::Open);
        assert_eq!(endpoint.connect_count(), 2);
        assert_eq!(uplink.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_right_after_reconnect_is_not_lost() {
        let endpoint = SimEndpoint::new();
        endpoint.set_accepting(false);
        let (uplink, _) = uplink_with(&endpoint);
        assert!(uplink.connect().await.is_err());
        settle().await;
        assert!(uplink.is_reconnecting());

        endpoint.set_accepting(true);
        endpoint.close_next_on_open(1);
        tokio::time::sleep(Duration::from_millis(5000)).await;
        settle().await;
        assert_eq!(endpoint.connect_count(), 1);
        assert_eq!(uplink.state(), UplinkState::Disconnected);
        assert!(uplink.is_reconnecting());

        tokio::time::sleep(Duration::from_millis(5000)).await;
        settle().await;
        assert_eq!(uplink.state(), UplinkState::Open);
        assert_eq!(endpoint.connect_count(), 2);
        assert_eq!(endpoint.open_connections(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_racing_reconnect_recovers_on_worker_threads() {
        let endpoint = SimEndpoint::new();
        endpoint.set_accepting(false);
        let settings = UplinkSettings {
            endpoint: "ws://sim.local/ws".to_string(),
            policy: ReconnectPolicy {
                initial_delay_ms: 5,
                max_delay_ms: 20,
            },
            ..Default::default()
        };
        let uplink = StreamUplink::new(
            Arc::new(endpoint.clone()),
            settings,
            Arc::new(RecordingNotificationSink::new()),
        );
        assert!(uplink.connect().await.is_err());

        endpoint.close_next_on_open(20);
        endpoint.set_accepting(true);

        let recovered = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if endpoint.connect_count() > 20 && uplink.is_connected() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(recovered.is_ok(), "uplink stayed down without a send");
        assert_eq!(endpoint.open_connections(), 1);
        uplink.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_error_triggers_reconnect() {
        let endpoint = SimEndpoint::new();
        let (uplink, _) = uplink_with(&endpoint);
        uplink.connect().await.unwrap();

        endpoint.reset_all();
        settle().await;
        assert!(uplink.is_reconnecting());
        assert_eq!(uplink.reconnect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_pending_reconnect() {
        let endpoint = SimEndpoint::new();
        endpoint.set_accepting(false);
        let (uplink, _) = uplink_with(&endpoint);

        assert!(uplink.send(&Sample::new(70), "strap").await.is_err());
        settle().await;
        assert!(uplink.is_reconnecting());
        let attempts = endpoint.connect_attempts();

        uplink.dispose().await;
        assert!(!uplink.is_reconnecting());
        assert_eq!(uplink.state(), UplinkState::Disconnected);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(endpoint.connect_attempts(), attempts);
        assert_eq!(
            uplink.send(&Sample::new(70), "strap").await,
            Err(UplinkError::Disposed)
        );
        // A second dispose is a no-op.
        uplink.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_bounds_graceful_close() {
        let endpoint = SimEndpoint::new();
        let (uplink, _) = uplink_with(&endpoint);
        uplink.connect().await.unwrap();
        endpoint.set_stall_close(true);

        let started = tokio::time::Instant::now();
        uplink.dispose().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
        assert_eq!(uplink.state(), UplinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_interrupts_stalled_send() {
        let endpoint = SimEndpoint::new();
        let (uplink, _) = uplink_with(&endpoint);
        uplink.connect().await.unwrap();
        endpoint.set_stall_sends(true);

        let sending = {
            let uplink = Arc::clone(&uplink);
            tokio::spawn(async move { uplink.send(&Sample::new(70), "strap").await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        uplink.dispose().await;
        assert_eq!(sending.await.unwrap(), Err(UplinkError::Disposed));
    }
}
