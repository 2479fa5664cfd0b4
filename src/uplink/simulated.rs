//! In-process telemetry endpoint
//!
//! A scripted stand-in for the remote server: it can refuse connections,
//! stall sends or closes, push frames, close or reset every live
//! connection, and records every text frame it receives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::transport::{InboundMessage, UplinkConnector, UplinkSocket};
use super::UplinkError;

struct LiveLink {
    id: u64,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    open: Arc<AtomicBool>,
}

struct EndpointState {
    accepting: bool,
    stall_sends: bool,
    stall_close: bool,
    close_on_open: usize,
    connect_attempts: usize,
    connect_count: usize,
    next_id: u64,
    last_url: Option<String>,
    frames: Vec<String>,
    live: Vec<LiveLink>,
}

/// A simulated endpoint. Clones share the same server.
#[derive(Clone)]
pub struct SimEndpoint {
    shared: Arc<Mutex<EndpointState>>,
}

impl Default for SimEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEndpoint {
    /// An endpoint that accepts connections.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(EndpointState {
                accepting: true,
                stall_sends: false,
                stall_close: false,
                close_on_open: 0,
                connect_attempts: 0,
                connect_count: 0,
                next_id: 0,
                last_url: None,
                frames: Vec::new(),
                live: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EndpointState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.lock().accepting = accepting;
    }

    /// Make every send hang until the caller gives up.
    pub fn set_stall_sends(&self, stall: bool) {
        self.lock().stall_sends = stall;
    }

    /// Make graceful closes hang.
    pub fn set_stall_close(&self, stall: bool) {
        self.lock().stall_close = stall;
    }

    /// Send a Close frame as soon as each of the next `count` connections
    /// is accepted.
    pub fn close_next_on_open(&self, count: usize) {
        self.lock().close_on_open = count;
    }

    /// Text frames received so far, in order.
    pub fn frames(&self) -> Vec<String> {
        self.lock().frames.clone()
    }

    /// Connection attempts, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    /// Connections accepted.
    pub fn connect_count(&self) -> usize {
        self.lock().connect_count
    }

    pub fn open_connections(&self) -> usize {
        self.lock()
            .live
            .iter()
            .filter(|l| l.open.load(Ordering::SeqCst))
            .count()
    }

    pub fn last_url(&self) -> Option<String> {
        self.lock().last_url.clone()
    }

    /// Push a text frame to every live connection.
    pub fn push_text(&self, text: &str) {
        for link in &self.lock().live {
            let _ = link.inbound_tx.send(InboundMessage::Text(text.to_string()));
        }
    }

    /// Send a Close frame on every live connection and forget them.
    pub fn close_all(&self) {
        for link in self.lock().live.drain(..) {
            link.open.store(false, Ordering::SeqCst);
            let _ = link.inbound_tx.send(InboundMessage::Close);
        }
    }

    /// Drop every live connection without a Close frame.
    pub fn reset_all(&self) {
        for link in self.lock().live.drain(..) {
            link.open.store(false, Ordering::SeqCst);
        }
    }

    fn forget(&self, id: u64) {
        self.lock().live.retain(|l| l.id != id);
    }
}

#[async_trait]
impl UplinkConnector for SimEndpoint {
    async fn connect(&self, url: &str) -> Result<Box<dyn UplinkSocket>, UplinkError> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        state.last_url = Some(url.to_string());
        if !state.accepting {
            return Err(UplinkError::TransportError("Connection refused".to_string()));
        }
        state.connect_count += 1;
        state.next_id += 1;

        let id = state.next_id;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        if state.close_on_open > 0 {
            state.close_on_open -= 1;
            open.store(false, Ordering::SeqCst);
            let _ = inbound_tx.send(InboundMessage::Close);
        }
        state.live.push(LiveLink {
            id,
            inbound_tx,
            open: Arc::clone(&open),
        });

        Ok(Box::new(SimSocket {
            id,
            endpoint: self.clone(),
            open,
            inbound: tokio::sync::Mutex::new(inbound_rx),
        }))
    }
}

/// Client side of a simulated connection.
pub struct SimSocket {
    id: u64,
    endpoint: SimEndpoint,
    open: Arc<AtomicBool>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
}

#[async_trait]
impl UplinkSocket for SimSocket {
    async fn send_text(&self, text: String) -> Result<(), UplinkError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(UplinkError::TransportError("Connection reset".to_string()));
        }
        let stall = self.endpoint.lock().stall_sends;
        if stall {
            std::future::pending::<()>().await;
        }
        self.endpoint.lock().frames.push(text);
        Ok(())
    }

    async fn recv(&self) -> Result<InboundMessage, UplinkError> {
        match self.inbound.lock().await.recv().await {
            Some(message) => Ok(message),
            None => Err(UplinkError::TransportError("Connection reset".to_string())),
        }
    }

    async fn close(&self) -> Result<(), UplinkError> {
        let stall = self.endpoint.lock().stall_close;
        if stall {
            std::future::pending::<()>().await;
        }
        self.open.store(false, Ordering::SeqCst);
        self.endpoint.forget(self.id);
        Ok(())
    }
}
