//! Host collaborators
//!
//! The pipeline talks to the surrounding application through three narrow
//! interfaces: a notification sink, a string key-value store and a
//! keep-alive switch. Logging and file-backed implementations are provided
//! for the headless runner; recording implementations back the tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::Duration;
use thiserror::Error;

/// Key under which the connector records the last connected peripheral.
pub const LAST_CONNECTED_DEVICE_KEY: &str = "LastConnectedDevice";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Periodic heart-rate summary shown while running in the background.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusNotification {
    pub title: String,
    pub current: u16,
    pub average: f64,
    pub min: u16,
    pub max: u16,
    pub duration: Duration,
}

impl StatusNotification {
    /// One-line summary: current and average.
    pub fn summary(&self) -> String {
        format!(
            "Current: {} bpm    Avg: {:.0} bpm",
            self.current, self.average
        )
    }

    /// Multi-line body with duration and range.
    pub fn details(&self) -> String {
        let secs = self.duration.num_seconds().max(0);
        format!(
            "Current: {} bpm\nDuration: {:02}:{:02}:{:02}\nMin: {} bpm | Max: {} bpm",
            self.current,
            secs / 3600,
            (secs / 60) % 60,
            secs % 60,
            self.min,
            self.max
        )
    }
}

/// Surface for user-visible notifications.
pub trait NotificationSink: Send + Sync {
    /// Degraded-connectivity alert raised by the uplink's reconnection routine.
    fn reconnection_alert(&self, title: &str, message: &str, attempt: u32);

    /// Show or refresh the ongoing heart-rate status.
    fn heart_rate_status(&self, status: &StatusNotification);

    /// Remove the ongoing heart-rate status.
    fn cancel_status(&self);
}

/// String key-value persistence.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Asks the host to keep the process runnable while in the background.
pub trait KeepAlive: Send + Sync {
    fn start(&self);
    fn stop(&self);
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn reconnection_alert(&self, title: &str, message: &str, attempt: u32) {
        log::warn!("{} (attempt {}): {}", title, attempt, message);
    }

    fn heart_rate_status(&self, status: &StatusNotification) {
        log::info!("{}: {}", status.title, status.details().replace('\n', ", "));
    }

    fn cancel_status(&self) {
        log::debug!("Heart rate status cleared");
    }
}

/// A keep-alive that only records the request in the log. A headless
/// process has nothing else to do to stay alive.
#[derive(Debug, Default)]
pub struct NoopKeepAlive;

impl KeepAlive for NoopKeepAlive {
    fn start(&self) {
        log::info!("Keep-alive requested");
    }

    fn stop(&self) {
        log::info!("Keep-alive released");
    }
}

/// In-memory key-value store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Key-value store persisted as a single pretty-printed JSON object.
///
/// The whole map is rewritten on every `set`.
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl JsonFileStore {
    /// Open the store at `path`, loading existing values if the file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let data = std::fs::read(&path).map_err(|e| StoreError::IoError(e.to_string()))?;
            serde_json::from_slice(&data)
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, values: &HashMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::IoError(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(values)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        std::fs::write(&self.path, json).map_err(|e| StoreError::IoError(e.to_string()))
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        self.write(&values)
    }
}

/// A delivered reconnection alert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedAlert {
    pub title: String,
    pub message: String,
    pub attempt: u32,
}

/// Notification sink that keeps everything it is given, for inspection.
#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    alerts: Mutex<Vec<RecordedAlert>>,
    statuses: Mutex<Vec<StatusNotification>>,
    cancellations: Mutex<usize>,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<RecordedAlert> {
        self.alerts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn statuses(&self) -> Vec<StatusNotification> {
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn cancellations(&self) -> usize {
        *self.cancellations.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NotificationSink for RecordingNotificationSink {
    fn reconnection_alert(&self, title: &str, message: &str, attempt: u32) {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedAlert {
                title: title.to_string(),
                message: message.to_string(),
                attempt,
            });
    }

    fn heart_rate_status(&self, status: &StatusNotification) {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(status.clone());
    }

    fn cancel_status(&self) {
        *self.cancellations.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }
}

/// Keep-alive that counts start/stop requests.
#[derive(Debug, Default)]
pub struct RecordingKeepAlive {
    active: Mutex<bool>,
    starts: Mutex<usize>,
}

impl RecordingKeepAlive {
    pub fn is_active(&self) -> bool {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn starts(&self) -> usize {
        *self.starts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeepAlive for RecordingKeepAlive {
    fn start(&self) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = true;
        *self.starts.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn stop(&self) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }
}
