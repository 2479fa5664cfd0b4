//! Telemetry wire format
//!
//! Each sample goes out as one JSON text frame:
//! `{"HeartRate":72,"Timestamp":"2024-05-01T10:00:00.123+02:00","DeviceName":"HRM Pro","Token":"..."}`.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use super::UplinkError;
use crate::types::Sample;

const STREAMING_SCHEMES: &[&str] = &["ws://", "wss://"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TelemetryFrame {
    pub heart_rate: u16,
    pub timestamp: DateTime<Local>,
    pub device_name: String,
    pub token: String,
}

impl TelemetryFrame {
    pub fn new(sample: &Sample, device_name: &str, token: &str) -> Self {
        Self {
            heart_rate: sample.heart_rate,
            timestamp: sample.timestamp,
            device_name: device_name.to_string(),
            token: token.to_string(),
        }
    }

    pub fn to_json(&self) -> Result<String, UplinkError> {
        serde_json::to_string(self).map_err(|e| UplinkError::Serialization(e.to_string()))
    }
}

/// Check that `url` uses a streaming scheme.
pub fn validate_endpoint(url: &str) -> Result<(), UplinkError> {
    let lowered = url.trim().to_ascii_lowercase();
    let has_host = STREAMING_SCHEMES
        .iter()
        .find_map(|scheme| lowered.strip_prefix(scheme))
        .map(|rest| !rest.is_empty());
    match has_host {
        Some(true) => Ok(()),
        _ => Err(UplinkError::InvalidEndpoint(url.to_string())),
    }
}

/// Use `candidate` if it is a valid streaming URL, otherwise keep `fallback`.
pub fn resolve_endpoint(candidate: &str, fallback: &str) -> String {
    match validate_endpoint(candidate) {
        Ok(()) => candidate.trim().to_string(),
        Err(_) => {
            log::warn!(
                "Ignoring endpoint {:?}, keeping {}",
                candidate,
                fallback
            );
            fallback.to_string()
        }
    }
}
