//! types/heartrate.rs
//!
//! Defines the Sample struct: one heart-rate reading as it enters the session.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// A timestamped heart-rate reading. Immutable once created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Local>,
    pub heart_rate: u16,
}

impl Sample {
    pub fn new(heart_rate: u16) -> Self {
        Self {
            heart_rate,
            timestamp: Local::now(),
        }
    }

    pub fn at(heart_rate: u16, timestamp: DateTime<Local>) -> Self {
        Self {
            heart_rate,
            timestamp,
        }
    }
}
