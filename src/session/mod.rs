//! session/mod.rs
//!
//! The rolling heart-rate session shared between the BLE ingest path, the
//! uplink tick and any UI poller.
//!
//! All state (window, statistics, start time, dirty flag) lives behind one
//! mutex, so a reader either sees the state before an insert or after it,
//! never a mix of the two.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Local};
use serde::{Deserialize, Serialize};

use crate::types::Sample;

/// Default number of samples kept in the window.
pub const DEFAULT_SESSION_CAPACITY: usize = 100;

/// A read-only copy of the session at one instant.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Samples in arrival order, oldest first.
    pub samples: Vec<Sample>,
    pub latest: u16,
    pub min: u16,
    pub max: u16,
    /// Arithmetic mean over the current window.
    pub average: f64,
    pub started_at: Option<DateTime<Local>>,
    pub has_unflushed_update: bool,
}

impl SessionSnapshot {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Time since the first sample of the session.
    pub fn duration_at(&self, now: DateTime<Local>) -> Duration {
        match self.started_at {
            Some(start) if !self.samples.is_empty() => now - start,
            _ => Duration::zero(),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration_at(Local::now())
    }
}

#[derive(Default)]
struct SessionState {
    samples: VecDeque<Sample>,
    latest: u16,
    min: u16,
    max: u16,
    average: f64,
    started_at: Option<DateTime<Local>>,
    dirty: bool,
}

impl SessionState {
    fn recompute(&mut self) {
        let mut min = u16::MAX;
        let mut max = 0;
        let mut sum: u64 = 0;
        for sample in &self.samples {
            min = min.min(sample.heart_rate);
            max = max.max(sample.heart_rate);
            sum += u64::from(sample.heart_rate);
        }
        if self.samples.is_empty() {
            self.min = 0;
            self.max = 0;
            self.average = 0.0;
        } else {
            self.min = min;
            self.max = max;
            self.average = sum as f64 / self.samples.len() as f64;
        }
    }
}

/// Thread-safe, ring-bounded store of samples with running statistics.
pub struct SessionAggregator {
    capacity: usize,
    state: Mutex<SessionState>,
}

impl Default for SessionAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_CAPACITY)
    }
}

impl SessionAggregator {
    /// Create an empty session keeping at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(SessionState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a reading timestamped now.
    pub fn add_sample(&self, heart_rate: u16) {
        self.push(Sample::new(heart_rate));
    }

    /// Append a reading, evicting the oldest sample once the window is full.
    pub fn push(&self, sample: Sample) {
        let mut state = self.lock();
        if state.samples.is_empty() && state.started_at.is_none() {
            state.started_at = Some(sample.timestamp);
        }
        state.samples.push_back(sample);
        while state.samples.len() > self.capacity {
            state.samples.pop_front();
        }
        state.latest = sample.heart_rate;
        state.recompute();
        state.dirty = true;
    }

    /// Clear the window, statistics, start time and dirty flag.
    pub fn reset(&self) {
        *self.lock() = SessionState::default();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock();
        SessionSnapshot {
            samples: state.samples.iter().copied().collect(),
            latest: state.latest,
            min: state.min,
            max: state.max,
            average: state.average,
            started_at: state.started_at,
            has_unflushed_update: state.dirty,
        }
    }

    /// Latest reading, or `None` for an empty session.
    pub fn latest(&self) -> Option<Sample> {
        self.lock().samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().samples.is_empty()
    }

    /// Read and clear the dirty flag in one step.
    pub fn consume_dirty_flag(&self) -> bool {
        std::mem::replace(&mut self.lock().dirty, false)
    }
}
