//! Reconnection backoff and alert thresholds

/// Exponential backoff between reconnection attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 5_000,
            max_delay_ms: 60_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay in milliseconds before the `attempt`-th consecutive retry
    /// (1-based): the initial delay, doubled per further failure, capped.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let doublings = attempt.saturating_sub(1).min(32);
        self.initial_delay_ms
            .saturating_mul(1u64 << doublings)
            .min(self.max_delay_ms)
    }

    /// Whether the user should hear about attempt number `attempt`.
    pub fn should_alert(attempt: u32) -> bool {
        attempt == 3 || attempt == 5 || (attempt > 0 && attempt % 10 == 0)
    }
}
