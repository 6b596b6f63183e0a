//! Linear reconnect backoff.

use std::time::Duration;

/// Reconnect schedule: attempt N waits `min(N * step, cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub step: Duration,
    pub cap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            step: Duration::from_secs(2),
            cap: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.cap)
    }

    /// Whether another attempt may be scheduled after `attempts` so far.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
