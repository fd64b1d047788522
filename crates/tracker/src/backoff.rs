//! Exponential-backoff policy for document WebSocket reconnects.
//!
//! The policy is a pure function of the attempt number. It has no delay
//! ceiling; the schedule is bounded by [`BackoffPolicy::max_attempts`]
//! instead, after which the connection gives up and reports
//! [`TrackerError::RetriesExhausted`](crate::error::TrackerError::RetriesExhausted).

use std::time::Duration;

/// Tunable parameters for the reconnect schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first reconnection attempt.
    pub base_delay: Duration,
    /// Factor by which the delay grows after each failed attempt.
    pub multiplier: f64,
    /// Number of reconnects scheduled before giving up.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(2000),
            multiplier: 1.5,
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait before reconnect number `attempt` (0-based).
    ///
    /// Returns `None` once `attempt` reaches `max_attempts`. The delay is
    /// `base_delay * multiplier^attempt`, rounded to whole milliseconds.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let base_ms = self.base_delay.as_millis() as f64;
        let factor = self.multiplier.powi(attempt as i32);
        Some(Duration::from_millis((base_ms * factor).round() as u64))
    }

    /// The full reconnect schedule, one delay per allowed attempt.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts).filter_map(|attempt| self.delay_for(attempt))
    }
}
