//! Application-level liveness probing for one document connection.
//!
//! The document server speaks plain-text `ping`/`pong` sentinels instead of
//! WebSocket control frames, so silent failures (no close event, no
//! responses) have to be detected by counting unanswered probes.

use std::time::Duration;

/// Plain-text liveness probe. Sent by either side.
pub const PROBE: &str = "ping";

/// Plain-text answer to [`PROBE`].
pub const PROBE_RESPONSE: &str = "pong";

/// Interval between heartbeat probes (in seconds).
const DEFAULT_INTERVAL_SECS: u64 = 30;

/// Unanswered probes tolerated before the connection is declared dead.
const DEFAULT_MAX_MISSED: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            max_missed: DEFAULT_MAX_MISSED,
        }
    }
}

/// What the connection should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Send a [`PROBE`] and keep going.
    Probe,
    /// Too many probes went unanswered; force-close the transport.
    Dead { missed: u32 },
}

/// Missed-probe counter for one open connection.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    max_missed: u32,
    missed: u32,
}

impl HeartbeatMonitor {
    pub fn new(config: &HeartbeatConfig) -> Self {
        Self {
            max_missed: config.max_missed,
            missed: 0,
        }
    }

    /// Called once per interval while the connection is open.
    ///
    /// If the counter already reached the limit the peer has missed
    /// `max_missed` consecutive probes and the verdict is
    /// [`HeartbeatVerdict::Dead`]. Otherwise a probe is due and counted as
    /// outstanding.
    pub fn on_tick(&mut self) -> HeartbeatVerdict {
        if self.missed >= self.max_missed {
            return HeartbeatVerdict::Dead {
                missed: self.missed,
            };
        }
        self.missed += 1;
        HeartbeatVerdict::Probe
    }

    /// A [`PROBE_RESPONSE`] arrived.
    pub fn on_response(&mut self) {
        self.missed = 0;
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }
}
