//! Tracker configuration, loaded from `DOCWATCH_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use docwatch_core::error::CoreError;

use crate::backoff::BackoffPolicy;
use crate::heartbeat::HeartbeatConfig;

/// Tracker configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// WebSocket base URL of the document server.
    pub ws_url: String,
    /// HTTP base URL of the document server (poll + classification).
    pub api_url: String,
    /// Bearer token sent with HTTP requests, if any.
    pub api_token: Option<String>,
    /// Server-side idle timeout requested for each document socket.
    pub ws_timeout_secs: u64,
    pub backoff: BackoffPolicy,
    pub heartbeat: HeartbeatConfig,
    /// How long a connection stays open after a terminal status, to let
    /// trailing frames drain.
    pub terminal_grace: Duration,
    /// Interval of the fallback HTTP poller.
    pub poll_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8003".into(),
            api_url: "http://localhost:8003".into(),
            api_token: None,
            ws_timeout_secs: 300,
            backoff: BackoffPolicy::default(),
            heartbeat: HeartbeatConfig::default(),
            terminal_grace: Duration::from_millis(5000),
            poll_interval: Duration::from_secs(3),
        }
    }
}

impl TrackerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                            | Default                 |
    /// |------------------------------------|-------------------------|
    /// | `DOCWATCH_WS_URL`                  | `ws://localhost:8003`   |
    /// | `DOCWATCH_API_URL`                 | `http://localhost:8003` |
    /// | `DOCWATCH_TOKEN`                   | unset                   |
    /// | `DOCWATCH_WS_TIMEOUT_SECS`         | `300`                   |
    /// | `DOCWATCH_RECONNECT_BASE_MS`       | `2000`                  |
    /// | `DOCWATCH_RECONNECT_MULTIPLIER`    | `1.5`                   |
    /// | `DOCWATCH_RECONNECT_MAX_ATTEMPTS`  | `5`                     |
    /// | `DOCWATCH_HEARTBEAT_INTERVAL_SECS` | `30`                    |
    /// | `DOCWATCH_HEARTBEAT_MAX_MISSED`    | `3`                     |
    /// | `DOCWATCH_TERMINAL_GRACE_MS`       | `5000`                  |
    /// | `DOCWATCH_POLL_INTERVAL_SECS`      | `3`                     |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads variables through
    /// `lookup`, so tests do not have to mutate the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let ws_url = lookup("DOCWATCH_WS_URL").unwrap_or(defaults.ws_url);
        let api_url = lookup("DOCWATCH_API_URL").unwrap_or(defaults.api_url);
        let api_token = lookup("DOCWATCH_TOKEN").filter(|t| !t.trim().is_empty());

        let ws_timeout_secs = parse_or(
            &lookup,
            "DOCWATCH_WS_TIMEOUT_SECS",
            defaults.ws_timeout_secs,
        )?;

        let base_ms: u64 = parse_or(&lookup, "DOCWATCH_RECONNECT_BASE_MS", 2000)?;
        let multiplier: f64 = parse_or(
            &lookup,
            "DOCWATCH_RECONNECT_MULTIPLIER",
            defaults.backoff.multiplier,
        )?;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(CoreError::Validation(format!(
                "DOCWATCH_RECONNECT_MULTIPLIER must be a finite number >= 1.0, got {multiplier}"
            )));
        }
        let max_attempts = parse_or(
            &lookup,
            "DOCWATCH_RECONNECT_MAX_ATTEMPTS",
            defaults.backoff.max_attempts,
        )?;

        let heartbeat_secs: u64 = parse_or(&lookup, "DOCWATCH_HEARTBEAT_INTERVAL_SECS", 30)?;
        if heartbeat_secs == 0 {
            return Err(CoreError::Validation(
                "DOCWATCH_HEARTBEAT_INTERVAL_SECS must be greater than zero".into(),
            ));
        }
        let max_missed = parse_or(
            &lookup,
            "DOCWATCH_HEARTBEAT_MAX_MISSED",
            defaults.heartbeat.max_missed,
        )?;

        let grace_ms: u64 = parse_or(&lookup, "DOCWATCH_TERMINAL_GRACE_MS", 5000)?;

        let poll_secs: u64 = parse_or(&lookup, "DOCWATCH_POLL_INTERVAL_SECS", 3)?;
        if poll_secs == 0 {
            return Err(CoreError::Validation(
                "DOCWATCH_POLL_INTERVAL_SECS must be greater than zero".into(),
            ));
        }

        Ok(Self {
            ws_url,
            api_url,
            api_token,
            ws_timeout_secs,
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(base_ms),
                multiplier,
                max_attempts,
            },
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(heartbeat_secs),
                max_missed,
            },
            terminal_grace: Duration::from_millis(grace_ms),
            poll_interval: Duration::from_secs(poll_secs),
        })
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, CoreError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CoreError::Validation(format!("{key} has an invalid value: {raw:?}"))),
        None => Ok(default),
    }
}
