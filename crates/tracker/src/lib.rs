//! Real-time status tracking for documents in a processing pipeline.
//!
//! Maintains one WebSocket connection per tracked document with heartbeat
//! liveness checks and exponential-backoff reconnects, merges push updates
//! with optional HTTP poll snapshots into a monotonic progress record, and
//! tears each connection down shortly after its document finishes.

pub mod api;
pub mod backoff;
pub mod callbacks;
pub mod classify;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod messages;
pub mod poller;
pub mod reconciler;
pub mod registry;
pub mod tracker;

pub use callbacks::{ChannelCallbacks, NoopCallbacks, StatusCallbacks, SubscriptionEvent};
pub use config::TrackerConfig;
pub use error::TrackerError;
pub use tracker::Tracker;
