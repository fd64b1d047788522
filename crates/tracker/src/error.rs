//! Tracker and transport error types.

use docwatch_core::types::EntityId;

/// Errors that can occur while tracking a document.
///
/// Only [`TrackerError::RetriesExhausted`] ever reaches subscriber
/// callbacks; the other variants are absorbed and logged where they occur.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrackerError {
    /// Transport-level failure. Retried via backoff.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed or unknown frame. Logged and ignored.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Every scheduled reconnect failed. The caller must re-subscribe.
    #[error("Gave up reconnecting to document {entity_id} after {attempts} attempts")]
    RetriesExhausted { entity_id: EntityId, attempts: u32 },

    /// A poll request failed. Retried on the poller's next tick.
    #[error("Poll error: {0}")]
    Poll(String),
}

/// Errors raised by a [`Transport`](crate::client::Transport)
/// implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to establish the connection.
    #[error("Connection error: {0}")]
    Connect(String),

    /// Failed to write a frame to an established connection.
    #[error("Send error: {0}")]
    Send(String),

    /// Failed to read from an established connection.
    #[error("Receive error: {0}")]
    Receive(String),
}

impl From<TransportError> for TrackerError {
    fn from(err: TransportError) -> Self {
        TrackerError::Connection(err.to_string())
    }
}
