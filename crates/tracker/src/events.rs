//! Inputs queued for the tracker's control loop.
//!
//! Connection drivers, pollers and grace timers run as separate tasks and
//! never touch tracker state directly. They push a [`TrackerInput`] tagged
//! with the [`Generation`] they were started under, and the control loop
//! discards anything whose generation is no longer current for that
//! document.

use docwatch_core::types::EntityId;

use crate::connection::ConnectionState;
use crate::messages::StatusUpdate;

/// Incarnation number of one subscription's connection.
///
/// Allocated from a registry-wide counter, so a forced replacement for the
/// same document always gets a larger value than the connection it
/// replaces.
pub type Generation = u64;

#[derive(Debug)]
pub(crate) enum TrackerInput {
    Connection(ConnectionEvent),
    Poll(PollEvent),
    /// The grace period after a poll-delivered terminal status elapsed.
    GraceElapsed {
        entity_id: EntityId,
        generation: Generation,
    },
}

#[derive(Debug)]
pub(crate) struct ConnectionEvent {
    pub entity_id: EntityId,
    pub generation: Generation,
    pub kind: ConnectionEventKind,
}

#[derive(Debug)]
pub(crate) enum ConnectionEventKind {
    StateChanged(ConnectionState),
    /// The server greeted the socket.
    Connected { message: String },
    Status(StatusUpdate),
    /// The transport closed without `disconnect()` being called.
    Closed,
    RetriesExhausted { attempts: u32 },
    /// The driver disconnected itself after the terminal grace period.
    Finished,
}

#[derive(Debug)]
pub(crate) struct PollEvent {
    pub entity_id: EntityId,
    pub generation: Generation,
    pub update: StatusUpdate,
}
