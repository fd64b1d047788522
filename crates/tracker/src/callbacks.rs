//! Subscriber-facing callbacks.
//!
//! Callbacks run synchronously on the task driving the
//! [`Tracker`](crate::tracker::Tracker), never concurrently with each
//! other, and never after the subscription they belong to was torn down.

use docwatch_core::types::EntityId;
use tokio::sync::mpsc;

use crate::error::TrackerError;
use crate::messages::StatusUpdate;

/// Receives lifecycle and status notifications for one subscription.
///
/// Every method defaults to a no-op.
pub trait StatusCallbacks: Send {
    /// A status update arrived. Push updates are forwarded as received;
    /// poll snapshots only when they changed the record or finished the
    /// document.
    fn on_status(&mut self, _update: &StatusUpdate) {}

    /// The reconciled progress value changed.
    fn on_progress(&mut self, _progress: f64) {}

    /// The server greeted the socket.
    fn on_connected(&mut self, _message: &str) {}

    /// Tracking stopped and needs caller action.
    fn on_error(&mut self, _error: &TrackerError) {}

    /// The transport dropped; a reconnect may follow.
    fn on_closed(&mut self) {}
}

/// Callbacks that ignore everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl StatusCallbacks for NoopCallbacks {}

/// A callback invocation captured as a value.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Status(StatusUpdate),
    Progress(f64),
    Connected(String),
    Error(TrackerError),
    Closed,
}

/// Forwards every callback onto an unbounded channel, tagged with the
/// document it belongs to.
///
/// Several subscriptions can share one sender, which lets a single loop
/// consume events for many documents.
#[derive(Debug, Clone)]
pub struct ChannelCallbacks {
    entity_id: EntityId,
    tx: mpsc::UnboundedSender<(EntityId, SubscriptionEvent)>,
}

impl ChannelCallbacks {
    pub fn new(
        entity_id: impl Into<EntityId>,
        tx: mpsc::UnboundedSender<(EntityId, SubscriptionEvent)>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            tx,
        }
    }

    fn forward(&self, event: SubscriptionEvent) {
        // A closed receiver only means nobody is listening any more.
        let _ = self.tx.send((self.entity_id.clone(), event));
    }
}

impl StatusCallbacks for ChannelCallbacks {
    fn on_status(&mut self, update: &StatusUpdate) {
        self.forward(SubscriptionEvent::Status(update.clone()));
    }

    fn on_progress(&mut self, progress: f64) {
        self.forward(SubscriptionEvent::Progress(progress));
    }

    fn on_connected(&mut self, message: &str) {
        self.forward(SubscriptionEvent::Connected(message.to_string()));
    }

    fn on_error(&mut self, error: &TrackerError) {
        self.forward(SubscriptionEvent::Error(error.clone()));
    }

    fn on_closed(&mut self) {
        self.forward(SubscriptionEvent::Closed);
    }
}
