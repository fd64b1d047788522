//! The tracker: registry, reconciler and pollers behind one control loop.
//!
//! Connection drivers, pollers and grace timers run as tokio tasks and only
//! talk to the tracker through its input queue. Whoever owns the
//! [`Tracker`] drives it by calling [`Tracker::turn`] (or
//! [`Tracker::run`]); all registry and reconciler mutations, and every
//! subscriber callback, happen on that task.
//!
//! All methods that start connections, pollers or timers spawn tokio tasks
//! and must be called from within a Tokio runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use docwatch_core::types::EntityId;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::callbacks::StatusCallbacks;
use crate::classify::{spawn_classification, Classifier};
use crate::client::Transport;
use crate::config::TrackerConfig;
use crate::connection::{CloseReason, ConnectionSettings, ConnectionState};
use crate::error::TrackerError;
use crate::events::{ConnectionEvent, ConnectionEventKind, Generation, PollEvent, TrackerInput};
use crate::messages::StatusUpdate;
use crate::poller::{Poller, SnapshotSource};
use crate::reconciler::{ProgressRecord, Reconciled, Reconciler, UpdateSource};
use crate::registry::{Registry, SubscriptionHandle};

pub struct Tracker {
    registry: Registry,
    reconciler: Reconciler,
    pollers: HashMap<EntityId, Poller>,
    classifier: Option<Arc<dyn Classifier>>,
    settings: Arc<ConnectionSettings>,
    poll_interval: Duration,
    inputs_tx: mpsc::UnboundedSender<TrackerInput>,
    inputs: mpsc::UnboundedReceiver<TrackerInput>,
}

impl Tracker {
    pub fn new(config: &TrackerConfig, transport: Arc<dyn Transport>) -> Self {
        let (inputs_tx, inputs) = mpsc::unbounded_channel();
        let settings = Arc::new(ConnectionSettings::from(config));

        Self {
            registry: Registry::new(transport, Arc::clone(&settings), inputs_tx.clone()),
            reconciler: Reconciler::new(),
            pollers: HashMap::new(),
            classifier: None,
            settings,
            poll_interval: config.poll_interval,
            inputs_tx,
            inputs,
        }
    }

    /// Trigger `classifier` on the first `completed` status of each
    /// document.
    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    // -- Subscriptions ------------------------------------------------------

    /// Start tracking a document.
    ///
    /// Subscribing to a document that already has a live connection is a
    /// no-op and keeps the original callbacks, unless `force` is set, in
    /// which case the old connection, poller and record are discarded.
    /// A document that already reached a terminal status is always
    /// re-subscribed from scratch.
    pub fn subscribe(
        &mut self,
        entity_id: impl Into<EntityId>,
        callbacks: Box<dyn StatusCallbacks>,
        force: bool,
    ) -> SubscriptionHandle {
        let entity_id = entity_id.into();
        let force = force || self.reconciler.has_ended(&entity_id);

        if force {
            self.stop_polling(&entity_id);
            self.reconciler.forget(&entity_id);
        }

        let handle = self.registry.subscribe(&entity_id, callbacks, force);
        self.reconciler.begin(&entity_id);

        tracing::info!(
            entity_id = %entity_id,
            generation = handle.generation(),
            force,
            "Subscribed to document",
        );
        handle
    }

    /// Stop tracking a document. Returns whether it was tracked.
    pub fn unsubscribe(&mut self, entity_id: &EntityId) -> bool {
        self.stop_polling(entity_id);
        self.reconciler.forget(entity_id);
        let removed = self.registry.unsubscribe(entity_id);
        if removed {
            tracing::info!(entity_id = %entity_id, "Unsubscribed from document");
        }
        removed
    }

    /// Stop tracking everything. Returns the number of connections closed.
    pub fn unsubscribe_all(&mut self) -> usize {
        self.pollers.clear();
        self.reconciler.clear();
        self.registry.unsubscribe_all()
    }

    // -- Polling ------------------------------------------------------------

    /// Poll `source` for a subscribed document alongside its push channel.
    ///
    /// Returns `false` if the document is not subscribed or has already
    /// finished. An existing poller for the document is replaced.
    pub fn start_polling(&mut self, entity_id: &EntityId, source: Arc<dyn SnapshotSource>) -> bool {
        let Some(connection) = self.registry.get(entity_id) else {
            tracing::debug!(entity_id = %entity_id, "Not polling unsubscribed document");
            return false;
        };
        if !self.reconciler.is_active(entity_id) {
            return false;
        }

        let poller = Poller::spawn(
            entity_id.clone(),
            connection.generation(),
            source,
            self.poll_interval,
            self.inputs_tx.clone(),
        );
        self.pollers.insert(entity_id.clone(), poller);
        true
    }

    pub fn stop_polling(&mut self, entity_id: &EntityId) -> bool {
        self.pollers.remove(entity_id).is_some()
    }

    /// Feed a pull-channel snapshot directly into the reconciler.
    pub fn apply_poll(&mut self, update: StatusUpdate) -> Reconciled {
        self.reconcile(update, UpdateSource::Poll)
    }

    // -- Queries ------------------------------------------------------------

    pub fn record(&self, entity_id: &EntityId) -> Option<&ProgressRecord> {
        self.reconciler.record(entity_id)
    }

    pub fn connection_state(&self, entity_id: &EntityId) -> Option<ConnectionState> {
        self.registry.get(entity_id).map(|connection| connection.state())
    }

    pub fn is_tracking(&self, entity_id: &EntityId) -> bool {
        self.registry.contains(entity_id)
    }

    pub fn is_polling(&self, entity_id: &EntityId) -> bool {
        self.pollers.contains_key(entity_id)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    // -- Control loop -------------------------------------------------------

    /// Wait for the next queued input and process it.
    pub async fn turn(&mut self) {
        // The tracker holds a sender itself, so the queue never closes.
        if let Some(input) = self.inputs.recv().await {
            self.dispatch(input);
        }
    }

    /// Process every input that is already queued. Returns how many were
    /// handled.
    pub fn drain(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(input) = self.inputs.try_recv() {
            self.dispatch(input);
            handled += 1;
        }
        handled
    }

    /// Run the control loop until `shutdown` is cancelled, then close
    /// every connection.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.turn() => {}
            }
        }

        let closed = self.unsubscribe_all();
        tracing::info!(closed, "Tracker stopped");
    }

    fn dispatch(&mut self, input: TrackerInput) {
        match input {
            TrackerInput::Connection(event) => self.on_connection_event(event),
            TrackerInput::Poll(event) => self.on_poll_event(event),
            TrackerInput::GraceElapsed {
                entity_id,
                generation,
            } => {
                if self.registry.is_current(&entity_id, generation) {
                    tracing::info!(entity_id = %entity_id, "Terminal grace period elapsed, disconnecting");
                    self.unsubscribe(&entity_id);
                }
            }
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        let ConnectionEvent {
            entity_id,
            generation,
            kind,
        } = event;

        let Some(tracked) = self.registry.current_mut(&entity_id, generation) else {
            tracing::trace!(
                entity_id = %entity_id,
                generation,
                event = ?kind,
                "Dropping event from stale connection",
            );
            return;
        };

        match kind {
            ConnectionEventKind::StateChanged(state) => tracked.connection.observe(state),
            ConnectionEventKind::Connected { message } => tracked.callbacks.on_connected(&message),
            ConnectionEventKind::Status(update) => {
                tracked.callbacks.on_status(&update);
                self.reconcile(update, UpdateSource::Push);
            }
            ConnectionEventKind::Closed => tracked.callbacks.on_closed(),
            ConnectionEventKind::RetriesExhausted { attempts } => {
                tracked
                    .connection
                    .observe(ConnectionState::Closed(CloseReason::Exhausted));
                let error = TrackerError::RetriesExhausted {
                    entity_id: entity_id.clone(),
                    attempts,
                };
                tracked.callbacks.on_error(&error);
                self.registry.remove_if_current(&entity_id, generation);
                tracing::warn!(entity_id = %entity_id, attempts, "Stopped tracking document");
            }
            ConnectionEventKind::Finished => {
                self.registry.remove_if_current(&entity_id, generation);
                self.stop_polling(&entity_id);
                self.reconciler.forget(&entity_id);
                tracing::info!(entity_id = %entity_id, "Document connection closed after terminal status");
            }
        }
    }

    fn on_poll_event(&mut self, event: PollEvent) {
        let current = self
            .pollers
            .get(&event.entity_id)
            .is_some_and(|poller| poller.generation() == event.generation);
        if !current {
            tracing::trace!(
                entity_id = %event.entity_id,
                generation = event.generation,
                "Dropping snapshot from stale poller",
            );
            return;
        }

        self.reconcile(event.update, UpdateSource::Poll);
    }

    /// Apply `update` and run the side effects of the outcome.
    fn reconcile(&mut self, update: StatusUpdate, source: UpdateSource) -> Reconciled {
        let entity_id = update.document_id.clone();
        let outcome = self.reconciler.apply(&update, source);

        match &outcome {
            Reconciled::Progress(record) => {
                if let Some(tracked) = self.registry.get_mut(&entity_id) {
                    if source == UpdateSource::Poll {
                        tracked.callbacks.on_status(&update);
                    }
                    tracked.callbacks.on_progress(record.progress);
                }
            }
            Reconciled::Terminal {
                status, classify, ..
            } => {
                tracing::info!(
                    entity_id = %entity_id,
                    status = %status,
                    %source,
                    "Document finished processing",
                );
                if source == UpdateSource::Poll {
                    if let Some(tracked) = self.registry.get_mut(&entity_id) {
                        tracked.callbacks.on_status(&update);
                    }
                    self.schedule_teardown(&entity_id);
                }
                self.stop_polling(&entity_id);
                if *classify {
                    self.trigger_classification(&entity_id);
                }
            }
            Reconciled::Unchanged | Reconciled::Ignored => {}
        }

        outcome
    }

    /// Disconnect `entity_id` once the terminal grace period has passed,
    /// unless its connection is torn down or replaced first. Without a
    /// connection there is nothing to wait for, so the session is dropped
    /// right away.
    fn schedule_teardown(&mut self, entity_id: &EntityId) {
        let Some(connection) = self.registry.get(entity_id) else {
            self.reconciler.forget(entity_id);
            return;
        };
        let generation: Generation = connection.generation();
        let cancel = connection.cancellation();
        let grace = self.settings.terminal_grace;
        let inputs = self.inputs_tx.clone();
        let entity_id = entity_id.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    let _ = inputs.send(TrackerInput::GraceElapsed { entity_id, generation });
                }
            }
        });
    }

    fn trigger_classification(&self, entity_id: &EntityId) {
        match &self.classifier {
            Some(classifier) => {
                spawn_classification(Arc::clone(classifier), entity_id.clone());
            }
            None => {
                tracing::debug!(entity_id = %entity_id, "No classifier configured, skipping classification");
            }
        }
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}
