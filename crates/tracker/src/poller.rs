//! Fallback HTTP poller.
//!
//! Each poller is a task that fetches a document snapshot on a fixed
//! interval and queues it for the tracker. It stops when cancelled or when
//! the tracker goes away.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docwatch_core::types::EntityId;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::TrackerError;
use crate::events::{Generation, PollEvent, TrackerInput};
use crate::messages::StatusUpdate;

/// Source of point-in-time document snapshots.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch(&self, entity_id: &EntityId) -> anyhow::Result<StatusUpdate>;
}

/// Handle to a running poll task. Dropping it stops the task.
#[derive(Debug)]
pub(crate) struct Poller {
    generation: Generation,
    cancel: CancellationToken,
}

impl Poller {
    /// Spawn a poll task for `entity_id`. The first fetch happens
    /// immediately.
    pub(crate) fn spawn(
        entity_id: EntityId,
        generation: Generation,
        source: Arc<dyn SnapshotSource>,
        interval: Duration,
        events: mpsc::UnboundedSender<TrackerInput>,
    ) -> Self {
        let cancel = CancellationToken::new();
        tokio::spawn(poll_loop(
            entity_id,
            generation,
            source,
            interval,
            events,
            cancel.clone(),
        ));
        Self { generation, cancel }
    }

    pub(crate) fn generation(&self) -> Generation {
        self.generation
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_loop(
    entity_id: EntityId,
    generation: Generation,
    source: Arc<dyn SnapshotSource>,
    interval: Duration,
    events: mpsc::UnboundedSender<TrackerInput>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(entity_id = %entity_id, generation, "Poller started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = source.fetch(&entity_id) => result,
        };

        match result {
            Ok(mut update) => {
                update.document_id = entity_id.clone();
                let event = TrackerInput::Poll(PollEvent {
                    entity_id: entity_id.clone(),
                    generation,
                    update,
                });
                if events.send(event).is_err() {
                    break;
                }
            }
            Err(e) => {
                let error = TrackerError::Poll(format!("{e:#}"));
                tracing::warn!(
                    entity_id = %entity_id,
                    error = %error,
                    "Snapshot fetch failed, retrying on next tick",
                );
            }
        }
    }

    tracing::debug!(entity_id = %entity_id, generation, "Poller stopped");
}
