//! Status Reconciler: folds push and poll updates into one progress record
//! per document.
//!
//! Rules applied to every non-terminal update:
//!
//! * progress only ever increases; a lower value is ignored,
//! * `pending` never overrides `processing`,
//! * stage and message text is replaced whenever the update carries it,
//! * an update that changes nothing leaves the record (and its timestamp)
//!   untouched.
//!
//! A terminal update ends the session for that document: the record is
//! dropped and every later update is ignored until the next
//! [`Reconciler::begin`].

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use docwatch_core::status::DocumentStatus;
use docwatch_core::types::{EntityId, Timestamp};
use serde::Serialize;

use crate::messages::StatusUpdate;

/// Which channel delivered an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateSource {
    Push,
    Poll,
}

impl std::fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Push => "push",
            Self::Poll => "poll",
        })
    }
}

/// Last known state of a document that has not reached a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressRecord {
    pub entity_id: EntityId,
    pub status: DocumentStatus,
    /// Completion percentage, 0-100.
    pub progress: f64,
    pub stage: Option<String>,
    pub message: Option<String>,
    /// When the record last changed.
    pub updated_at: Timestamp,
}

/// Outcome of [`Reconciler::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// The record was created or changed.
    Progress(ProgressRecord),
    /// The update carried nothing new.
    Unchanged,
    /// The document finished; its record is gone.
    Terminal {
        status: DocumentStatus,
        error_message: Option<String>,
        /// Set on the first `completed` outcome seen for this document.
        classify: bool,
    },
    /// No active session for this document.
    Ignored,
}

#[derive(Debug)]
enum Session {
    Active(Option<ProgressRecord>),
    Ended,
}

#[derive(Debug, Default)]
pub struct Reconciler {
    sessions: HashMap<EntityId, Session>,
    classified: HashSet<EntityId>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting updates for `entity_id`. An active session is left
    /// as is; an ended one is restarted with no record.
    pub fn begin(&mut self, entity_id: &EntityId) {
        match self.sessions.get(entity_id) {
            Some(Session::Active(_)) => {}
            _ => {
                self.sessions
                    .insert(entity_id.clone(), Session::Active(None));
            }
        }
    }

    /// Stop tracking `entity_id`, returning its record if there was one.
    pub fn forget(&mut self, entity_id: &EntityId) -> Option<ProgressRecord> {
        match self.sessions.remove(entity_id)? {
            Session::Active(record) => record,
            Session::Ended => None,
        }
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }

    pub fn is_active(&self, entity_id: &EntityId) -> bool {
        matches!(self.sessions.get(entity_id), Some(Session::Active(_)))
    }

    /// Whether `entity_id` reached a terminal status in its current session.
    pub fn has_ended(&self, entity_id: &EntityId) -> bool {
        matches!(self.sessions.get(entity_id), Some(Session::Ended))
    }

    pub fn record(&self, entity_id: &EntityId) -> Option<&ProgressRecord> {
        match self.sessions.get(entity_id)? {
            Session::Active(record) => record.as_ref(),
            Session::Ended => None,
        }
    }

    pub fn records(&self) -> impl Iterator<Item = &ProgressRecord> {
        self.sessions.values().filter_map(|session| match session {
            Session::Active(record) => record.as_ref(),
            Session::Ended => None,
        })
    }

    /// Number of sessions still waiting for a terminal status.
    pub fn active_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|session| matches!(session, Session::Active(_)))
            .count()
    }

    /// Fold `update` into the record for its document.
    pub fn apply(&mut self, update: &StatusUpdate, source: UpdateSource) -> Reconciled {
        let entity_id = &update.document_id;

        let Some(session) = self.sessions.get_mut(entity_id) else {
            tracing::trace!(entity_id = %entity_id, %source, "Update for untracked document ignored");
            return Reconciled::Ignored;
        };

        if matches!(session, Session::Ended) {
            tracing::trace!(entity_id = %entity_id, %source, "Update after terminal status ignored");
            return Reconciled::Ignored;
        }

        if update.is_terminal() {
            *session = Session::Ended;
            let classify = update.status == DocumentStatus::Completed
                && self.classified.insert(entity_id.clone());
            tracing::debug!(
                entity_id = %entity_id,
                %source,
                status = %update.status,
                classify,
                "Document reached terminal status",
            );
            return Reconciled::Terminal {
                status: update.status,
                error_message: update.error_message.clone(),
                classify,
            };
        }

        let Session::Active(slot) = session else {
            return Reconciled::Ignored;
        };

        match slot {
            None => {
                let record = ProgressRecord {
                    entity_id: entity_id.clone(),
                    status: update.status,
                    progress: update.clamped_progress().unwrap_or(0.0),
                    stage: update.stage().map(str::to_string),
                    message: update.message().map(str::to_string),
                    updated_at: Utc::now(),
                };
                tracing::debug!(
                    entity_id = %entity_id,
                    %source,
                    progress = record.progress,
                    "Progress record created",
                );
                *slot = Some(record.clone());
                Reconciled::Progress(record)
            }
            Some(record) => {
                if merge(record, update, source) {
                    record.updated_at = Utc::now();
                    Reconciled::Progress(record.clone())
                } else {
                    Reconciled::Unchanged
                }
            }
        }
    }
}

/// Merge `update` into `record`. Returns whether anything changed.
fn merge(record: &mut ProgressRecord, update: &StatusUpdate, source: UpdateSource) -> bool {
    let mut changed = false;

    if let Some(progress) = update.clamped_progress() {
        if progress > record.progress {
            record.progress = progress;
            changed = true;
        } else if progress < record.progress {
            tracing::debug!(
                entity_id = %record.entity_id,
                %source,
                current = record.progress,
                incoming = progress,
                "Ignoring stale progress",
            );
        }
    }

    if record.status == DocumentStatus::Pending && update.status == DocumentStatus::Processing {
        record.status = DocumentStatus::Processing;
        changed = true;
    }

    if let Some(stage) = update.stage() {
        if record.stage.as_deref() != Some(stage) {
            record.stage = Some(stage.to_string());
            changed = true;
        }
    }

    if let Some(message) = update.message() {
        if record.message.as_deref() != Some(message) {
            record.message = Some(message.to_string());
            changed = true;
        }
    }

    changed
}
