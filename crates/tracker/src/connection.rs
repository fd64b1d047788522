//! Per-document connection: state machine, handle and driver task.
//!
//! A [`Connection`] is the handle kept in the
//! [`Registry`](crate::registry::Registry). Calling `connect()` spawns a
//! driver task that owns the transport and every timer of the connection
//! (heartbeat, terminal grace, reconnect backoff). All of those timers
//! select on the connection's [`CancellationToken`], so `disconnect()`
//! stops them synchronously. The driver reports back through the tracker's
//! input queue, tagging each event with the connection's generation.

use std::sync::Arc;
use std::time::Duration;

use docwatch_core::types::EntityId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;
use crate::client::{FrameStream, Transport};
use crate::config::TrackerConfig;
use crate::error::{TrackerError, TransportError};
use crate::events::{ConnectionEvent, ConnectionEventKind, Generation, TrackerInput};
use crate::heartbeat::{HeartbeatConfig, HeartbeatMonitor, HeartbeatVerdict, PROBE, PROBE_RESPONSE};
use crate::messages::{parse_frame, Frame, ServerMessage};

/// Upper bound on a graceful close before the transport is just dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Why a connection is in [`ConnectionState::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// An open transport dropped (peer close, receive error, dead heartbeat).
    Lost,
    /// A connect attempt failed.
    Failed,
    /// `disconnect()` was called, or the terminal grace period elapsed.
    Intentional,
    /// Every scheduled reconnect failed.
    Exhausted,
}

impl CloseReason {
    /// Intentional and exhausted closes never reconnect.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Intentional | Self::Exhausted)
    }
}

/// Lifecycle state of one document connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed but never started.
    Idle,
    /// Establishing the transport. `attempt` is the number of reconnects
    /// scheduled so far (0 for the first connect).
    Connecting { attempt: u32 },
    Open,
    Closed(CloseReason),
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed(reason) if reason.is_terminal())
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Any non-terminal state may be closed intentionally; a terminal state
    /// has no outgoing transitions.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use CloseReason::*;
        use ConnectionState::*;

        match (self, next) {
            (Idle, Connecting { .. }) => true,
            (Connecting { .. }, Open) => true,
            (Connecting { .. } | Open, Closed(_)) => true,
            (Closed(Lost | Failed), Connecting { .. }) => true,
            (Closed(Lost | Failed), Closed(Exhausted)) => true,
            (from, Closed(Intentional)) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Validate a state transition, returning an error message for invalid
    /// ones.
    pub fn validate_transition(self, next: ConnectionState) -> Result<(), String> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(format!("Invalid transition: {self:?} -> {next:?}"))
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Timing parameters shared by every connection of one tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub backoff: BackoffPolicy,
    pub heartbeat: HeartbeatConfig,
    pub terminal_grace: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&TrackerConfig::default())
    }
}

impl From<&TrackerConfig> for ConnectionSettings {
    fn from(config: &TrackerConfig) -> Self {
        Self {
            backoff: config.backoff.clone(),
            heartbeat: config.heartbeat.clone(),
            terminal_grace: config.terminal_grace,
        }
    }
}

/// Everything a connection needs to spawn its driver.
#[derive(Clone)]
pub(crate) struct Launcher {
    pub transport: Arc<dyn Transport>,
    pub settings: Arc<ConnectionSettings>,
    pub events: mpsc::UnboundedSender<TrackerInput>,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Owned handle to one document connection.
///
/// Dropping the handle cancels the connection.
pub struct Connection {
    entity_id: EntityId,
    generation: Generation,
    state: ConnectionState,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    launcher: Launcher,
}

impl Connection {
    pub(crate) fn new(entity_id: EntityId, generation: Generation, launcher: Launcher) -> Self {
        Self {
            entity_id,
            generation,
            state: ConnectionState::Idle,
            cancel: CancellationToken::new(),
            task: None,
            launcher,
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Last state reported by the driver.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// A live connection can still (re)connect on its own.
    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Whether the driver task is currently running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start the driver. No-op while it is already running (open, or
    /// waiting for a scheduled reconnect) and on terminal connections.
    pub(crate) fn connect(&mut self) {
        if self.is_running() {
            tracing::trace!(entity_id = %self.entity_id, "Connection already running");
            return;
        }
        if !self.is_live() {
            tracing::debug!(
                entity_id = %self.entity_id,
                state = ?self.state,
                "Refusing to start a terminated connection",
            );
            return;
        }

        let driver = ConnectionDriver {
            entity_id: self.entity_id.clone(),
            generation: self.generation,
            state: self.state,
            attempts: 0,
            grace_deadline: None,
            transport: Arc::clone(&self.launcher.transport),
            settings: Arc::clone(&self.launcher.settings),
            events: self.launcher.events.clone(),
            cancel: self.cancel.clone(),
        };
        self.task = Some(tokio::spawn(driver.run()));
    }

    /// Intentional, terminal close.
    ///
    /// Cancels the heartbeat, grace and reconnect timers; the driver closes
    /// the transport and exits without reporting anything further.
    pub(crate) fn disconnect(&mut self) {
        self.cancel.cancel();
        if !self.state.is_terminal() {
            self.state = ConnectionState::Closed(CloseReason::Intentional);
        }
        tracing::debug!(
            entity_id = %self.entity_id,
            generation = self.generation,
            "Connection disconnected",
        );
    }

    /// Mirror a state reported by the driver.
    pub(crate) fn observe(&mut self, state: ConnectionState) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.state = state;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("entity_id", &self.entity_id)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("running", &self.is_running())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// How one open session ended.
enum SessionEnd {
    /// Unexpected close; schedule a reconnect.
    Lost,
    /// The terminal grace period elapsed.
    Finished,
    /// `disconnect()` was called.
    Cancelled,
}

/// Task-side half of a connection. Owns the transport and all timers.
struct ConnectionDriver {
    entity_id: EntityId,
    generation: Generation,
    state: ConnectionState,
    /// Reconnects scheduled since the last successful open.
    attempts: u32,
    /// Set by the first terminal status; outlives the session it arrived on.
    grace_deadline: Option<Instant>,
    transport: Arc<dyn Transport>,
    settings: Arc<ConnectionSettings>,
    events: mpsc::UnboundedSender<TrackerInput>,
    cancel: CancellationToken,
}

impl ConnectionDriver {
    /// Connect -> process frames -> reconnect, until cancelled, finished or
    /// out of attempts.
    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.transition(ConnectionState::Connecting {
                attempt: self.attempts,
            });

            let opened = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.transport.open(&self.entity_id) => result,
            };

            match opened {
                Ok(stream) => {
                    self.attempts = 0;
                    self.transition(ConnectionState::Open);
                    tracing::info!(
                        entity_id = %self.entity_id,
                        generation = self.generation,
                        "Document connection open",
                    );

                    match self.run_open(stream).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Finished => {
                            self.transition(ConnectionState::Closed(CloseReason::Intentional));
                            self.emit(ConnectionEventKind::Finished);
                            break;
                        }
                        SessionEnd::Lost if self.grace_deadline.is_some() => {
                            self.transition(ConnectionState::Closed(CloseReason::Lost));
                            if self.await_grace().await {
                                self.emit(ConnectionEventKind::Finished);
                            }
                            break;
                        }
                        SessionEnd::Lost => {
                            self.transition(ConnectionState::Closed(CloseReason::Lost));
                            self.emit(ConnectionEventKind::Closed);
                        }
                    }
                }
                Err(e) => {
                    let error = TrackerError::from(e);
                    tracing::warn!(
                        entity_id = %self.entity_id,
                        attempt = self.attempts,
                        error = %error,
                        "Document connection attempt failed",
                    );
                    self.transition(ConnectionState::Closed(CloseReason::Failed));
                    self.emit(ConnectionEventKind::Closed);
                }
            }

            let Some(delay) = self.settings.backoff.delay_for(self.attempts) else {
                tracing::warn!(
                    entity_id = %self.entity_id,
                    attempts = self.attempts,
                    "Reconnect attempts exhausted",
                );
                self.transition(ConnectionState::Closed(CloseReason::Exhausted));
                self.emit(ConnectionEventKind::RetriesExhausted {
                    attempts: self.attempts,
                });
                break;
            };
            self.attempts += 1;

            tracing::info!(
                entity_id = %self.entity_id,
                attempt = self.attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to document server",
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::debug!(
            entity_id = %self.entity_id,
            generation = self.generation,
            "Connection task exited",
        );
    }

    /// The document already finished but its socket dropped: no reconnect,
    /// just sit out the rest of the grace period. Returns `false` if
    /// cancelled first.
    async fn await_grace(&mut self) -> bool {
        tracing::info!(
            entity_id = %self.entity_id,
            "Document socket lost after terminal status, not reconnecting",
        );
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = sleep_until_opt(self.grace_deadline) => {
                self.transition(ConnectionState::Closed(CloseReason::Intentional));
                true
            }
        }
    }

    /// Process frames and heartbeats until the session ends, then close the
    /// transport.
    async fn run_open(&mut self, mut stream: Box<dyn FrameStream>) -> SessionEnd {
        let period = self.settings.heartbeat.interval;
        let mut heartbeat = HeartbeatMonitor::new(&self.settings.heartbeat);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

        let end = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break SessionEnd::Cancelled,
                _ = sleep_until_opt(self.grace_deadline) => {
                    tracing::info!(
                        entity_id = %self.entity_id,
                        "Terminal grace period elapsed, disconnecting",
                    );
                    break SessionEnd::Finished;
                }
                _ = ticker.tick() => match heartbeat.on_tick() {
                    HeartbeatVerdict::Probe => {
                        tracing::trace!(
                            entity_id = %self.entity_id,
                            missed = heartbeat.missed(),
                            "Heartbeat probe",
                        );
                        if let Err(e) = stream.send_text(PROBE).await {
                            tracing::warn!(entity_id = %self.entity_id, error = %e, "Heartbeat send failed");
                            break SessionEnd::Lost;
                        }
                    }
                    HeartbeatVerdict::Dead { missed } => {
                        tracing::warn!(
                            entity_id = %self.entity_id,
                            missed,
                            "Heartbeat responses missing, forcing reconnect",
                        );
                        break SessionEnd::Lost;
                    }
                },
                frame = stream.next_frame() => match frame {
                    Some(Ok(text)) => {
                        if let Err(e) = self
                            .handle_frame(&text, &mut stream, &mut heartbeat)
                            .await
                        {
                            tracing::warn!(entity_id = %self.entity_id, error = %e, "Heartbeat reply failed");
                            break SessionEnd::Lost;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(entity_id = %self.entity_id, error = %e, "Document socket receive error");
                        break SessionEnd::Lost;
                    }
                    None => {
                        tracing::info!(entity_id = %self.entity_id, "Document socket closed by server");
                        break SessionEnd::Lost;
                    }
                },
            }
        };

        if tokio::time::timeout(CLOSE_TIMEOUT, stream.close()).await.is_err() {
            tracing::debug!(entity_id = %self.entity_id, "Transport close timed out");
        }
        end
    }

    /// Dispatch one inbound text frame.
    ///
    /// Only a failed heartbeat reply is reported as an error; protocol
    /// problems are logged and the frame is dropped.
    async fn handle_frame(
        &mut self,
        text: &str,
        stream: &mut Box<dyn FrameStream>,
        heartbeat: &mut HeartbeatMonitor,
    ) -> Result<(), TransportError> {
        let frame = match parse_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                let error = TrackerError::Protocol(e.to_string());
                tracing::warn!(
                    entity_id = %self.entity_id,
                    error = %error,
                    raw_message = %text,
                    "Failed to parse document frame",
                );
                return Ok(());
            }
        };

        match frame {
            Frame::Probe => stream.send_text(PROBE_RESPONSE).await?,
            Frame::ProbeResponse => heartbeat.on_response(),
            Frame::Message(msg) if msg.document_id() != &self.entity_id => {
                tracing::warn!(
                    entity_id = %self.entity_id,
                    other_id = %msg.document_id(),
                    "Ignoring frame addressed to another document",
                );
            }
            Frame::Message(ServerMessage::Connected(greeting)) => {
                tracing::debug!(entity_id = %self.entity_id, message = %greeting.message, "Server greeted");
                self.emit(ConnectionEventKind::Connected {
                    message: greeting.message,
                });
            }
            Frame::Message(ServerMessage::Subscribed(greeting)) => {
                tracing::debug!(entity_id = %self.entity_id, message = %greeting.message, "Subscribed to status feed");
            }
            Frame::Message(ServerMessage::StatusUpdate(update)) => {
                if update.is_terminal() && self.grace_deadline.is_none() {
                    let grace = self.settings.terminal_grace;
                    self.grace_deadline = Some(Instant::now() + grace);
                    tracing::info!(
                        entity_id = %self.entity_id,
                        status = %update.status,
                        grace_ms = grace.as_millis() as u64,
                        "Terminal status received, closing after grace period",
                    );
                }
                self.emit(ConnectionEventKind::Status(update));
            }
        }
        Ok(())
    }

    fn transition(&mut self, next: ConnectionState) {
        if let Err(e) = self.state.validate_transition(next) {
            tracing::warn!(entity_id = %self.entity_id, error = %e, "Unexpected connection state change");
        }
        tracing::debug!(
            entity_id = %self.entity_id,
            from = ?self.state,
            to = ?next,
            "Connection state change",
        );
        self.state = next;
        self.emit(ConnectionEventKind::StateChanged(next));
    }

    fn emit(&self, kind: ConnectionEventKind) {
        // Send only fails once the tracker is gone, which also cancels us.
        let _ = self.events.send(TrackerInput::Connection(ConnectionEvent {
            entity_id: self.entity_id.clone(),
            generation: self.generation,
            kind,
        }));
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
