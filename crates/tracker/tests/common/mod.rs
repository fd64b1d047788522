#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use docwatch_core::status::DocumentStatus;
use docwatch_core::types::EntityId;
use docwatch_tracker::classify::Classifier;
use docwatch_tracker::client::{FrameStream, Transport};
use docwatch_tracker::error::TransportError;
use docwatch_tracker::messages::{Greeting, ServerMessage, StatusUpdate};
use docwatch_tracker::poller::SnapshotSource;
use docwatch_tracker::{ChannelCallbacks, SubscriptionEvent, Tracker, TrackerConfig};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// What the mock transport does with one connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Accept,
    Refuse,
}

/// In-memory transport. Each accepted connection is handed to the test as a
/// [`MockServer`].
pub struct MockTransport {
    plans: Mutex<VecDeque<Plan>>,
    fallback: Plan,
    attempts: Mutex<Vec<(EntityId, Instant)>>,
    servers_tx: mpsc::UnboundedSender<MockServer>,
    servers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockServer>>,
}

impl MockTransport {
    /// Accept every connect attempt.
    pub fn accepting() -> Arc<Self> {
        Self::with_plans(Plan::Accept, [])
    }

    /// Refuse every connect attempt.
    pub fn refusing() -> Arc<Self> {
        Self::with_plans(Plan::Refuse, [])
    }

    /// Follow `plans` in order, then `fallback` for every further attempt.
    pub fn with_plans(fallback: Plan, plans: impl IntoIterator<Item = Plan>) -> Arc<Self> {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            plans: Mutex::new(plans.into_iter().collect()),
            fallback,
            attempts: Mutex::new(Vec::new()),
            servers_tx,
            servers_rx: tokio::sync::Mutex::new(servers_rx),
        })
    }

    /// Instants of every connect attempt so far.
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    /// Wait for the next accepted connection.
    pub async fn next_server(&self) -> MockServer {
        self.servers_rx
            .lock()
            .await
            .recv()
            .await
            .expect("transport dropped")
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, entity_id: &EntityId) -> Result<Box<dyn FrameStream>, TransportError> {
        self.attempts
            .lock()
            .unwrap()
            .push((entity_id.clone(), Instant::now()));

        let plan = self.plans.lock().unwrap().pop_front().unwrap_or(self.fallback);
        if plan == Plan::Refuse {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let server = MockServer {
            entity_id: entity_id.clone(),
            to_client: Some(to_client),
            from_client,
            closed: Arc::clone(&closed),
        };
        let _ = self.servers_tx.send(server);

        Ok(Box::new(MockStream {
            incoming,
            outgoing,
            closed,
        }))
    }
}

struct MockStream {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameStream for MockStream {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.outgoing
            .send(text.to_string())
            .map_err(|_| TransportError::Send("peer gone".into()))
    }

    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.incoming.close();
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Test-side end of one accepted connection.
pub struct MockServer {
    pub entity_id: EntityId,
    to_client: Option<mpsc::UnboundedSender<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

impl MockServer {
    pub fn send(&self, text: &str) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(text.to_string());
        }
    }

    pub fn send_message(&self, message: &ServerMessage) {
        self.send(&serde_json::to_string(message).unwrap());
    }

    pub fn send_status(&self, update: StatusUpdate) {
        self.send_message(&ServerMessage::StatusUpdate(update));
    }

    pub fn send_connected(&self, message: &str) {
        self.send_message(&ServerMessage::Connected(Greeting {
            document_id: self.entity_id.clone(),
            message: message.to_string(),
        }));
    }

    /// Drop the connection from the server side.
    pub fn hang_up(&mut self) {
        self.to_client = None;
    }

    /// Every frame the client sent that has not been read yet.
    pub fn received(&mut self) -> Vec<String> {
        std::iter::from_fn(|| self.from_client.try_recv().ok()).collect()
    }

    /// Whether the client closed or dropped its end.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Snapshot source returning a fixed sequence of updates, repeating the
/// last one.
pub struct ScriptedSource {
    updates: Mutex<VecDeque<StatusUpdate>>,
    fetches: Mutex<Vec<Instant>>,
}

impl ScriptedSource {
    pub fn new(updates: impl IntoIterator<Item = StatusUpdate>) -> Arc<Self> {
        Arc::new(Self {
            updates: Mutex::new(updates.into_iter().collect()),
            fetches: Mutex::new(Vec::new()),
        })
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSource {
    async fn fetch(&self, _entity_id: &EntityId) -> anyhow::Result<StatusUpdate> {
        self.fetches.lock().unwrap().push(Instant::now());
        let mut updates = self.updates.lock().unwrap();
        let update = if updates.len() > 1 {
            updates.pop_front()
        } else {
            updates.front().cloned()
        };
        update.ok_or_else(|| anyhow::anyhow!("no snapshot scripted"))
    }
}

/// Classifier that only records which documents it was asked about.
#[derive(Default)]
pub struct RecordingClassifier {
    calls: Mutex<Vec<EntityId>>,
}

impl RecordingClassifier {
    pub fn calls(&self) -> Vec<EntityId> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Classifier for RecordingClassifier {
    async fn classify(&self, entity_id: &EntityId) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(entity_id.clone());
        Ok(())
    }
}

pub type Events = mpsc::UnboundedReceiver<(EntityId, SubscriptionEvent)>;

pub fn tracker(transport: Arc<MockTransport>) -> Tracker {
    Tracker::new(&TrackerConfig::default(), transport)
}

/// Callbacks that record into a fresh channel.
pub fn recorder(entity_id: &str) -> (Box<ChannelCallbacks>, Events) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Box::new(ChannelCallbacks::new(entity_id, tx)), rx)
}

/// Drain every callback recorded so far.
pub fn drain_events(rx: &mut Events) -> Vec<SubscriptionEvent> {
    std::iter::from_fn(|| rx.try_recv().ok())
        .map(|(_, event)| event)
        .collect()
}

/// Drive the tracker's control loop for `duration` of (virtual) time.
pub async fn run_for(tracker: &mut Tracker, duration: Duration) {
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            biased;
            _ = &mut deadline => break,
            _ = tracker.turn() => {}
        }
    }
    tracker.drain();
}

pub fn processing(entity_id: &str, progress: f64) -> StatusUpdate {
    StatusUpdate::new(entity_id, DocumentStatus::Processing).with_progress(progress)
}

pub fn completed(entity_id: &str) -> StatusUpdate {
    StatusUpdate::new(entity_id, DocumentStatus::Completed).with_progress(100.0)
}

/// Assert `actual` is within `tolerance` of `expected`.
pub fn assert_close(actual: Duration, expected: Duration, tolerance: Duration) {
    let diff = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    assert!(
        diff <= tolerance,
        "expected {expected:?} (+/- {tolerance:?}), got {actual:?}"
    );
}
