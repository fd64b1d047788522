//! Document WebSocket frame types and parser.
//!
//! The server sends two kinds of text frames: the plain-text heartbeat
//! sentinels (`ping` / `pong`) and JSON envelopes with a `type`
//! discriminant whose fields sit next to it, e.g.
//! `{"type": "status_update", "document_id": "...", "status": "processing"}`.

use docwatch_core::status::DocumentStatus;
use docwatch_core::types::EntityId;
use serde::{Deserialize, Serialize};

use crate::heartbeat::{PROBE, PROBE_RESPONSE};

/// Metadata key carrying the human-readable processing stage.
pub const META_STAGE: &str = "stage";

/// Metadata key carrying a free-form progress message.
pub const META_MESSAGE: &str = "message";

/// One reported state of a document, independent of which channel
/// delivered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub document_id: EntityId,
    pub status: DocumentStatus,
    /// Completion percentage (0-100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl StatusUpdate {
    pub fn new(document_id: impl Into<EntityId>, status: DocumentStatus) -> Self {
        Self {
            document_id: document_id.into(),
            status,
            progress: None,
            error_message: None,
            metadata: None,
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_stage(self, stage: impl Into<String>) -> Self {
        self.with_metadata(META_STAGE, serde_json::Value::String(stage.into()))
    }

    pub fn with_message(self, message: impl Into<String>) -> Self {
        self.with_metadata(META_MESSAGE, serde_json::Value::String(message.into()))
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Progress clamped to `[0, 100]`. `NaN` is treated as absent.
    pub fn clamped_progress(&self) -> Option<f64> {
        self.progress
            .filter(|p| !p.is_nan())
            .map(|p| p.clamp(0.0, 100.0))
    }

    pub fn stage(&self) -> Option<&str> {
        self.metadata_str(META_STAGE)
    }

    pub fn message(&self) -> Option<&str> {
        self.metadata_str(META_MESSAGE)
    }

    fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key)?.as_str()
    }
}

/// Greeting payload shared by `connected` and `subscribed` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Greeting {
    pub document_id: EntityId,
    #[serde(default)]
    pub message: String,
}

/// All known JSON envelopes, discriminated by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The socket is accepted.
    Connected(Greeting),

    /// The server attached this socket to the document's status feed.
    Subscribed(Greeting),

    /// The document's processing state changed.
    StatusUpdate(StatusUpdate),
}

impl ServerMessage {
    pub fn document_id(&self) -> &EntityId {
        match self {
            Self::Connected(g) | Self::Subscribed(g) => &g.document_id,
            Self::StatusUpdate(u) => &u.document_id,
        }
    }
}

/// A classified inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// The peer is probing us; answer with [`PROBE_RESPONSE`].
    Probe,
    /// The peer answered one of our probes.
    ProbeResponse,
    Message(ServerMessage),
}

/// Classify one inbound text frame.
///
/// Heartbeat sentinels are matched before any JSON parsing. Returns `Err`
/// for malformed JSON or unknown `type` values; callers should log and
/// continue.
pub fn parse_frame(text: &str) -> Result<Frame, serde_json::Error> {
    match text {
        PROBE => Ok(Frame::Probe),
        PROBE_RESPONSE => Ok(Frame::ProbeResponse),
        _ => serde_json::from_str(text).map(Frame::Message),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn heartbeat_sentinels_skip_json() {
        assert_eq!(parse_frame("ping").unwrap(), Frame::Probe);
        assert_eq!(parse_frame("pong").unwrap(), Frame::ProbeResponse);
    }

    #[test]
    fn parse_connected() {
        let json = r#"{"type":"connected","document_id":"doc1","message":"welcome"}"#;
        assert_matches!(
            parse_frame(json).unwrap(),
            Frame::Message(ServerMessage::Connected(Greeting { document_id, message }))
                if document_id.as_str() == "doc1" && message == "welcome"
        );
    }

    #[test]
    fn parse_subscribed_without_message() {
        let json = r#"{"type":"subscribed","document_id":"doc1"}"#;
        assert_matches!(
            parse_frame(json).unwrap(),
            Frame::Message(ServerMessage::Subscribed(g)) if g.message.is_empty()
        );
    }

    #[test]
    fn parse_full_status_update() {
        let json = r#"{
            "type": "status_update",
            "document_id": "doc1",
            "status": "processing",
            "progress": 42.5,
            "metadata": {"stage": "ocr", "message": "page 3 of 8", "pages": 8}
        }"#;
        let Frame::Message(ServerMessage::StatusUpdate(update)) = parse_frame(json).unwrap() else {
            panic!("Expected StatusUpdate");
        };
        assert_eq!(update.document_id.as_str(), "doc1");
        assert_eq!(update.status, DocumentStatus::Processing);
        assert_eq!(update.progress, Some(42.5));
        assert_eq!(update.stage(), Some("ocr"));
        assert_eq!(update.message(), Some("page 3 of 8"));
        assert!(!update.is_terminal());
    }

    #[test]
    fn parse_minimal_failed_update() {
        let json = r#"{"type":"status_update","document_id":"doc1","status":"failed","error_message":"corrupt pdf"}"#;
        let Frame::Message(ServerMessage::StatusUpdate(update)) = parse_frame(json).unwrap() else {
            panic!("Expected StatusUpdate");
        };
        assert!(update.is_terminal());
        assert_eq!(update.progress, None);
        assert_eq!(update.error_message.as_deref(), Some("corrupt pdf"));
        assert_eq!(update.stage(), None);
    }

    #[test]
    fn parse_unknown_type_returns_error() {
        assert!(parse_frame(r#"{"type":"shutdown","document_id":"doc1"}"#).is_err());
    }

    #[test]
    fn parse_invalid_json_returns_error() {
        assert!(parse_frame("PING").is_err());
        assert!(parse_frame("not json at all").is_err());
    }

    #[test]
    fn progress_is_clamped() {
        let update = StatusUpdate::new("doc1", DocumentStatus::Processing).with_progress(140.0);
        assert_eq!(update.clamped_progress(), Some(100.0));

        let update = StatusUpdate::new("doc1", DocumentStatus::Processing).with_progress(-3.0);
        assert_eq!(update.clamped_progress(), Some(0.0));

        let update = StatusUpdate::new("doc1", DocumentStatus::Processing).with_progress(f64::NAN);
        assert_eq!(update.clamped_progress(), None);
    }

    #[test]
    fn status_update_serializes_with_type_tag() {
        let msg = ServerMessage::StatusUpdate(
            StatusUpdate::new("doc1", DocumentStatus::Completed).with_progress(100.0),
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "status_update");
        assert_eq!(value["status"], "completed");
        assert!(value.get("error_message").is_none());
    }
}
