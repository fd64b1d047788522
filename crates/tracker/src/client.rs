//! Transport abstraction for the per-document push channel.
//!
//! [`Transport`] opens one [`FrameStream`] per document. The production
//! implementation is [`WsTransport`], which speaks WebSocket via
//! `tokio-tungstenite`; tests substitute an in-memory transport.

use async_trait::async_trait;
use docwatch_core::types::EntityId;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::TrackerConfig;
use crate::error::TransportError;

/// Opens push connections scoped to a single document.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, entity_id: &EntityId) -> Result<Box<dyn FrameStream>, TransportError>;
}

/// A live, bidirectional text-frame connection.
///
/// `next_frame` must be cancel-safe: the connection driver polls it inside
/// `tokio::select!` next to its timers.
#[async_trait]
pub trait FrameStream: Send {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError>;

    /// Next text frame. `None` means the peer closed the connection.
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>>;

    /// Close the connection. Errors are ignored; the stream is unusable
    /// afterwards either way.
    async fn close(&mut self);
}

/// WebSocket transport for the document status endpoint.
///
/// Connects to `{ws_url}/ws/documents/{id}?timeout={timeout_secs}`.
#[derive(Debug, Clone)]
pub struct WsTransport {
    ws_url: String,
    timeout_secs: u64,
}

impl WsTransport {
    /// * `ws_url`       - WebSocket base URL, e.g. `ws://host:8003`.
    /// * `timeout_secs` - server-side idle timeout requested per socket.
    pub fn new(ws_url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            ws_url: ws_url.into().trim_end_matches('/').to_string(),
            timeout_secs,
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::new(config.ws_url.clone(), config.ws_timeout_secs)
    }

    /// Full URL of the status socket for one document. The id is
    /// percent-encoded as a single path segment.
    pub fn document_url(&self, entity_id: &EntityId) -> Result<Url, TransportError> {
        let invalid = |reason: String| {
            TransportError::Connect(format!("Invalid socket URL {}: {reason}", self.ws_url))
        };

        let mut url = Url::parse(&self.ws_url).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("cannot be a base".into()))?
            .pop_if_empty()
            .extend(["ws", "documents", entity_id.as_str()]);
        url.query_pairs_mut()
            .append_pair("timeout", &self.timeout_secs.to_string());
        Ok(url)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, entity_id: &EntityId) -> Result<Box<dyn FrameStream>, TransportError> {
        let url = self.document_url(entity_id)?;

        let (ws_stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            TransportError::Connect(format!("Failed to connect to {url}: {e}"))
        })?;

        tracing::debug!(entity_id = %entity_id, url = %url, "Document socket opened");

        Ok(Box::new(WsFrameStream { inner: ws_stream }))
    }
}

struct WsFrameStream {
    inner: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl FrameStream for WsFrameStream {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        while let Some(msg_result) = self.inner.next().await {
            match msg_result {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(_)) => {
                    tracing::trace!("Ignoring binary frame");
                }
                Ok(Message::Ping(_) | Message::Pong(_)) => {
                    // Handled automatically by tungstenite.
                }
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "Document socket closed by peer");
                    return None;
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            }
        }
        None
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.close(None).await {
            tracing::trace!(error = %e, "Error while closing document socket");
        }
    }
}
