//! REST client for the document server.
//!
//! Provides the pull channel ([`SnapshotSource`]) and the classification
//! trigger ([`Classifier`]) on top of [`reqwest`].

use async_trait::async_trait;
use docwatch_core::status::DocumentStatus;
use docwatch_core::types::EntityId;
use reqwest::Url;
use serde::Deserialize;

use crate::classify::Classifier;
use crate::config::TrackerConfig;
use crate::messages::StatusUpdate;
use crate::poller::SnapshotSource;

/// HTTP client for one document server.
#[derive(Debug, Clone)]
pub struct DocumentApi {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

/// Document as returned by `GET /api/documents/{id}`. Fields the tracker
/// does not use are skipped.
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentSnapshot {
    pub parse_status: DocumentStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Option<SnapshotMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnapshotMetadata {
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl DocumentSnapshot {
    /// Convert into the update shape shared with the push channel.
    pub fn into_update(self, entity_id: EntityId) -> StatusUpdate {
        let metadata = self.metadata.unwrap_or_default();
        let mut update = StatusUpdate::new(entity_id, self.parse_status);
        update.progress = metadata.progress;
        update.error_message = self.error_message;
        if let Some(stage) = metadata.stage {
            update = update.with_stage(stage);
        }
        if let Some(message) = metadata.message {
            update = update.with_message(message);
        }
        update
    }
}

/// Errors from the document REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum DocumentApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server returned a non-2xx status code.
    #[error("Document API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The configured base URL cannot carry a document path.
    #[error("Invalid document API URL: {0}")]
    InvalidUrl(String),
}

impl DocumentApi {
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8003`.
    /// * `token`   - Bearer token attached to every request, if any.
    pub fn new(api_url: impl Into<String>, token: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url, token)
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::new(config.api_url.clone(), config.api_token.clone())
    }

    /// Reuse an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(
        client: reqwest::Client,
        api_url: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    /// `{api_url}/api/documents/{id}`, with the id percent-encoded as a
    /// single path segment.
    pub fn document_url(&self, entity_id: &EntityId) -> Result<Url, DocumentApiError> {
        self.endpoint(entity_id, &[])
    }

    fn endpoint(&self, entity_id: &EntityId, trailing: &[&str]) -> Result<Url, DocumentApiError> {
        let mut url = Url::parse(&self.api_url)
            .map_err(|e| DocumentApiError::InvalidUrl(format!("{}: {e}", self.api_url)))?;
        url.path_segments_mut()
            .map_err(|_| DocumentApiError::InvalidUrl(format!("{}: cannot be a base", self.api_url)))?
            .pop_if_empty()
            .extend(["api", "documents", entity_id.as_str()])
            .extend(trailing);
        Ok(url)
    }

    /// Fetch the current state of a document.
    pub async fn get_document(
        &self,
        entity_id: &EntityId,
    ) -> Result<DocumentSnapshot, DocumentApiError> {
        let response = self
            .authorized(self.client.get(self.document_url(entity_id)?))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Ask the server to classify a processed document.
    pub async fn classify_document(
        &self,
        entity_id: &EntityId,
    ) -> Result<serde_json::Value, DocumentApiError> {
        let response = self
            .authorized(self.client.post(self.endpoint(entity_id, &["classify"])?))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Return the response unchanged if it has a success status, otherwise
    /// convert it into [`DocumentApiError::ApiError`].
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, DocumentApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(DocumentApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DocumentApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl SnapshotSource for DocumentApi {
    async fn fetch(&self, entity_id: &EntityId) -> anyhow::Result<StatusUpdate> {
        let snapshot = self.get_document(entity_id).await?;
        Ok(snapshot.into_update(entity_id.clone()))
    }
}

#[async_trait]
impl Classifier for DocumentApi {
    async fn classify(&self, entity_id: &EntityId) -> anyhow::Result<()> {
        let result = self.classify_document(entity_id).await?;
        tracing::debug!(entity_id = %entity_id, %result, "Classification response");
        Ok(())
    }
}
