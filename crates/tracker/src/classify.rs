//! Post-completion classification trigger.

use std::sync::Arc;

use async_trait::async_trait;
use docwatch_core::types::EntityId;
use tokio::task::JoinHandle;

/// Kicks off classification of a completed document.
#[async_trait]
pub trait Classifier: Send + Sync + 'static {
    async fn classify(&self, entity_id: &EntityId) -> anyhow::Result<()>;
}

/// Run `classifier` in the background. The outcome is only logged; nothing
/// is reported back to subscribers.
pub(crate) fn spawn_classification(
    classifier: Arc<dyn Classifier>,
    entity_id: EntityId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(entity_id = %entity_id, "Triggering classification");
        match classifier.classify(&entity_id).await {
            Ok(()) => tracing::info!(entity_id = %entity_id, "Classification requested"),
            Err(e) => tracing::warn!(
                entity_id = %entity_id,
                error = %format!("{e:#}"),
                "Classification failed",
            ),
        }
    })
}
