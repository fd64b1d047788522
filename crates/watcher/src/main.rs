//! `docwatch` -- follow documents through the processing pipeline.
//!
//! Subscribes to the status socket of every document given on the command
//! line, polls the REST API as a fallback, logs progress, and exits once
//! every document has finished (or tracking gave up on it).
//!
//! ```text
//! docwatch <document-id>...
//! ```
//!
//! Configuration is read from the environment (and `.env`); see
//! [`TrackerConfig::from_env`] for the variables.

use std::collections::HashSet;
use std::sync::Arc;

use docwatch_core::types::EntityId;
use docwatch_tracker::api::DocumentApi;
use docwatch_tracker::client::WsTransport;
use docwatch_tracker::{ChannelCallbacks, SubscriptionEvent, Tracker, TrackerConfig};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docwatch=info,docwatch_tracker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let ids: Vec<EntityId> = std::env::args().skip(1).map(EntityId::from).collect();
    if ids.is_empty() {
        tracing::error!("Usage: docwatch <document-id>...");
        std::process::exit(2);
    }

    let config = TrackerConfig::from_env()?;

    tracing::info!(
        ws_url = %config.ws_url,
        api_url = %config.api_url,
        documents = ids.len(),
        "Starting docwatch",
    );

    let api = Arc::new(DocumentApi::from_config(&config));
    let transport = Arc::new(WsTransport::from_config(&config));
    let mut tracker = Tracker::new(&config, transport).with_classifier(api.clone());

    let (events_tx, mut events) = mpsc::unbounded_channel();
    for id in &ids {
        let callbacks = ChannelCallbacks::new(id.clone(), events_tx.clone());
        tracker.subscribe(id.clone(), Box::new(callbacks), false);
        tracker.start_polling(id, api.clone());
    }
    drop(events_tx);

    let mut pending: HashSet<EntityId> = ids.into_iter().collect();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while !pending.is_empty() {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!(remaining = pending.len(), "Interrupted");
                break;
            }
            _ = tracker.turn() => {}
            Some((entity_id, event)) = events.recv() => {
                if pending.contains(&entity_id) && report(&entity_id, &event) {
                    pending.remove(&entity_id);
                }
            }
        }
    }

    if pending.is_empty() {
        // Let terminal connections close and classification requests go out.
        let _ = tokio::time::timeout(config.terminal_grace, async {
            loop {
                tracker.turn().await;
            }
        })
        .await;
    }

    let closed = tracker.unsubscribe_all();
    tracing::info!(closed, "docwatch finished");
    Ok(())
}

/// Log one subscription event. Returns `true` once the document needs no
/// further watching.
fn report(entity_id: &EntityId, event: &SubscriptionEvent) -> bool {
    match event {
        SubscriptionEvent::Connected(message) => {
            tracing::info!(entity_id = %entity_id, message = %message, "Connected");
            false
        }
        SubscriptionEvent::Progress(progress) => {
            tracing::info!(entity_id = %entity_id, progress, "Progress");
            false
        }
        SubscriptionEvent::Status(update) => {
            tracing::debug!(
                entity_id = %entity_id,
                status = %update.status,
                progress = ?update.progress,
                stage = ?update.stage(),
                "Status update",
            );
            if update.is_terminal() {
                tracing::info!(
                    entity_id = %entity_id,
                    status = %update.status,
                    error_message = ?update.error_message,
                    "Document finished",
                );
            }
            update.is_terminal()
        }
        SubscriptionEvent::Closed => {
            tracing::warn!(entity_id = %entity_id, "Connection lost, reconnecting");
            false
        }
        SubscriptionEvent::Error(error) => {
            tracing::error!(entity_id = %entity_id, error = %error, "Tracking stopped");
            true
        }
    }
}
