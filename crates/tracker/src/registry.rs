//! Connection Registry: at most one live connection per document.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use docwatch_core::types::EntityId;
use tokio::sync::mpsc;

use crate::callbacks::StatusCallbacks;
use crate::client::Transport;
use crate::connection::{Connection, ConnectionSettings, Launcher};
use crate::events::{Generation, TrackerInput};

/// Reference to one subscription, as returned by
/// [`Registry::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    entity_id: EntityId,
    generation: Generation,
}

impl SubscriptionHandle {
    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }
}

/// A registered connection together with the subscriber that owns it.
pub(crate) struct Tracked {
    pub connection: Connection,
    pub callbacks: Box<dyn StatusCallbacks>,
}

/// Keyed table of document connections.
///
/// Terminated connections (closed intentionally or out of retries) are
/// replaced on the next lookup instead of being handed back.
pub struct Registry {
    entries: HashMap<EntityId, Tracked>,
    next_generation: Generation,
    launcher: Launcher,
}

impl Registry {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        settings: Arc<ConnectionSettings>,
        events: mpsc::UnboundedSender<TrackerInput>,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            next_generation: 1,
            launcher: Launcher {
                transport,
                settings,
                events,
            },
        }
    }

    /// Return the live connection for `entity_id`, creating one if there is
    /// none. A new connection is not started.
    ///
    /// `callbacks` are only installed when a new connection is created; an
    /// existing live connection keeps its original subscriber.
    pub fn get_or_create(
        &mut self,
        entity_id: &EntityId,
        callbacks: Box<dyn StatusCallbacks>,
    ) -> &mut Connection {
        match self.entries.entry(entity_id.clone()) {
            Entry::Occupied(entry) if entry.get().connection.is_live() => {
                tracing::trace!(entity_id = %entity_id, "Reusing live connection");
                &mut entry.into_mut().connection
            }
            Entry::Occupied(mut entry) => {
                let generation = self.next_generation;
                self.next_generation += 1;
                let fresh = Tracked {
                    connection: Connection::new(entity_id.clone(), generation, self.launcher.clone()),
                    callbacks,
                };
                let mut stale = entry.insert(fresh);
                stale.connection.disconnect();
                tracing::debug!(
                    entity_id = %entity_id,
                    old_generation = stale.connection.generation(),
                    generation,
                    "Replaced terminated connection",
                );
                &mut entry.into_mut().connection
            }
            Entry::Vacant(entry) => {
                let generation = self.next_generation;
                self.next_generation += 1;
                tracing::debug!(entity_id = %entity_id, generation, "Registered connection");
                let tracked = entry.insert(Tracked {
                    connection: Connection::new(entity_id.clone(), generation, self.launcher.clone()),
                    callbacks,
                });
                &mut tracked.connection
            }
        }
    }

    /// Ensure a connection exists for `entity_id` and is started.
    ///
    /// With `force`, any existing connection is disconnected first and a
    /// fresh one (with a newer generation) takes its place.
    pub fn subscribe(
        &mut self,
        entity_id: &EntityId,
        callbacks: Box<dyn StatusCallbacks>,
        force: bool,
    ) -> SubscriptionHandle {
        if force && self.unsubscribe(entity_id) {
            tracing::info!(entity_id = %entity_id, "Forced re-subscribe, previous connection closed");
        }

        let connection = self.get_or_create(entity_id, callbacks);
        connection.connect();

        SubscriptionHandle {
            entity_id: entity_id.clone(),
            generation: connection.generation(),
        }
    }

    /// Disconnect and forget the connection for `entity_id`. Returns
    /// whether one was registered.
    pub fn unsubscribe(&mut self, entity_id: &EntityId) -> bool {
        match self.entries.remove(entity_id) {
            Some(mut tracked) => {
                tracked.connection.disconnect();
                true
            }
            None => false,
        }
    }

    /// Disconnect everything. Returns the number of connections closed.
    pub fn unsubscribe_all(&mut self) -> usize {
        let count = self.entries.len();
        for (_, mut tracked) in self.entries.drain() {
            tracked.connection.disconnect();
        }
        if count > 0 {
            tracing::info!(count, "Closed all document connections");
        }
        count
    }

    pub fn get(&self, entity_id: &EntityId) -> Option<&Connection> {
        self.entries.get(entity_id).map(|tracked| &tracked.connection)
    }

    pub fn contains(&self, entity_id: &EntityId) -> bool {
        self.entries.contains_key(entity_id)
    }

    /// Whether `generation` is the registered connection for `entity_id`.
    pub fn is_current(&self, entity_id: &EntityId, generation: Generation) -> bool {
        self.get(entity_id)
            .is_some_and(|connection| connection.generation() == generation)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.entries.keys()
    }

    pub(crate) fn get_mut(&mut self, entity_id: &EntityId) -> Option<&mut Tracked> {
        self.entries.get_mut(entity_id)
    }

    /// The entry for `entity_id`, but only if it is still `generation`.
    pub(crate) fn current_mut(
        &mut self,
        entity_id: &EntityId,
        generation: Generation,
    ) -> Option<&mut Tracked> {
        self.entries
            .get_mut(entity_id)
            .filter(|tracked| tracked.connection.generation() == generation)
    }

    /// Drop the entry for `entity_id` if it is still `generation`.
    pub(crate) fn remove_if_current(
        &mut self,
        entity_id: &EntityId,
        generation: Generation,
    ) -> Option<Tracked> {
        if !self.is_current(entity_id, generation) {
            return None;
        }
        let mut tracked = self.entries.remove(entity_id)?;
        tracked.connection.disconnect();
        Some(tracked)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("connections", &self.entries.len())
            .field("next_generation", &self.next_generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::callbacks::NoopCallbacks;
    use crate::client::FrameStream;
    use crate::connection::{CloseReason, ConnectionState};
    use crate::error::TransportError;

    /// A transport whose connect attempts never complete.
    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        async fn open(&self, _: &EntityId) -> Result<Box<dyn FrameStream>, TransportError> {
            std::future::pending().await
        }
    }

    fn registry() -> (Registry, mpsc::UnboundedReceiver<TrackerInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Registry::new(
            Arc::new(StalledTransport),
            Arc::new(ConnectionSettings::default()),
            tx,
        );
        (registry, rx)
    }

    fn noop() -> Box<dyn StatusCallbacks> {
        Box::new(NoopCallbacks)
    }

    #[tokio::test]
    async fn get_or_create_registers_without_starting() {
        let (mut registry, _rx) = registry();
        let id = EntityId::from("doc1");

        let connection = registry.get_or_create(&id, noop());
        assert_eq!(connection.state(), ConnectionState::Idle);
        assert!(!connection.is_running());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn subscribe_twice_reuses_connection() {
        let (mut registry, _rx) = registry();
        let id = EntityId::from("doc1");

        let first = registry.subscribe(&id, noop(), false);
        let second = registry.subscribe(&id, noop(), false);

        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id).unwrap().is_running());
    }

    #[tokio::test]
    async fn forced_subscribe_replaces_connection() {
        let (mut registry, _rx) = registry();
        let id = EntityId::from("doc1");

        let first = registry.subscribe(&id, noop(), false);
        let old_token = registry.get(&id).unwrap().cancellation();

        let second = registry.subscribe(&id, noop(), true);

        assert!(second.generation() > first.generation());
        assert!(old_token.is_cancelled());
        assert_eq!(registry.len(), 1);
        assert!(registry.is_current(&id, second.generation()));
        assert!(!registry.is_current(&id, first.generation()));
    }

    #[tokio::test]
    async fn terminated_connection_is_replaced_on_lookup() {
        let (mut registry, _rx) = registry();
        let id = EntityId::from("doc1");

        let first = registry.subscribe(&id, noop(), false);
        registry
            .current_mut(&id, first.generation())
            .unwrap()
            .connection
            .observe(ConnectionState::Closed(CloseReason::Exhausted));

        let second = registry.subscribe(&id, noop(), false);
        assert_ne!(first.generation(), second.generation());
        assert!(registry.get(&id).unwrap().is_live());
    }

    #[tokio::test]
    async fn unsubscribe_unknown_is_noop() {
        let (mut registry, _rx) = registry();
        assert!(!registry.unsubscribe(&EntityId::from("missing")));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_cancels_connection() {
        let (mut registry, _rx) = registry();
        let id = EntityId::from("doc1");

        registry.subscribe(&id, noop(), false);
        let token = registry.get(&id).unwrap().cancellation();

        assert!(registry.unsubscribe(&id));
        assert!(token.is_cancelled());
        assert!(!registry.contains(&id));
    }

    #[tokio::test]
    async fn unsubscribe_all_closes_everything() {
        let (mut registry, _rx) = registry();
        for id in ["a", "b", "c"] {
            registry.subscribe(&EntityId::from(id), noop(), false);
        }

        assert_eq!(registry.unsubscribe_all(), 3);
        assert!(registry.is_empty());
        assert_eq!(registry.unsubscribe_all(), 0);
    }

    #[tokio::test]
    async fn remove_if_current_ignores_stale_generation() {
        let (mut registry, _rx) = registry();
        let id = EntityId::from("doc1");

        let first = registry.subscribe(&id, noop(), false);
        let second = registry.subscribe(&id, noop(), true);

        assert!(registry.remove_if_current(&id, first.generation()).is_none());
        assert!(registry.contains(&id));
        assert!(registry.remove_if_current(&id, second.generation()).is_some());
        assert!(!registry.contains(&id));
    }
}
