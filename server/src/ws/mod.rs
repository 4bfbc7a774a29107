pub mod actor;
pub mod broadcast;
pub mod events;
pub mod handler;
pub mod protocol;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::chat::presence::PresenceTransition;

/// Sender half of a connection's bounded outbound queue.
/// Other parts of the system clone this to push frames to a specific client.
pub type ConnectionSender = mpsc::Sender<axum::extract::ws::Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One live connection: an identity plus the queue feeding its writer task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    sender: ConnectionSender,
}

impl ConnectionHandle {
    pub fn new(sender: ConnectionSender) -> Self {
        Self {
            id: ConnectionId::new(),
            sender,
        }
    }

    pub fn sender(&self) -> &ConnectionSender {
        &self.sender
    }
}

/// Connection registry: tracks all live connections per user id.
/// A user can have multiple concurrent connections (multiple devices/tabs).
///
/// Occupancy transitions (0 -> 1 and 1 -> 0 connections) are emitted on the
/// presence channel while the user's map entry is still locked, so the
/// presence worker observes them in the same order the registry applied them.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<i64, Vec<ConnectionHandle>>>,
    transitions: Option<mpsc::UnboundedSender<PresenceTransition>>,
}

impl ConnectionRegistry {
    /// Registry without presence reporting.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that reports occupancy transitions to `transitions`.
    pub fn with_presence(transitions: mpsc::UnboundedSender<PresenceTransition>) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            transitions: Some(transitions),
        }
    }

    /// Register a connection. Returns true if it is the user's first one.
    pub fn add(&self, user_id: i64, handle: ConnectionHandle) -> bool {
        let mut entry = self.connections.entry(user_id).or_default();
        let first = entry.is_empty();
        entry.push(handle);
        if first {
            self.emit(PresenceTransition::online(user_id));
        }
        let count = entry.len();
        drop(entry);

        tracing::debug!(user_id = %user_id, connections = count, "Connection registered");
        first
    }

    /// Remove a connection. Returns true if it was the user's last one.
    pub fn remove(&self, user_id: i64, connection_id: ConnectionId) -> bool {
        let last = match self.connections.entry(user_id) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().retain(|c| c.id != connection_id);
                if entry.get().is_empty() {
                    self.emit(PresenceTransition::offline(user_id));
                    entry.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => false,
        };

        tracing::debug!(
            user_id = %user_id,
            connection_id = %connection_id,
            last,
            "Connection unregistered"
        );
        last
    }

    /// Snapshot of a user's live connections; empty if offline.
    pub fn connections_for(&self, user_id: i64) -> Vec<ConnectionHandle> {
        self.connections
            .get(&user_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub fn online_user_count(&self) -> usize {
        self.connections.len()
    }

    fn emit(&self, transition: PresenceTransition) {
        if let Some(tx) = &self.transitions {
            if tx.send(transition).is_err() {
                tracing::warn!("Presence worker is gone, dropping transition");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::UserStatus;

    fn handle() -> (ConnectionHandle, mpsc::Receiver<axum::extract::ws::Message>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnectionHandle::new(tx), rx)
    }

    #[test]
    fn test_multiple_connections_per_user() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = handle();
        let (b, _rx_b) = handle();
        let (a_id, b_id) = (a.id, b.id);

        assert!(registry.add(3, a));
        assert!(!registry.add(3, b));
        assert_eq!(registry.connections_for(3).len(), 2);

        assert!(!registry.remove(3, a_id));
        assert!(registry.is_online(3));
        assert!(registry.remove(3, b_id));
        assert!(!registry.is_online(3));
        assert!(registry.connections_for(3).is_empty());
    }

    #[test]
    fn test_removing_unknown_connection_is_harmless() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = handle();
        assert!(!registry.remove(9, a.id));
        registry.add(9, a.clone());
        let (stranger, _rx2) = handle();
        assert!(!registry.remove(9, stranger.id));
        assert_eq!(registry.connections_for(9).len(), 1);
    }

    #[test]
    fn test_only_occupancy_changes_emit_transitions() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = ConnectionRegistry::with_presence(tx);
        let (a, _rx_a) = handle();
        let (b, _rx_b) = handle();
        let (a_id, b_id) = (a.id, b.id);

        registry.add(4, a);
        registry.add(4, b);
        registry.remove(4, a_id);
        registry.remove(4, b_id);

        let first = rx.try_recv().unwrap();
        assert_eq!((first.user_id(), first.status()), (4, UserStatus::Online));
        let second = rx.try_recv().unwrap();
        assert_eq!((second.user_id(), second.status()), (4, UserStatus::Offline));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_connect_disconnect_leaves_registry_empty() {
        let registry = ConnectionRegistry::new();
        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (tx, _rx) = mpsc::channel(1);
                let handle = ConnectionHandle::new(tx);
                let id = handle.id;
                registry.add(i % 4, handle);
                tokio::task::yield_now().await;
                registry.remove(i % 4, id);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(registry.online_user_count(), 0);
    }
}
