use axum::extract::ws::Message;
use std::collections::HashSet;
use tokio::sync::mpsc::error::TrySendError;

use super::events::ServerEvent;
use super::{ConnectionRegistry, ConnectionSender};

/// Fans events out to every live connection of a set of users.
///
/// Delivery is best-effort and never blocks: offline users are skipped, and a
/// connection whose queue is full or closed loses the frame.
#[derive(Clone)]
pub struct EventDispatcher {
    registry: ConnectionRegistry,
}

impl EventDispatcher {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    /// Send `event` to all connections of `targets`. Returns the number of
    /// connections that accepted the frame.
    pub fn dispatch<I>(&self, targets: I, event: &ServerEvent) -> usize
    where
        I: IntoIterator<Item = i64>,
    {
        let frame = match encode(event) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(event = event.kind(), error = %e, "Failed to encode event");
                return 0;
            }
        };

        let targets: HashSet<i64> = targets.into_iter().collect();
        let mut delivered = 0;
        for user_id in targets {
            for connection in self.registry.connections_for(user_id) {
                if push(connection.sender(), frame.clone()) {
                    delivered += 1;
                }
            }
        }

        tracing::debug!(event = event.kind(), delivered, "Event dispatched");
        delivered
    }

    /// Send `event` to a single user (all their connections).
    pub fn send_to_user(&self, user_id: i64, event: &ServerEvent) -> usize {
        self.dispatch([user_id], event)
    }
}

/// Encode and queue an event on one connection.
pub fn send_event(sender: &ConnectionSender, event: &ServerEvent) -> bool {
    match encode(event) {
        Ok(frame) => push(sender, frame),
        Err(e) => {
            tracing::error!(event = event.kind(), error = %e, "Failed to encode event");
            false
        }
    }
}

fn encode(event: &ServerEvent) -> Result<Message, serde_json::Error> {
    Ok(Message::Text(serde_json::to_string(event)?.into()))
}

fn push(sender: &ConnectionSender, frame: Message) -> bool {
    match sender.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::warn!("Outbound queue full, dropping frame");
            false
        }
        Err(TrySendError::Closed(_)) => {
            tracing::debug!("Connection closed, dropping frame");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::ConnectionHandle;
    use tokio::sync::mpsc;

    fn frame_json(msg: Message) -> serde_json::Value {
        match msg {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_dispatch_to_offline_user_is_a_noop() {
        let dispatcher = EventDispatcher::new(ConnectionRegistry::new());
        assert_eq!(dispatcher.dispatch([1, 2, 3], &ServerEvent::pong()), 0);
    }

    #[test]
    fn test_fan_out_reaches_every_device_once() {
        let registry = ConnectionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let (tx_c, mut rx_c) = mpsc::channel(4);
        registry.add(4, ConnectionHandle::new(tx_a));
        registry.add(4, ConnectionHandle::new(tx_b));
        registry.add(5, ConnectionHandle::new(tx_c));

        let dispatcher = EventDispatcher::new(registry);
        // Duplicate target ids must not duplicate frames.
        let delivered = dispatcher.dispatch([4, 4, 6], &ServerEvent::error("boom"));
        assert_eq!(delivered, 2);

        for rx in [&mut rx_a, &mut rx_b] {
            let value = frame_json(rx.try_recv().unwrap());
            assert_eq!(value["type"], "error");
            assert_eq!(value["data"]["message"], "boom");
            assert!(rx.try_recv().is_err());
        }
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(1);
        registry.add(7, ConnectionHandle::new(tx));
        let dispatcher = EventDispatcher::new(registry);

        assert_eq!(dispatcher.send_to_user(7, &ServerEvent::pong()), 1);
        assert_eq!(dispatcher.send_to_user(7, &ServerEvent::pong()), 0);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_connection_is_skipped() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::channel(1);
        registry.add(8, ConnectionHandle::new(tx));
        drop(rx);
        let dispatcher = EventDispatcher::new(registry);
        assert_eq!(dispatcher.send_to_user(8, &ServerEvent::pong()), 0);
    }
}
