use tokio::sync::mpsc;

use crate::chat::presence::spawn_presence_worker;
use crate::config::RealtimeConfig;
use crate::db::DbPool;
use crate::ws::broadcast::EventDispatcher;
use crate::ws::ConnectionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
    /// Active WebSocket connections per user
    pub connections: ConnectionRegistry,
    /// Fan-out of events to live connections
    pub dispatcher: EventDispatcher,
    /// Live connection tuning
    pub realtime: RealtimeConfig,
}

impl AppState {
    /// Build the state and start the presence worker. Must be called inside
    /// a tokio runtime.
    pub fn new(db: DbPool, jwt_secret: Vec<u8>, realtime: RealtimeConfig) -> Self {
        let (presence_tx, presence_rx) = mpsc::unbounded_channel();
        spawn_presence_worker(db.clone(), presence_rx);

        let connections = ConnectionRegistry::with_presence(presence_tx);
        let dispatcher = EventDispatcher::new(connections.clone());
        Self {
            db,
            jwt_secret,
            connections,
            dispatcher,
            realtime,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        let conn = crate::db::open_in_memory().expect("in-memory database");
        Self::new(
            std::sync::Arc::new(std::sync::Mutex::new(conn)),
            vec![7u8; 32],
            RealtimeConfig::default(),
        )
    }
}
