//! Persisted presence.
//!
//! The connection registry reports occupancy transitions (first connection
//! opened, last connection closed) on an unbounded channel. A single worker
//! drains that channel and writes `users.status` / `users.last_active_at`,
//! so updates for one user land in the order the registry produced them.

use rusqlite::{params, Connection};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::db::models::UserStatus;
use crate::db::{self, DbPool};
use crate::error::AppError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceTransition {
    Online { user_id: i64, at: String },
    Offline { user_id: i64, at: String },
}

impl PresenceTransition {
    pub fn online(user_id: i64) -> Self {
        Self::Online {
            user_id,
            at: db::now(),
        }
    }

    pub fn offline(user_id: i64) -> Self {
        Self::Offline {
            user_id,
            at: db::now(),
        }
    }

    pub fn user_id(&self) -> i64 {
        match self {
            Self::Online { user_id, .. } | Self::Offline { user_id, .. } => *user_id,
        }
    }

    pub fn status(&self) -> UserStatus {
        match self {
            Self::Online { .. } => UserStatus::Online,
            Self::Offline { .. } => UserStatus::Offline,
        }
    }

    pub fn at(&self) -> &str {
        match self {
            Self::Online { at, .. } | Self::Offline { at, .. } => at,
        }
    }
}

/// Write one transition to the users table.
pub fn persist_transition(conn: &Connection, transition: &PresenceTransition) -> Result<(), AppError> {
    let updated = conn.execute(
        "UPDATE users SET status = ?1, last_active_at = ?2 WHERE id = ?3",
        params![transition.status(), transition.at(), transition.user_id()],
    )?;
    if updated == 0 {
        return Err(AppError::not_found(format!(
            "User {} not found",
            transition.user_id()
        )));
    }
    Ok(())
}

/// Spawn the task that persists presence transitions.
///
/// Failures are logged and skipped; a lost presence write never affects the
/// connection that caused it. The task ends once every sender is dropped.
pub fn spawn_presence_worker(
    db: DbPool,
    mut transitions: mpsc::UnboundedReceiver<PresenceTransition>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(transition) = transitions.recv().await {
            let user_id = transition.user_id();
            let status = transition.status();
            let result = db::with_conn(&db, move |conn| persist_transition(conn, &transition)).await;
            match result {
                Ok(()) => tracing::debug!(user_id, status = %status, "Presence persisted"),
                Err(e) => tracing::warn!(
                    user_id,
                    status = %status,
                    error = %e,
                    "Failed to persist presence"
                ),
            }
        }
        tracing::debug!("Presence worker stopped");
    })
}
