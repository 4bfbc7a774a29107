//! Read receipts and unread counts.
//!
//! Unread counts are never stored; they are derived from the participant's
//! `last_read_at` watermark on every read.

use axum::{
    body::Bytes,
    extract::{Path, State},
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::auth::middleware::Claims;
use crate::chat::conversations::require_participant;
use crate::db::{self, with_conn};
use crate::error::{ApiResponse, ApiResult, AppError};
use crate::state::AppState;
use crate::ws::events::{MessageRead, ServerEvent};

/// Messages from others created after the watermark.
pub fn unread_count(
    conn: &Connection,
    conversation_id: i64,
    user_id: i64,
    last_read_at: &str,
) -> Result<i64, AppError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM messages
         WHERE conversation_id = ?1 AND sender_id != ?2 AND created_at > ?3",
        params![conversation_id, user_id, last_read_at],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: i64,
    pub last_read_message_id: Option<i64>,
    pub last_read_at: String,
    /// Number of messages moved to `read`.
    pub updated: usize,
    /// Sender to notify, when the cursor message was sent by someone else.
    #[serde(skip)]
    pub notify: Option<i64>,
}

/// Advance the caller's read state in a conversation.
///
/// With a cursor, every message up to and including it that others sent and
/// that is still `sent` or `delivered` becomes `read`, and the watermark moves
/// to the cursor message's timestamp. Without one, the whole conversation is
/// marked read and the watermark moves to now.
pub fn apply_read(
    conn: &mut Connection,
    user_id: i64,
    conversation_id: i64,
    last_read_message_id: Option<i64>,
) -> Result<ReadReceipt, AppError> {
    require_participant(conn, conversation_id, user_id)?;

    let cursor = match last_read_message_id {
        Some(message_id) => conn
            .query_row(
                "SELECT created_at, sender_id FROM messages WHERE id = ?1 AND conversation_id = ?2",
                params![message_id, conversation_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?,
        None => None,
    };

    let now = db::now();
    let tx = conn.transaction()?;
    let updated = tx.execute(
        "UPDATE messages SET status = 'read', updated_at = ?1
         WHERE conversation_id = ?2 AND sender_id != ?3
           AND status IN ('sent', 'delivered')
           AND (?4 IS NULL OR id <= ?4)",
        params![now, conversation_id, user_id, last_read_message_id],
    )?;
    // Falls back to now when the cursor message cannot be found.
    let last_read_at = cursor
        .as_ref()
        .map(|(created_at, _)| created_at.clone())
        .unwrap_or_else(|| now.clone());
    tx.execute(
        "UPDATE conversation_participants SET last_read_at = ?1
         WHERE conversation_id = ?2 AND user_id = ?3",
        params![last_read_at, conversation_id, user_id],
    )?;
    tx.commit()?;

    let notify = cursor
        .map(|(_, sender_id)| sender_id)
        .filter(|sender_id| *sender_id != user_id);

    Ok(ReadReceipt {
        conversation_id,
        last_read_message_id,
        last_read_at,
        updated,
        notify,
    })
}

/// Mark messages read and tell the cursor message's sender.
pub async fn mark_read(
    state: &AppState,
    user_id: i64,
    conversation_id: i64,
    last_read_message_id: Option<i64>,
) -> Result<ReadReceipt, AppError> {
    let receipt = with_conn(&state.db, move |conn| {
        apply_read(conn, user_id, conversation_id, last_read_message_id)
    })
    .await?;

    if let (Some(sender_id), Some(message_id)) = (receipt.notify, receipt.last_read_message_id) {
        let event = ServerEvent::MessageRead(MessageRead {
            message_id,
            conversation_id,
            reader_id: user_id,
            read_at: receipt.last_read_at.clone(),
        });
        state.dispatcher.send_to_user(sender_id, &event);
    }

    tracing::debug!(
        conversation_id,
        user_id,
        updated = receipt.updated,
        "Conversation marked read"
    );
    Ok(receipt)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    pub last_read_message_id: Option<i64>,
}

/// POST /api/conversations/{id}/read
pub async fn mark_read_handler(
    State(state): State<AppState>,
    claims: Claims,
    Path(conversation_id): Path<i64>,
    body: Bytes,
) -> ApiResult<ReadReceipt> {
    // The body is optional: an empty request marks the whole conversation read.
    let req: MarkReadRequest = if body.is_empty() {
        MarkReadRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::invalid(format!("Invalid request body: {}", e)))?
    };
    let receipt = mark_read(&state, claims.sub, conversation_id, req.last_read_message_id).await?;
    Ok(ApiResponse::ok(receipt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::conversations::{find_participant, insert_group, open_direct};
    use crate::chat::messages::{find_message, insert_message, SendMessageRequest};
    use crate::db::models::MessageStatus;
    use crate::users::test_support::user;
    use crate::ws::ConnectionHandle;
    use tokio::sync::mpsc;

    fn send(conn: &mut Connection, sender: i64, conversation_id: i64, content: &str) -> i64 {
        insert_message(
            conn,
            sender,
            SendMessageRequest {
                conversation_id,
                content: Some(content.to_string()),
                message_type: None,
                media_url: None,
                reply_to_id: None,
            },
        )
        .unwrap()
        .0
        .id
    }

    #[test]
    fn test_cursor_marks_only_earlier_messages_from_others() {
        let mut conn = db::open_in_memory().unwrap();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let (conversation, _) = open_direct(&mut conn, alice, bob).unwrap();

        let first = send(&mut conn, bob, conversation.id, "one");
        let own = send(&mut conn, alice, conversation.id, "mine");
        let second = send(&mut conn, bob, conversation.id, "two");
        let third = send(&mut conn, bob, conversation.id, "three");

        let receipt = apply_read(&mut conn, alice, conversation.id, Some(second)).unwrap();
        assert_eq!(receipt.updated, 2);
        assert_eq!(receipt.notify, Some(bob));

        let status = |id| find_message(&conn, id).unwrap().unwrap().status;
        assert_eq!(status(first), MessageStatus::Read);
        assert_eq!(status(second), MessageStatus::Read);
        assert_eq!(status(third), MessageStatus::Sent);
        assert_eq!(status(own), MessageStatus::Sent);

        let cursor_at = find_message(&conn, second).unwrap().unwrap().created_at;
        let participant = find_participant(&conn, conversation.id, alice).unwrap().unwrap();
        assert_eq!(participant.last_read_at, cursor_at);
        assert_eq!(
            unread_count(&conn, conversation.id, alice, &participant.last_read_at).unwrap(),
            1
        );
    }

    #[test]
    fn test_without_cursor_everything_is_read_and_nobody_is_notified() {
        let mut conn = db::open_in_memory().unwrap();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let carol = user(&conn, "carol");
        let group = insert_group(&mut conn, alice, "Trio", &[bob, carol]).unwrap();
        let conversation_id = group.conversation.id;

        send(&mut conn, bob, conversation_id, "a");
        send(&mut conn, carol, conversation_id, "b");

        let receipt = apply_read(&mut conn, alice, conversation_id, None).unwrap();
        assert_eq!(receipt.updated, 2);
        assert!(receipt.notify.is_none());
        assert_eq!(
            unread_count(&conn, conversation_id, alice, &receipt.last_read_at).unwrap(),
            0
        );
    }

    #[test]
    fn test_unknown_cursor_falls_back_to_now() {
        let mut conn = db::open_in_memory().unwrap();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let (conversation, _) = open_direct(&mut conn, alice, bob).unwrap();
        send(&mut conn, bob, conversation.id, "hello");

        let before = db::now();
        let receipt = apply_read(&mut conn, alice, conversation.id, Some(9999)).unwrap();
        assert!(receipt.last_read_at >= before);
        assert!(receipt.notify.is_none());
    }

    #[test]
    fn test_reading_own_message_notifies_nobody() {
        let mut conn = db::open_in_memory().unwrap();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let (conversation, _) = open_direct(&mut conn, alice, bob).unwrap();
        let own = send(&mut conn, alice, conversation.id, "note to self");

        let receipt = apply_read(&mut conn, alice, conversation.id, Some(own)).unwrap();
        assert_eq!(receipt.updated, 0);
        assert!(receipt.notify.is_none());
    }

    #[test]
    fn test_mark_read_requires_existing_conversation_and_membership() {
        let mut conn = db::open_in_memory().unwrap();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let mallory = user(&conn, "mallory");
        let (conversation, _) = open_direct(&mut conn, alice, bob).unwrap();

        assert!(matches!(
            apply_read(&mut conn, alice, 4040, None),
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            apply_read(&mut conn, mallory, conversation.id, None),
            Err(AppError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_sender_receives_message_read() {
        let state = AppState::for_tests();
        let (alice, bob, conversation_id, message_id) = {
            let mut conn = state.db.lock().unwrap();
            let alice = user(&conn, "alice");
            let bob = user(&conn, "bob");
            let (conversation, _) = open_direct(&mut conn, alice, bob).unwrap();
            let message_id = send(&mut conn, bob, conversation.id, "ping");
            (alice, bob, conversation.id, message_id)
        };
        let (tx, mut rx) = mpsc::channel(4);
        state.connections.add(bob, ConnectionHandle::new(tx));

        let receipt = mark_read(&state, alice, conversation_id, Some(message_id)).await.unwrap();

        let frame = match rx.try_recv().unwrap() {
            axum::extract::ws::Message::Text(text) => {
                serde_json::from_str::<serde_json::Value>(text.as_str()).unwrap()
            }
            other => panic!("unexpected frame {:?}", other),
        };
        assert_eq!(frame["type"], "message_read");
        assert_eq!(frame["data"]["messageId"], message_id);
        assert_eq!(frame["data"]["readerId"], alice);
        assert_eq!(frame["data"]["readAt"], receipt.last_read_at.as_str());
    }
}
