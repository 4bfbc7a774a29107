//! Message persistence: send, history and soft delete.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::auth::middleware::Claims;
use crate::chat::conversations::{other_participant_ids, require_participant};
use crate::db::models::{CallStatus, Message, MessageType};
use crate::db::{self, with_conn};
use crate::error::{ApiResponse, ApiResult, ApiStatusResult, AppError, AppJson};
use crate::state::AppState;
use crate::ws::events::{MessageDeleted, ServerEvent};

/// Maximum message content length (chars).
const MAX_CONTENT_LENGTH: usize = 4000;
/// Default page size for message history.
const DEFAULT_LIMIT: u32 = 50;
/// Maximum page size for message history.
const MAX_LIMIT: u32 = 100;

pub fn find_message(conn: &Connection, message_id: i64) -> Result<Option<Message>, AppError> {
    let message = conn
        .query_row(
            &format!("SELECT {} FROM messages WHERE id = ?1", Message::COLUMNS),
            params![message_id],
            Message::from_row,
        )
        .optional()?;
    Ok(message)
}

/// Everything needed to write one message row.
#[derive(Debug, Clone)]
pub(crate) struct MessageDraft {
    pub conversation_id: i64,
    pub sender_id: i64,
    pub receiver_id: Option<i64>,
    pub content: Option<String>,
    pub message_type: MessageType,
    pub media_url: Option<String>,
    pub reply_to_id: Option<i64>,
    pub call_status: Option<CallStatus>,
    pub call_started_at: Option<String>,
}

/// Insert a message, bump the conversation's `last_message_at` and mark the
/// conversation read for the sender, all in one transaction.
pub(crate) fn persist_message(conn: &mut Connection, draft: &MessageDraft) -> Result<Message, AppError> {
    let now = db::now();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO messages (conversation_id, sender_id, receiver_id, content, message_type,
                               media_url, reply_to_id, status, call_status, call_started_at,
                               created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'sent', ?8, ?9, ?10, ?10)",
        params![
            draft.conversation_id,
            draft.sender_id,
            draft.receiver_id,
            draft.content,
            draft.message_type,
            draft.media_url,
            draft.reply_to_id,
            draft.call_status,
            draft.call_started_at,
            now
        ],
    )?;
    let message_id = tx.last_insert_rowid();
    tx.execute(
        "UPDATE conversations SET last_message_at = ?1 WHERE id = ?2",
        params![now, draft.conversation_id],
    )?;
    tx.execute(
        "UPDATE conversation_participants SET last_read_at = ?1
         WHERE conversation_id = ?2 AND user_id = ?3",
        params![now, draft.conversation_id, draft.sender_id],
    )?;
    let message = tx.query_row(
        &format!("SELECT {} FROM messages WHERE id = ?1", Message::COLUMNS),
        params![message_id],
        Message::from_row,
    )?;
    tx.commit()?;
    Ok(message)
}

// --- Send ---

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: i64,
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub message_type: Option<MessageType>,
    pub media_url: Option<String>,
    pub reply_to_id: Option<i64>,
}

fn validate_payload(
    message_type: MessageType,
    content: Option<&str>,
    media_url: Option<&str>,
) -> Result<(), AppError> {
    if message_type.is_call() {
        return Err(AppError::invalid(
            "Call messages are created by initiating a call",
        ));
    }
    if let Some(content) = content {
        if content.chars().count() > MAX_CONTENT_LENGTH {
            return Err(AppError::invalid(format!(
                "Message content exceeds maximum length of {} characters",
                MAX_CONTENT_LENGTH
            )));
        }
    }
    if message_type == MessageType::Text && content.map_or(true, |c| c.trim().is_empty()) {
        return Err(AppError::invalid("Message content cannot be empty"));
    }
    if message_type.is_media() && media_url.map_or(true, |u| u.trim().is_empty()) {
        return Err(AppError::invalid(format!(
            "A mediaUrl is required for {} messages",
            message_type
        )));
    }
    Ok(())
}

/// Validate and store a message. Returns it with the ids of the other participants.
pub fn insert_message(
    conn: &mut Connection,
    user_id: i64,
    req: SendMessageRequest,
) -> Result<(Message, Vec<i64>), AppError> {
    let message_type = req.message_type.unwrap_or(MessageType::Text);
    validate_payload(message_type, req.content.as_deref(), req.media_url.as_deref())?;

    require_participant(conn, req.conversation_id, user_id)?;

    if let Some(reply_to_id) = req.reply_to_id {
        let target_conversation: Option<i64> = conn
            .query_row(
                "SELECT conversation_id FROM messages WHERE id = ?1",
                params![reply_to_id],
                |row| row.get(0),
            )
            .optional()?;
        if target_conversation != Some(req.conversation_id) {
            return Err(AppError::invalid(
                "Reply target must belong to the same conversation",
            ));
        }
    }

    let message = persist_message(
        conn,
        &MessageDraft {
            conversation_id: req.conversation_id,
            sender_id: user_id,
            receiver_id: None,
            content: req.content,
            message_type,
            media_url: req.media_url,
            reply_to_id: req.reply_to_id,
            call_status: None,
            call_started_at: None,
        },
    )?;
    let recipients = other_participant_ids(conn, message.conversation_id, user_id)?;
    Ok((message, recipients))
}

/// Store a message and push `new_message` to the other participants.
/// The row is committed before anything is dispatched.
pub async fn send_message(
    state: &AppState,
    user_id: i64,
    req: SendMessageRequest,
) -> Result<Message, AppError> {
    let (message, recipients) = with_conn(&state.db, move |conn| insert_message(conn, user_id, req)).await?;

    tracing::debug!(
        message_id = message.id,
        conversation_id = message.conversation_id,
        sender_id = user_id,
        "Message stored"
    );
    state
        .dispatcher
        .dispatch(recipients, &ServerEvent::NewMessage(message.clone()));
    Ok(message)
}

// --- History ---

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

/// Messages of a conversation, newest first. `before` is an exclusive
/// message-id cursor. Soft-deleted messages are included.
pub fn list_messages(
    conn: &Connection,
    user_id: i64,
    conversation_id: i64,
    before: Option<i64>,
    limit: u32,
) -> Result<MessagePage, AppError> {
    require_participant(conn, conversation_id, user_id)?;
    let limit = limit.clamp(1, MAX_LIMIT);

    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM messages
         WHERE conversation_id = ?1 AND (?2 IS NULL OR id < ?2)
         ORDER BY id DESC
         LIMIT ?3",
        Message::COLUMNS
    ))?;
    let mut messages = stmt
        .query_map(params![conversation_id, before, limit + 1], Message::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let has_more = messages.len() > limit as usize;
    messages.truncate(limit as usize);
    Ok(MessagePage { messages, has_more })
}

// --- Delete ---

/// Outcome of a delete request.
#[derive(Debug)]
pub struct Deletion {
    pub message: Message,
    /// False when the message had already been deleted.
    pub changed: bool,
    pub recipients: Vec<i64>,
}

/// Soft-delete a message: content and media are cleared, the row stays.
pub fn soft_delete(conn: &Connection, user_id: i64, message_id: i64) -> Result<Deletion, AppError> {
    let message = find_message(conn, message_id)?
        .ok_or_else(|| AppError::not_found("Message not found"))?;
    if message.sender_id != user_id {
        return Err(AppError::forbidden("Only the sender can delete this message"));
    }
    if message.is_deleted() {
        return Ok(Deletion {
            message,
            changed: false,
            recipients: Vec::new(),
        });
    }

    let now = db::now();
    conn.execute(
        "UPDATE messages SET content = NULL, media_url = NULL, deleted_at = ?1, updated_at = ?1
         WHERE id = ?2",
        params![now, message_id],
    )?;
    let message = find_message(conn, message_id)?
        .ok_or_else(|| AppError::internal("message vanished during delete"))?;
    let recipients = other_participant_ids(conn, message.conversation_id, user_id)?;
    Ok(Deletion {
        message,
        changed: true,
        recipients,
    })
}

/// Soft-delete a message and push `message_deleted` to the other participants.
/// Deleting an already deleted message is a no-op and sends nothing.
pub async fn delete_message(state: &AppState, user_id: i64, message_id: i64) -> Result<Message, AppError> {
    let deletion = with_conn(&state.db, move |conn| soft_delete(conn, user_id, message_id)).await?;

    if deletion.changed {
        let event = ServerEvent::MessageDeleted(MessageDeleted {
            message_id: deletion.message.id,
            conversation_id: deletion.message.conversation_id,
            deleted_at: deletion.message.deleted_at.clone().unwrap_or_default(),
        });
        state.dispatcher.dispatch(deletion.recipients, &event);
        tracing::info!(message_id, user_id, "Message deleted");
    }
    Ok(deletion.message)
}

// --- REST handlers ---

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub before: Option<i64>,
    pub limit: Option<u32>,
}

/// POST /api/messages
pub async fn send_message_handler(
    State(state): State<AppState>,
    claims: Claims,
    AppJson(req): AppJson<SendMessageRequest>,
) -> ApiStatusResult<Message> {
    let message = send_message(&state, claims.sub, req).await?;
    Ok(ApiResponse::with_status(StatusCode::CREATED, message))
}

/// GET /api/conversations/{id}/messages?before&limit
pub async fn list_messages_handler(
    State(state): State<AppState>,
    claims: Claims,
    Path(conversation_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<MessagePage> {
    let user_id = claims.sub;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    let page = with_conn(&state.db, move |conn| {
        list_messages(conn, user_id, conversation_id, query.before, limit)
    })
    .await?;
    Ok(ApiResponse::ok(page))
}

/// DELETE /api/messages/{id}
pub async fn delete_message_handler(
    State(state): State<AppState>,
    claims: Claims,
    Path(message_id): Path<i64>,
) -> ApiResult<Message> {
    let message = delete_message(&state, claims.sub, message_id).await?;
    Ok(ApiResponse::ok(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::conversations::{find_participant, list_conversations, open_direct};
    use crate::users::test_support::user;
    use crate::ws::ConnectionHandle;
    use tokio::sync::mpsc;

    fn text(conversation_id: i64, content: &str) -> SendMessageRequest {
        SendMessageRequest {
            conversation_id,
            content: Some(content.to_string()),
            message_type: None,
            media_url: None,
            reply_to_id: None,
        }
    }

    fn pair(conn: &mut Connection) -> (i64, i64, i64) {
        let alice = user(conn, "alice");
        let bob = user(conn, "bob");
        let (conversation, _) = open_direct(conn, alice, bob).unwrap();
        (alice, bob, conversation.id)
    }

    #[test]
    fn test_send_updates_activity_and_unread_counts() {
        let mut conn = db::open_in_memory().unwrap();
        let (alice, bob, conversation_id) = pair(&mut conn);

        let (message, recipients) = insert_message(&mut conn, alice, text(conversation_id, "hi")).unwrap();
        assert_eq!(recipients, vec![bob]);
        assert_eq!(message.status, crate::db::models::MessageStatus::Sent);
        assert_eq!(message.message_type, MessageType::Text);

        let alice_view = list_conversations(&conn, alice, 1, 20).unwrap();
        let bob_view = list_conversations(&conn, bob, 1, 20).unwrap();
        assert_eq!(alice_view.conversations[0].last_message_at.as_deref(), Some(message.created_at.as_str()));
        assert_eq!(bob_view.conversations[0].last_message_at.as_deref(), Some(message.created_at.as_str()));
        assert_eq!(alice_view.conversations[0].unread_count, 0);
        assert_eq!(bob_view.conversations[0].unread_count, 1);

        let sender = find_participant(&conn, conversation_id, alice).unwrap().unwrap();
        assert_eq!(sender.last_read_at, message.created_at);
    }

    #[test]
    fn test_send_rejects_outsiders_and_bad_payloads() {
        let mut conn = db::open_in_memory().unwrap();
        let (alice, _bob, conversation_id) = pair(&mut conn);
        let mallory = user(&conn, "mallory");

        assert!(matches!(
            insert_message(&mut conn, mallory, text(conversation_id, "hi")),
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            insert_message(&mut conn, alice, text(9999, "hi")),
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            insert_message(&mut conn, alice, text(conversation_id, "   ")),
            Err(AppError::InvalidArgument(_))
        ));
        assert!(matches!(
            insert_message(&mut conn, alice, text(conversation_id, &"x".repeat(4001))),
            Err(AppError::InvalidArgument(_))
        ));

        let mut image = text(conversation_id, "");
        image.message_type = Some(MessageType::Image);
        assert!(matches!(
            insert_message(&mut conn, alice, image.clone()),
            Err(AppError::InvalidArgument(_))
        ));
        image.media_url = Some("https://cdn.example.com/a.png".into());
        assert!(insert_message(&mut conn, alice, image).is_ok());

        let mut call = text(conversation_id, "ring");
        call.message_type = Some(MessageType::CallAudio);
        assert!(matches!(
            insert_message(&mut conn, alice, call),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_reply_must_target_same_conversation() {
        let mut conn = db::open_in_memory().unwrap();
        let (alice, bob, conversation_id) = pair(&mut conn);
        let carol = user(&conn, "carol");
        let (elsewhere, _) = open_direct(&mut conn, alice, carol).unwrap();

        let (original, _) = insert_message(&mut conn, bob, text(conversation_id, "question")).unwrap();
        let (foreign, _) = insert_message(&mut conn, carol, text(elsewhere.id, "other")).unwrap();

        let mut reply = text(conversation_id, "answer");
        reply.reply_to_id = Some(original.id);
        let (stored, _) = insert_message(&mut conn, alice, reply.clone()).unwrap();
        assert_eq!(stored.reply_to_id, Some(original.id));

        reply.reply_to_id = Some(foreign.id);
        assert!(matches!(
            insert_message(&mut conn, alice, reply.clone()),
            Err(AppError::InvalidArgument(_))
        ));
        reply.reply_to_id = Some(424242);
        assert!(matches!(
            insert_message(&mut conn, alice, reply),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_history_is_newest_first_with_cursor() {
        let mut conn = db::open_in_memory().unwrap();
        let (alice, _bob, conversation_id) = pair(&mut conn);
        let mut ids = Vec::new();
        for i in 0..5 {
            let (m, _) = insert_message(&mut conn, alice, text(conversation_id, &format!("m{}", i))).unwrap();
            ids.push(m.id);
        }

        let first = list_messages(&conn, alice, conversation_id, None, 2).unwrap();
        let got: Vec<i64> = first.messages.iter().map(|m| m.id).collect();
        assert_eq!(got, vec![ids[4], ids[3]]);
        assert!(first.has_more);

        let rest = list_messages(&conn, alice, conversation_id, Some(ids[3]), 10).unwrap();
        let got: Vec<i64> = rest.messages.iter().map(|m| m.id).collect();
        assert_eq!(got, vec![ids[2], ids[1], ids[0]]);
        assert!(!rest.has_more);
    }

    #[test]
    fn test_soft_delete_clears_content_and_only_sender_may_delete() {
        let mut conn = db::open_in_memory().unwrap();
        let (alice, bob, conversation_id) = pair(&mut conn);
        let (message, _) = insert_message(&mut conn, alice, text(conversation_id, "oops")).unwrap();

        assert!(matches!(soft_delete(&conn, bob, message.id), Err(AppError::Forbidden(_))));
        assert!(matches!(soft_delete(&conn, alice, 777), Err(AppError::NotFound(_))));

        let deletion = soft_delete(&conn, alice, message.id).unwrap();
        assert!(deletion.changed);
        assert_eq!(deletion.recipients, vec![bob]);
        assert!(deletion.message.content.is_none());
        assert!(deletion.message.is_deleted());

        let again = soft_delete(&conn, alice, message.id).unwrap();
        assert!(!again.changed);

        // Deleted rows stay in history but no longer count as the last message.
        let history = list_messages(&conn, bob, conversation_id, None, 10).unwrap();
        assert_eq!(history.messages.len(), 1);
        let listing = list_conversations(&conn, bob, 1, 20).unwrap();
        assert!(listing.conversations[0].last_message.is_none());
    }

    #[tokio::test]
    async fn test_send_pushes_new_message_to_other_participants_only() {
        let state = AppState::for_tests();
        let (alice, bob, conversation_id) = {
            let mut conn = state.db.lock().unwrap();
            pair(&mut conn)
        };
        let (alice_tx, mut alice_rx) = mpsc::channel(4);
        let (bob_tx, mut bob_rx) = mpsc::channel(4);
        state.connections.add(alice, ConnectionHandle::new(alice_tx));
        state.connections.add(bob, ConnectionHandle::new(bob_tx));

        let message = send_message(&state, alice, text(conversation_id, "hello")).await.unwrap();

        let frame = match bob_rx.try_recv().unwrap() {
            axum::extract::ws::Message::Text(text) => {
                serde_json::from_str::<serde_json::Value>(text.as_str()).unwrap()
            }
            other => panic!("unexpected frame {:?}", other),
        };
        assert_eq!(frame["type"], "new_message");
        assert_eq!(frame["data"]["id"], message.id);
        assert_eq!(frame["data"]["content"], "hello");
        assert!(alice_rx.try_recv().is_err());

        delete_message(&state, alice, message.id).await.unwrap();
        delete_message(&state, alice, message.id).await.unwrap();
        let frame = match bob_rx.try_recv().unwrap() {
            axum::extract::ws::Message::Text(text) => {
                serde_json::from_str::<serde_json::Value>(text.as_str()).unwrap()
            }
            other => panic!("unexpected frame {:?}", other),
        };
        assert_eq!(frame["type"], "message_deleted");
        assert_eq!(frame["data"]["messageId"], message.id);
        assert!(bob_rx.try_recv().is_err());
    }
}
