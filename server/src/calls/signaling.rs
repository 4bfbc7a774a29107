//! Call signaling.
//!
//! A call is a message of type `call_audio` / `call_video` whose
//! `call_status` moves through `missed -> answered | rejected` and
//! `answered -> completed`. Media never flows through the server.

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use rusqlite::{params, Connection};
use serde::Deserialize;

use crate::auth::middleware::Claims;
use crate::chat::conversations::{other_participant_ids, require_participant};
use crate::chat::messages::{find_message, persist_message, MessageDraft};
use crate::db::models::{CallStatus, ConversationType, Message, MessageType};
use crate::db::{self, with_conn};
use crate::error::{ApiResponse, ApiResult, ApiStatusResult, AppError, AppJson};
use crate::state::AppState;
use crate::ws::events::ServerEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

impl CallKind {
    pub fn message_type(self) -> MessageType {
        match self {
            Self::Audio => MessageType::CallAudio,
            Self::Video => MessageType::CallVideo,
        }
    }
}

/// Create the call message. Returns it with the participants to ring.
pub fn start_call(
    conn: &mut Connection,
    user_id: i64,
    conversation_id: i64,
    kind: CallKind,
) -> Result<(Message, Vec<i64>), AppError> {
    let (conversation, _) = require_participant(conn, conversation_id, user_id)?;
    let others = other_participant_ids(conn, conversation_id, user_id)?;

    let receiver_id = match conversation.conversation_type {
        ConversationType::Direct => others.first().copied(),
        ConversationType::Group => None,
    };

    let message = persist_message(
        conn,
        &MessageDraft {
            conversation_id,
            sender_id: user_id,
            receiver_id,
            content: None,
            message_type: kind.message_type(),
            media_url: None,
            reply_to_id: None,
            call_status: Some(CallStatus::Missed),
            call_started_at: Some(db::now()),
        },
    )?;
    Ok((message, others))
}

/// Start a call and ring every other participant.
pub async fn initiate_call(
    state: &AppState,
    user_id: i64,
    conversation_id: i64,
    kind: CallKind,
) -> Result<Message, AppError> {
    let (message, others) =
        with_conn(&state.db, move |conn| start_call(conn, user_id, conversation_id, kind)).await?;

    tracing::info!(
        message_id = message.id,
        conversation_id,
        caller_id = user_id,
        receiver_id = ?message.receiver_id,
        "Call initiated"
    );
    state
        .dispatcher
        .dispatch(others, &ServerEvent::IncomingCall(message.clone()));
    Ok(message)
}

/// Apply a call status change. Returns the updated call and who to notify.
pub fn change_call_status(
    conn: &Connection,
    user_id: i64,
    message_id: i64,
    status: CallStatus,
    duration: Option<i64>,
) -> Result<(Message, Vec<i64>), AppError> {
    let call = find_message(conn, message_id)?
        .filter(|m| m.message_type.is_call())
        .ok_or_else(|| AppError::not_found("Call not found"))?;
    if call.sender_id != user_id && call.receiver_id != Some(user_id) {
        return Err(AppError::forbidden("Not a party to this call"));
    }
    if duration.is_some_and(|d| d < 0) {
        return Err(AppError::invalid("Call duration cannot be negative"));
    }

    let current = call.call_status.unwrap_or(CallStatus::Missed);
    if !current.can_transition_to(status) {
        return Err(AppError::invalid(format!(
            "Call cannot move from {} to {}",
            current, status
        )));
    }

    let now = db::now();
    let (ended_at, duration) = match (status, duration) {
        (CallStatus::Completed, Some(duration)) => (Some(now.as_str()), Some(duration)),
        _ => (None, None),
    };
    conn.execute(
        "UPDATE messages
         SET call_status = ?1,
             call_duration = COALESCE(?2, call_duration),
             call_ended_at = COALESCE(?3, call_ended_at),
             updated_at = ?4
         WHERE id = ?5",
        params![status, duration, ended_at, now, message_id],
    )?;
    let updated = find_message(conn, message_id)?
        .ok_or_else(|| AppError::internal("call vanished during update"))?;

    // Direct calls notify the other party; group calls have no receiver and
    // notify every other participant.
    let notify = match updated.receiver_id {
        Some(receiver_id) if receiver_id == user_id => vec![updated.sender_id],
        Some(receiver_id) => vec![receiver_id],
        None => other_participant_ids(conn, updated.conversation_id, user_id)?,
    };
    Ok((updated, notify))
}

/// Update a call's status and tell the other party.
pub async fn update_call_status(
    state: &AppState,
    user_id: i64,
    message_id: i64,
    status: CallStatus,
    duration: Option<i64>,
) -> Result<Message, AppError> {
    let (call, notify) = with_conn(&state.db, move |conn| {
        change_call_status(conn, user_id, message_id, status, duration)
    })
    .await?;

    tracing::info!(message_id, user_id, status = %status, "Call status changed");
    state
        .dispatcher
        .dispatch(notify, &ServerEvent::CallStatusChanged(call.clone()));
    Ok(call)
}

// --- REST handlers ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateCallRequest {
    pub conversation_id: i64,
    #[serde(rename = "type")]
    pub kind: CallKind,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCallStatusRequest {
    pub status: CallStatus,
    pub duration: Option<i64>,
}

/// POST /api/calls
pub async fn initiate_call_handler(
    State(state): State<AppState>,
    claims: Claims,
    AppJson(req): AppJson<InitiateCallRequest>,
) -> ApiStatusResult<Message> {
    let call = initiate_call(&state, claims.sub, req.conversation_id, req.kind).await?;
    Ok(ApiResponse::with_status(StatusCode::CREATED, call))
}

/// PATCH /api/calls/{id}/status
pub async fn update_call_status_handler(
    State(state): State<AppState>,
    claims: Claims,
    Path(message_id): Path<i64>,
    AppJson(req): AppJson<UpdateCallStatusRequest>,
) -> ApiResult<Message> {
    let call = update_call_status(&state, claims.sub, message_id, req.status, req.duration).await?;
    Ok(ApiResponse::ok(call))
}
