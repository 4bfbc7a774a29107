//! Conversation store: direct and group conversations, participants and the
//! per-user conversation list.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::auth::middleware::Claims;
use crate::chat::read_state;
use crate::db::models::{
    Conversation, ConversationType, Group, GroupRole, Message, Participant, PublicProfile,
};
use crate::db::{self, with_conn};
use crate::error::{ApiResponse, ApiResult, ApiStatusResult, AppError, AppJson};
use crate::state::AppState;
use crate::users::user_exists;
use crate::ws::events::{GroupConversationCreated, ServerEvent};

/// Default page size for the conversation list.
const DEFAULT_PAGE_SIZE: u32 = 20;
/// Maximum page size for the conversation list.
const MAX_PAGE_SIZE: u32 = 100;
/// Maximum group name length (chars).
const MAX_GROUP_NAME_LENGTH: usize = 100;

pub(crate) const NOT_PARTICIPANT: &str = "Not a participant in this conversation";

/// Canonical key of the direct conversation between two users.
pub fn direct_key(a: i64, b: i64) -> String {
    format!("{}:{}", a.min(b), a.max(b))
}

// --- Lookups ---

pub fn find_conversation(conn: &Connection, conversation_id: i64) -> Result<Option<Conversation>, AppError> {
    let conversation = conn
        .query_row(
            &format!("SELECT {} FROM conversations WHERE id = ?1", Conversation::COLUMNS),
            params![conversation_id],
            Conversation::from_row,
        )
        .optional()?;
    Ok(conversation)
}

pub fn find_participant(
    conn: &Connection,
    conversation_id: i64,
    user_id: i64,
) -> Result<Option<Participant>, AppError> {
    let participant = conn
        .query_row(
            &format!(
                "SELECT {} FROM conversation_participants WHERE conversation_id = ?1 AND user_id = ?2",
                Participant::COLUMNS
            ),
            params![conversation_id, user_id],
            Participant::from_row,
        )
        .optional()?;
    Ok(participant)
}

/// Load a conversation the caller belongs to.
/// `NotFound` if the conversation is absent, `Forbidden` if the caller is not in it.
pub fn require_participant(
    conn: &Connection,
    conversation_id: i64,
    user_id: i64,
) -> Result<(Conversation, Participant), AppError> {
    let conversation = find_conversation(conn, conversation_id)?
        .ok_or_else(|| AppError::not_found("Conversation not found"))?;
    let participant = find_participant(conn, conversation_id, user_id)?
        .ok_or_else(|| AppError::forbidden(NOT_PARTICIPANT))?;
    Ok((conversation, participant))
}

pub fn participant_ids(conn: &Connection, conversation_id: i64) -> Result<Vec<i64>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM conversation_participants WHERE conversation_id = ?1 ORDER BY user_id",
    )?;
    let ids = stmt
        .query_map(params![conversation_id], |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

/// Participants of a conversation except `user_id`.
pub fn other_participant_ids(
    conn: &Connection,
    conversation_id: i64,
    user_id: i64,
) -> Result<Vec<i64>, AppError> {
    Ok(participant_ids(conn, conversation_id)?
        .into_iter()
        .filter(|id| *id != user_id)
        .collect())
}

fn other_participant_profiles(
    conn: &Connection,
    conversation_id: i64,
    user_id: i64,
) -> Result<Vec<PublicProfile>, AppError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM conversation_participants p
         JOIN users u ON u.id = p.user_id
         WHERE p.conversation_id = ?1 AND p.user_id != ?2
         ORDER BY u.id",
        PublicProfile::COLUMNS
    ))?;
    let profiles = stmt
        .query_map(params![conversation_id, user_id], PublicProfile::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(profiles)
}

fn find_group(conn: &Connection, group_id: i64) -> Result<Group, AppError> {
    conn.query_row(
        "SELECT id, name, creator_id FROM chat_groups WHERE id = ?1",
        params![group_id],
        |row| {
            Ok(Group {
                id: row.get(0)?,
                name: row.get(1)?,
                creator_id: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| AppError::internal(format!("group {} missing for conversation", group_id)))
}

fn find_direct(conn: &Connection, key: &str) -> Result<Option<Conversation>, AppError> {
    let conversation = conn
        .query_row(
            &format!("SELECT {} FROM conversations WHERE direct_key = ?1", Conversation::COLUMNS),
            params![key],
            Conversation::from_row,
        )
        .optional()?;
    Ok(conversation)
}

fn last_visible_message(conn: &Connection, conversation_id: i64) -> Result<Option<Message>, AppError> {
    let message = conn
        .query_row(
            &format!(
                "SELECT {} FROM messages
                 WHERE conversation_id = ?1 AND deleted_at IS NULL
                 ORDER BY id DESC LIMIT 1",
                Message::COLUMNS
            ),
            params![conversation_id],
            Message::from_row,
        )
        .optional()?;
    Ok(message)
}

// --- Direct conversations ---

/// Find or create the direct conversation between `user_id` and `target_user_id`.
/// The flag is true when a new conversation was created.
pub fn open_direct(
    conn: &mut Connection,
    user_id: i64,
    target_user_id: i64,
) -> Result<(Conversation, bool), AppError> {
    if user_id == target_user_id {
        return Err(AppError::invalid("Cannot start a conversation with yourself"));
    }
    if !user_exists(conn, target_user_id)? {
        return Err(AppError::not_found("Target user not found"));
    }

    let key = direct_key(user_id, target_user_id);
    if let Some(existing) = find_direct(conn, &key)? {
        return Ok((existing, false));
    }

    let (conversation, created) = insert_or_reuse_direct(conn, &key, user_id, target_user_id)?;
    if created {
        tracing::info!(
            conversation_id = conversation.id,
            user_id,
            target_user_id,
            "Direct conversation created"
        );
    }
    Ok((conversation, created))
}

/// Insert the direct conversation for `key`, or return the row already holding it.
/// In-process callers are serialized by the connection mutex; the UNIQUE key
/// covers other writers of the same database file.
fn insert_or_reuse_direct(
    conn: &mut Connection,
    key: &str,
    a: i64,
    b: i64,
) -> Result<(Conversation, bool), AppError> {
    match insert_direct(conn, key, a, b) {
        Ok(conversation) => Ok((conversation, true)),
        Err(e) if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
            match find_direct(conn, key)? {
                Some(existing) => Ok((existing, false)),
                None => Err(AppError::from(e)),
            }
        }
        Err(e) => Err(AppError::from(e)),
    }
}

fn insert_direct(conn: &mut Connection, key: &str, a: i64, b: i64) -> rusqlite::Result<Conversation> {
    let now = db::now();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO conversations (conversation_type, direct_key, created_at)
         VALUES ('direct', ?1, ?2)",
        params![key, now],
    )?;
    let conversation_id = tx.last_insert_rowid();
    for user_id in [a, b] {
        tx.execute(
            "INSERT INTO conversation_participants (conversation_id, user_id, last_read_at, joined_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![conversation_id, user_id, now],
        )?;
    }
    let conversation = tx.query_row(
        &format!("SELECT {} FROM conversations WHERE id = ?1", Conversation::COLUMNS),
        params![conversation_id],
        Conversation::from_row,
    )?;
    tx.commit()?;
    Ok(conversation)
}

// --- Group conversations ---

/// A freshly created group and its conversation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupCreated {
    pub conversation: Conversation,
    pub group: Group,
    /// All members, creator included.
    pub participants: Vec<PublicProfile>,
}

pub fn insert_group(
    conn: &mut Connection,
    user_id: i64,
    name: &str,
    member_ids: &[i64],
) -> Result<GroupCreated, AppError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::invalid("Group name cannot be empty"));
    }
    if name.chars().count() > MAX_GROUP_NAME_LENGTH {
        return Err(AppError::invalid(format!(
            "Group name exceeds maximum length of {} characters",
            MAX_GROUP_NAME_LENGTH
        )));
    }

    let mut members: BTreeSet<i64> = member_ids.iter().copied().collect();
    members.insert(user_id);
    for member in &members {
        if !user_exists(conn, *member)? {
            return Err(AppError::not_found(format!("User {} not found", member)));
        }
    }

    let now = db::now();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO chat_groups (name, creator_id, created_at) VALUES (?1, ?2, ?3)",
        params![name, user_id, now],
    )?;
    let group_id = tx.last_insert_rowid();
    tx.execute(
        "INSERT INTO conversations (conversation_type, group_id, created_at) VALUES ('group', ?1, ?2)",
        params![group_id, now],
    )?;
    let conversation_id = tx.last_insert_rowid();

    for member in &members {
        let role = if *member == user_id { GroupRole::Owner } else { GroupRole::Member };
        tx.execute(
            "INSERT INTO group_members (group_id, user_id, role, joined_at) VALUES (?1, ?2, ?3, ?4)",
            params![group_id, member, role, now],
        )?;
        tx.execute(
            "INSERT INTO conversation_participants (conversation_id, user_id, last_read_at, joined_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![conversation_id, member, now],
        )?;
    }

    let conversation = tx.query_row(
        &format!("SELECT {} FROM conversations WHERE id = ?1", Conversation::COLUMNS),
        params![conversation_id],
        Conversation::from_row,
    )?;
    let participants = {
        let mut stmt = tx.prepare(&format!(
            "SELECT {} FROM conversation_participants p
             JOIN users u ON u.id = p.user_id
             WHERE p.conversation_id = ?1
             ORDER BY u.id",
            PublicProfile::COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![conversation_id], PublicProfile::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    tx.commit()?;

    tracing::info!(
        group_id,
        conversation_id,
        creator_id = user_id,
        members = participants.len(),
        "Group conversation created"
    );

    Ok(GroupCreated {
        conversation,
        group: Group {
            id: group_id,
            name: name.to_string(),
            creator_id: user_id,
        },
        participants,
    })
}

/// Create a group conversation and announce it to every member but the creator.
pub async fn create_group(
    state: &AppState,
    user_id: i64,
    name: String,
    member_ids: Vec<i64>,
) -> Result<GroupCreated, AppError> {
    let created = with_conn(&state.db, move |conn| insert_group(conn, user_id, &name, &member_ids)).await?;

    let event = ServerEvent::GroupConversationCreated(GroupConversationCreated {
        conversation_id: created.conversation.id,
        group: created.group.clone(),
        participants: created.participants.clone(),
        created_at: created.conversation.created_at.clone(),
    });
    let targets = created
        .participants
        .iter()
        .map(|p| p.id)
        .filter(|id| *id != user_id);
    state.dispatcher.dispatch(targets, &event);

    Ok(created)
}

// --- Listing ---

/// One entry of a user's conversation list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: i64,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub group: Option<Group>,
    /// Other participants; the caller is never included.
    pub participants: Vec<PublicProfile>,
    pub last_message: Option<Message>,
    pub last_message_at: Option<String>,
    pub unread_count: i64,
    pub is_muted: bool,
    pub is_archived: bool,
    pub created_at: String,
}

fn summarize(
    conn: &Connection,
    conversation: Conversation,
    participant: &Participant,
) -> Result<ConversationSummary, AppError> {
    let user_id = participant.user_id;
    let group = conversation
        .group_id
        .map(|group_id| find_group(conn, group_id))
        .transpose()?;

    Ok(ConversationSummary {
        id: conversation.id,
        conversation_type: conversation.conversation_type,
        group,
        participants: other_participant_profiles(conn, conversation.id, user_id)?,
        last_message: last_visible_message(conn, conversation.id)?,
        unread_count: read_state::unread_count(
            conn,
            conversation.id,
            user_id,
            &participant.last_read_at,
        )?,
        last_message_at: conversation.last_message_at,
        is_muted: participant.is_muted,
        is_archived: participant.is_archived,
        created_at: conversation.created_at,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationPage {
    pub conversations: Vec<ConversationSummary>,
    pub page: u32,
    pub limit: u32,
    pub total: i64,
    pub has_more: bool,
}

/// Conversations of `user_id`, most recently active first. Conversations
/// without messages sort last. `page` is 1-based.
pub fn list_conversations(
    conn: &Connection,
    user_id: i64,
    page: u32,
    limit: u32,
) -> Result<ConversationPage, AppError> {
    let page = page.max(1);
    let limit = limit.clamp(1, MAX_PAGE_SIZE);
    let skip = i64::from(page - 1) * i64::from(limit);

    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM conversation_participants WHERE user_id = ?1",
        params![user_id],
        |row| row.get(0),
    )?;

    let conversations = {
        let mut stmt = conn.prepare(
            "SELECT c.id, c.conversation_type, c.group_id, c.last_message_at, c.created_at
             FROM conversations c
             JOIN conversation_participants p ON p.conversation_id = c.id
             WHERE p.user_id = ?1
             ORDER BY c.last_message_at IS NULL, c.last_message_at DESC, c.id DESC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit, skip], Conversation::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut summaries = Vec::with_capacity(conversations.len());
    for conversation in conversations {
        let participant = find_participant(conn, conversation.id, user_id)?
            .ok_or_else(|| AppError::internal("participant row vanished during listing"))?;
        summaries.push(summarize(conn, conversation, &participant)?);
    }

    let has_more = skip + (summaries.len() as i64) < total;
    Ok(ConversationPage {
        conversations: summaries,
        page,
        limit,
        total,
        has_more,
    })
}

pub fn get_conversation(
    conn: &Connection,
    user_id: i64,
    conversation_id: i64,
) -> Result<ConversationSummary, AppError> {
    let (conversation, participant) = require_participant(conn, conversation_id, user_id)?;
    summarize(conn, conversation, &participant)
}

// --- Participant settings ---

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    pub is_muted: Option<bool>,
    pub is_archived: Option<bool>,
}

/// Update the caller's own mute/archive flags. Absent fields are left as is.
pub fn update_participant_settings(
    conn: &Connection,
    user_id: i64,
    conversation_id: i64,
    update: &SettingsUpdate,
) -> Result<Participant, AppError> {
    require_participant(conn, conversation_id, user_id)?;
    conn.execute(
        "UPDATE conversation_participants
         SET is_muted = COALESCE(?1, is_muted), is_archived = COALESCE(?2, is_archived)
         WHERE conversation_id = ?3 AND user_id = ?4",
        params![update.is_muted, update.is_archived, conversation_id, user_id],
    )?;
    find_participant(conn, conversation_id, user_id)?
        .ok_or_else(|| AppError::internal("participant row vanished after update"))
}

// --- REST handlers ---

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDirectRequest {
    pub target_user_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub member_ids: Vec<i64>,
}

/// GET /api/conversations?page&limit
pub async fn list_conversations_handler(
    State(state): State<AppState>,
    claims: Claims,
    Query(query): Query<ListQuery>,
) -> ApiResult<ConversationPage> {
    let user_id = claims.sub;
    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let result = with_conn(&state.db, move |conn| list_conversations(conn, user_id, page, limit)).await?;
    Ok(ApiResponse::ok(result))
}

/// POST /api/conversations/direct. Answers 201 when created, 200 when it already existed.
pub async fn create_direct_handler(
    State(state): State<AppState>,
    claims: Claims,
    AppJson(req): AppJson<CreateDirectRequest>,
) -> ApiStatusResult<Conversation> {
    let user_id = claims.sub;
    let (conversation, created) =
        with_conn(&state.db, move |conn| open_direct(conn, user_id, req.target_user_id)).await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok(ApiResponse::with_status(status, conversation))
}

/// POST /api/conversations/group
pub async fn create_group_handler(
    State(state): State<AppState>,
    claims: Claims,
    AppJson(req): AppJson<CreateGroupRequest>,
) -> ApiStatusResult<GroupCreated> {
    let created = create_group(&state, claims.sub, req.name, req.member_ids).await?;
    Ok(ApiResponse::with_status(StatusCode::CREATED, created))
}

/// GET /api/conversations/{id}
pub async fn get_conversation_handler(
    State(state): State<AppState>,
    claims: Claims,
    Path(conversation_id): Path<i64>,
) -> ApiResult<ConversationSummary> {
    let user_id = claims.sub;
    let summary = with_conn(&state.db, move |conn| get_conversation(conn, user_id, conversation_id)).await?;
    Ok(ApiResponse::ok(summary))
}

/// PATCH /api/conversations/{id}/settings
pub async fn update_settings_handler(
    State(state): State<AppState>,
    claims: Claims,
    Path(conversation_id): Path<i64>,
    AppJson(update): AppJson<SettingsUpdate>,
) -> ApiResult<Participant> {
    let user_id = claims.sub;
    let participant = with_conn(&state.db, move |conn| {
        update_participant_settings(conn, user_id, conversation_id, &update)
    })
    .await?;
    Ok(ApiResponse::ok(participant))
}
