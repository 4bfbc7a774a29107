//! Friend requests and the friend list.
//!
//! A friendship row is directed from initiator to receiver. At most one row
//! exists per direction; the pair's relationship is the union of both rows.

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::auth::middleware::Claims;
use crate::db::models::{FriendshipStatus, Friendship, PublicProfile};
use crate::db::{self, with_conn};
use crate::error::{ApiResponse, ApiResult, ApiStatusResult, AppError, AppJson};
use crate::state::AppState;
use crate::users::user_exists;

fn find_request(conn: &Connection, request_id: i64) -> Result<Option<Friendship>, AppError> {
    let request = conn
        .query_row(
            &format!("SELECT {} FROM friendships WHERE id = ?1", Friendship::COLUMNS),
            params![request_id],
            Friendship::from_row,
        )
        .optional()?;
    Ok(request)
}

/// Both directions of the relationship between two users.
fn pair_rows(conn: &Connection, a: i64, b: i64) -> Result<Vec<Friendship>, AppError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM friendships
         WHERE (initiator_id = ?1 AND receiver_id = ?2)
            OR (initiator_id = ?2 AND receiver_id = ?1)",
        Friendship::COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![a, b], Friendship::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn send_request(conn: &Connection, user_id: i64, receiver_id: i64) -> Result<Friendship, AppError> {
    if user_id == receiver_id {
        return Err(AppError::invalid("Cannot send a friend request to yourself"));
    }
    if !user_exists(conn, receiver_id)? {
        return Err(AppError::not_found("User not found"));
    }

    let rows = pair_rows(conn, user_id, receiver_id)?;
    let has = |status: FriendshipStatus| rows.iter().any(|f| f.status == status);
    if has(FriendshipStatus::Blocked) {
        return Err(AppError::forbidden("Friend requests between these users are blocked"));
    }
    if has(FriendshipStatus::Accepted) {
        return Err(AppError::invalid("Already friends"));
    }
    if has(FriendshipStatus::Pending) {
        return Err(AppError::invalid("A friend request is already pending"));
    }

    let now = db::now();
    let own = rows.iter().find(|f| f.initiator_id == user_id);
    let request_id = match own {
        // A previously rejected request is re-opened.
        Some(previous) => {
            conn.execute(
                "UPDATE friendships SET status = 'pending', updated_at = ?1 WHERE id = ?2",
                params![now, previous.id],
            )?;
            previous.id
        }
        None => {
            conn.execute(
                "INSERT INTO friendships (initiator_id, receiver_id, status, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', ?3, ?3)",
                params![user_id, receiver_id, now],
            )?;
            conn.last_insert_rowid()
        }
    };

    tracing::info!(request_id, user_id, receiver_id, "Friend request sent");
    find_request(conn, request_id)?.ok_or_else(|| AppError::internal("friend request vanished"))
}

/// Answer a friend request. Only the receiver may respond; accept and reject
/// apply to pending requests only, block applies at any time.
pub fn respond_to_request(
    conn: &Connection,
    user_id: i64,
    request_id: i64,
    status: FriendshipStatus,
) -> Result<Friendship, AppError> {
    let request = find_request(conn, request_id)?
        .ok_or_else(|| AppError::not_found("Friend request not found"))?;
    if request.receiver_id != user_id {
        return Err(AppError::forbidden("Only the receiver can respond to this request"));
    }
    match status {
        FriendshipStatus::Pending => {
            return Err(AppError::invalid("Response must be accepted, rejected or blocked"));
        }
        FriendshipStatus::Accepted | FriendshipStatus::Rejected
            if request.status != FriendshipStatus::Pending =>
        {
            return Err(AppError::invalid(format!(
                "Request is already {}",
                request.status
            )));
        }
        _ => {}
    }

    conn.execute(
        "UPDATE friendships SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status, db::now(), request_id],
    )?;
    tracing::info!(request_id, user_id, status = %status, "Friend request answered");
    find_request(conn, request_id)?.ok_or_else(|| AppError::internal("friend request vanished"))
}

/// Accepted friends in either direction.
pub fn list_friends(conn: &Connection, user_id: i64) -> Result<Vec<PublicProfile>, AppError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM friendships f
         JOIN users u ON u.id = CASE WHEN f.initiator_id = ?1 THEN f.receiver_id ELSE f.initiator_id END
         WHERE (f.initiator_id = ?1 OR f.receiver_id = ?1) AND f.status = 'accepted'
         ORDER BY u.username",
        PublicProfile::COLUMNS
    ))?;
    let friends = stmt
        .query_map(params![user_id], PublicProfile::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(friends)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub id: i64,
    pub from: PublicProfile,
    pub created_at: String,
}

/// Incoming requests still waiting for an answer, oldest first.
pub fn list_pending(conn: &Connection, user_id: i64) -> Result<Vec<PendingRequest>, AppError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT f.id, f.created_at, {} FROM friendships f
         JOIN users u ON u.id = f.initiator_id
         WHERE f.receiver_id = ?1 AND f.status = 'pending'
         ORDER BY f.created_at, f.id",
        PublicProfile::COLUMNS
    ))?;
    let pending = stmt
        .query_map(params![user_id], |row| {
            Ok(PendingRequest {
                id: row.get(0)?,
                created_at: row.get(1)?,
                from: PublicProfile {
                    id: row.get(2)?,
                    username: row.get(3)?,
                    avatar_url: row.get(4)?,
                    status: row.get(5)?,
                },
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(pending)
}

// --- REST handlers ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequestBody {
    pub receiver_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct RespondBody {
    pub status: FriendshipStatus,
}

/// GET /api/friends
pub async fn list_friends_handler(
    State(state): State<AppState>,
    claims: Claims,
) -> ApiResult<Vec<PublicProfile>> {
    let user_id = claims.sub;
    let friends = with_conn(&state.db, move |conn| list_friends(conn, user_id)).await?;
    Ok(ApiResponse::ok(friends))
}

/// GET /api/friends/requests
pub async fn list_pending_handler(
    State(state): State<AppState>,
    claims: Claims,
) -> ApiResult<Vec<PendingRequest>> {
    let user_id = claims.sub;
    let pending = with_conn(&state.db, move |conn| list_pending(conn, user_id)).await?;
    Ok(ApiResponse::ok(pending))
}

/// POST /api/friends/requests
pub async fn send_request_handler(
    State(state): State<AppState>,
    claims: Claims,
    AppJson(body): AppJson<FriendRequestBody>,
) -> ApiStatusResult<Friendship> {
    let user_id = claims.sub;
    let request = with_conn(&state.db, move |conn| send_request(conn, user_id, body.receiver_id)).await?;
    Ok(ApiResponse::with_status(StatusCode::CREATED, request))
}

/// PUT /api/friends/requests/{id}
pub async fn respond_handler(
    State(state): State<AppState>,
    claims: Claims,
    Path(request_id): Path<i64>,
    AppJson(body): AppJson<RespondBody>,
) -> ApiResult<Friendship> {
    let user_id = claims.sub;
    let request = with_conn(&state.db, move |conn| {
        respond_to_request(conn, user_id, request_id, body.status)
    })
    .await?;
    Ok(ApiResponse::ok(request))
}
