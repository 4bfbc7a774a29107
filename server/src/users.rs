//! User records and public profiles.

use axum::extract::{Path, State};
use rusqlite::{params, Connection, OptionalExtension};

use crate::auth::middleware::Claims;
use crate::db::models::{PublicProfile, User};
use crate::db::{self, with_conn};
use crate::error::{ApiResponse, ApiResult, AppError};
use crate::state::AppState;

/// Fields needed to create a user row. Credentials live with the identity
/// service, not here.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub phone: Option<String>,
    pub avatar_url: Option<String>,
}

/// Insert a user. Unique email/username/phone clashes surface as `InvalidArgument`.
pub fn create_user(conn: &Connection, new_user: &NewUser) -> Result<User, AppError> {
    let now = db::now();
    conn.execute(
        "INSERT INTO users (email, username, phone, avatar_url, status, created_at)
         VALUES (?1, ?2, ?3, ?4, 'offline', ?5)",
        params![
            new_user.email,
            new_user.username,
            new_user.phone,
            new_user.avatar_url,
            now
        ],
    )
    .map_err(|e| match e.sqlite_error_code() {
        Some(rusqlite::ErrorCode::ConstraintViolation) => {
            AppError::invalid("Email, username or phone already in use")
        }
        _ => AppError::from(e),
    })?;

    find_user(conn, conn.last_insert_rowid())?
        .ok_or_else(|| AppError::internal("user vanished after insert"))
}

pub fn find_user(conn: &Connection, user_id: i64) -> Result<Option<User>, AppError> {
    let user = conn
        .query_row(
            &format!("SELECT {} FROM users WHERE id = ?1", User::COLUMNS),
            params![user_id],
            User::from_row,
        )
        .optional()?;
    Ok(user)
}

pub fn user_exists(conn: &Connection, user_id: i64) -> Result<bool, AppError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
        params![user_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

pub fn public_profile(conn: &Connection, user_id: i64) -> Result<PublicProfile, AppError> {
    conn.query_row(
        &format!("SELECT {} FROM users u WHERE u.id = ?1", PublicProfile::COLUMNS),
        params![user_id],
        PublicProfile::from_row,
    )
    .optional()?
    .ok_or_else(|| AppError::not_found("User not found"))
}

/// GET /api/users/me: the caller's own full record.
pub async fn get_me(State(state): State<AppState>, claims: Claims) -> ApiResult<User> {
    let user_id = claims.sub;
    let user = with_conn(&state.db, move |conn| {
        find_user(conn, user_id)?.ok_or_else(|| AppError::not_found("User not found"))
    })
    .await?;
    Ok(ApiResponse::ok(user))
}

/// GET /api/users/{id}: public profile of any user.
pub async fn get_profile(
    State(state): State<AppState>,
    _claims: Claims,
    Path(user_id): Path<i64>,
) -> ApiResult<PublicProfile> {
    let profile = with_conn(&state.db, move |conn| public_profile(conn, user_id)).await?;
    Ok(ApiResponse::ok(profile))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Create a user named `name` with a derived email.
    pub fn user(conn: &Connection, name: &str) -> i64 {
        create_user(
            conn,
            &NewUser {
                email: format!("{}@example.com", name),
                username: name.to_string(),
                phone: None,
                avatar_url: None,
            },
        )
        .expect("create test user")
        .id
    }
}
