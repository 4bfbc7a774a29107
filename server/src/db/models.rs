//! Database row types and the string enums stored in TEXT columns.
//! These correspond 1:1 to the SQLite schema defined in migrations.rs.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

/// Declares an enum persisted as a lowercase TEXT value, with matching
/// serde names and rusqlite conversions.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant,)+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} value: {}", stringify!($name), other)),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    };
}

text_enum!(
    /// Persisted presence of a user.
    UserStatus {
        Online => "online",
        Offline => "offline",
        Away => "away",
        Busy => "busy",
    }
);

text_enum!(FriendshipStatus {
    Pending => "pending",
    Accepted => "accepted",
    Rejected => "rejected",
    Blocked => "blocked",
});

text_enum!(ConversationType {
    Direct => "direct",
    Group => "group",
});

text_enum!(GroupRole {
    Owner => "owner",
    Admin => "admin",
    Member => "member",
});

text_enum!(MessageType {
    Text => "text",
    Image => "image",
    File => "file",
    Audio => "audio",
    Video => "video",
    CallAudio => "call_audio",
    CallVideo => "call_video",
});

text_enum!(
    /// Delivery status of a message.
    MessageStatus {
        Sending => "sending",
        Sent => "sent",
        Delivered => "delivered",
        Read => "read",
        Failed => "failed",
    }
);

text_enum!(
    /// Status of a call message. `Missed` is the initial state.
    CallStatus {
        Missed => "missed",
        Answered => "answered",
        Rejected => "rejected",
        Completed => "completed",
    }
);

impl MessageType {
    pub fn is_call(&self) -> bool {
        matches!(self, Self::CallAudio | Self::CallVideo)
    }

    /// Media types carry their payload in `media_url`.
    pub fn is_media(&self) -> bool {
        matches!(self, Self::Image | Self::File | Self::Audio | Self::Video)
    }
}

impl CallStatus {
    /// Allowed call transitions: missed -> answered | rejected, answered -> completed.
    pub fn can_transition_to(&self, next: CallStatus) -> bool {
        matches!(
            (self, next),
            (Self::Missed, Self::Answered)
                | (Self::Missed, Self::Rejected)
                | (Self::Answered, Self::Completed)
        )
    }
}

/// User record in the users table
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub email: String,
    pub username: String,
    pub phone: Option<String>,
    #[serde(rename = "avatar")]
    pub avatar_url: Option<String>,
    pub status: UserStatus,
    pub last_active_at: Option<String>,
    pub created_at: String,
}

impl User {
    pub const COLUMNS: &'static str =
        "id, email, username, phone, avatar_url, status, last_active_at, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            username: row.get(2)?,
            phone: row.get(3)?,
            avatar_url: row.get(4)?,
            status: row.get(5)?,
            last_active_at: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

/// What other users may see about a user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicProfile {
    pub id: i64,
    pub username: String,
    #[serde(rename = "avatar")]
    pub avatar_url: Option<String>,
    pub status: UserStatus,
}

impl PublicProfile {
    pub const COLUMNS: &'static str = "u.id, u.username, u.avatar_url, u.status";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            username: row.get(1)?,
            avatar_url: row.get(2)?,
            status: row.get(3)?,
        })
    }
}

impl From<User> for PublicProfile {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            avatar_url: user.avatar_url,
            status: user.status,
        }
    }
}

/// Friend request / relationship, directed from initiator to receiver.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Friendship {
    pub id: i64,
    pub initiator_id: i64,
    pub receiver_id: i64,
    pub status: FriendshipStatus,
    pub created_at: String,
    pub updated_at: String,
}

impl Friendship {
    pub const COLUMNS: &'static str =
        "id, initiator_id, receiver_id, status, created_at, updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            initiator_id: row.get(1)?,
            receiver_id: row.get(2)?,
            status: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub creator_id: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: i64,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub group_id: Option<i64>,
    pub last_message_at: Option<String>,
    pub created_at: String,
}

impl Conversation {
    pub const COLUMNS: &'static str =
        "id, conversation_type, group_id, last_message_at, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_type: row.get(1)?,
            group_id: row.get(2)?,
            last_message_at: row.get(3)?,
            created_at: row.get(4)?,
        })
    }
}

/// Per-user state inside a conversation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub conversation_id: i64,
    pub user_id: i64,
    pub last_read_at: String,
    pub is_archived: bool,
    pub is_muted: bool,
    pub joined_at: String,
}

impl Participant {
    pub const COLUMNS: &'static str =
        "conversation_id, user_id, last_read_at, is_archived, is_muted, joined_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            conversation_id: row.get(0)?,
            user_id: row.get(1)?,
            last_read_at: row.get(2)?,
            is_archived: row.get(3)?,
            is_muted: row.get(4)?,
            joined_at: row.get(5)?,
        })
    }
}

/// Message row, including call fields for call-type messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub sender_id: i64,
    pub receiver_id: Option<i64>,
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub media_url: Option<String>,
    pub reply_to_id: Option<i64>,
    pub status: MessageStatus,
    pub call_status: Option<CallStatus>,
    pub call_started_at: Option<String>,
    pub call_ended_at: Option<String>,
    pub call_duration: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl Message {
    pub const COLUMNS: &'static str = "id, conversation_id, sender_id, receiver_id, content, \
         message_type, media_url, reply_to_id, status, call_status, call_started_at, \
         call_ended_at, call_duration, created_at, updated_at, deleted_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            sender_id: row.get(2)?,
            receiver_id: row.get(3)?,
            content: row.get(4)?,
            message_type: row.get(5)?,
            media_url: row.get(6)?,
            reply_to_id: row.get(7)?,
            status: row.get(8)?,
            call_status: row.get(9)?,
            call_started_at: row.get(10)?,
            call_ended_at: row.get(11)?,
            call_duration: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
            deleted_at: row.get(15)?,
        })
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_text_round_trips_through_serde_names() {
        assert_eq!(MessageType::CallAudio.as_str(), "call_audio");
        assert_eq!("call_video".parse::<MessageType>(), Ok(MessageType::CallVideo));
        assert_eq!(
            serde_json::to_value(MessageType::CallAudio).unwrap(),
            serde_json::json!("call_audio")
        );
        assert!("sideways".parse::<CallStatus>().is_err());
    }

    #[test]
    fn test_call_transitions() {
        assert!(CallStatus::Missed.can_transition_to(CallStatus::Answered));
        assert!(CallStatus::Missed.can_transition_to(CallStatus::Rejected));
        assert!(CallStatus::Answered.can_transition_to(CallStatus::Completed));
        assert!(!CallStatus::Missed.can_transition_to(CallStatus::Completed));
        assert!(!CallStatus::Rejected.can_transition_to(CallStatus::Answered));
        assert!(!CallStatus::Completed.can_transition_to(CallStatus::Missed));
        assert!(!CallStatus::Answered.can_transition_to(CallStatus::Answered));
    }
}
