//! Outbound events pushed to live connections.
//!
//! Every frame is JSON `{ "type": "<event>", "data": { ... } }`; the enum tag
//! is the contract clients switch on.

use serde::Serialize;

use crate::db::models::{Group, Message, PublicProfile};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ConnectionEstablished(ConnectionEstablished),
    UserTyping(UserTyping),
    NewMessage(Message),
    MessageDeleted(MessageDeleted),
    MessageRead(MessageRead),
    GroupConversationCreated(GroupConversationCreated),
    IncomingCall(Message),
    CallStatusChanged(Message),
    Pong(Pong),
    Error(EventError),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEstablished {
    pub user_id: i64,
    pub connection_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserTyping {
    pub conversation_id: i64,
    pub user_id: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    pub message_id: i64,
    pub conversation_id: i64,
    pub deleted_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRead {
    pub message_id: i64,
    pub conversation_id: i64,
    pub reader_id: i64,
    pub read_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConversationCreated {
    pub conversation_id: i64,
    pub group: Group,
    /// Every member, creator included.
    pub participants: Vec<PublicProfile>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pong {
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventError {
    pub message: String,
}

impl ServerEvent {
    pub fn pong() -> Self {
        Self::Pong(Pong {
            timestamp: crate::db::now(),
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(EventError {
            message: message.into(),
        })
    }

    /// Event name as it appears in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished(_) => "connection_established",
            Self::UserTyping(_) => "user_typing",
            Self::NewMessage(_) => "new_message",
            Self::MessageDeleted(_) => "message_deleted",
            Self::MessageRead(_) => "message_read",
            Self::GroupConversationCreated(_) => "group_conversation_created",
            Self::IncomingCall(_) => "incoming_call",
            Self::CallStatusChanged(_) => "call_status_changed",
            Self::Pong(_) => "pong",
            Self::Error(_) => "error",
        }
    }
}
