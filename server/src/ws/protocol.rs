use serde::Deserialize;

use crate::chat::conversations::{other_participant_ids, require_participant};
use crate::db::with_conn;
use crate::state::AppState;
use crate::ws::broadcast::send_event;
use crate::ws::events::{ServerEvent, UserTyping};
use crate::ws::ConnectionSender;

/// Frames a client may send.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Typing { conversation_id: i64 },
    Ping,
}

/// Handle an incoming text frame. Bad input is answered with an `error`
/// frame; the connection always stays open.
pub async fn handle_text_message(text: &str, tx: &ConnectionSender, state: &AppState, user_id: i64) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(user_id, error = %e, "Unparseable client frame");
            send_event(tx, &ServerEvent::error("Invalid message format"));
            return;
        }
    };

    match frame {
        ClientFrame::Ping => {
            send_event(tx, &ServerEvent::pong());
        }
        ClientFrame::Typing { conversation_id } => {
            handle_typing(conversation_id, tx, state, user_id).await;
        }
    }
}

/// Binary frames carry nothing we understand.
pub fn handle_binary_message(tx: &ConnectionSender, user_id: i64) {
    tracing::debug!(user_id, "Binary frame rejected");
    send_event(tx, &ServerEvent::error("Binary frames are not supported"));
}

/// Relay a typing indicator to the conversation's other participants.
async fn handle_typing(conversation_id: i64, tx: &ConnectionSender, state: &AppState, user_id: i64) {
    let others = with_conn(&state.db, move |conn| {
        require_participant(conn, conversation_id, user_id)?;
        other_participant_ids(conn, conversation_id, user_id)
    })
    .await;

    match others {
        Ok(others) => {
            let event = ServerEvent::UserTyping(UserTyping {
                conversation_id,
                user_id,
            });
            state.dispatcher.dispatch(others, &event);
        }
        Err(e) => {
            send_event(tx, &ServerEvent::error(e.public_message()));
        }
    }
}
