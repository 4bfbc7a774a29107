use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::state::AppState;
use crate::ws::broadcast::send_event;
use crate::ws::events::{ConnectionEstablished, ServerEvent};
use crate::ws::{protocol, ConnectionHandle, ConnectionId};

/// Run the actor-per-connection pattern for an authenticated WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards frames from the bounded outbound queue
/// - Reader loop: processes incoming frames, dispatches to protocol handlers
///
/// The registry holds a clone of the queue's sender so any part of the system
/// can push events to this client.
pub async fn run_connection(socket: WebSocket, state: AppState, user_id: i64) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Message>(state.realtime.outbound_buffer.max(1));

    let connection_id = register(&state, user_id, &tx);

    tracing::info!(
        user_id,
        connection_id = %connection_id,
        "WebSocket actor started"
    );

    // Spawn writer task: forwards queued frames to the WebSocket sink
    let mut writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Track pong reception
    let (pong_tx, pong_rx) = mpsc::unbounded_channel::<()>();

    // Spawn ping task: sends periodic pings and monitors pong responses
    let ping_interval = Duration::from_secs(state.realtime.ping_interval_secs.max(1));
    let pong_timeout = Duration::from_secs(state.realtime.pong_timeout_secs.max(1));
    let ping_handle = tokio::spawn(keepalive(tx.clone(), pong_rx, ping_interval, pong_timeout));

    // Reader loop: runs until the client goes away or the writer gives up
    loop {
        let next = tokio::select! {
            next = ws_receiver.next() => next,
            _ = &mut writer_handle => {
                tracing::debug!(user_id, "Writer task finished");
                break;
            }
        };

        match next {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    protocol::handle_text_message(text.as_str(), &tx, &state, user_id).await;
                }
                Message::Binary(_) => {
                    protocol::handle_binary_message(&tx, user_id);
                }
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    let _ = tx.try_send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(user_id, reason = ?frame, "Client initiated close");
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(user_id, error = %e, "WebSocket receive error");
                break;
            }
            None => {
                tracing::info!(user_id, "WebSocket stream ended");
                break;
            }
        }
    }

    // Cleanup: unregister first so no new frames are queued, then stop tasks
    state.connections.remove(user_id, connection_id);
    writer_handle.abort();
    ping_handle.abort();

    tracing::info!(
        user_id,
        connection_id = %connection_id,
        "WebSocket actor stopped"
    );
}

/// Queue the greeting, then make the connection visible to dispatchers.
/// The greeting is always the first frame a client sees.
fn register(state: &AppState, user_id: i64, tx: &mpsc::Sender<Message>) -> ConnectionId {
    let handle = ConnectionHandle::new(tx.clone());
    let connection_id = handle.id;
    send_event(
        tx,
        &ServerEvent::ConnectionEstablished(ConnectionEstablished {
            user_id,
            connection_id: connection_id.to_string(),
        }),
    );
    state.connections.add(user_id, handle);
    connection_id
}

/// Ping every `ping_interval` and close with 1001 when no pong follows within
/// `pong_timeout`. Only pongs received after the current ping count.
async fn keepalive(
    ping_tx: mpsc::Sender<Message>,
    mut pong_rx: mpsc::UnboundedReceiver<()>,
    ping_interval: Duration,
    pong_timeout: Duration,
) {
    let mut ping_timer = interval(ping_interval);
    // Skip the first immediate tick
    ping_timer.tick().await;

    loop {
        ping_timer.tick().await;

        while pong_rx.try_recv().is_ok() {}

        if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).await.is_err() {
            // Writer task has died, connection is gone
            break;
        }

        match timeout(pong_timeout, pong_rx.recv()).await {
            Ok(Some(())) => {}
            _ => {
                tracing::warn!("Pong timeout, closing connection");
                let _ = ping_tx
                    .send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

/// Writer task: receives frames from the outbound queue and forwards them to the sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() || closing {
            break;
        }
    }
}
