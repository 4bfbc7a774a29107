use axum::{middleware, Router};

use crate::auth::middleware::inject_jwt_secret;
use crate::calls::signaling;
use crate::chat::{conversations, messages, read_state};
use crate::friends::requests as friend_requests;
use crate::state::AppState;
use crate::users;
use crate::ws::handler as ws_handler;

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Authenticated routes (JWT required: the Claims extractor validates the token)
    let user_routes = Router::new()
        .route("/api/users/me", axum::routing::get(users::get_me))
        .route("/api/users/{id}", axum::routing::get(users::get_profile));

    let friend_routes = Router::new()
        .route("/api/friends", axum::routing::get(friend_requests::list_friends_handler))
        .route(
            "/api/friends/requests",
            axum::routing::get(friend_requests::list_pending_handler)
                .post(friend_requests::send_request_handler),
        )
        .route(
            "/api/friends/requests/{id}",
            axum::routing::put(friend_requests::respond_handler),
        );

    let conversation_routes = Router::new()
        .route(
            "/api/conversations",
            axum::routing::get(conversations::list_conversations_handler),
        )
        .route(
            "/api/conversations/direct",
            axum::routing::post(conversations::create_direct_handler),
        )
        .route(
            "/api/conversations/group",
            axum::routing::post(conversations::create_group_handler),
        )
        .route(
            "/api/conversations/{id}",
            axum::routing::get(conversations::get_conversation_handler),
        )
        .route(
            "/api/conversations/{id}/settings",
            axum::routing::patch(conversations::update_settings_handler),
        )
        .route(
            "/api/conversations/{id}/messages",
            axum::routing::get(messages::list_messages_handler),
        )
        .route(
            "/api/conversations/{id}/read",
            axum::routing::post(read_state::mark_read_handler),
        );

    let message_routes = Router::new()
        .route("/api/messages", axum::routing::post(messages::send_message_handler))
        .route(
            "/api/messages/{id}",
            axum::routing::delete(messages::delete_message_handler),
        );

    let call_routes = Router::new()
        .route("/api/calls", axum::routing::post(signaling::initiate_call_handler))
        .route(
            "/api/calls/{id}/status",
            axum::routing::patch(signaling::update_call_status_handler),
        );

    // WebSocket route (auth via query param, not the Claims extractor)
    let ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));

    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(user_routes)
        .merge(friend_routes)
        .merge(conversation_routes)
        .merge(message_routes)
        .merge(call_routes)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
