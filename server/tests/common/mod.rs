//! Shared harness for integration tests: a server on a random port backed by
//! a temporary data directory.

#![allow(dead_code)]

use futures_util::StreamExt;
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use chat_server::config::RealtimeConfig;
use chat_server::state::AppState;
use chat_server::users::{create_user, NewUser};

pub type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;
pub type WsReader = futures_util::stream::SplitStream<WsStream>;

pub struct TestServer {
    pub base_url: String,
    pub addr: SocketAddr,
    pub state: AppState,
    pub client: reqwest::Client,
    _data_dir: tempfile::TempDir,
}

#[derive(Debug, Clone)]
pub struct TestUser {
    pub id: i64,
    pub token: String,
}

/// Start the server on a random port.
pub async fn start_test_server() -> TestServer {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = chat_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = chat_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");
    let state = AppState::new(db, jwt_secret, RealtimeConfig::default());

    let app = chat_server::routes::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base_url: format!("http://{}", addr),
        addr,
        state,
        client: reqwest::Client::new(),
        _data_dir: tmp_dir,
    }
}

impl TestServer {
    /// Insert a user directly and mint a token for it.
    pub fn create_user(&self, name: &str) -> TestUser {
        let email = format!("{}@example.com", name);
        let user = {
            let conn = self.state.db.lock().unwrap();
            create_user(
                &conn,
                &NewUser {
                    email: email.clone(),
                    username: name.to_string(),
                    phone: None,
                    avatar_url: None,
                },
            )
            .expect("create user")
        };
        let token = chat_server::auth::jwt::issue_access_token(&self.state.jwt_secret, user.id, &email)
            .expect("issue token");
        TestUser { id: user.id, token }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn ws_url(&self, token: &str) -> String {
        format!("ws://{}/ws?token={}", self.addr, token)
    }

    /// Authenticated request helper returning (status, body).
    pub async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        user: &TestUser,
        body: Option<Value>,
    ) -> (u16, Value) {
        let mut req = self
            .client
            .request(method, self.url(path))
            .bearer_auth(&user.token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.expect("request failed");
        let status = resp.status().as_u16();
        let body = resp.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }

    pub async fn get(&self, path: &str, user: &TestUser) -> (u16, Value) {
        self.send(reqwest::Method::GET, path, user, None).await
    }

    pub async fn post(&self, path: &str, user: &TestUser, body: Value) -> (u16, Value) {
        self.send(reqwest::Method::POST, path, user, Some(body)).await
    }

    pub async fn patch(&self, path: &str, user: &TestUser, body: Value) -> (u16, Value) {
        self.send(reqwest::Method::PATCH, path, user, Some(body)).await
    }

    pub async fn put(&self, path: &str, user: &TestUser, body: Value) -> (u16, Value) {
        self.send(reqwest::Method::PUT, path, user, Some(body)).await
    }

    pub async fn delete(&self, path: &str, user: &TestUser) -> (u16, Value) {
        self.send(reqwest::Method::DELETE, path, user, None).await
    }

    /// Create (or fetch) the direct conversation between two users.
    pub async fn direct(&self, a: &TestUser, b: &TestUser) -> i64 {
        let (status, body) = self
            .post("/api/conversations/direct", a, serde_json::json!({ "targetUserId": b.id }))
            .await;
        assert!(status == 200 || status == 201, "create direct: {} {}", status, body);
        body["data"]["id"].as_i64().unwrap()
    }
}

/// Next JSON event on a socket, skipping transport frames. Panics after 2s.
pub async fn next_event(read: &mut WsReader) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), read.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("event JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

/// Assert that nothing arrives on the socket for a short while.
pub async fn expect_silence(read: &mut WsReader) {
    let result = tokio::time::timeout(Duration::from_millis(300), read.next()).await;
    assert!(result.is_err(), "expected no frame, got {:?}", result);
}
