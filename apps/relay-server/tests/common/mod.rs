#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use futures_util::StreamExt;
use jsonwebtoken::{EncodingKey, Header};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use relay_server::config::Config;
use relay_server::AppState;

pub const TEST_SECRET: &str = "relay-test-secret";
pub const TEST_SERVICE_KEY: &str = "relay-test-service-key";

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Serialize)]
struct TestClaims<'a> {
    sub: &'a str,
    exp: i64,
}

/// Mint an HS256 token for `user_id` valid for five minutes.
pub fn mint_token(user_id: &str) -> String {
    mint_token_with_exp(user_id, (chrono::Utc::now() + chrono::Duration::seconds(300)).timestamp())
}

/// Mint a token that expired an hour ago.
pub fn mint_expired_token(user_id: &str) -> String {
    mint_token_with_exp(user_id, (chrono::Utc::now() - chrono::Duration::hours(1)).timestamp())
}

fn mint_token_with_exp(user_id: &str, exp: i64) -> String {
    jsonwebtoken::encode(
        &Header::default(),
        &TestClaims { sub: user_id, exp },
        &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
    )
    .expect("mint test token")
}

pub fn test_config() -> Config {
    Config::with_secret(TEST_SECRET)
}

/// Application state with the test secret and default limits.
pub fn test_state() -> AppState {
    AppState::new(test_config())
}

/// Router plus state, for axum-test.
pub fn test_app(config: Config) -> (Router, AppState) {
    let state = AppState::new(config);
    let app = relay_server::routes::router().with_state(state.clone());
    (app, state)
}

/// Start an actual TCP server for WebSocket testing.
pub async fn start_ws_server() -> (SocketAddr, AppState) {
    start_ws_server_with(test_config()).await
}

pub async fn start_ws_server_with(config: Config) -> (SocketAddr, AppState) {
    let (app, state) = test_app(config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

/// Open a gateway connection as `user_id` using a bearer header.
pub async fn connect_as(addr: SocketAddr, user_id: &str) -> WsStream {
    let mut request = format!("ws://{addr}/gateway").into_client_request().unwrap();
    request.headers_mut().insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {}", mint_token(user_id))).unwrap(),
    );
    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("ws connect");
    ws
}

/// Open a gateway connection and consume its `ready` frame.
pub async fn connect_ready(addr: SocketAddr, user_id: &str) -> (WsStream, serde_json::Value) {
    let mut ws = connect_as(addr, user_id).await;
    let ready = next_event(&mut ws).await;
    assert_eq!(ready["event"], "ready");
    (ws, ready)
}

/// Read the next text frame as JSON.
pub async fn next_event(ws: &mut WsStream) -> serde_json::Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for event")
            .expect("stream ended")
            .expect("ws read error");
        if msg.is_text() {
            let text = msg.into_text().expect("not text");
            return serde_json::from_str(&text).expect("parse event");
        }
    }
}

/// Read events until one named `event` arrives.
pub async fn next_named(ws: &mut WsStream, event: &str) -> serde_json::Value {
    loop {
        let value = next_event(ws).await;
        if value["event"] == event {
            return value;
        }
    }
}

/// Assert that nothing arrives within a short window.
pub async fn assert_quiet(ws: &mut WsStream) {
    let res = time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(res.is_err(), "expected no event, got {res:?}");
}
