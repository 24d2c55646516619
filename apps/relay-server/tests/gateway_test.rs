mod common;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite;

use common::{assert_quiet, connect_ready, next_event, next_named, WsStream};

async fn send_json(ws: &mut WsStream, value: serde_json::Value) {
    ws.send(tungstenite::Message::Text(value.to_string().into()))
        .await
        .expect("send frame");
}

async fn join(ws: &mut WsStream, room: &str) -> serde_json::Value {
    send_json(ws, json!({ "event": "join_room", "data": room })).await;
    next_named(ws, "room_joined").await
}

fn http_status(err: tungstenite::Error) -> u16 {
    match err {
        tungstenite::Error::Http(resp) => resp.status().as_u16(),
        other => panic!("expected HTTP rejection, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upgrade_without_token_is_refused() {
    let (addr, state) = common::start_ws_server().await;

    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/gateway"))
        .await
        .expect_err("upgrade should be refused");
    assert_eq!(http_status(err), 401);
    assert_eq!(state.relay.connection_count(), 0);
}

#[tokio::test]
async fn upgrade_with_expired_token_is_refused() {
    let (addr, state) = common::start_ws_server().await;
    let token = common::mint_expired_token("buyer-1");

    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/gateway?token={token}"))
        .await
        .expect_err("upgrade should be refused");
    assert_eq!(http_status(err), 401);
    assert!(!state.relay.presence().is_online(&"buyer-1".into()));
}

#[tokio::test]
async fn query_token_yields_ready() {
    let (addr, state) = common::start_ws_server().await;
    let token = common::mint_token("buyer-1");

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/gateway?token={token}"))
        .await
        .expect("ws connect");

    let ready = next_event(&mut ws).await;
    assert_eq!(ready["event"], "ready");
    assert_eq!(ready["data"]["userIdentity"], "buyer-1");
    assert!(ready["data"]["connectionId"]
        .as_str()
        .unwrap()
        .starts_with("conn_"));
    assert!(state.relay.presence().is_online(&"buyer-1".into()));
}

#[tokio::test]
async fn connection_limit_refuses_upgrade() {
    let mut config = common::test_config();
    config.max_connections_per_user = 1;
    let (addr, _state) = common::start_ws_server_with(config).await;

    let (_first, _) = connect_ready(addr, "agent-1").await;

    let token = common::mint_token("agent-1");
    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/gateway?token={token}"))
        .await
        .expect_err("second connection should be refused");
    assert_eq!(http_status(err), 429);
}

// ---------------------------------------------------------------------------
// Rooms and messages
// ---------------------------------------------------------------------------

#[tokio::test]
async fn message_reaches_both_members() {
    let (addr, _state) = common::start_ws_server().await;
    let (mut buyer, _) = connect_ready(addr, "buyer-1").await;
    let (mut agent, _) = connect_ready(addr, "agent-1").await;

    join(&mut buyer, "listing-42").await;
    let joined = join(&mut agent, "listing-42").await;
    let mut members: Vec<String> = joined["data"]["members"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m.as_str().unwrap().to_string())
        .collect();
    members.sort();
    assert_eq!(members, vec!["agent-1", "buyer-1"]);

    let notice = next_named(&mut buyer, "user_joined").await;
    assert_eq!(notice["data"]["userIdentity"], "agent-1");

    send_json(
        &mut buyer,
        json!({
            "event": "send_message",
            "data": { "roomId": "listing-42", "payload": { "text": "Is it still available?" } }
        }),
    )
    .await;

    for ws in [&mut buyer, &mut agent] {
        let msg = next_named(ws, "receive_message").await;
        assert_eq!(msg["data"]["roomId"], "listing-42");
        assert_eq!(msg["data"]["senderIdentity"], "buyer-1");
        assert_eq!(msg["data"]["payload"]["text"], "Is it still available?");
        assert!(msg["data"]["serverTimestamp"].is_string());
    }
}

#[tokio::test]
async fn send_to_unjoined_room_errors_only_to_sender() {
    let (addr, _state) = common::start_ws_server().await;
    let (mut buyer, _) = connect_ready(addr, "buyer-1").await;
    let (mut agent, _) = connect_ready(addr, "agent-1").await;
    join(&mut agent, "listing-7").await;
    next_named(&mut buyer, "user_online").await;

    send_json(
        &mut buyer,
        json!({
            "event": "send_message",
            "data": { "roomId": "listing-7", "payload": "hello" }
        }),
    )
    .await;

    let err = next_event(&mut buyer).await;
    assert_eq!(err["event"], "error");
    assert_eq!(err["data"]["code"], "NOT_MEMBER");
    assert_eq!(err["data"]["roomId"], "listing-7");
    assert_quiet(&mut agent).await;
}

#[tokio::test]
async fn typing_is_relayed_to_others_only() {
    let (addr, _state) = common::start_ws_server().await;
    let (mut buyer, _) = connect_ready(addr, "buyer-1").await;
    let (mut agent, _) = connect_ready(addr, "agent-1").await;
    join(&mut buyer, "listing-42").await;
    join(&mut agent, "listing-42").await;
    next_named(&mut buyer, "user_joined").await;

    send_json(
        &mut agent,
        json!({ "event": "typing", "data": { "roomId": "listing-42", "isTyping": true } }),
    )
    .await;

    let typing = next_named(&mut buyer, "user_typing").await;
    assert_eq!(typing["data"]["userIdentity"], "agent-1");
    assert_eq!(typing["data"]["isTyping"], true);
    assert_quiet(&mut agent).await;
}

#[tokio::test]
async fn malformed_frame_keeps_connection_open() {
    let (addr, _state) = common::start_ws_server().await;
    let (mut ws, _) = connect_ready(addr, "buyer-1").await;

    send_json(&mut ws, json!({ "event": "teleport", "data": {} })).await;
    let err = next_event(&mut ws).await;
    assert_eq!(err["event"], "error");
    assert_eq!(err["data"]["code"], "BAD_REQUEST");

    let joined = join(&mut ws, "listing-42").await;
    assert_eq!(joined["data"]["roomId"], "listing-42");
}

// ---------------------------------------------------------------------------
// Presence and disconnect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn close_announces_departure_then_offline() {
    let (addr, state) = common::start_ws_server().await;
    let (mut buyer, _) = connect_ready(addr, "buyer-1").await;
    let (mut agent, _) = connect_ready(addr, "agent-1").await;

    let online = next_named(&mut buyer, "user_online").await;
    assert_eq!(online["data"]["userIdentity"], "agent-1");

    join(&mut buyer, "listing-42").await;
    join(&mut agent, "listing-42").await;
    next_named(&mut buyer, "user_joined").await;

    agent.close(None).await.expect("close");

    let left = next_event(&mut buyer).await;
    assert_eq!(left["event"], "user_left");
    assert_eq!(left["data"]["userIdentity"], "agent-1");
    let offline = next_event(&mut buyer).await;
    assert_eq!(offline["event"], "user_offline");
    assert_eq!(offline["data"]["userIdentity"], "agent-1");

    assert!(!state.relay.presence().is_online(&"agent-1".into()));
    assert!(!state
        .relay
        .rooms()
        .is_member(&"listing-42".into(), &"agent-1".into()));
}

#[tokio::test]
async fn second_tab_closing_keeps_user_online() {
    let (addr, state) = common::start_ws_server().await;
    let (mut watcher, _) = connect_ready(addr, "buyer-1").await;
    let (tab1, _) = connect_ready(addr, "agent-1").await;
    let (_tab2, _) = connect_ready(addr, "agent-1").await;
    next_named(&mut watcher, "user_online").await;

    drop(tab1);
    assert_quiet(&mut watcher).await;
    assert_eq!(state.relay.presence().connection_count(&"agent-1".into()), 1);
}

#[tokio::test]
async fn overflowing_connection_is_evicted() {
    let mut config = common::test_config();
    config.outbound_queue_capacity = 1;
    let (addr, state) = common::start_ws_server_with(config).await;

    let (mut slow, _) = connect_ready(addr, "agent-1").await;
    let (mut watcher, _) = connect_ready(addr, "buyer-1").await;
    next_named(&mut slow, "user_online").await;

    // Nothing yields between notifications, so the writer cannot drain the
    // one-slot queue.
    for n in 0..8 {
        state.notifier.notify(&"agent-1".into(), json!({ "n": n }));
    }
    assert!(!state.relay.presence().is_online(&"agent-1".into()));

    let offline = next_named(&mut watcher, "user_offline").await;
    assert_eq!(offline["data"]["userIdentity"], "agent-1");

    let code = loop {
        let frame = tokio::time::timeout(std::time::Duration::from_secs(5), slow.next())
            .await
            .expect("timeout waiting for close")
            .expect("stream ended before close frame")
            .expect("ws read error");
        if let tungstenite::Message::Close(frame) = frame {
            break frame.map(|f| u16::from(f.code));
        }
    };
    assert_eq!(code, Some(4009));
    assert_eq!(state.relay.connection_count(), 1);
}
