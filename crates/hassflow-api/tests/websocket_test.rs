#![allow(clippy::unwrap_used)]
// Integration tests for `HassSocket` against a scripted local WebSocket server.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use url::Url;

use hassflow_api::{Error, HassSocket, ReconnectConfig, SocketConfig};

const TOKEN: &str = "llat-test";

type ServerWs = WebSocketStream<TcpStream>;

// ── Scripted server helpers ─────────────────────────────────────────

async fn bind() -> (TcpListener, Url) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = Url::parse(&format!("ws://{addr}/api/websocket")).unwrap();
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerWs {
    let (tcp, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(tcp).await.unwrap()
}

async fn recv_json(ws: &mut ServerWs) -> Value {
    loop {
        if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn send_json(ws: &mut ServerWs, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

async fn handshake(ws: &mut ServerWs) {
    send_json(ws, json!({ "type": "auth_required", "ha_version": "2026.10.1" })).await;
    let auth = recv_json(ws).await;
    assert_eq!(auth["type"], "auth");
    assert_eq!(auth["access_token"], TOKEN);
    send_json(ws, json!({ "type": "auth_ok", "ha_version": "2026.10.1" })).await;
}

/// Keep the connection open until the client goes away.
async fn drain(mut ws: ServerWs) {
    while let Some(Ok(_)) = ws.next().await {}
}

fn config(url: Url) -> SocketConfig {
    let mut config = SocketConfig::new(url, SecretString::from(TOKEN.to_string()));
    config.timeout = Duration::from_secs(5);
    config.reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        max_retries: Some(0),
    };
    config
}

async fn expect_subscribe(ws: &mut ServerWs) -> u64 {
    let cmd = recv_json(ws).await;
    assert_eq!(cmd["type"], "subscribe_entities");
    let id = cmd["id"].as_u64().unwrap();
    send_json(ws, json!({ "id": id, "type": "result", "success": true, "result": null })).await;
    id
}

// ── Handshake ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_authenticates_and_reports_version() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handshake(&mut ws).await;
        drain(ws).await;
    });

    let socket = HassSocket::connect(config(url), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(socket.ha_version(), "2026.10.1");

    socket.close();
    server.await.unwrap();
}

#[tokio::test]
async fn test_rejected_token_is_authentication_error() {
    let (listener, url) = bind().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        send_json(&mut ws, json!({ "type": "auth_required" })).await;
        let _auth = recv_json(&mut ws).await;
        send_json(&mut ws, json!({ "type": "auth_invalid", "message": "Invalid access token or password" })).await;
    });

    let result = HassSocket::connect(config(url), CancellationToken::new()).await;
    match result {
        Err(Error::Authentication { message }) => {
            assert_eq!(message, "Invalid access token or password");
        }
        Err(other) => panic!("expected Authentication error, got: {other:?}"),
        Ok(_) => panic!("expected Authentication error, got a session"),
    }
}

// ── Entity subscription ─────────────────────────────────────────────

#[tokio::test]
async fn test_subscription_publishes_full_snapshots() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handshake(&mut ws).await;
        let id = expect_subscribe(&mut ws).await;
        send_json(&mut ws, json!({
            "id": id, "type": "event",
            "event": { "a": {
                "sensor.temp": { "s": "20.5", "a": { "unit_of_measurement": "°C" }, "c": "ctx1", "lc": 1_700_000_000.0 },
                "light.kitchen": { "s": "off", "a": {}, "c": "ctx2", "lc": 1_700_000_000.0 }
            } }
        })).await;
        send_json(&mut ws, json!({
            "id": id, "type": "event",
            "event": { "c": { "sensor.temp": { "+": { "s": "21.0", "lc": 1_700_000_060.0 } } } }
        })).await;
        drain(ws).await;
    });

    let socket = HassSocket::connect(config(url), CancellationToken::new())
        .await
        .unwrap();
    let mut feed = socket.subscribe_entities().await.unwrap();

    let first = feed.next().await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first["sensor.temp"].state, "20.5");

    let second = feed.next().await.unwrap();
    assert_eq!(second["sensor.temp"].state, "21.0");
    assert_eq!(second["sensor.temp"].attributes["unit_of_measurement"], "°C");
    assert_eq!(second["light.kitchen"].state, "off");

    // A late subscriber starts from the newest snapshot.
    let mut late = socket.subscribe_entities().await.unwrap();
    let seeded = late.next().await.unwrap();
    assert_eq!(seeded["sensor.temp"].state, "21.0");

    socket.close();
    assert!(feed.next().await.is_none());
    server.await.unwrap();
}

#[tokio::test]
async fn test_reconnect_resubscribes() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handshake(&mut ws).await;
        let id = expect_subscribe(&mut ws).await;
        send_json(&mut ws, json!({
            "id": id, "type": "event",
            "event": { "a": { "switch.fan": { "s": "off", "lc": 1_700_000_000.0 } } }
        })).await;
        drop(ws);

        let mut ws = accept(&listener).await;
        handshake(&mut ws).await;
        let id = expect_subscribe(&mut ws).await;
        send_json(&mut ws, json!({
            "id": id, "type": "event",
            "event": { "a": { "switch.fan": { "s": "on", "lc": 1_700_000_100.0 } } }
        })).await;
        drain(ws).await;
    });

    let mut config = config(url);
    config.reconnect.max_retries = Some(5);
    let socket = HassSocket::connect(config, CancellationToken::new())
        .await
        .unwrap();
    let mut feed = socket.subscribe_entities().await.unwrap();

    assert_eq!(feed.next().await.unwrap()["switch.fan"].state, "off");
    assert_eq!(feed.next().await.unwrap()["switch.fan"].state, "on");

    socket.close();
    server.await.unwrap();
}

// ── Commands ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_call_service_round_trip() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handshake(&mut ws).await;

        let cmd = recv_json(&mut ws).await;
        assert_eq!(cmd["type"], "call_service");
        assert_eq!(cmd["domain"], "light");
        assert_eq!(cmd["service"], "turn_on");
        assert_eq!(cmd["service_data"], json!({ "brightness": 128 }));
        assert_eq!(cmd["target"], json!({ "entity_id": "light.kitchen" }));
        send_json(&mut ws, json!({
            "id": cmd["id"], "type": "result", "success": true,
            "result": { "context": { "id": "ctx9" } }
        })).await;

        let cmd = recv_json(&mut ws).await;
        send_json(&mut ws, json!({
            "id": cmd["id"], "type": "result", "success": false,
            "error": { "code": "not_found", "message": "Service light.explode not found." }
        })).await;

        drain(ws).await;
    });

    let socket = HassSocket::connect(config(url), CancellationToken::new())
        .await
        .unwrap();

    let result = socket
        .call_service(
            "light",
            "turn_on",
            Some(json!({ "brightness": 128 })),
            Some(json!({ "entity_id": "light.kitchen" })),
        )
        .await
        .unwrap();
    assert_eq!(result["context"]["id"], "ctx9");

    let err = socket
        .call_service("light", "explode", None, None)
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "expected not_found, got: {err:?}");

    socket.close();
    server.await.unwrap();
}

#[tokio::test]
async fn test_dropped_connection_fails_pending_command() {
    let (listener, url) = bind().await;
    tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handshake(&mut ws).await;
        let _cmd = recv_json(&mut ws).await;
        drop(ws);
    });

    let socket = HassSocket::connect(config(url), CancellationToken::new())
        .await
        .unwrap();

    let err = socket
        .call_service("switch", "toggle", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Disconnected), "got: {err:?}");

    // max_retries = 0: the session gives up instead of reconnecting.
    tokio::time::timeout(Duration::from_secs(5), async {
        while !socket.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_get_states_parses_rest_shaped_entities() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        handshake(&mut ws).await;

        let cmd = recv_json(&mut ws).await;
        assert_eq!(cmd["type"], "get_states");
        send_json(&mut ws, json!({
            "id": cmd["id"], "type": "result", "success": true,
            "result": [{
                "entity_id": "sun.sun",
                "state": "below_horizon",
                "attributes": { "elevation": -12.5 },
                "last_changed": "2026-10-19T04:00:00+00:00",
                "last_updated": "2026-10-19T04:10:00+00:00",
                "context": { "id": "ctx", "parent_id": null, "user_id": null }
            }]
        })).await;
        drain(ws).await;
    });

    let socket = HassSocket::connect(config(url), CancellationToken::new())
        .await
        .unwrap();
    let states = socket.get_states().await.unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].entity_id, "sun.sun");
    assert_eq!(states[0].attributes["elevation"], -12.5);

    socket.close();
    server.await.unwrap();
}
