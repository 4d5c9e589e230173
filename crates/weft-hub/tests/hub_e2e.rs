//! End-to-end hub tests over real sockets.
//!
//! A fake tool server and a browser connect through the listener; the
//! full upgrade → auth → handshake → dispatch path runs on loopback.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use weft_hub::{Hub, HubConfig, RouterConfig, StaticTokenValidator};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_hub() -> Hub {
    let config = HubConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..HubConfig::default()
    };
    let validator = StaticTokenValidator::new()
        .with_browser_token("browser-secret")
        .with_tool_token("pipe-secret");
    Hub::start(config, RouterConfig::default(), Arc::new(validator))
        .await
        .expect("hub should bind on loopback")
}

async fn connect(url: &str) -> Client {
    let (ws, _) = connect_async(url).await.expect("client connect failed");
    ws
}

async fn recv_json(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("invalid JSON"),
            Message::Ping(_) | Message::Pong(_) => {},
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

async fn send_json(ws: &mut Client, frame: &Value) {
    ws.send(Message::Text(serde_json::to_string(frame).unwrap().into()))
        .await
        .expect("send failed");
}

/// Connect a fake tool server and answer the router's handshake.
async fn connect_tool_server(addr: &std::net::SocketAddr, name: &str) -> Client {
    let mut ws = connect(&format!("ws://{addr}/mcp?token=pipe-secret")).await;

    let init = recv_json(&mut ws).await;
    assert_eq!(init["method"], "initialize");
    send_json(
        &mut ws,
        &json!({
            "jsonrpc": "2.0",
            "id": init["id"],
            "result": { "serverInfo": { "name": name } },
        }),
    )
    .await;

    let note = recv_json(&mut ws).await;
    assert_eq!(note["method"], "notifications/initialized");

    let list = recv_json(&mut ws).await;
    assert_eq!(list["method"], "tools/list");
    send_json(
        &mut ws,
        &json!({
            "jsonrpc": "2.0",
            "id": list["id"],
            "result": { "tools": [
                { "name": "echo", "description": "Echo", "inputSchema": { "type": "object" } },
            ] },
        }),
    )
    .await;

    ws
}

// ── Authentication ───────────────────────────────────────────

#[tokio::test]
async fn missing_token_is_closed_with_4401_before_any_frame() {
    let hub = start_hub().await;
    let addr = hub.local_addr();

    let mut ws = connect(&format!("ws://{addr}/")).await;
    let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
        .await
        .expect("expected a close frame")
        .expect("stream ended")
        .expect("read error");

    match msg {
        Message::Close(Some(frame)) => {
            assert_eq!(u16::from(frame.code), 4401);
        },
        other => panic!("expected close 4401, got {other:?}"),
    }

    hub.stop().await;
}

#[tokio::test]
async fn wrong_audience_token_is_rejected() {
    let hub = start_hub().await;
    let addr = hub.local_addr();

    // A valid browser token is not a valid tool-pipe token.
    let mut ws = connect(&format!("ws://{addr}/mcp?token=browser-secret")).await;
    let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
        .await
        .expect("expected a close frame")
        .expect("stream ended")
        .expect("read error");
    assert!(matches!(msg, Message::Close(Some(frame)) if u16::from(frame.code) == 4401));

    hub.stop().await;
}

#[tokio::test]
async fn unknown_path_is_refused() {
    let hub = start_hub().await;
    let addr = hub.local_addr();

    let mut ws = connect(&format!("ws://{addr}/other?token=browser-secret")).await;
    let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
        .await
        .expect("expected a close frame")
        .expect("stream ended")
        .expect("read error");
    assert!(matches!(msg, Message::Close(Some(frame)) if u16::from(frame.code) == 1008));

    hub.stop().await;
}

// ── Happy path ───────────────────────────────────────────────

#[tokio::test]
async fn browser_call_reaches_the_tool_server_and_back() {
    let hub = start_hub().await;
    let addr = hub.local_addr();

    let mut server = connect_tool_server(&addr, "echo-server").await;

    let mut browser = connect(&format!("ws://{addr}/?token=browser-secret")).await;
    // The first frame is a status; if the browser raced the tool
    // server's registration, the broadcast that follows it settles.
    let mut status = recv_json(&mut browser).await;
    assert_eq!(status["type"], "status");
    if status["mcp_connected"] == false {
        status = recv_json(&mut browser).await;
    }
    assert_eq!(status["mcp_connected"], true);
    assert_eq!(status["mcp_servers"], json!(["echo-server"]));

    send_json(
        &mut browser,
        &json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "tools/call",
            "params": { "name": "echo", "arguments": { "x": 1 } },
        }),
    )
    .await;

    let forwarded = recv_json(&mut server).await;
    assert_eq!(forwarded["method"], "tools/call");
    assert!(forwarded["id"].as_i64().unwrap() >= 1_000_000_000);
    send_json(
        &mut server,
        &json!({
            "jsonrpc": "2.0",
            "id": forwarded["id"],
            "result": { "echoed": { "x": 1 } },
        }),
    )
    .await;

    let response = recv_json(&mut browser).await;
    assert_eq!(response["id"], 7);
    assert_eq!(response["result"]["echoed"]["x"], 1);

    hub.stop().await;
}

#[tokio::test]
async fn tool_server_drop_updates_browser_status() {
    let hub = start_hub().await;
    let addr = hub.local_addr();

    let server = connect_tool_server(&addr, "echo-server").await;
    let mut browser = connect(&format!("ws://{addr}/?token=browser-secret")).await;
    let mut status = recv_json(&mut browser).await;
    if status["mcp_connected"] == false {
        status = recv_json(&mut browser).await;
    }
    assert_eq!(status["mcp_connected"], true);

    drop(server);

    let status = recv_json(&mut browser).await;
    assert_eq!(status["type"], "status");
    assert_eq!(status["mcp_connected"], false);

    hub.stop().await;
}
