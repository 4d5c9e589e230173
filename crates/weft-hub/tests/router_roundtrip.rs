//! Router integration tests: dispatch, correlation, timeouts, status.
//!
//! These drive the router through its inbox with in-process channels,
//! playing both the browser and the tool-server side.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};

use weft_config::ToolOverride;
use weft_hub::router::PeerId;
use weft_hub::{HubRouter, RouterConfig, RouterMsg};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn start_router(config: RouterConfig) -> mpsc::Sender<RouterMsg> {
    let (router, tx) = HubRouter::new(config);
    tokio::spawn(router.run());
    tx
}

async fn recv_frame(rx: &mut mpsc::Receiver<Value>) -> Value {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("channel closed")
}

async fn expect_request(rx: &mut mpsc::Receiver<Value>, method: &str) -> (i64, Value) {
    let frame = recv_frame(rx).await;
    assert_eq!(frame["method"], method, "unexpected frame: {frame}");
    let id = frame["id"].as_i64().expect("router requests use integer ids");
    (id, frame)
}

/// Register a tool server and walk it through the handshake.
async fn connect_tool_server(
    router: &mpsc::Sender<RouterMsg>,
    name: &str,
    tools: Value,
) -> (PeerId, mpsc::Receiver<Value>) {
    let (tx, mut rx) = mpsc::channel(64);
    let (reply_tx, reply_rx) = oneshot::channel();
    router
        .send(RouterMsg::ToolServerConnected { tx, reply: reply_tx })
        .await
        .unwrap();
    let peer = reply_rx.await.unwrap();

    let (init_id, init) = expect_request(&mut rx, "initialize").await;
    assert!(init_id >= 1_000_000_000, "handshake ids use the router space");
    assert_eq!(init["params"]["clientInfo"]["name"], "weft-hub");
    router
        .send(RouterMsg::ToolServerFrame {
            peer,
            frame: json!({
                "jsonrpc": "2.0",
                "id": init_id,
                "result": { "serverInfo": { "name": name } },
            }),
        })
        .await
        .unwrap();

    let note = recv_frame(&mut rx).await;
    assert_eq!(note["method"], "notifications/initialized");

    let (list_id, _) = expect_request(&mut rx, "tools/list").await;
    router
        .send(RouterMsg::ToolServerFrame {
            peer,
            frame: json!({
                "jsonrpc": "2.0",
                "id": list_id,
                "result": { "tools": tools },
            }),
        })
        .await
        .unwrap();

    (peer, rx)
}

/// Register a browser; returns its handle, channel, and first status.
async fn connect_browser(
    router: &mpsc::Sender<RouterMsg>,
) -> (PeerId, mpsc::Receiver<Value>, Value) {
    let (tx, mut rx) = mpsc::channel(64);
    let (reply_tx, reply_rx) = oneshot::channel();
    router
        .send(RouterMsg::BrowserConnected { tx, reply: reply_tx })
        .await
        .unwrap();
    let peer = reply_rx.await.unwrap();
    let status = recv_frame(&mut rx).await;
    assert_eq!(status["type"], "status");
    (peer, rx, status)
}

fn echo_tools() -> Value {
    json!([{
        "name": "echo",
        "description": "Echoes its arguments",
        "inputSchema": { "type": "object" },
    }])
}

// ── Status ───────────────────────────────────────────────────

#[tokio::test]
async fn browser_sees_connected_status_after_server_registers() {
    let router = start_router(RouterConfig::default());
    let (_server, _server_rx) = connect_tool_server(&router, "echo-server", echo_tools()).await;

    let (_browser, _rx, status) = connect_browser(&router).await;
    assert_eq!(status["mcp_connected"], true);
    assert_eq!(status["mcp_servers"], json!(["echo-server"]));
}

#[tokio::test]
async fn server_disconnect_broadcasts_disconnected_status() {
    let router = start_router(RouterConfig::default());
    let (server, _server_rx) = connect_tool_server(&router, "echo-server", echo_tools()).await;
    let (_browser, mut rx, _status) = connect_browser(&router).await;

    router
        .send(RouterMsg::ToolServerClosed { peer: server })
        .await
        .unwrap();

    let status = recv_frame(&mut rx).await;
    assert_eq!(status["type"], "status");
    assert_eq!(status["mcp_connected"], false);
    assert_eq!(status["mcp_servers"], json!([]));
}

// ── tools/list and initialize ────────────────────────────────

#[tokio::test]
async fn tools_list_is_answered_by_the_router() {
    let router = start_router(RouterConfig::default());
    let (_server, mut server_rx) = connect_tool_server(&router, "echo-server", echo_tools()).await;
    let (browser, mut rx, _status) = connect_browser(&router).await;

    router
        .send(RouterMsg::BrowserFrame {
            peer: browser,
            frame: json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
        })
        .await
        .unwrap();

    let response = recv_frame(&mut rx).await;
    assert_eq!(response["id"], 1);
    assert_eq!(response["result"]["tools"][0]["name"], "echo");

    // The tool server was never consulted.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), server_rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn initialize_is_answered_by_the_router() {
    let router = start_router(RouterConfig::default());
    let (browser, mut rx, _status) = connect_browser(&router).await;

    router
        .send(RouterMsg::BrowserFrame {
            peer: browser,
            frame: json!({"jsonrpc": "2.0", "id": "init-1", "method": "initialize"}),
        })
        .await
        .unwrap();

    let response = recv_frame(&mut rx).await;
    assert_eq!(response["id"], "init-1");
    assert_eq!(response["result"]["serverInfo"]["name"], "weft-hub");
}

#[tokio::test]
async fn unknown_method_yields_method_not_found() {
    let router = start_router(RouterConfig::default());
    let (browser, mut rx, _status) = connect_browser(&router).await;

    router
        .send(RouterMsg::BrowserFrame {
            peer: browser,
            frame: json!({"jsonrpc": "2.0", "id": 2, "method": "resources/list"}),
        })
        .await
        .unwrap();

    let response = recv_frame(&mut rx).await;
    assert_eq!(response["error"]["code"], -32601);
}

// ── tools/call round trip ────────────────────────────────────

#[tokio::test]
async fn call_round_trip_restores_id_and_preserves_payload() {
    let router = start_router(RouterConfig::default());
    let (server, mut server_rx) = connect_tool_server(&router, "echo-server", echo_tools()).await;
    let (browser, mut rx, _status) = connect_browser(&router).await;

    router
        .send(RouterMsg::BrowserFrame {
            peer: browser,
            frame: json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "tools/call",
                "params": { "name": "echo", "arguments": { "x": 1 } },
                "x-trace": "keep-me",
            }),
        })
        .await
        .unwrap();

    // The forwarded request carries a router-space id and everything
    // else untouched.
    let forwarded = recv_frame(&mut server_rx).await;
    let router_id = forwarded["id"].as_i64().unwrap();
    assert!(router_id >= 1_000_000_000);
    assert_ne!(forwarded["id"], 7);
    assert_eq!(forwarded["params"]["arguments"]["x"], 1);
    assert_eq!(forwarded["x-trace"], "keep-me");

    let result = json!({ "echoed": { "x": 1 }, "z-unknown": [3, 2, 1] });
    router
        .send(RouterMsg::ToolServerFrame {
            peer: server,
            frame: json!({"jsonrpc": "2.0", "id": router_id, "result": result}),
        })
        .await
        .unwrap();

    let response = recv_frame(&mut rx).await;
    assert_eq!(response["id"], 7);
    assert_eq!(
        serde_json::to_string(&response["result"]).unwrap(),
        serde_json::to_string(&result).unwrap(),
        "result payload must survive byte-for-byte"
    );
}

#[tokio::test]
async fn concurrent_browsers_with_colliding_ids_are_kept_apart() {
    let router = start_router(RouterConfig::default());
    let (server, mut server_rx) = connect_tool_server(&router, "echo-server", echo_tools()).await;
    let (browser_a, mut rx_a, _) = connect_browser(&router).await;
    let (browser_b, mut rx_b, _) = connect_browser(&router).await;

    for peer in [browser_a, browser_b] {
        router
            .send(RouterMsg::BrowserFrame {
                peer,
                frame: json!({
                    "jsonrpc": "2.0",
                    "id": 42,
                    "method": "tools/call",
                    "params": { "name": "echo", "arguments": { "from": peer } },
                }),
            })
            .await
            .unwrap();
    }

    let first = recv_frame(&mut server_rx).await;
    let second = recv_frame(&mut server_rx).await;
    assert_ne!(first["id"], second["id"], "rewritten ids must not collide");

    // Answer in reverse order; each browser still gets its own reply.
    for forwarded in [second, first] {
        let from = forwarded["params"]["arguments"]["from"].clone();
        router
            .send(RouterMsg::ToolServerFrame {
                peer: server,
                frame: json!({
                    "jsonrpc": "2.0",
                    "id": forwarded["id"],
                    "result": { "from": from },
                }),
            })
            .await
            .unwrap();
    }

    let reply_a = recv_frame(&mut rx_a).await;
    assert_eq!(reply_a["id"], 42);
    assert_eq!(reply_a["result"]["from"], browser_a);

    let reply_b = recv_frame(&mut rx_b).await;
    assert_eq!(reply_b["id"], 42);
    assert_eq!(reply_b["result"]["from"], browser_b);
}

#[tokio::test]
async fn unknown_tool_call_yields_method_not_found() {
    let router = start_router(RouterConfig::default());
    let (_server, _server_rx) = connect_tool_server(&router, "echo-server", echo_tools()).await;
    let (browser, mut rx, _status) = connect_browser(&router).await;

    router
        .send(RouterMsg::BrowserFrame {
            peer: browser,
            frame: json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": { "name": "missing" },
            }),
        })
        .await
        .unwrap();

    let response = recv_frame(&mut rx).await;
    assert_eq!(response["id"], 3);
    assert_eq!(response["error"]["code"], -32601);
    assert_eq!(response["error"]["message"], "Method not found");
}

// ── Overrides ────────────────────────────────────────────────

fn overrides(entries: &[(&str, ToolOverride)]) -> BTreeMap<String, ToolOverride> {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn disabled_override_hides_the_tool_and_rejects_calls() {
    let router = start_router(RouterConfig::default());
    let (_server, _server_rx) = connect_tool_server(&router, "echo-server", echo_tools()).await;
    let (browser, mut rx, _status) = connect_browser(&router).await;

    router
        .send(RouterMsg::OverridesChanged {
            overrides: overrides(&[(
                "echo-server/echo",
                ToolOverride {
                    disabled: true,
                    ..ToolOverride::default()
                },
            )]),
        })
        .await
        .unwrap();

    router
        .send(RouterMsg::BrowserFrame {
            peer: browser,
            frame: json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
        })
        .await
        .unwrap();
    let response = recv_frame(&mut rx).await;
    assert_eq!(response["result"]["tools"], json!([]));

    router
        .send(RouterMsg::BrowserFrame {
            peer: browser,
            frame: json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/call",
                "params": { "name": "echo" },
            }),
        })
        .await
        .unwrap();
    let response = recv_frame(&mut rx).await;
    assert_eq!(response["error"]["code"], -32601);
    assert_eq!(response["error"]["message"], "Method not found");
}

#[tokio::test]
async fn renamed_override_dispatches_under_the_original_name() {
    let router = start_router(RouterConfig::default());
    let (server, mut server_rx) = connect_tool_server(&router, "echo-server", echo_tools()).await;
    let (browser, mut rx, _status) = connect_browser(&router).await;

    router
        .send(RouterMsg::OverridesChanged {
            overrides: overrides(&[(
                "echo-server/echo",
                ToolOverride {
                    custom_name: Some("repeat".into()),
                    custom_description: Some("Repeats things".into()),
                    ..ToolOverride::default()
                },
            )]),
        })
        .await
        .unwrap();

    router
        .send(RouterMsg::BrowserFrame {
            peer: browser,
            frame: json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
        })
        .await
        .unwrap();
    let response = recv_frame(&mut rx).await;
    assert_eq!(response["result"]["tools"][0]["name"], "repeat");
    assert_eq!(response["result"]["tools"][0]["description"], "Repeats things");

    router
        .send(RouterMsg::BrowserFrame {
            peer: browser,
            frame: json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/call",
                "params": { "name": "repeat", "arguments": {} },
            }),
        })
        .await
        .unwrap();

    // The backing server sees its own tool name.
    let forwarded = recv_frame(&mut server_rx).await;
    assert_eq!(forwarded["params"]["name"], "echo");

    router
        .send(RouterMsg::ToolServerFrame {
            peer: server,
            frame: json!({
                "jsonrpc": "2.0",
                "id": forwarded["id"],
                "result": { "ok": true },
            }),
        })
        .await
        .unwrap();
    let response = recv_frame(&mut rx).await;
    assert_eq!(response["id"], 2);
    assert_eq!(response["result"]["ok"], true);
}

// ── Failure semantics ────────────────────────────────────────

#[tokio::test]
async fn pending_call_times_out_with_request_timeout() {
    let router = start_router(RouterConfig {
        call_timeout: Duration::from_millis(200),
        ..RouterConfig::default()
    });
    let (server, mut server_rx) = connect_tool_server(&router, "echo-server", echo_tools()).await;
    let (browser, mut rx, _status) = connect_browser(&router).await;

    router
        .send(RouterMsg::BrowserFrame {
            peer: browser,
            frame: json!({
                "jsonrpc": "2.0",
                "id": 9,
                "method": "tools/call",
                "params": { "name": "echo" },
            }),
        })
        .await
        .unwrap();

    let forwarded = recv_frame(&mut server_rx).await;

    // No response from the server: the router synthesizes the timeout.
    let response = recv_frame(&mut rx).await;
    assert_eq!(response["id"], 9);
    assert_eq!(response["error"]["code"], -32001);
    assert_eq!(response["error"]["message"], "Request timeout");

    // A late response is dropped, not delivered.
    router
        .send(RouterMsg::ToolServerFrame {
            peer: server,
            frame: json!({
                "jsonrpc": "2.0",
                "id": forwarded["id"],
                "result": { "late": true },
            }),
        })
        .await
        .unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .is_err(),
        "late response must not reach the browser"
    );
}

#[tokio::test]
async fn backend_close_fails_in_flight_calls() {
    let router = start_router(RouterConfig::default());
    let (server, mut server_rx) = connect_tool_server(&router, "echo-server", echo_tools()).await;
    let (browser, mut rx, _status) = connect_browser(&router).await;

    router
        .send(RouterMsg::BrowserFrame {
            peer: browser,
            frame: json!({
                "jsonrpc": "2.0",
                "id": 11,
                "method": "tools/call",
                "params": { "name": "echo" },
            }),
        })
        .await
        .unwrap();
    let _forwarded = recv_frame(&mut server_rx).await;

    router
        .send(RouterMsg::ToolServerClosed { peer: server })
        .await
        .unwrap();

    let response = recv_frame(&mut rx).await;
    assert_eq!(response["id"], 11);
    assert_eq!(response["error"]["code"], -32002);
    assert_eq!(response["error"]["message"], "Backend closed");

    // Followed by the status broadcast.
    let status = recv_frame(&mut rx).await;
    assert_eq!(status["type"], "status");
    assert_eq!(status["mcp_connected"], false);
}

#[tokio::test]
async fn browser_close_drops_its_pending_responses() {
    let router = start_router(RouterConfig::default());
    let (server, mut server_rx) = connect_tool_server(&router, "echo-server", echo_tools()).await;
    let (browser, rx, _status) = connect_browser(&router).await;

    router
        .send(RouterMsg::BrowserFrame {
            peer: browser,
            frame: json!({
                "jsonrpc": "2.0",
                "id": 5,
                "method": "tools/call",
                "params": { "name": "echo" },
            }),
        })
        .await
        .unwrap();
    let forwarded = recv_frame(&mut server_rx).await;

    drop(rx);
    router
        .send(RouterMsg::BrowserClosed { peer: browser })
        .await
        .unwrap();

    // The response arrives after the browser is gone; the router keeps
    // working and a fresh browser is unaffected.
    router
        .send(RouterMsg::ToolServerFrame {
            peer: server,
            frame: json!({
                "jsonrpc": "2.0",
                "id": forwarded["id"],
                "result": { "orphaned": true },
            }),
        })
        .await
        .unwrap();

    let (_browser2, _rx2, status) = connect_browser(&router).await;
    assert_eq!(status["mcp_connected"], true);
}

// ── Tie-breaks ───────────────────────────────────────────────

#[tokio::test]
async fn duplicate_tool_name_resolves_to_latest_registrant() {
    let router = start_router(RouterConfig::default());
    let (_first, mut first_rx) = connect_tool_server(&router, "alpha", echo_tools()).await;
    let (second, mut second_rx) = connect_tool_server(&router, "beta", echo_tools()).await;
    let (browser, mut rx, _status) = connect_browser(&router).await;

    router
        .send(RouterMsg::BrowserFrame {
            peer: browser,
            frame: json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "tools/call",
                "params": { "name": "echo" },
            }),
        })
        .await
        .unwrap();

    let forwarded = recv_frame(&mut second_rx).await;
    assert_eq!(forwarded["method"], "tools/call");
    assert!(
        tokio::time::timeout(Duration::from_millis(200), first_rx.recv())
            .await
            .is_err(),
        "the shadowed registrant must not receive the call"
    );

    router
        .send(RouterMsg::ToolServerFrame {
            peer: second,
            frame: json!({
                "jsonrpc": "2.0",
                "id": forwarded["id"],
                "result": { "served_by": "beta" },
            }),
        })
        .await
        .unwrap();
    let response = recv_frame(&mut rx).await;
    assert_eq!(response["result"]["served_by"], "beta");
}

// ── tools/list_changed ───────────────────────────────────────

#[tokio::test]
async fn list_changed_notification_refreshes_the_catalog() {
    let router = start_router(RouterConfig::default());
    let (server, mut server_rx) = connect_tool_server(&router, "echo-server", echo_tools()).await;
    let (browser, mut rx, _status) = connect_browser(&router).await;

    router
        .send(RouterMsg::ToolServerFrame {
            peer: server,
            frame: json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}),
        })
        .await
        .unwrap();

    let (list_id, _) = expect_request(&mut server_rx, "tools/list").await;
    router
        .send(RouterMsg::ToolServerFrame {
            peer: server,
            frame: json!({
                "jsonrpc": "2.0",
                "id": list_id,
                "result": { "tools": [
                    { "name": "echo", "description": "Echo", "inputSchema": {} },
                    { "name": "shout", "description": "Loud echo", "inputSchema": {} },
                ] },
            }),
        })
        .await
        .unwrap();

    router
        .send(RouterMsg::BrowserFrame {
            peer: browser,
            frame: json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
        })
        .await
        .unwrap();
    let response = recv_frame(&mut rx).await;
    let names: Vec<&str> = response["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["echo", "shout"]);
}
