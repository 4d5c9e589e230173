//! Per-browser session task.
//!
//! Relays frames between one browser WebSocket and the router inbox.
//! The session holds no routing state: it validates framing, tags
//! inbound frames with its handle, and writes whatever the router
//! sends back.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use weft_core::Throttle;

use crate::router::RouterMsg;

/// Frames buffered from the router toward one browser.
const OUTBOUND_BUFFER: usize = 64;

/// Drive one browser connection until either side closes.
pub(crate) async fn run(ws: WebSocketStream<TcpStream>, router: mpsc::Sender<RouterMsg>) {
    let (mut writer, mut reader) = ws.split();

    let (tx, mut rx) = mpsc::channel::<Value>(OUTBOUND_BUFFER);
    let (reply_tx, reply_rx) = oneshot::channel();
    if router
        .send(RouterMsg::BrowserConnected {
            tx,
            reply: reply_tx,
        })
        .await
        .is_err()
    {
        return;
    }
    let Ok(peer) = reply_rx.await else {
        return;
    };

    // Writer half: everything the router sends, serialized as text.
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if writer.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = writer.close().await;
    });

    // Reader half: validate and tag inbound frames.
    let mut protocol_log = Throttle::per_minute();
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if text.is_empty() {
                    if protocol_log.allow() {
                        warn!(peer, "Dropping empty frame from browser");
                    }
                    continue;
                }
                let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                    if protocol_log.allow() {
                        warn!(peer, "Dropping non-JSON frame from browser");
                    }
                    continue;
                };
                if router
                    .send(RouterMsg::BrowserFrame { peer, frame })
                    .await
                    .is_err()
                {
                    break;
                }
            },
            Ok(Message::Binary(payload)) => {
                if protocol_log.allow() {
                    warn!(peer, bytes = payload.len(), "Dropping binary frame from browser");
                }
            },
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {},
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!(peer, error = %e, "Browser read error");
                break;
            },
        }
    }

    let _ = router.send(RouterMsg::BrowserClosed { peer }).await;
    writer_task.abort();
    debug!(peer, "Browser session finished");
}
