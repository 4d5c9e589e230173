//! Per-tool-server session task.
//!
//! The inbound peer is one tool server (usually a remote weft bridge
//! splicing a subprocess). The router drives the initialization
//! exchange; this task only relays frames and reports the close.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use weft_core::Throttle;

use crate::router::RouterMsg;

/// Frames buffered from the router toward one tool server.
const OUTBOUND_BUFFER: usize = 64;

/// Drive one tool-server connection until either side closes.
pub(crate) async fn run(ws: WebSocketStream<TcpStream>, router: mpsc::Sender<RouterMsg>) {
    let (mut writer, mut reader) = ws.split();

    let (tx, mut rx) = mpsc::channel::<Value>(OUTBOUND_BUFFER);
    let (reply_tx, reply_rx) = oneshot::channel();
    if router
        .send(RouterMsg::ToolServerConnected {
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

    let mut protocol_log = Throttle::per_minute();
    while let Some(msg) = reader.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if text.is_empty() {
                    if protocol_log.allow() {
                        warn!(peer, "Dropping empty frame from tool server");
                    }
                    continue;
                }
                let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                    if protocol_log.allow() {
                        warn!(peer, "Dropping non-JSON frame from tool server");
                    }
                    continue;
                };
                if router
                    .send(RouterMsg::ToolServerFrame { peer, frame })
                    .await
                    .is_err()
                {
                    break;
                }
            },
            Ok(Message::Binary(payload)) => {
                if protocol_log.allow() {
                    warn!(
                        peer,
                        bytes = payload.len(),
                        "Dropping binary frame from tool server"
                    );
                }
            },
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {},
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!(peer, error = %e, "Tool server read error");
                break;
            },
        }
    }

    let _ = router.send(RouterMsg::ToolServerClosed { peer }).await;
    writer_task.abort();
    debug!(peer, "Tool server session finished");
}
