//! Hub WebSocket listener.
//!
//! Accepts TCP connections, upgrades them, and routes by request path:
//! browser clients on the browser path, tool servers (bridges) on the
//! tool path. Authentication is a `?token=…` query parameter checked
//! against the auth collaborator; an invalid token closes the socket
//! with application code 4401 before any frame is delivered.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

use crate::auth::{Audience, TokenValidator};
use crate::error::HubResult;
use crate::router::RouterMsg;
use crate::{browser, tool_server};

/// Close code for rejected authentication.
const CLOSE_UNAUTHORIZED: u16 = 4401;
/// Close code for an unrecognized upgrade path.
const CLOSE_POLICY: u16 = 1008;

/// Listener configuration, passed in at construction.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Bind address (`HUB_BIND_ADDR`).
    pub bind_addr: String,
    /// Upgrade path for browser clients (`HUB_BROWSER_PATH`).
    pub browser_path: String,
    /// Upgrade path for tool servers (`HUB_TOOL_PATH`).
    pub tool_path: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8900".to_string(),
            browser_path: "/".to_string(),
            tool_path: "/mcp".to_string(),
        }
    }
}

/// Accept connections until shutdown.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    config: HubConfig,
    validator: Arc<dyn TokenValidator>,
    router: mpsc::Sender<RouterMsg>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                info!("Hub listener shutting down");
                return;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let config = config.clone();
                        let validator = Arc::clone(&validator);
                        let router = router.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, addr, &config, validator, router).await
                            {
                                debug!(addr = %addr, error = %e, "Connection ended with error");
                            }
                        });
                    },
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                    },
                }
            }
        }
    }
}

/// Upgrade one connection, authenticate, and hand it to a session task.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: &HubConfig,
    validator: Arc<dyn TokenValidator>,
    router: mpsc::Sender<RouterMsg>,
) -> HubResult<()> {
    // Capture the request URI during the handshake; path and token are
    // decided after the upgrade so rejections arrive as close frames.
    let mut uri = None;
    let mut ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
        uri = Some(req.uri().clone());
        Ok(resp)
    })
    .await?;

    let Some(uri) = uri else {
        return Ok(());
    };
    let path = uri.path().to_string();
    let token = token_from_query(uri.query()).unwrap_or_default();

    let audience = if path == config.browser_path {
        Audience::Browser
    } else if path == config.tool_path {
        Audience::ToolPipe
    } else {
        debug!(addr = %addr, path = %path, "Rejecting unknown upgrade path");
        let _ = ws
            .close(Some(CloseFrame {
                code: CloseCode::from(CLOSE_POLICY),
                reason: "unknown path".into(),
            }))
            .await;
        return Ok(());
    };

    let decision = validator.validate(&token, audience).await;
    if !decision.valid {
        info!(
            addr = %addr,
            path = %path,
            reason = decision.reason.as_deref().unwrap_or("invalid token"),
            "Rejecting upgrade: authentication failed"
        );
        let _ = ws
            .close(Some(CloseFrame {
                code: CloseCode::from(CLOSE_UNAUTHORIZED),
                reason: "invalid token".into(),
            }))
            .await;
        return Ok(());
    }

    info!(
        addr = %addr,
        path = %path,
        subject = decision.subject.as_deref().unwrap_or("?"),
        "Client connected"
    );
    match audience {
        Audience::Browser => browser::run(ws, router).await,
        Audience::ToolPipe => tool_server::run(ws, router).await,
    }
    Ok(())
}

/// Extract the `token` query parameter, if present.
fn token_from_query(query: Option<&str>) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())
}
