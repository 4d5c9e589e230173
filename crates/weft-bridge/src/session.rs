//! Endpoint session: one supervised WebSocket per endpoint×server pair.
//!
//! The session dials the remote hub, spawns the tool subprocess, and
//! splices frames in both directions without interpreting them. On any
//! transport failure it tears both sides down and reconnects with
//! exponential backoff; `stop()` (the shutdown channel) ends the loop
//! and cancels any pending backoff sleep.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected --dial--> Connecting --success--> Open
//! Connecting --failure--> Disconnected (schedule backoff)
//! Open --close|exit----> Disconnected (schedule backoff)
//! Open --shutdown------> Closing --> Disconnected (cancel backoff)
//! ```

use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use weft_config::{ConnectionStatus, EndpointId, ServerDefinition};
use weft_core::rpc::{self, FrameKind, reserved};
use weft_core::{Throttle, ToolDescriptor};

use crate::backoff::Backoff;
use crate::connection::{EndpointConnection, WsReader, WsWriter};
use crate::error::BridgeError;
use crate::subprocess::ToolProcess;

/// An open period at least this long counts as a success and resets the
/// backoff schedule.
const RESET_AFTER: Duration = Duration::from_secs(10);

/// Grace given to the socket writer to flush after the splice ends.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Configuration for one endpoint session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Endpoint this session dials.
    pub endpoint_id: EndpointId,
    /// Endpoint display name, for logs.
    pub endpoint_name: String,
    /// Dial URL, passed through verbatim.
    pub url: String,
    /// The tool server bridged over this session.
    pub server: ServerDefinition,
    /// Initial reconnect delay.
    pub backoff_base: Duration,
    /// Reconnect delay cap.
    pub backoff_max: Duration,
    /// Dial timeout.
    pub dial_timeout: Duration,
    /// Idle keepalive ping interval.
    pub ping_interval: Duration,
    /// Subprocess graceful-exit window.
    pub subprocess_grace: Duration,
    /// How long a full splice buffer may stall before the session
    /// closes with a transport-overrun error.
    pub stall_timeout: Duration,
    /// Per-direction splice buffer, in frames.
    pub buffer_frames: usize,
}

impl SessionConfig {
    /// Config with default timings for one endpoint×server pair.
    #[must_use]
    pub fn new(
        endpoint_id: EndpointId,
        endpoint_name: impl Into<String>,
        url: impl Into<String>,
        server: ServerDefinition,
    ) -> Self {
        Self {
            endpoint_id,
            endpoint_name: endpoint_name.into(),
            url: url.into(),
            server,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            subprocess_grace: Duration::from_secs(5),
            stall_timeout: Duration::from_secs(10),
            buffer_frames: 64,
        }
    }
}

/// Events a session reports to its supervisor.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A connection-state transition.
    Status {
        /// Endpoint the session belongs to.
        endpoint_id: EndpointId,
        /// Server name of the pair.
        server: String,
        /// New state.
        status: ConnectionStatus,
        /// Error message accompanying an `Error` state.
        error: Option<String>,
    },
    /// The injected `tools/list` discovery completed.
    Catalog {
        /// Endpoint the session belongs to.
        endpoint_id: EndpointId,
        /// Server name of the pair.
        server: String,
        /// Tools the child advertised.
        tools: Vec<ToolDescriptor>,
    },
}

/// How one open period ended.
enum SpliceExit {
    /// Shutdown was requested; do not reconnect.
    Shutdown,
    /// The transport or subprocess failed; reconnect after backoff.
    Lost(String),
}

/// One endpoint×server bridge session.
pub struct EndpointSession {
    config: SessionConfig,
    events: mpsc::Sender<SessionEvent>,
    shutdown_rx: broadcast::Receiver<()>,
    shutdown_tx: broadcast::Sender<()>,
    /// Monotonic counter for discovery request ids.
    discovery_seq: i64,
}

impl EndpointSession {
    /// Create a session. Does not dial yet.
    #[must_use]
    pub fn new(
        config: SessionConfig,
        events: mpsc::Sender<SessionEvent>,
        shutdown_rx: broadcast::Receiver<()>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            config,
            events,
            shutdown_rx,
            shutdown_tx,
            discovery_seq: 0,
        }
    }

    /// Run the session: dial, splice, reconnect. Returns on shutdown.
    pub async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_max);

        loop {
            if self.shutdown_signalled() {
                self.report(ConnectionStatus::Disconnected, None).await;
                return;
            }

            self.report(ConnectionStatus::Connecting, None).await;

            match self.connect_and_splice().await {
                Ok((SpliceExit::Shutdown, _)) => {
                    info!(
                        endpoint = %self.config.endpoint_name,
                        server = %self.config.server.name,
                        "Endpoint session stopped"
                    );
                    self.report(ConnectionStatus::Disconnected, None).await;
                    return;
                },
                Ok((SpliceExit::Lost(reason), open_for)) => {
                    warn!(
                        endpoint = %self.config.endpoint_name,
                        server = %self.config.server.name,
                        reason = %reason,
                        "Endpoint session lost"
                    );
                    if open_for >= RESET_AFTER {
                        backoff.reset();
                    }
                    self.report(ConnectionStatus::Error, Some(reason)).await;
                },
                Err(e) => {
                    warn!(
                        endpoint = %self.config.endpoint_name,
                        server = %self.config.server.name,
                        error = %e,
                        "Endpoint connection attempt failed"
                    );
                    self.report(ConnectionStatus::Error, Some(e.to_string()))
                        .await;
                },
            }

            let delay = backoff.next_delay();
            info!(
                endpoint = %self.config.endpoint_name,
                server = %self.config.server.name,
                delay_ms = delay.as_millis(),
                "Reconnecting after backoff"
            );
            if !self.sleep_or_shutdown(delay).await {
                self.report(ConnectionStatus::Disconnected, None).await;
                return;
            }
        }
    }

    /// Single open period: dial, spawn, splice, tear down.
    ///
    /// Returns how the splice ended plus how long the session was open.
    async fn connect_and_splice(&mut self) -> Result<(SpliceExit, Duration), BridgeError> {
        debug!(
            url = %self.config.url,
            server = %self.config.server.name,
            "Dialing endpoint"
        );
        let conn = EndpointConnection::dial(&self.config.url, self.config.dial_timeout).await?;
        let child = ToolProcess::spawn(&self.config.server)?;

        // Inject discovery before any remote traffic reaches the child.
        let discovery_id = reserved::DISCOVERY_ID_BASE.saturating_add(self.discovery_seq);
        self.discovery_seq = self.discovery_seq.saturating_add(1);
        child
            .write_frame(&rpc::request(discovery_id, rpc::method::TOOLS_LIST, None))
            .await?;

        self.report(ConnectionStatus::Connected, None).await;
        info!(
            endpoint = %self.config.endpoint_name,
            server = %self.config.server.name,
            pid = ?child.id(),
            "Endpoint session open"
        );
        let opened = Instant::now();

        let (ws_writer, mut ws_reader) = conn.into_parts();
        let (out_tx, out_rx) = mpsc::channel::<Message>(self.config.buffer_frames);
        let mut writer_handle = spawn_writer(ws_writer, out_rx);
        let ping_handle = spawn_keepalive(
            out_tx.clone(),
            self.config.ping_interval,
            self.shutdown_tx.subscribe(),
        );

        let mut child = child;
        let exit = self
            .splice(&mut ws_reader, &out_tx, &mut child, discovery_id)
            .await;

        // Stop feeding the writer, then give it a moment to flush and
        // send its close frame before aborting.
        ping_handle.abort();
        drop(out_tx);
        tokio::select! {
            _ = &mut writer_handle => {},
            () = tokio::time::sleep(WRITER_DRAIN) => {
                writer_handle.abort();
            },
        }

        child.stop(self.config.subprocess_grace).await;

        Ok((exit, opened.elapsed()))
    }

    /// Pipe frames between the socket and the child until either side
    /// fails or shutdown is requested.
    async fn splice(
        &mut self,
        ws_reader: &mut WsReader,
        out_tx: &mpsc::Sender<Message>,
        child: &mut ToolProcess,
        discovery_id: i64,
    ) -> SpliceExit {
        let stdin = child.writer();
        let mut protocol_log = Throttle::per_minute();

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.recv() => {
                    return SpliceExit::Shutdown;
                }

                frame = child.next_frame() => {
                    let Some(line) = frame else {
                        return SpliceExit::Lost("subprocess exited".into());
                    };
                    if self.intercept_discovery(&line, discovery_id).await {
                        continue;
                    }
                    match out_tx
                        .send_timeout(
                            Message::Text(line.into()),
                            self.config.stall_timeout,
                        )
                        .await
                    {
                        Ok(()) => {},
                        Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                            return SpliceExit::Lost(
                                BridgeError::Overrun { direction: "child→socket" }.to_string(),
                            );
                        },
                        Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                            return SpliceExit::Lost("socket writer closed".into());
                        },
                    }
                }

                msg = ws_reader.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if text.is_empty() {
                                if protocol_log.allow() {
                                    warn!(
                                        server = %self.config.server.name,
                                        "Dropping empty frame from remote"
                                    );
                                }
                                continue;
                            }
                            if serde_json::from_str::<Value>(&text).is_err() {
                                if protocol_log.allow() {
                                    warn!(
                                        server = %self.config.server.name,
                                        "Dropping non-JSON frame from remote"
                                    );
                                }
                                continue;
                            }
                            match stdin
                                .send_timeout(text.as_str().to_string(), self.config.stall_timeout)
                                .await
                            {
                                Ok(()) => {},
                                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                                    return SpliceExit::Lost(
                                        BridgeError::Overrun {
                                            direction: "socket→child",
                                        }
                                        .to_string(),
                                    );
                                },
                                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                                    return SpliceExit::Lost(
                                        "subprocess stdin closed".into(),
                                    );
                                },
                            }
                        },
                        Some(Ok(Message::Binary(payload))) => {
                            if protocol_log.allow() {
                                warn!(
                                    server = %self.config.server.name,
                                    bytes = payload.len(),
                                    "Dropping binary frame from remote"
                                );
                            }
                        },
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {},
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.as_ref().map_or(1005, |f| u16::from(f.code));
                            return SpliceExit::Lost(format!("closed by remote (code {code})"));
                        },
                        Some(Err(e)) => {
                            return SpliceExit::Lost(format!("WebSocket read error: {e}"));
                        },
                        None => {
                            return SpliceExit::Lost("WebSocket stream ended".into());
                        },
                    }
                }
            }
        }
    }

    /// Capture the response to the injected discovery request.
    ///
    /// Returns `true` when the frame was consumed and must not be
    /// forwarded to the socket.
    async fn intercept_discovery(&self, line: &str, discovery_id: i64) -> bool {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return false;
        };
        let Ok(FrameKind::Response { id, is_error }) = rpc::classify(&value) else {
            return false;
        };
        if !reserved::is_discovery(&id) {
            return false;
        }

        if id != rpc::RpcId::Int(discovery_id) {
            debug!(id = %id, "Dropping stale discovery response");
            return true;
        }

        if is_error {
            warn!(
                server = %self.config.server.name,
                "Discovery tools/list returned an error"
            );
            return true;
        }

        let tools = value
            .get("result")
            .map(ToolDescriptor::from_list_result)
            .unwrap_or_default();
        info!(
            server = %self.config.server.name,
            count = tools.len(),
            "Discovered tools"
        );
        let _ = self
            .events
            .send(SessionEvent::Catalog {
                endpoint_id: self.config.endpoint_id,
                server: self.config.server.name.clone(),
                tools,
            })
            .await;
        true
    }

    /// Report a connection-state transition to the supervisor.
    async fn report(&self, status: ConnectionStatus, error: Option<String>) {
        let _ = self
            .events
            .send(SessionEvent::Status {
                endpoint_id: self.config.endpoint_id,
                server: self.config.server.name.clone(),
                status,
                error,
            })
            .await;
    }

    /// Sleep for `duration`; returns `false` if shutdown interrupted.
    async fn sleep_or_shutdown(&mut self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown_rx.recv() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }

    /// Non-blocking check for a pending shutdown signal.
    fn shutdown_signalled(&mut self) -> bool {
        !matches!(
            self.shutdown_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        )
    }
}

/// Spawn the socket writer task.
fn spawn_writer(mut ws_writer: WsWriter, mut out_rx: mpsc::Receiver<Message>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if let Err(e) = ws_writer.send(msg).await {
                debug!(error = %e, "Session writer: send failed");
                return;
            }
        }
        // Input drained: close cleanly.
        let _ = ws_writer.close().await;
    })
}

/// Spawn the idle-ping task.
fn spawn_keepalive(
    out_tx: mpsc::Sender<Message>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return,
                _ = ticker.tick() => {
                    if out_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn echo_server_def() -> ServerDefinition {
        ServerDefinition::stdio("echo", "sh").with_args(["-c", "cat"])
    }

    /// Spawn a session against `url` with fast timings for tests.
    fn spawn_session(
        url: &str,
        server: ServerDefinition,
    ) -> (
        mpsc::Receiver<SessionEvent>,
        broadcast::Sender<()>,
        JoinHandle<()>,
    ) {
        let mut config =
            SessionConfig::new(EndpointId::new(), "test-endpoint", url, server);
        config.backoff_base = Duration::from_millis(50);
        config.backoff_max = Duration::from_millis(400);
        config.dial_timeout = Duration::from_secs(2);

        let (events_tx, events_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let session =
            EndpointSession::new(config, events_tx, shutdown_rx, shutdown_tx.clone());
        let task = tokio::spawn(session.run());
        (events_rx, shutdown_tx, task)
    }

    async fn next_status(events: &mut mpsc::Receiver<SessionEvent>) -> ConnectionStatus {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("expected a session event")
                .expect("event channel closed");
            if let SessionEvent::Status { status, .. } = event {
                return status;
            }
        }
    }

    // ── Splice round trip ────────────────────────────────────

    #[tokio::test]
    async fn frames_are_spliced_byte_for_byte() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            // The echo child reflects the injected discovery request;
            // it is a request (not a response), so it is forwarded.
            let echoed = ws.next().await.unwrap().unwrap();
            assert!(matches!(echoed, Message::Text(ref t)
                if t.contains("tools/list") && t.contains("2000000000")));

            let frame =
                r#"{"jsonrpc":"2.0","id":7,"method":"tools/call","params":{"x":1},"x-trace":"t1"}"#;
            ws.send(Message::Text(frame.into())).await.unwrap();

            let back = ws.next().await.unwrap().unwrap();
            match back {
                Message::Text(text) => assert_eq!(text.as_str(), frame),
                other => panic!("expected text frame, got {other:?}"),
            }
        });

        let (mut events, shutdown_tx, task) =
            spawn_session(&format!("ws://{addr}"), echo_server_def());

        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connecting);
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connected);

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("round trip should finish")
            .unwrap();

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("session should stop on shutdown")
            .unwrap();
    }

    // ── Discovery interception ───────────────────────────────

    #[tokio::test]
    async fn discovery_response_is_captured_not_forwarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            // The discovery response must NOT reach the socket.
            let got = tokio::time::timeout(Duration::from_millis(500), ws.next()).await;
            assert!(got.is_err(), "discovery response leaked to the socket");
        });

        // Child answers the first line with a canned discovery response
        // (the session's first discovery id is the range base).
        let script = r#"read line; printf '{"jsonrpc":"2.0","id":2000000000,"result":{"tools":[{"name":"echo","description":"Echo","inputSchema":{"type":"object"}}]}}\n'; cat >/dev/null"#;
        let def = ServerDefinition::stdio("echo", "sh").with_args(["-c", script]);

        let (mut events, shutdown_tx, task) = spawn_session(&format!("ws://{addr}"), def);

        let tools = loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("expected a catalog event")
                .expect("event channel closed");
            if let SessionEvent::Catalog { tools, .. } = event {
                break tools;
            }
        };
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        server.await.unwrap();
        shutdown_tx.send(()).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }

    // ── Failure and backoff ──────────────────────────────────

    #[tokio::test]
    async fn dial_failure_reports_error_and_retries() {
        // Nothing listens on this address.
        let (mut events, shutdown_tx, task) =
            spawn_session("ws://127.0.0.1:9", echo_server_def());

        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connecting);
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Error);
        // Backoff elapses and a second attempt begins.
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connecting);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("session should stop on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_backoff() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = SessionConfig::new(
            EndpointId::new(),
            "test-endpoint",
            format!("ws://{addr}"),
            echo_server_def(),
        );
        // Long enough that only a cancelled sleep lets the test pass.
        config.backoff_base = Duration::from_secs(30);
        config.backoff_max = Duration::from_secs(30);
        config.dial_timeout = Duration::from_secs(1);

        let (events_tx, mut events_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let session =
            EndpointSession::new(config, events_tx, shutdown_rx, shutdown_tx.clone());
        let task = tokio::spawn(session.run());

        assert_eq!(
            next_status(&mut events_rx).await,
            ConnectionStatus::Connecting
        );
        assert_eq!(next_status(&mut events_rx).await, ConnectionStatus::Error);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("shutdown should cancel the backoff sleep")
            .unwrap();
    }

    #[tokio::test]
    async fn remote_close_reports_error_then_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // Accept, then immediately drop the first connection.
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            drop(ws);
            // The session reconnects; accept again to prove it.
            let (stream, _) = listener.accept().await.unwrap();
            let _ws = accept_async(stream).await.unwrap();
        });

        let (mut events, shutdown_tx, task) =
            spawn_session(&format!("ws://{addr}"), echo_server_def());

        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connecting);
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connected);
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Error);
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connecting);
        assert_eq!(next_status(&mut events).await, ConnectionStatus::Connected);

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server should see the reconnect")
            .unwrap();

        shutdown_tx.send(()).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }
}
