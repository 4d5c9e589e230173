//! The hub router: a single serializing task owning all routing state.
//!
//! Browser and tool-server sessions hold only a sender into the
//! router's inbox and are addressed by opaque integer handles; the
//! router owns the catalog, the dispatch table, and the pending-request
//! table, so every state change is totally ordered by inbox arrival.
//!
//! Forwarded requests get their id rewritten into the router's reserved
//! integer space (no collisions across browsers); the original id is
//! restored on the way back. Payloads pass through untouched.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use weft_config::{ToolOverride, override_key};
use weft_core::ToolDescriptor;
use weft_core::rpc::{self, FrameKind, RpcId, code, method, reserved};

/// Opaque handle addressing one connected session.
pub type PeerId = u64;

/// Router timing configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Deadline for router-initiated `initialize` / `tools/list`.
    pub list_timeout: Duration,
    /// Deadline for forwarded `tools/call` requests.
    pub call_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            list_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(60),
        }
    }
}

/// Messages arriving on the router inbox.
#[derive(Debug)]
pub enum RouterMsg {
    /// A browser session finished its handshake.
    BrowserConnected {
        /// Channel for frames the router sends to this browser.
        tx: mpsc::Sender<Value>,
        /// Receives the assigned handle.
        reply: oneshot::Sender<PeerId>,
    },
    /// A frame arrived from a browser.
    BrowserFrame {
        /// Originating browser.
        peer: PeerId,
        /// The parsed frame.
        frame: Value,
    },
    /// A browser session closed.
    BrowserClosed {
        /// The closed browser.
        peer: PeerId,
    },
    /// A tool-server session finished its handshake.
    ToolServerConnected {
        /// Channel for frames the router sends to this tool server.
        tx: mpsc::Sender<Value>,
        /// Receives the assigned handle.
        reply: oneshot::Sender<PeerId>,
    },
    /// A frame arrived from a tool server.
    ToolServerFrame {
        /// Originating tool server.
        peer: PeerId,
        /// The parsed frame.
        frame: Value,
    },
    /// A tool-server session closed.
    ToolServerClosed {
        /// The closed tool server.
        peer: PeerId,
    },
    /// A pending request passed its deadline.
    DeadlineExpired {
        /// The rewritten (router-space) request id.
        router_id: i64,
    },
    /// The override set changed.
    OverridesChanged {
        /// New overrides, keyed by `server/tool`.
        overrides: BTreeMap<String, ToolOverride>,
    },
    /// Stop the router.
    Shutdown,
}

/// Where a pending request came from.
enum PendingOrigin {
    /// A browser `tools/call`, to be answered with its original id.
    Browser {
        peer: PeerId,
        original_id: RpcId,
    },
    /// The router's own `initialize` toward a new tool server.
    HandshakeInitialize,
    /// The router's own `tools/list` toward a tool server.
    HandshakeTools,
}

/// One in-flight request, keyed by its router-space id.
struct Pending {
    origin: PendingOrigin,
    target: PeerId,
}

/// Connection state of a tool-server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolServerState {
    /// `initialize` sent, waiting for the response.
    AwaitingInitialize,
    /// `tools/list` sent, waiting for the catalog.
    AwaitingTools,
    /// Registered; its tools are dispatchable.
    Ready,
}

struct BrowserPeer {
    tx: mpsc::Sender<Value>,
}

struct ToolServerPeer {
    tx: mpsc::Sender<Value>,
    name: Option<String>,
    tools: Vec<ToolDescriptor>,
    state: ToolServerState,
}

/// The router task.
pub struct HubRouter {
    config: RouterConfig,
    inbox_tx: mpsc::Sender<RouterMsg>,
    inbox_rx: Option<mpsc::Receiver<RouterMsg>>,
    browsers: HashMap<PeerId, BrowserPeer>,
    tool_servers: HashMap<PeerId, ToolServerPeer>,
    /// Advertised tool name → (owning session, original tool name).
    dispatch: HashMap<String, (PeerId, String)>,
    pending: HashMap<i64, Pending>,
    overrides: BTreeMap<String, ToolOverride>,
    next_peer: PeerId,
    next_router_id: i64,
}

impl HubRouter {
    /// Create a router and the sender for its inbox.
    #[must_use]
    pub fn new(config: RouterConfig) -> (Self, mpsc::Sender<RouterMsg>) {
        let (inbox_tx, inbox_rx) = mpsc::channel(1024);
        let router = Self {
            config,
            inbox_tx: inbox_tx.clone(),
            inbox_rx: Some(inbox_rx),
            browsers: HashMap::new(),
            tool_servers: HashMap::new(),
            dispatch: HashMap::new(),
            pending: HashMap::new(),
            overrides: BTreeMap::new(),
            next_peer: 1,
            next_router_id: reserved::ROUTER_ID_BASE,
        };
        (router, inbox_tx)
    }

    /// Process inbox messages until shutdown or all senders drop.
    pub async fn run(mut self) {
        let Some(mut inbox) = self.inbox_rx.take() else {
            error!("Router started twice");
            return;
        };
        info!("Hub router starting");

        while let Some(msg) = inbox.recv().await {
            match msg {
                RouterMsg::BrowserConnected { tx, reply } => {
                    self.browser_connected(tx, reply);
                },
                RouterMsg::BrowserFrame { peer, frame } => {
                    self.browser_frame(peer, frame);
                },
                RouterMsg::BrowserClosed { peer } => {
                    self.browser_closed(peer);
                },
                RouterMsg::ToolServerConnected { tx, reply } => {
                    self.tool_server_connected(tx, reply);
                },
                RouterMsg::ToolServerFrame { peer, frame } => {
                    self.tool_server_frame(peer, frame);
                },
                RouterMsg::ToolServerClosed { peer } => {
                    self.tool_server_closed(peer);
                },
                RouterMsg::DeadlineExpired { router_id } => {
                    self.deadline_expired(router_id);
                },
                RouterMsg::OverridesChanged { overrides } => {
                    self.overrides = overrides;
                    self.rebuild_dispatch();
                },
                RouterMsg::Shutdown => {
                    info!("Hub router shutting down");
                    return;
                },
            }
        }
        debug!("Router inbox closed");
    }

    // ── Browser peers ────────────────────────────────────────

    fn browser_connected(&mut self, tx: mpsc::Sender<Value>, reply: oneshot::Sender<PeerId>) {
        let peer = self.next_peer;
        self.next_peer = self.next_peer.wrapping_add(1);

        let status = self.status_frame();
        let browser = BrowserPeer { tx };
        // First frame on any browser socket is the current status.
        if browser.tx.try_send(status).is_err() {
            debug!(peer, "Browser went away before the status frame");
        }
        self.browsers.insert(peer, browser);
        let _ = reply.send(peer);
        debug!(peer, browsers = self.browsers.len(), "Browser registered");
    }

    fn browser_closed(&mut self, peer: PeerId) {
        self.browsers.remove(&peer);
        // Responses for this browser's in-flight calls are dropped
        // silently when they arrive; forget the records now.
        self.pending.retain(|_, pending| {
            !matches!(pending.origin, PendingOrigin::Browser { peer: p, .. } if p == peer)
        });
        debug!(peer, browsers = self.browsers.len(), "Browser closed");
    }

    fn browser_frame(&mut self, peer: PeerId, frame: Value) {
        match rpc::classify(&frame) {
            Ok(FrameKind::Request { id, method: m }) => {
                self.browser_request(peer, frame, id, &m);
            },
            Ok(FrameKind::Notification { method: m }) => {
                // notifications/initialized and keep-alives; nothing to
                // forward.
                debug!(peer, method = %m, "Browser notification");
            },
            Ok(FrameKind::Response { .. }) => {
                debug!(peer, "Ignoring response frame from browser");
            },
            Err(e) => {
                debug!(peer, error = %e, "Dropping malformed browser frame");
            },
        }
    }

    fn browser_request(&mut self, peer: PeerId, frame: Value, id: RpcId, m: &str) {
        match m {
            method::INITIALIZE => {
                let result = json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": "weft-hub",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                });
                self.send_to_browser(peer, rpc::response(&id, result));
            },
            method::TOOLS_LIST => {
                let tools = self.projected_catalog();
                self.send_to_browser(peer, rpc::response(&id, json!({ "tools": tools })));
            },
            method::TOOLS_CALL => self.dispatch_call(peer, frame, id),
            other => {
                debug!(peer, method = %other, "Unrecognized method from browser");
                self.send_to_browser(
                    peer,
                    rpc::error_response(&id, code::METHOD_NOT_FOUND, "Method not found"),
                );
            },
        }
    }

    /// Forward a `tools/call` to the owning tool server.
    fn dispatch_call(&mut self, peer: PeerId, mut frame: Value, id: RpcId) {
        let advertised = frame
            .get("params")
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let Some(advertised) = advertised else {
            self.send_to_browser(
                peer,
                rpc::error_response(&id, code::METHOD_NOT_FOUND, "Method not found"),
            );
            return;
        };

        let Some((target, original_name)) = self.dispatch.get(&advertised).cloned() else {
            self.send_to_browser(
                peer,
                rpc::error_response(&id, code::METHOD_NOT_FOUND, "Method not found"),
            );
            return;
        };

        // Rewrite the id into the router space and, when the tool was
        // advertised under a custom name, restore the backing name.
        let router_id = self.next_router_id;
        self.next_router_id = self.next_router_id.wrapping_add(1);
        rpc::set_id(&mut frame, &RpcId::Int(router_id));
        if original_name != advertised
            && let Some(name_slot) = frame.get_mut("params").and_then(|p| p.get_mut("name"))
        {
            *name_slot = Value::from(original_name.clone());
        }

        let Some(server) = self.tool_servers.get(&target) else {
            error!(tool = %advertised, target, "Dispatch table points at unknown session");
            self.send_to_browser(
                peer,
                rpc::error_response(&id, code::INTERNAL_ERROR, "Internal error"),
            );
            return;
        };

        if server.tx.try_send(frame).is_err() {
            warn!(tool = %advertised, target, "Tool server channel unavailable");
            self.send_to_browser(
                peer,
                rpc::error_response(&id, code::BACKEND_CLOSED, "Backend closed"),
            );
            return;
        }

        self.pending.insert(
            router_id,
            Pending {
                origin: PendingOrigin::Browser {
                    peer,
                    original_id: id,
                },
                target,
            },
        );
        self.arm_deadline(router_id, self.config.call_timeout);
    }

    // ── Tool-server peers ────────────────────────────────────

    fn tool_server_connected(&mut self, tx: mpsc::Sender<Value>, reply: oneshot::Sender<PeerId>) {
        let peer = self.next_peer;
        self.next_peer = self.next_peer.wrapping_add(1);
        self.tool_servers.insert(
            peer,
            ToolServerPeer {
                tx,
                name: None,
                tools: Vec::new(),
                state: ToolServerState::AwaitingInitialize,
            },
        );
        let _ = reply.send(peer);
        debug!(peer, "Tool server connected, starting handshake");

        let router_id = self.send_to_tool_server(
            peer,
            method::INITIALIZE,
            Some(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": { "name": "weft-hub", "version": env!("CARGO_PKG_VERSION") },
            })),
            PendingOrigin::HandshakeInitialize,
        );
        if router_id.is_none() {
            self.tool_server_closed(peer);
        }
    }

    fn tool_server_closed(&mut self, peer: PeerId) {
        let Some(server) = self.tool_servers.remove(&peer) else {
            return;
        };
        info!(
            peer,
            name = server.name.as_deref().unwrap_or("<unregistered>"),
            "Tool server disconnected"
        );

        // Every request in flight toward this session gets a backend
        // error; no later response for those ids is delivered.
        let failed: Vec<i64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.target == peer)
            .map(|(router_id, _)| *router_id)
            .collect();
        for router_id in failed {
            if let Some(pending) = self.pending.remove(&router_id)
                && let PendingOrigin::Browser {
                    peer: browser,
                    original_id,
                } = pending.origin
            {
                self.send_to_browser(
                    browser,
                    rpc::error_response(&original_id, code::BACKEND_CLOSED, "Backend closed"),
                );
            }
        }

        self.rebuild_dispatch();
        self.broadcast_status();
    }

    fn tool_server_frame(&mut self, peer: PeerId, frame: Value) {
        match rpc::classify(&frame) {
            Ok(FrameKind::Response { id, .. }) => self.tool_server_response(peer, frame, &id),
            Ok(FrameKind::Notification { method: m }) => {
                if m == method::TOOLS_LIST_CHANGED {
                    self.refresh_tools(peer);
                } else {
                    debug!(peer, method = %m, "Ignoring tool-server notification");
                }
            },
            Ok(FrameKind::Request { id, method: m }) => {
                // The hub surface does not forward server-initiated
                // requests; answer them directly.
                debug!(peer, method = %m, "Refusing server-initiated request");
                if let Some(server) = self.tool_servers.get(&peer) {
                    let _ = server.tx.try_send(rpc::error_response(
                        &id,
                        code::METHOD_NOT_FOUND,
                        "Method not found",
                    ));
                }
            },
            Err(e) => {
                debug!(peer, error = %e, "Dropping malformed tool-server frame");
            },
        }
    }

    fn tool_server_response(&mut self, peer: PeerId, frame: Value, id: &RpcId) {
        let RpcId::Int(router_id) = id else {
            warn!(peer, id = %id, "Response with non-router id, dropping");
            return;
        };
        let Some(pending) = self.pending.remove(router_id) else {
            warn!(peer, router_id, "No pending request matches response, dropping");
            return;
        };
        if pending.target != peer {
            warn!(peer, router_id, "Response from the wrong session, dropping");
            return;
        }

        match pending.origin {
            PendingOrigin::Browser {
                peer: browser,
                original_id,
            } => {
                let mut frame = frame;
                rpc::set_id(&mut frame, &original_id);
                self.send_to_browser(browser, frame);
            },
            PendingOrigin::HandshakeInitialize => self.finish_initialize(peer, &frame),
            PendingOrigin::HandshakeTools => self.finish_tools(peer, &frame),
        }
    }

    /// Initialize response: name the session, ack, and ask for tools.
    fn finish_initialize(&mut self, peer: PeerId, frame: &Value) {
        let name = frame
            .get("result")
            .and_then(|r| r.get("serverInfo"))
            .and_then(|i| i.get("name"))
            .and_then(Value::as_str)
            .map_or_else(|| format!("server-{peer}"), str::to_string);

        let Some(server) = self.tool_servers.get_mut(&peer) else {
            return;
        };
        server.name = Some(name.clone());
        server.state = ToolServerState::AwaitingTools;
        info!(peer, name = %name, "Tool server initialized");

        let _ = server
            .tx
            .try_send(rpc::notification(method::INITIALIZED, None));
        self.refresh_tools(peer);
    }

    /// Issue a router-initiated `tools/list` to `peer`.
    fn refresh_tools(&mut self, peer: PeerId) {
        let Some(server) = self.tool_servers.get(&peer) else {
            return;
        };
        if server.name.is_none() {
            debug!(peer, "Ignoring tools refresh before initialization");
            return;
        }
        let sent = self.send_to_tool_server(
            peer,
            method::TOOLS_LIST,
            None,
            PendingOrigin::HandshakeTools,
        );
        if sent.is_none() {
            self.tool_server_closed(peer);
        }
    }

    /// `tools/list` response: cache the catalog and go live.
    fn finish_tools(&mut self, peer: PeerId, frame: &Value) {
        let tools = frame
            .get("result")
            .map(ToolDescriptor::from_list_result)
            .unwrap_or_default();

        let Some(server) = self.tool_servers.get_mut(&peer) else {
            return;
        };
        let went_live = server.state != ToolServerState::Ready;
        server.tools = tools;
        server.state = ToolServerState::Ready;
        info!(
            peer,
            name = server.name.as_deref().unwrap_or("?"),
            tools = server.tools.len(),
            "Tool server catalog cached"
        );

        self.rebuild_dispatch();
        if went_live {
            self.broadcast_status();
        }
    }

    // ── Pending requests ─────────────────────────────────────

    /// Send a router-originated request to a tool server, recording the
    /// pending entry and arming its deadline. Returns `None` when the
    /// session's channel is gone.
    fn send_to_tool_server(
        &mut self,
        peer: PeerId,
        m: &str,
        params: Option<Value>,
        origin: PendingOrigin,
    ) -> Option<i64> {
        let server = self.tool_servers.get(&peer)?;
        let router_id = self.next_router_id;
        self.next_router_id = self.next_router_id.wrapping_add(1);

        let frame = rpc::request(router_id, m, params);
        if server.tx.try_send(frame).is_err() {
            warn!(peer, method = %m, "Tool server channel unavailable");
            return None;
        }

        self.pending.insert(
            router_id,
            Pending {
                origin,
                target: peer,
            },
        );
        self.arm_deadline(router_id, self.config.list_timeout);
        Some(router_id)
    }

    /// Spawn the deadline timer for a pending request.
    fn arm_deadline(&self, router_id: i64, deadline: Duration) {
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = inbox.send(RouterMsg::DeadlineExpired { router_id }).await;
        });
    }

    fn deadline_expired(&mut self, router_id: i64) {
        // Already resolved is the common case; the timer always fires.
        let Some(pending) = self.pending.remove(&router_id) else {
            return;
        };
        match pending.origin {
            PendingOrigin::Browser { peer, original_id } => {
                warn!(router_id, browser = peer, "Request timed out");
                self.send_to_browser(
                    peer,
                    rpc::error_response(&original_id, code::REQUEST_TIMEOUT, "Request timeout"),
                );
            },
            PendingOrigin::HandshakeInitialize | PendingOrigin::HandshakeTools => {
                warn!(
                    router_id,
                    target = pending.target,
                    "Tool server did not answer the handshake in time"
                );
            },
        }
    }

    // ── Catalog projection ───────────────────────────────────

    /// Ready servers in registration order, with overrides applied.
    ///
    /// Later registrants shadow earlier ones on advertised-name
    /// collisions.
    fn rebuild_dispatch(&mut self) {
        let mut dispatch: HashMap<String, (PeerId, String)> = HashMap::new();
        let mut owners: HashMap<String, String> = HashMap::new();

        let mut peers: Vec<PeerId> = self
            .tool_servers
            .iter()
            .filter(|(_, s)| s.state == ToolServerState::Ready)
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort_unstable();

        for peer in peers {
            let Some(server) = self.tool_servers.get(&peer) else {
                continue;
            };
            let Some(server_name) = server.name.clone() else {
                continue;
            };
            for tool in &server.tools {
                let key = override_key(&server_name, &tool.name);
                let override_entry = self.overrides.get(&key);
                if override_entry.is_some_and(|o| o.disabled) {
                    continue;
                }
                let advertised = override_entry
                    .and_then(|o| o.custom_name.clone())
                    .unwrap_or_else(|| tool.name.clone());

                if let Some(previous) = owners.get(&advertised) {
                    warn!(
                        tool = %advertised,
                        shadowed = %previous,
                        winner = %server_name,
                        "Duplicate tool name, latest registrant wins"
                    );
                }
                owners.insert(advertised.clone(), server_name.clone());
                dispatch.insert(advertised, (peer, tool.name.clone()));
            }
        }
        self.dispatch = dispatch;
    }

    /// The browser-visible catalog: overrides applied, disabled tools
    /// removed, shadowed duplicates collapsed to the latest registrant.
    fn projected_catalog(&self) -> Vec<Value> {
        let mut by_name: BTreeMap<String, Value> = BTreeMap::new();

        let mut peers: Vec<PeerId> = self
            .tool_servers
            .iter()
            .filter(|(_, s)| s.state == ToolServerState::Ready)
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort_unstable();

        for peer in peers {
            let Some(server) = self.tool_servers.get(&peer) else {
                continue;
            };
            let Some(server_name) = server.name.as_deref() else {
                continue;
            };
            for tool in &server.tools {
                let key = override_key(server_name, &tool.name);
                let override_entry = self.overrides.get(&key);
                if override_entry.is_some_and(|o| o.disabled) {
                    continue;
                }
                let name = override_entry
                    .and_then(|o| o.custom_name.clone())
                    .unwrap_or_else(|| tool.name.clone());
                let description = override_entry
                    .and_then(|o| o.custom_description.clone())
                    .unwrap_or_else(|| tool.description.clone());

                by_name.insert(
                    name.clone(),
                    json!({
                        "name": name,
                        "description": description,
                        "inputSchema": tool.input_schema,
                    }),
                );
            }
        }
        by_name.into_values().collect()
    }

    // ── Status broadcast ─────────────────────────────────────

    /// The non-RPC status frame pushed to browsers.
    fn status_frame(&self) -> Value {
        let mut names: Vec<&str> = self
            .tool_servers
            .values()
            .filter(|s| s.state == ToolServerState::Ready)
            .filter_map(|s| s.name.as_deref())
            .collect();
        names.sort_unstable();
        json!({
            "type": "status",
            "mcp_connected": !names.is_empty(),
            "mcp_servers": names,
        })
    }

    /// Fire-and-forget status to every browser.
    fn broadcast_status(&self) {
        let status = self.status_frame();
        for (peer, browser) in &self.browsers {
            if browser.tx.try_send(status.clone()).is_err() {
                debug!(peer, "Status broadcast dropped for slow browser");
            }
        }
    }

    fn send_to_browser(&self, peer: PeerId, frame: Value) {
        let Some(browser) = self.browsers.get(&peer) else {
            // The browser went away; late responses drop silently.
            debug!(peer, "Dropping frame for closed browser");
            return;
        };
        if browser.tx.try_send(frame).is_err() {
            debug!(peer, "Browser channel full, dropping frame");
        }
    }
}
