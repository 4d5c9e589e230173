//! Bridge supervisor: desired-state reconciliation over the config
//! store.
//!
//! Holds the live set of endpoint sessions (one per enabled endpoint ×
//! enabled server), reacts to config change events, persists endpoint
//! connection state back to the store, and writes the merged tool
//! catalog snapshot after discovery.
//!
//! The supervisor is a single serializing task: change events, session
//! events, and poll ticks are processed in arrival order, which gives
//! per-endpoint ordering for free. It is stateless across restarts and
//! rebuilds everything from the store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use weft_config::{
    ChangeEvent, ConfigStore, ConnectionStatus, Endpoint, EndpointId, ServerDefinition, ServerKind,
};
use weft_core::{CatalogSnapshot, ToolDescriptor};

use crate::session::{EndpointSession, SessionConfig, SessionEvent};

/// How long a stopped session gets to exit before being aborted.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// One endpoint×server slot.
type PairKey = (EndpointId, String);

/// Runtime configuration for the bridge, passed in at construction.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Where the catalog snapshot is written (`BRIDGE_CATALOG_PATH`).
    pub catalog_path: PathBuf,
    /// Initial reconnect delay.
    pub backoff_base: Duration,
    /// Reconnect delay cap (`BRIDGE_BACKOFF_MAX_SECONDS`).
    pub backoff_max: Duration,
    /// Dial timeout.
    pub dial_timeout: Duration,
    /// Idle keepalive ping interval.
    pub ping_interval: Duration,
    /// Subprocess graceful-exit window
    /// (`BRIDGE_SUBPROCESS_GRACE_SECONDS`).
    pub subprocess_grace: Duration,
    /// Splice stall window before a transport-overrun close.
    pub stall_timeout: Duration,
    /// Config-store poll interval when the event stream is quiet.
    pub poll_interval: Duration,
    /// Per-direction splice buffer, in frames.
    pub buffer_frames: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("weft-catalog.json"),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            subprocess_grace: Duration::from_secs(5),
            stall_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
            buffer_frames: 64,
        }
    }
}

/// Handle to one running endpoint session.
struct SessionHandle {
    /// URL the session was started with, to detect URL drift on poll.
    url: String,
    /// Monotonic start counter, distinguishes restarts of one slot.
    generation: u64,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// The bridge supervisor task.
pub struct BridgeSupervisor {
    store: Arc<ConfigStore>,
    config: BridgeConfig,
    sessions: HashMap<PairKey, SessionHandle>,
    session_tx: mpsc::Sender<SessionEvent>,
    session_rx: Option<mpsc::Receiver<SessionEvent>>,
    /// Latest reported status per pair, for endpoint aggregation.
    pair_status: HashMap<PairKey, ConnectionStatus>,
    /// Latest discovered tools per server name.
    catalogs: BTreeMap<String, Vec<ToolDescriptor>>,
    /// Next session generation number.
    next_generation: u64,
}

impl BridgeSupervisor {
    /// Create a supervisor over `store`.
    #[must_use]
    pub fn new(store: Arc<ConfigStore>, config: BridgeConfig) -> Self {
        let (session_tx, session_rx) = mpsc::channel(256);
        Self {
            store,
            config,
            sessions: HashMap::new(),
            session_tx,
            session_rx: Some(session_rx),
            pair_status: HashMap::new(),
            catalogs: BTreeMap::new(),
            next_generation: 0,
        }
    }

    /// Run the supervisor until `shutdown_rx` fires.
    ///
    /// Subscribes to the store's change events, resyncs on start and on
    /// every poll tick, and serializes all state changes through this
    /// task's loop.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let Some(mut session_rx) = self.session_rx.take() else {
            error!("Supervisor started twice");
            return;
        };
        let mut changes = self.store.subscribe();

        info!("Bridge supervisor starting");
        self.resync().await;

        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        poll.tick().await; // The first tick fires immediately; resync already ran.

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Bridge supervisor shutting down");
                    self.shutdown_all().await;
                    return;
                }

                event = changes.recv() => {
                    match event {
                        Some(event) => self.apply_change(event).await,
                        None => {
                            // The bus outlives the store Arc we hold, so
                            // this is unexpected; resubscribe and resync.
                            warn!("Change-event stream ended, resubscribing");
                            changes = self.store.subscribe();
                            self.resync().await;
                        },
                    }
                }

                Some(event) = session_rx.recv() => {
                    self.apply_session_event(event).await;
                }

                _ = poll.tick() => {
                    self.resync().await;
                }
            }
        }
    }

    // ── Change events ────────────────────────────────────────

    async fn apply_change(&mut self, event: ChangeEvent) {
        debug!(?event, "Applying config change");
        match event {
            ChangeEvent::Connect(id) => self.connect_endpoint(id).await,
            ChangeEvent::Disconnect(id) => self.disconnect_endpoint(id).await,
            ChangeEvent::Update(id) => {
                // Tear down and rebuild so the child never keeps state
                // from the old URL's environment.
                self.disconnect_endpoint(id).await;
                self.connect_endpoint(id).await;
            },
            ChangeEvent::Reload => self.resync().await,
        }
    }

    async fn connect_endpoint(&mut self, id: EndpointId) {
        let Some(endpoint) = self.store.endpoint(id).await else {
            debug!(endpoint = %id, "Connect for unknown endpoint, ignoring");
            return;
        };
        if !endpoint.enabled {
            return;
        }
        for server in self.bridgeable_servers().await {
            self.start_pair(&endpoint, server);
        }
    }

    /// Enabled server definitions the bridge can materialize.
    ///
    /// Only stdio servers become subprocesses; http definitions are the
    /// hub's concern.
    async fn bridgeable_servers(&self) -> Vec<ServerDefinition> {
        self.store
            .enabled_servers()
            .await
            .into_iter()
            .filter(|server| {
                if server.kind == ServerKind::Stdio {
                    true
                } else {
                    debug!(server = %server.name, "Skipping non-stdio server definition");
                    false
                }
            })
            .collect()
    }

    async fn disconnect_endpoint(&mut self, id: EndpointId) {
        let keys: Vec<PairKey> = self
            .sessions
            .keys()
            .filter(|(endpoint_id, _)| *endpoint_id == id)
            .cloned()
            .collect();
        for key in keys {
            self.stop_pair(&key).await;
        }
        if self.store.endpoint(id).await.is_some()
            && let Err(e) = self
                .store
                .set_connection_status(id, ConnectionStatus::Disconnected, None)
                .await
        {
            warn!(endpoint = %id, error = %e, "Failed to persist endpoint status");
        }
    }

    /// Recompute the full desired set and apply the add/remove diff.
    ///
    /// Idempotent: running it twice with no config change is a no-op.
    async fn resync(&mut self) {
        let endpoints = self.store.enabled_endpoints().await;
        let servers = self.bridgeable_servers().await;

        let mut desired: HashMap<PairKey, (&Endpoint, &ServerDefinition)> = HashMap::new();
        for endpoint in &endpoints {
            for server in &servers {
                desired.insert((endpoint.id, server.name.clone()), (endpoint, server));
            }
        }

        // Stop sessions that are no longer desired, or whose endpoint
        // URL changed underneath them (poll-only deployments never see
        // an Update event).
        let stale: Vec<PairKey> = self
            .sessions
            .iter()
            .filter(|(key, handle)| {
                desired
                    .get(*key)
                    .is_none_or(|(endpoint, _)| endpoint.url != handle.url)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.stop_pair(&key).await;
        }

        // Start what is missing.
        for (key, (endpoint, server)) in &desired {
            if !self.sessions.contains_key(key) {
                self.start_pair(endpoint, (*server).clone());
            }
        }

        // Drop catalog entries for servers that left the desired set.
        let desired_servers: BTreeSet<&str> = servers.iter().map(|s| s.name.as_str()).collect();
        let before = self.catalogs.len();
        self.catalogs
            .retain(|name, _| desired_servers.contains(name.as_str()));
        if self.catalogs.len() != before {
            self.write_snapshot();
        }
    }

    // ── Session lifecycle ────────────────────────────────────

    fn start_pair(&mut self, endpoint: &Endpoint, server: ServerDefinition) {
        let key = (endpoint.id, server.name.clone());
        if self.sessions.contains_key(&key) {
            return;
        }

        info!(
            endpoint = %endpoint.name,
            server = %server.name,
            url = %endpoint.url,
            "Starting endpoint session"
        );

        let mut session_config = SessionConfig::new(
            endpoint.id,
            endpoint.name.clone(),
            endpoint.url.clone(),
            server,
        );
        session_config.backoff_base = self.config.backoff_base;
        session_config.backoff_max = self.config.backoff_max;
        session_config.dial_timeout = self.config.dial_timeout;
        session_config.ping_interval = self.config.ping_interval;
        session_config.subprocess_grace = self.config.subprocess_grace;
        session_config.stall_timeout = self.config.stall_timeout;
        session_config.buffer_frames = self.config.buffer_frames;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let session = EndpointSession::new(
            session_config,
            self.session_tx.clone(),
            shutdown_rx,
            shutdown_tx.clone(),
        );
        let task = tokio::spawn(session.run());

        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);
        self.sessions.insert(
            key,
            SessionHandle {
                url: endpoint.url.clone(),
                generation,
                shutdown_tx,
                task,
            },
        );
    }

    async fn stop_pair(&mut self, key: &PairKey) {
        let Some(handle) = self.sessions.remove(key) else {
            return;
        };
        info!(endpoint = %key.0, server = %key.1, "Stopping endpoint session");

        let _ = handle.shutdown_tx.send(());
        let abort = handle.task.abort_handle();
        if tokio::time::timeout(STOP_GRACE, handle.task).await.is_err() {
            warn!(endpoint = %key.0, server = %key.1, "Session did not stop in time, aborting");
            abort.abort();
        }
        self.pair_status.remove(key);
    }

    async fn shutdown_all(&mut self) {
        // Sessions first (each stops its own subprocess), then the
        // change subscriber dies with this task.
        let keys: Vec<PairKey> = self.sessions.keys().cloned().collect();
        for key in keys {
            self.stop_pair(&key).await;
        }
    }

    // ── Session events ───────────────────────────────────────

    async fn apply_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Status {
                endpoint_id,
                server,
                status,
                error,
            } => {
                let key = (endpoint_id, server);
                if !self.sessions.contains_key(&key) {
                    // A session we already stopped reporting its exit.
                    debug!(endpoint = %key.0, server = %key.1, "Status from stopped session");
                    return;
                }
                self.pair_status.insert(key, status);
                self.persist_endpoint_status(endpoint_id, error).await;
            },
            SessionEvent::Catalog {
                server, tools, ..
            } => {
                if self.catalogs.get(&server) != Some(&tools) {
                    self.catalogs.insert(server, tools);
                    self.write_snapshot();
                }
            },
        }
    }

    /// Aggregate a pair status change into the endpoint record.
    async fn persist_endpoint_status(&self, id: EndpointId, error: Option<String>) {
        let aggregated = aggregate_status(
            self.pair_status
                .iter()
                .filter(|((endpoint_id, _), _)| *endpoint_id == id)
                .map(|(_, status)| *status),
        );
        let error = if aggregated == ConnectionStatus::Error {
            error
        } else {
            None
        };
        if let Err(e) = self
            .store
            .set_connection_status(id, aggregated, error)
            .await
        {
            warn!(endpoint = %id, error = %e, "Failed to persist endpoint status");
        }
    }

    /// Write the merged catalog snapshot atomically.
    fn write_snapshot(&self) {
        let snapshot = CatalogSnapshot {
            servers: self.catalogs.clone(),
        };
        match snapshot.write_atomic(&self.config.catalog_path) {
            Ok(()) => debug!(
                path = %self.config.catalog_path.display(),
                servers = self.catalogs.len(),
                "Catalog snapshot written"
            ),
            Err(e) => error!(
                path = %self.config.catalog_path.display(),
                error = %e,
                "Failed to write catalog snapshot"
            ),
        }
    }
}

/// Collapse per-pair statuses into one endpoint status.
fn aggregate_status(statuses: impl Iterator<Item = ConnectionStatus>) -> ConnectionStatus {
    let mut aggregated = ConnectionStatus::Disconnected;
    for status in statuses {
        match status {
            ConnectionStatus::Connected => return ConnectionStatus::Connected,
            ConnectionStatus::Connecting => aggregated = ConnectionStatus::Connecting,
            ConnectionStatus::Error if aggregated == ConnectionStatus::Disconnected => {
                aggregated = ConnectionStatus::Error;
            },
            _ => {},
        }
    }
    aggregated
}
