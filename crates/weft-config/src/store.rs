//! The TOML-backed configuration store.
//!
//! All access goes through one `RwLock`, giving read-your-writes for
//! every caller. Mutations are applied to a copy of the document,
//! persisted atomically, and only then committed to memory, so a failed
//! write leaves both disk and memory unchanged.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::events::{ChangeEvent, ChangeEvents, ChangeReceiver};
use crate::types::{
    ConnectionStatus, Endpoint, EndpointId, ServerDefinition, ToolOverride, override_key,
    validate_endpoint_url,
};

/// The persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct StoreDocument {
    /// Configured endpoints.
    #[serde(default)]
    endpoints: Vec<Endpoint>,
    /// Tool-server definitions, keyed by name.
    #[serde(default)]
    servers: BTreeMap<String, ServerDefinition>,
    /// Tool overrides, keyed by `server/tool`.
    #[serde(default)]
    overrides: BTreeMap<String, ToolOverride>,
}

impl StoreDocument {
    fn parse(content: &str) -> ConfigResult<Self> {
        let mut doc: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        // Server names live in the map keys.
        for (name, server) in &mut doc.servers {
            server.name.clone_from(name);
        }
        Ok(doc)
    }

    fn endpoint_mut(&mut self, id: EndpointId) -> ConfigResult<&mut Endpoint> {
        self.endpoints
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(ConfigError::UnknownEndpoint(id))
    }
}

/// Persistent store for endpoints, server definitions, and overrides.
pub struct ConfigStore {
    path: PathBuf,
    state: RwLock<StoreDocument>,
    events: ChangeEvents,
}

impl ConfigStore {
    /// Open the store at `path`, creating an empty document if the file
    /// does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file exists but cannot be read
    /// or parsed, or if the initial empty document cannot be written.
    pub fn open(path: impl Into<PathBuf>) -> ConfigResult<Self> {
        let path = path.into();
        let doc = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            StoreDocument::parse(&content)?
        } else {
            let doc = StoreDocument::default();
            persist(&path, &doc)?;
            doc
        };

        info!(path = %path.display(), "Config store opened");
        Ok(Self {
            path,
            state: RwLock::new(doc),
            events: ChangeEvents::new(),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The change-event bus.
    #[must_use]
    pub fn events(&self) -> &ChangeEvents {
        &self.events
    }

    /// Subscribe to change events.
    #[must_use]
    pub fn subscribe(&self) -> ChangeReceiver {
        self.events.subscribe()
    }

    /// Persist `doc`, commit it to memory, and publish `events`.
    async fn commit(&self, doc: StoreDocument, events: &[ChangeEvent]) -> ConfigResult<()> {
        persist(&self.path, &doc)?;
        *self.state.write().await = doc;
        for event in events {
            self.events.publish(*event);
        }
        Ok(())
    }

    // ── Endpoints ────────────────────────────────────────────

    /// Create an endpoint.
    ///
    /// Emits [`ChangeEvent::Connect`] when created enabled.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] on an invalid URL, empty name, or
    /// persistence failure.
    pub async fn add_endpoint(
        &self,
        name: impl Into<String>,
        url: impl Into<String>,
        enabled: bool,
    ) -> ConfigResult<Endpoint> {
        let name = name.into();
        let url = url.into();
        if name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        validate_endpoint_url(&url)?;

        let endpoint = Endpoint {
            id: EndpointId::new(),
            name,
            url,
            enabled,
            connection_status: ConnectionStatus::Disconnected,
            last_connected_at: None,
            last_error: None,
        };

        let mut doc = self.state.read().await.clone();
        doc.endpoints.push(endpoint.clone());

        let mut events = Vec::new();
        if enabled {
            events.push(ChangeEvent::Connect(endpoint.id));
        }
        self.commit(doc, &events).await?;
        Ok(endpoint)
    }

    /// Enable or disable an endpoint.
    ///
    /// Emits [`ChangeEvent::Connect`] / [`ChangeEvent::Disconnect`] on
    /// an actual transition; setting the current value is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for an unknown endpoint or persistence
    /// failure.
    pub async fn set_endpoint_enabled(&self, id: EndpointId, enabled: bool) -> ConfigResult<()> {
        let mut doc = self.state.read().await.clone();
        let endpoint = doc.endpoint_mut(id)?;
        if endpoint.enabled == enabled {
            return Ok(());
        }
        endpoint.enabled = enabled;

        let event = if enabled {
            ChangeEvent::Connect(id)
        } else {
            ChangeEvent::Disconnect(id)
        };
        self.commit(doc, &[event]).await
    }

    /// Change an endpoint's URL.
    ///
    /// Emits [`ChangeEvent::Update`] when the endpoint is enabled.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] on an invalid URL, unknown endpoint,
    /// or persistence failure.
    pub async fn set_endpoint_url(&self, id: EndpointId, url: impl Into<String>) -> ConfigResult<()> {
        let url = url.into();
        validate_endpoint_url(&url)?;

        let mut doc = self.state.read().await.clone();
        let endpoint = doc.endpoint_mut(id)?;
        if endpoint.url == url {
            return Ok(());
        }
        endpoint.url = url;
        let enabled = endpoint.enabled;

        let mut events = Vec::new();
        if enabled {
            events.push(ChangeEvent::Update(id));
        }
        self.commit(doc, &events).await
    }

    /// Delete an endpoint.
    ///
    /// Emits [`ChangeEvent::Disconnect`] when it was enabled.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for an unknown endpoint or persistence
    /// failure.
    pub async fn remove_endpoint(&self, id: EndpointId) -> ConfigResult<()> {
        let mut doc = self.state.read().await.clone();
        let was_enabled = doc.endpoint_mut(id)?.enabled;
        doc.endpoints.retain(|e| e.id != id);

        let mut events = Vec::new();
        if was_enabled {
            events.push(ChangeEvent::Disconnect(id));
        }
        self.commit(doc, &events).await
    }

    /// Record a connection-state transition for an endpoint.
    ///
    /// Written by the bridge supervisor; does not emit change events.
    /// `Connected` also stamps `last_connected_at`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for an unknown endpoint or persistence
    /// failure.
    pub async fn set_connection_status(
        &self,
        id: EndpointId,
        status: ConnectionStatus,
        last_error: Option<String>,
    ) -> ConfigResult<()> {
        let mut doc = self.state.read().await.clone();
        let endpoint = doc.endpoint_mut(id)?;
        endpoint.connection_status = status;
        endpoint.last_error = last_error;
        if status == ConnectionStatus::Connected {
            endpoint.last_connected_at = Some(Utc::now());
        }
        self.commit(doc, &[]).await
    }

    /// All endpoints.
    pub async fn endpoints(&self) -> Vec<Endpoint> {
        self.state.read().await.endpoints.clone()
    }

    /// A single endpoint by id.
    pub async fn endpoint(&self, id: EndpointId) -> Option<Endpoint> {
        self.state
            .read()
            .await
            .endpoints
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    /// Enabled endpoints only.
    pub async fn enabled_endpoints(&self) -> Vec<Endpoint> {
        self.state
            .read()
            .await
            .endpoints
            .iter()
            .filter(|e| e.enabled)
            .cloned()
            .collect()
    }

    // ── Server definitions ───────────────────────────────────

    /// Create or replace a server definition.
    ///
    /// Emits [`ChangeEvent::Reload`].
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] on validation or persistence failure.
    pub async fn upsert_server(&self, definition: ServerDefinition) -> ConfigResult<()> {
        definition.validate()?;

        let mut doc = self.state.read().await.clone();
        doc.servers.insert(definition.name.clone(), definition);
        self.commit(doc, &[ChangeEvent::Reload]).await
    }

    /// Delete a server definition.
    ///
    /// Emits [`ChangeEvent::Reload`].
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for an unknown server or persistence
    /// failure.
    pub async fn remove_server(&self, name: &str) -> ConfigResult<()> {
        let mut doc = self.state.read().await.clone();
        if doc.servers.remove(name).is_none() {
            return Err(ConfigError::UnknownServer(name.to_string()));
        }
        self.commit(doc, &[ChangeEvent::Reload]).await
    }

    /// All server definitions.
    pub async fn servers(&self) -> Vec<ServerDefinition> {
        self.state.read().await.servers.values().cloned().collect()
    }

    /// A single server definition by name.
    pub async fn server(&self, name: &str) -> Option<ServerDefinition> {
        self.state.read().await.servers.get(name).cloned()
    }

    /// Enabled (non-disabled) server definitions.
    pub async fn enabled_servers(&self) -> Vec<ServerDefinition> {
        self.state
            .read()
            .await
            .servers
            .values()
            .filter(|s| !s.disabled)
            .cloned()
            .collect()
    }

    // ── Overrides ────────────────────────────────────────────

    /// Set the override for `(server, tool)`.
    ///
    /// Emits [`ChangeEvent::Reload`].
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] on persistence failure.
    pub async fn set_override(
        &self,
        server: &str,
        tool: &str,
        value: ToolOverride,
    ) -> ConfigResult<()> {
        let mut doc = self.state.read().await.clone();
        doc.overrides.insert(override_key(server, tool), value);
        self.commit(doc, &[ChangeEvent::Reload]).await
    }

    /// Remove the override for `(server, tool)`, if any.
    ///
    /// Emits [`ChangeEvent::Reload`] when something was removed.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] on persistence failure.
    pub async fn clear_override(&self, server: &str, tool: &str) -> ConfigResult<()> {
        let mut doc = self.state.read().await.clone();
        if doc.overrides.remove(&override_key(server, tool)).is_none() {
            return Ok(());
        }
        self.commit(doc, &[ChangeEvent::Reload]).await
    }

    /// All overrides, keyed by `server/tool`.
    pub async fn overrides(&self) -> BTreeMap<String, ToolOverride> {
        self.state.read().await.overrides.clone()
    }

    // ── External reload ──────────────────────────────────────

    /// Re-read the backing file after an external edit.
    ///
    /// Publishes [`ChangeEvent::Reload`] when the document actually
    /// changed; a re-read of our own last write is silent.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or parsed.
    pub async fn reload_from_disk(&self) -> ConfigResult<()> {
        let content = std::fs::read_to_string(&self.path)?;
        let doc = StoreDocument::parse(&content)?;

        let mut state = self.state.write().await;
        if *state == doc {
            debug!("Config file unchanged, skipping reload event");
            return Ok(());
        }
        *state = doc;
        drop(state);

        info!(path = %self.path.display(), "Config reloaded from disk");
        self.events.publish(ChangeEvent::Reload);
        Ok(())
    }
}

/// Serialize and atomically write `doc` to `path`.
fn persist(path: &Path, doc: &StoreDocument) -> ConfigResult<()> {
    let content = toml::to_string_pretty(doc).map_err(|e| ConfigError::Serialize(e.to_string()))?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.persist(path).map_err(|e| ConfigError::Io(e.error))?;
    Ok(())
}
