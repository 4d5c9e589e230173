//! Persisted configuration records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigError, ConfigResult};

/// Opaque identifier of a configured endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(Uuid);

impl EndpointId {
    /// Generate a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Runtime state of an endpoint's bridge connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No session is attempting this endpoint.
    #[default]
    Disconnected,
    /// A dial is in flight.
    Connecting,
    /// At least one session is open.
    Connected,
    /// The last attempt failed; see `last_error`.
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A remote hub the bridge should dial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Stable identifier.
    pub id: EndpointId,
    /// Display name.
    pub name: String,
    /// WebSocket URL, including any query parameters the remote
    /// requires. Never rewritten on dial.
    pub url: String,
    /// Whether the bridge should maintain sessions for this endpoint.
    pub enabled: bool,
    /// Last observed connection state (written by the supervisor).
    #[serde(default)]
    pub connection_status: ConnectionStatus,
    /// When a session last reached `Connected`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Last connection error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Validate an endpoint URL: must parse and use `ws` or `wss`.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidUrl`] on parse failure or wrong scheme.
pub fn validate_endpoint_url(raw: &str) -> ConfigResult<()> {
    let parsed = url::Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason: format!("scheme must be ws or wss, got {other:?}"),
        }),
    }
}

/// Transport kind of a tool server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    /// Spawn a child process and speak newline-delimited JSON-RPC over
    /// its stdio.
    #[default]
    Stdio,
    /// Reach the server over HTTP.
    Http,
}

/// Configuration for one tool server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDefinition {
    /// Server name (unique; taken from the document key on load).
    #[serde(skip)]
    pub name: String,
    /// Transport kind.
    #[serde(default)]
    pub kind: ServerKind,
    /// Command to spawn (stdio kind).
    pub command: Option<String>,
    /// Arguments for the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the child.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// URL (http kind).
    pub url: Option<String>,
    /// Extra request headers (http kind).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Disabled definitions are not materialized as subprocesses.
    #[serde(default)]
    pub disabled: bool,
}

impl ServerDefinition {
    /// Create a stdio server definition.
    #[must_use]
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ServerKind::Stdio,
            command: Some(command.into()),
            ..Self::default()
        }
    }

    /// Create an http server definition.
    #[must_use]
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ServerKind::Http,
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Add arguments.
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Mark the definition disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Check structural invariants.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the name is empty, a stdio
    /// definition has no command, or an http definition has no URL.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        match self.kind {
            ServerKind::Stdio if self.command.is_none() => Err(ConfigError::MissingCommand {
                name: self.name.clone(),
            }),
            ServerKind::Http if self.url.is_none() => Err(ConfigError::MissingUrl {
                name: self.name.clone(),
            }),
            _ => Ok(()),
        }
    }
}

/// Per-tool administrative flags.
///
/// A disabled override removes the tool from browser-facing catalogs;
/// it does not stop the subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOverride {
    /// Hide the tool from browser projections.
    #[serde(default)]
    pub disabled: bool,
    /// Advertise the tool under a different name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    /// Advertise the tool with a different description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_description: Option<String>,
}

/// Key an override by `(server_name, tool_name)`.
#[must_use]
pub fn override_key(server: &str, tool: &str) -> String {
    format!("{server}/{tool}")
}
