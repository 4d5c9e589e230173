//! Error types for the configuration store.

use crate::types::EndpointId;

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors produced by the configuration store.
///
/// Validation errors surface at CRUD time and never reach runtime;
/// persistence errors reject the write and leave state unchanged.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Filesystem failure while loading or persisting.
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store file was not a valid document.
    #[error("invalid config: {0}")]
    Parse(String),

    /// The document could not be serialized.
    #[error("config serialization error: {0}")]
    Serialize(String),

    /// Endpoint URL did not parse or used a non-WebSocket scheme.
    #[error("invalid endpoint URL {url:?}: {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A stdio server definition was missing its command.
    #[error("server {name:?} is stdio but has no command")]
    MissingCommand {
        /// The offending server name.
        name: String,
    },

    /// An http server definition was missing its URL.
    #[error("server {name:?} is http but has no url")]
    MissingUrl {
        /// The offending server name.
        name: String,
    },

    /// A record name was empty.
    #[error("name must not be empty")]
    EmptyName,

    /// No endpoint with the given id exists.
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),

    /// No server definition with the given name exists.
    #[error("unknown server {0:?}")]
    UnknownServer(String),

    /// The filesystem watcher could not be installed.
    #[error("config watcher error: {0}")]
    Watch(String),
}
