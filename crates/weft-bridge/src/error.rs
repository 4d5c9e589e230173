//! Error types for the bridge.

/// Result alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors produced by bridge sessions and subprocess adapters.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// `WebSocket` transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Pipe or socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The tool subprocess could not be spawned.
    #[error("failed to spawn server {server:?}: {source}")]
    Spawn {
        /// Server definition name.
        server: String,
        /// Underlying spawn failure.
        #[source]
        source: std::io::Error,
    },

    /// A server definition cannot be materialized as a subprocess.
    #[error("server {server:?} is not a stdio server")]
    NotStdio {
        /// Server definition name.
        server: String,
    },

    /// The dial did not complete within the timeout.
    #[error("dial timed out")]
    DialTimeout,

    /// A splice buffer stayed full past the stall window.
    #[error("transport overrun ({direction})")]
    Overrun {
        /// Which direction stalled.
        direction: &'static str,
    },

    /// The remote closed the connection with a code.
    #[error("connection closed with code {0}")]
    Closed(u16),

    /// The tool subprocess exited while the session was open.
    #[error("subprocess exited")]
    SubprocessExited,

    /// Shutdown was requested.
    #[error("shutdown requested")]
    Shutdown,
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}
