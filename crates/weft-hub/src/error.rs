//! Error types for the hub.

/// Result alias for hub operations.
pub type HubResult<T> = Result<T, HubError>;

/// Errors produced by the hub listener and sessions.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Socket I/O failure (bind, accept).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `WebSocket` handshake or transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The router inbox is gone; the hub is shutting down.
    #[error("router unavailable")]
    RouterGone,
}

impl From<tokio_tungstenite::tungstenite::Error> for HubError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = HubError::RouterGone;
        assert!(err.to_string().contains("router"));

        let err = HubError::Io(std::io::Error::other("bind failed"));
        assert!(err.to_string().contains("bind failed"));
    }
}
