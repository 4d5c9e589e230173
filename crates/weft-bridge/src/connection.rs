//! `WebSocket` connection management for endpoint sessions.
//!
//! Handles dialing the remote hub and splitting the stream into halves
//! for use with `tokio::select!`.

use std::time::Duration;

use futures::StreamExt;
use futures::stream::{SplitSink, SplitStream};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::BridgeError;

/// Type alias for the `WebSocket` stream used by the bridge.
pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
/// Write half of the stream.
pub(crate) type WsWriter = SplitSink<WsStream, Message>;
/// Read half of the stream.
pub(crate) type WsReader = SplitStream<WsStream>;

/// A live `WebSocket` connection to a remote hub endpoint.
pub(crate) struct EndpointConnection {
    writer: WsWriter,
    reader: WsReader,
}

impl EndpointConnection {
    /// Dial the given endpoint URL.
    ///
    /// The URL is passed through verbatim; query parameters are part of
    /// the remote's auth contract and must not be rewritten.
    pub(crate) async fn dial(url: &str, timeout: Duration) -> Result<Self, BridgeError> {
        let (ws, _response) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| BridgeError::DialTimeout)??;
        let (writer, reader) = ws.split();
        Ok(Self { writer, reader })
    }

    /// Take the split halves for use with `tokio::select!`.
    pub(crate) fn into_parts(self) -> (WsWriter, WsReader) {
        (self.writer, self.reader)
    }
}
