//! Change-event bus for configuration mutations.
//!
//! The store publishes one event per successful mutation on a broadcast
//! channel. Delivery is at-least-once: a subscriber that lags far enough
//! to drop events receives a synthetic [`ChangeEvent::Reload`] instead,
//! forcing a full resync.

use tokio::sync::broadcast;
use tracing::warn;

use crate::types::EndpointId;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A configuration change the supervisor must react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    /// An endpoint became enabled or was created enabled.
    Connect(EndpointId),
    /// An endpoint was disabled or deleted.
    Disconnect(EndpointId),
    /// An enabled endpoint's URL changed.
    Update(EndpointId),
    /// Server definitions or overrides changed; recompute everything.
    Reload,
}

/// Broadcast bus carrying [`ChangeEvent`]s to all subscribers.
#[derive(Debug, Clone)]
pub struct ChangeEvents {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeEvents {
    /// Create a bus with default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with the given capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    ///
    /// Returns the number of receivers that saw it. Zero receivers is
    /// not an error.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to future events.
    #[must_use]
    pub fn subscribe(&self) -> ChangeReceiver {
        ChangeReceiver {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for ChangeEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of the bus.
pub struct ChangeReceiver {
    receiver: broadcast::Receiver<ChangeEvent>,
}

impl ChangeReceiver {
    /// Receive the next event.
    ///
    /// Returns `None` when the bus is closed. A lagged receiver gets a
    /// synthetic [`ChangeEvent::Reload`] in place of the dropped events.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Change-event receiver lagged, forcing resync");
                Some(ChangeEvent::Reload)
            },
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Receive without blocking; `None` when no event is ready.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "Change-event receiver lagged, forcing resync");
                Some(ChangeEvent::Reload)
            },
            Err(_) => None,
        }
    }
}
