//! Configuration store for the weft bridge and hub.
//!
//! Persists three collections in one TOML document: remote *endpoints*
//! the bridge dials, *server definitions* for the tool subprocesses it
//! spawns, and per-tool *overrides* the hub applies when projecting the
//! catalog to browsers.
//!
//! Every successful mutation emits a [`ChangeEvent`] on a broadcast bus;
//! the bridge supervisor subscribes and diff-applies. Events are
//! delivered at-least-once (a lagged subscriber receives a synthetic
//! [`ChangeEvent::Reload`]), so consumers must be idempotent.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
pub mod events;
pub mod store;
pub mod types;
pub mod watcher;

pub use error::{ConfigError, ConfigResult};
pub use events::{ChangeEvent, ChangeEvents, ChangeReceiver};
pub use store::ConfigStore;
pub use types::{
    ConnectionStatus, Endpoint, EndpointId, ServerDefinition, ServerKind, ToolOverride,
    override_key,
};
pub use watcher::ConfigWatcher;
