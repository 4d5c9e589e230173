//! The weft hub.
//!
//! Accepts browser WebSocket clients and tool-server WebSocket clients
//! (typically a remote weft bridge), aggregates the tool servers'
//! advertised catalogs, and routes browser JSON-RPC requests to the
//! owning tool server with response correlation, timeouts, and status
//! broadcasts.
//!
//! # Architecture
//!
//! ```text
//! weft-hub
//! ├── listener     TCP accept loop, path-routed upgrades, token auth
//! │   ├── browser      per-browser session task
//! │   └── tool_server  per-tool-server session task
//! ├── router       single serializing task owning all routing state
//! └── auth         token-validation seam
//! ```
//!
//! Sessions never hold references to each other or to the router; they
//! hold only a sender into the router's inbox and are addressed by
//! opaque integer handles.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod auth;
mod browser;
mod error;
mod listener;
pub mod router;
pub mod serve;
mod tool_server;

pub use auth::{Audience, StaticTokenValidator, TokenDecision, TokenValidator};
pub use error::{HubError, HubResult};
pub use listener::HubConfig;
pub use router::{HubRouter, RouterConfig, RouterMsg};
pub use serve::Hub;
