//! Shared types for the weft bridge and hub.
//!
//! Every weft channel (remote WebSocket, subprocess stdio, browser
//! WebSocket) carries one JSON value per frame. This crate holds the
//! JSON-RPC view over those values, the reserved identifier spaces, and
//! the tool-catalog document the bridge supervisor persists for admin
//! tooling.
//!
//! Frames are deliberately kept as raw [`serde_json::Value`]s while in
//! flight: relays must preserve fields they do not understand, so typed
//! structs exist only where a field is actually read.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod catalog;
pub mod rpc;
pub mod throttle;

pub use catalog::{CatalogError, CatalogSnapshot, ToolDescriptor};
pub use rpc::{FrameError, FrameKind, RpcId};
pub use throttle::Throttle;
