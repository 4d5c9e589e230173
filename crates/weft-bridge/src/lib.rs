//! The weft bridge.
//!
//! Maintains one supervised WebSocket session per configured remote
//! endpoint × enabled tool server, with a local subprocess on the other
//! end of each session. Frames are spliced between the socket and the
//! child's stdio without interpretation; reconnection, backpressure,
//! and hot reconfiguration happen here.
//!
//! # Architecture
//!
//! ```text
//! weft-bridge
//! ├── supervisor   desired-state diffing over the config store
//! │   └── session  per-pair reconnect loop (dial, splice, back off)
//! │       ├── connection  WebSocket dial + split halves
//! │       └── subprocess  child process, newline-JSON stdio framing
//! └── backoff      exponential delay with ±20% jitter
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod backoff;
mod connection;
mod error;
pub mod session;
pub mod subprocess;
pub mod supervisor;

pub use error::{BridgeError, BridgeResult};
pub use session::{EndpointSession, SessionConfig, SessionEvent};
pub use subprocess::ToolProcess;
pub use supervisor::{BridgeConfig, BridgeSupervisor};
