//! Established WebSocket sessions.
//!
//! ## Lifecycle
//!
//! 1. **Open**: after a successful upgrade
//! 2. **Closing**: our close frame is out, waiting for the peer's
//! 3. **Closed**: close frames exchanged, or the transport is gone
//!
//! A receive-side failure sends the matching close code and keeps reading
//! until the peer answers, so the peer observes the close instead of a reset.

mod fragmenter;
mod role;
mod state;

#[allow(clippy::module_inception)]
mod connection;

pub use connection::{Connection, WsReceiver, WsSender};
pub use fragmenter::MessageFragmenter;
pub use role::Role;
pub use state::ConnectionState;
