//! Bridge module - WebSocket peers to remote shells
//!
//! - `protocol`: JSON envelopes exchanged with the peer
//! - `sender`: serialized writes to one peer channel
//! - `session`: one remote shell and its output pump
//! - `registry`: live connections by session id
//! - `controller`: per-connection control loop
//! - `server`: TCP accept loop and WebSocket upgrade

mod controller;
pub mod protocol;
mod registry;
mod sender;
mod server;
mod session;
#[cfg(test)]
mod testutil;

pub use controller::{ExitReason, SessionController};
pub use protocol::{ClientMessage, ServerMessage};
pub use registry::{BufferedLine, ClientRecord, SessionRegistry};
pub use sender::SafeSender;
pub use server::{BridgeServer, ServerError};
pub use session::RemoteShellSession;
