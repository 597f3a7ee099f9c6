//! Realtime push stream modules.
//!
//! - `client`: public client, control handle, and the connection worker that
//!   owns connect, teardown, and reconnect.
//! - `proto`: inbound frame shapes.
//! - `session`: one live websocket with its receive loop and teardown.
//! - `heartbeat`: heartbeat clock and liveness watchdog.
//! - `dispatch`: routing of classified frames.

/// Push client, connection handle, and connection worker.
pub mod client;
/// Frame routing and bind handshake tasks.
pub(crate) mod dispatch;
/// Heartbeat clock and watchdog.
pub mod heartbeat;
/// Push protocol messages.
pub mod proto;
/// Transport session lifecycle.
pub mod session;
