//! Self-healing websocket client for a message-push server.
//!
//! The crate is organized by concern:
//! - `config`: startup configuration (`appsettings.json`).
//! - `stream`: websocket session lifecycle, heartbeat supervision, and
//!   reconnect handling.
//! - `bind`: HTTP bind handshake that authorizes a server-issued client id.
//! - `events`: presentation-facing status, log, and notification events.
//! - `retry`: backoff and timeout utilities.

/// Bind endpoint client and response types.
pub mod bind;
/// Startup configuration loading and validation.
pub mod config;
/// Events published to the presentation layer.
pub mod events;
/// Backoff and timeout helpers.
pub mod retry;
/// Push stream client, protocol types, and session lifecycle.
pub mod stream;

pub use config::AppConfig;
pub use events::{ClientEvent, ConnectionState};
pub use stream::client::{ConnectionHandle, ConnectionOptions, PushClient, PushConnection};
