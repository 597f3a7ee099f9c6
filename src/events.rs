//! Presentation-facing events.
//!
//! The client never calls into a UI directly. Everything an operator should
//! see is published on one unbounded channel, so a slow or absent consumer
//! can never stall the connection worker.

use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::mpsc;

/// Externally visible connection state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    /// A connect attempt is pending. `attempt == 0` is the initial connect;
    /// any other value is a reconnect attempt.
    Connecting {
        attempt: usize,
        max_attempts: usize,
    },
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_reconnecting(&self) -> bool {
        matches!(self, Self::Connecting { attempt, .. } if *attempt > 0)
    }

    /// Status line shown next to the connection indicator.
    pub fn label(&self) -> String {
        match self {
            Self::Disconnected => "disconnected".to_string(),
            Self::Connecting { attempt: 0, .. } => "connecting".to_string(),
            Self::Connecting {
                attempt,
                max_attempts,
            } => format!("reconnecting ({attempt}/{max_attempts})"),
            Self::Connected => "connected".to_string(),
        }
    }
}

/// Timestamped operator log line.
#[derive(Clone, Debug)]
pub struct LogLine {
    pub at: DateTime<Local>,
    pub text: String,
}

impl LogLine {
    /// Wall-clock time of the line as `HH:MM:SS`.
    pub fn time(&self) -> String {
        self.at.format("%H:%M:%S").to_string()
    }
}

/// Event published to the presentation layer.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    Log(LogLine),
    Status(ConnectionState),
    /// Transient toast-style alert.
    Notification { title: String, message: String },
    /// Application payload from an `order` frame.
    Message(String),
    /// Time left before the heartbeat watchdog declares the link dead.
    Liveness { remaining: Duration },
}

/// Cloneable publishing side of the event channel.
#[derive(Clone, Debug)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl EventPublisher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn log(&self, text: impl Into<String>) {
        self.publish(ClientEvent::Log(LogLine {
            at: Local::now(),
            text: text.into(),
        }));
    }

    pub fn notify(&self, title: impl Into<String>, message: impl Into<String>) {
        self.publish(ClientEvent::Notification {
            title: title.into(),
            message: message.into(),
        });
    }

    pub fn message(&self, payload: impl Into<String>) {
        self.publish(ClientEvent::Message(payload.into()));
    }

    pub(crate) fn status(&self, state: ConnectionState) {
        self.publish(ClientEvent::Status(state));
    }

    pub(crate) fn liveness(&self, remaining: Duration) {
        self.publish(ClientEvent::Liveness { remaining });
    }

    fn publish(&self, event: ClientEvent) {
        // The presentation layer may be gone during shutdown.
        let _ = self.tx.send(event);
    }
}
