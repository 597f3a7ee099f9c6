//! Routes classified inbound frames.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bind::{BindClient, BindError};
use crate::events::EventPublisher;
use crate::stream::heartbeat::HeartbeatClock;
use crate::stream::proto::ServerMessage;
use crate::stream::session::{DisconnectReason, SessionSignal};

/// Per-session frame router. Never blocks the receive loop: bind handshakes
/// run on their own tasks.
#[derive(Clone, Debug)]
pub(crate) struct Dispatcher {
    generation: u64,
    clock: HeartbeatClock,
    bind: BindClient,
    events: EventPublisher,
    signals: mpsc::UnboundedSender<SessionSignal>,
}

impl Dispatcher {
    pub(crate) fn new(
        generation: u64,
        clock: HeartbeatClock,
        bind: BindClient,
        events: EventPublisher,
        signals: mpsc::UnboundedSender<SessionSignal>,
    ) -> Self {
        Self {
            generation,
            clock,
            bind,
            events,
            signals,
        }
    }

    /// Handles one complete logical message. Unparseable frames are dropped.
    pub(crate) fn dispatch(&self, text: &str) {
        if let Some(message) = ServerMessage::classify(text) {
            self.route(message);
        }
    }

    fn route(&self, message: ServerMessage) {
        match message {
            ServerMessage::Heartbeat => self.clock.stamp(),
            ServerMessage::Init { client_id } => {
                debug!(event = "bind_requested", generation = self.generation, %client_id);
                tokio::spawn(run_bind(
                    self.bind.clone(),
                    client_id,
                    self.generation,
                    self.events.clone(),
                    self.signals.clone(),
                ));
            }
            ServerMessage::Order { message } => {
                self.events.message(message.clone());
                self.events.notify("New message", message);
            }
            ServerMessage::Other => {}
        }
    }
}

async fn run_bind(
    bind: BindClient,
    client_id: String,
    generation: u64,
    events: EventPublisher,
    signals: mpsc::UnboundedSender<SessionSignal>,
) {
    match bind.bind(&client_id).await {
        Ok(response) => {
            events.log(response.message.clone());
            if response.accepted() {
                info!(event = "bind_accepted", generation, %client_id);
            } else {
                warn!(
                    event = "bind_rejected",
                    generation,
                    %client_id,
                    status = response.status
                );
                let _ = signals.send(SessionSignal::Lost {
                    generation,
                    reason: DisconnectReason::BindRejected {
                        message: response.message,
                    },
                });
            }
        }
        Err(BindError::HttpStatus { status, body }) => {
            warn!(event = "bind_http_status", generation, %status, %body);
            events.log(format!("bind request failed: {status}"));
            events.notify("Bind failed", format!("status code: {status}"));
        }
        Err(err) => {
            warn!(event = "bind_error", generation, error = %err);
            events.log(format!("bind request error: {err}"));
            events.notify("Bind error", err.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use secrecy::SecretString;
    use tokio::sync::mpsc;

    use super::Dispatcher;
    use crate::bind::BindClient;
    use crate::events::{ClientEvent, EventPublisher};
    use crate::stream::heartbeat::HeartbeatClock;

    fn dispatcher() -> (
        Dispatcher,
        HeartbeatClock,
        mpsc::UnboundedReceiver<ClientEvent>,
    ) {
        let clock = HeartbeatClock::new();
        let bind = BindClient::new(
            "http://127.0.0.1:9/bind",
            SecretString::new("secret".to_string()),
        )
        .expect("bind client");
        let (events, events_rx) = EventPublisher::channel();
        let (signals, _signals_rx) = mpsc::unbounded_channel();
        (
            Dispatcher::new(1, clock.clone(), bind, events, signals),
            clock,
            events_rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_frame_stamps_clock() {
        let (dispatcher, clock, _events) = dispatcher();
        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(clock.elapsed(), Duration::from_secs(40));

        dispatcher.dispatch(r#"{"type":"@heart@"}"#);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn order_frame_reaches_message_sink_and_notifications() {
        let (dispatcher, _clock, mut events) = dispatcher();
        dispatcher.dispatch(r#"{"type":"order","message":"order 17 paid"}"#);

        match events.recv().await.expect("message event") {
            ClientEvent::Message(text) => assert_eq!(text, "order 17 paid"),
            other => panic!("unexpected event: {other:?}"),
        }
        match events.recv().await.expect("notification event") {
            ClientEvent::Notification { title, message } => {
                assert_eq!(title, "New message");
                assert_eq!(message, "order 17 paid");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_frames_produce_no_events() {
        let (dispatcher, _clock, mut events) = dispatcher();
        dispatcher.dispatch("hello");
        dispatcher.dispatch(r#"{"type":"order"}"#);
        dispatcher.dispatch(r#"{"type":"unknown"}"#);
        assert!(events.try_recv().is_err());
    }
}
