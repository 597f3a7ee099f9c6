//! Transport session: one websocket, its cancellation scope, its receive
//! loop, and its heartbeat watchdog.
//!
//! A session is created only after the socket handshake succeeds and is
//! consumed by [`Session::shutdown`]. Shutdown does not return until the
//! receive loop has observed cancellation, so two sessions never receive
//! concurrently.

use std::fmt;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bind::BindClient;
use crate::events::EventPublisher;
use crate::retry::with_timeout;
use crate::stream::dispatch::Dispatcher;
use crate::stream::heartbeat::{spawn_watchdog, HeartbeatClock, WatchdogConfig};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_REASON: &str = "client closing";

/// Errors produced while opening a transport session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Websocket transport or handshake error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// The handshake did not finish within the connect timeout.
    #[error("connect timed out ({}ms)", .0.as_millis())]
    Timeout(Duration),
}

/// Why a live session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Read error on the socket.
    Transport(String),
    /// The server sent a close frame.
    ServerClosed,
    /// The socket ended without a close frame.
    StreamEnded,
    /// No heartbeat within the watchdog timeout.
    HeartbeatTimeout { elapsed: Duration },
    /// The bind endpoint refused our client id.
    BindRejected { message: String },
}

impl DisconnectReason {
    /// A rejected bind counts as an intentional disconnect; everything else is
    /// a fault worth reconnecting after.
    pub fn reconnect_eligible(&self) -> bool {
        !matches!(self, Self::BindRejected { .. })
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(detail) => write!(f, "transport error: {detail}"),
            Self::ServerClosed => f.write_str("server closed the connection"),
            Self::StreamEnded => f.write_str("connection ended unexpectedly"),
            Self::HeartbeatTimeout { elapsed } => {
                write!(f, "heartbeat lost ({}s)", elapsed.as_secs())
            }
            Self::BindRejected { message } => write!(f, "bind rejected: {message}"),
        }
    }
}

/// Signals sent from session tasks to the connection worker.
#[derive(Clone, Debug)]
pub(crate) enum SessionSignal {
    Lost {
        generation: u64,
        reason: DisconnectReason,
    },
    Liveness {
        generation: u64,
        remaining: Duration,
    },
}

/// Shared collaborators handed to every session.
#[derive(Clone, Debug)]
pub(crate) struct SessionContext {
    pub(crate) clock: HeartbeatClock,
    pub(crate) bind: BindClient,
    pub(crate) events: EventPublisher,
    pub(crate) signals: mpsc::UnboundedSender<SessionSignal>,
    pub(crate) watchdog: WatchdogConfig,
}

/// Connects to `url`, abandoning the handshake after `timeout`.
///
/// The in-flight handshake is dropped before this returns on timeout, so no
/// half-open attempt survives.
pub(crate) async fn connect_with_timeout(
    url: String,
    timeout: Duration,
) -> Result<WsStream, SessionError> {
    let request = url.as_str().into_client_request()?;
    match with_timeout(timeout, connect_async(request)).await {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(err)) => Err(SessionError::WebSocket(err)),
        Err(_) => Err(SessionError::Timeout(timeout)),
    }
}

/// Live transport session.
pub(crate) struct Session {
    generation: u64,
    sink: SplitSink<WsStream, Message>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    watchdog: JoinHandle<()>,
}

impl Session {
    /// Stamps the heartbeat clock, starts the watchdog and spawns the
    /// receive loop for an already-connected socket.
    pub(crate) fn start(socket: WsStream, generation: u64, ctx: &SessionContext) -> Self {
        let (sink, stream) = socket.split();
        let cancel = CancellationToken::new();

        ctx.clock.stamp();
        let watchdog = spawn_watchdog(
            generation,
            ctx.clock.clone(),
            ctx.watchdog,
            cancel.clone(),
            ctx.signals.clone(),
        );

        let dispatcher = Dispatcher::new(
            generation,
            ctx.clock.clone(),
            ctx.bind.clone(),
            ctx.events.clone(),
            ctx.signals.clone(),
        );
        let reader = tokio::spawn(receive_loop(
            generation,
            stream,
            cancel.clone(),
            dispatcher,
            ctx.events.clone(),
            ctx.signals.clone(),
        ));

        debug!(event = "session_started", generation);
        Self {
            generation,
            sink,
            cancel,
            reader,
            watchdog,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Tears the session down. Every step runs even if an earlier one
    /// failed; failures are logged and never propagated.
    pub(crate) async fn shutdown(self, close_timeout: Duration) {
        let Session {
            generation,
            mut sink,
            cancel,
            reader,
            watchdog,
        } = self;

        // The reader only finishes on its own once the socket has left the
        // open state.
        let socket_open = !reader.is_finished();

        watchdog.abort();
        cancel.cancel();

        let closed = if socket_open {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: CLOSE_REASON.into(),
            };
            with_timeout(close_timeout, sink.send(Message::Close(Some(frame)))).await
        } else {
            // The peer already closed; flush the close reply tungstenite queued.
            with_timeout(close_timeout, sink.close()).await
        };
        match closed {
            Ok(Ok(())) => debug!(event = "session_close_sent", generation, socket_open),
            Ok(Err(err)) => {
                debug!(event = "session_close_failed", generation, socket_open, error = %err);
            }
            Err(_) => debug!(
                event = "session_close_timed_out",
                generation,
                timeout_ms = close_timeout.as_millis() as u64
            ),
        }

        drop(sink);
        if let Err(err) = reader.await {
            if !err.is_cancelled() {
                warn!(event = "session_reader_join_failed", generation, error = %err);
            }
        }
        if let Err(err) = watchdog.await {
            if !err.is_cancelled() {
                warn!(event = "session_watchdog_join_failed", generation, error = %err);
            }
        }
        drop(cancel);

        debug!(event = "session_torn_down", generation);
    }
}

async fn receive_loop(
    generation: u64,
    mut stream: SplitStream<WsStream>,
    cancel: CancellationToken,
    dispatcher: Dispatcher,
    events: EventPublisher,
    signals: mpsc::UnboundedSender<SessionSignal>,
) {
    let lost = |reason: DisconnectReason| {
        let _ = signals.send(SessionSignal::Lost { generation, reason });
    };

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                events.log("receive loop cancelled");
                debug!(event = "receive_loop_cancelled", generation);
                return;
            }
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => dispatcher.dispatch(&text),
            Some(Ok(Message::Binary(bytes))) => dispatcher.dispatch(&String::from_utf8_lossy(&bytes)),
            Some(Ok(Message::Close(_))) => {
                events.log("server closed the connection");
                lost(DisconnectReason::ServerClosed);
                return;
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                if cancel.is_cancelled() {
                    return;
                }
                events.log(format!("websocket error: {err}"));
                events.notify("Connection error", err.to_string());
                lost(DisconnectReason::Transport(err.to_string()));
                return;
            }
            None => {
                if !cancel.is_cancelled() {
                    lost(DisconnectReason::StreamEnded);
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{connect_with_timeout, DisconnectReason, SessionError};

    #[test]
    fn only_bind_rejection_suppresses_reconnect() {
        assert!(DisconnectReason::ServerClosed.reconnect_eligible());
        assert!(DisconnectReason::StreamEnded.reconnect_eligible());
        assert!(DisconnectReason::Transport("reset".to_string()).reconnect_eligible());
        assert!(DisconnectReason::HeartbeatTimeout {
            elapsed: Duration::from_secs(95)
        }
        .reconnect_eligible());
        assert!(!DisconnectReason::BindRejected {
            message: "bad secret".to_string()
        }
        .reconnect_eligible());
    }

    #[test]
    fn heartbeat_reason_reports_whole_seconds() {
        let reason = DisconnectReason::HeartbeatTimeout {
            elapsed: Duration::from_millis(95_400),
        };
        assert_eq!(reason.to_string(), "heartbeat lost (95s)");
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails_fast() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let result = connect_with_timeout(format!("ws://{addr}/ws"), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(SessionError::WebSocket(_))));
    }

    #[tokio::test]
    async fn connect_times_out_when_handshake_stalls() {
        // Accepts TCP but never answers the HTTP upgrade.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let result =
            connect_with_timeout(format!("ws://{addr}/ws"), Duration::from_millis(100)).await;
        match result {
            Err(SessionError::Timeout(timeout)) => {
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }
        server.abort();
    }

    #[test]
    fn invalid_url_is_a_websocket_error() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let result = runtime.block_on(connect_with_timeout(
            "not a url".to_string(),
            Duration::from_secs(1),
        ));
        assert!(matches!(result, Err(SessionError::WebSocket(_))));
    }
}
