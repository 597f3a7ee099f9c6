//! Push-server websocket client and its connection worker.
//!
//! A single background worker owns the connection state, the live session
//! and the reconnect counter. User requests and session signals reach it over
//! channels, so every state transition is serialized through one task and
//! published in order on the event channel.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::bind::{BindClient, BindClientOptions, BindError};
use crate::config::AppConfig;
use crate::events::{ClientEvent, ConnectionState, EventPublisher};
use crate::retry::RetryPolicy;
use crate::stream::heartbeat::{HeartbeatClock, WatchdogConfig};
use crate::stream::session::{
    connect_with_timeout, DisconnectReason, Session, SessionContext, SessionError, SessionSignal,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectionDefaults;

impl ConnectionDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);
    pub const CLOSE_TIMEOUT: Duration = Duration::from_millis(3_000);
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(60_000);
    pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(90_000);
}

/// Connection policy knobs.
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// Bound on each websocket handshake.
    pub connect_timeout: Duration,
    /// Bound on the graceful close handshake during teardown.
    pub close_timeout: Duration,
    /// Heartbeat watchdog sampling interval.
    pub heartbeat_interval: Duration,
    /// Heartbeat gap after which the link is considered dead.
    pub heartbeat_timeout: Duration,
    /// Reconnect attempt cap and backoff.
    pub reconnect: RetryPolicy,
    /// Bind endpoint HTTP client settings.
    pub bind: BindClientOptions,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: ConnectionDefaults::CONNECT_TIMEOUT,
            close_timeout: ConnectionDefaults::CLOSE_TIMEOUT,
            heartbeat_interval: ConnectionDefaults::HEARTBEAT_INTERVAL,
            heartbeat_timeout: ConnectionDefaults::HEARTBEAT_TIMEOUT,
            reconnect: RetryPolicy::reconnect(),
            bind: BindClientOptions::default(),
        }
    }
}

/// Entry point for creating push connections.
#[derive(Clone, Debug)]
pub struct PushClient {
    config: AppConfig,
    options: ConnectionOptions,
}

impl PushClient {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            options: ConnectionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.config.websocket_url
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Spawns the connection worker on the current tokio runtime.
    ///
    /// The worker starts `Disconnected`; call [`ConnectionHandle::connect`]
    /// to open the first session.
    pub fn start(&self) -> Result<PushConnection, ClientError> {
        let bind = BindClient::with_options(
            self.config.bind_url.clone(),
            self.config.secret_id.clone(),
            self.options.bind.clone(),
        )?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (events, events_rx) = EventPublisher::channel();

        let worker = ConnectionWorker {
            url: self.config.websocket_url.clone(),
            options: self.options.clone(),
            ctx: SessionContext {
                clock: HeartbeatClock::new(),
                bind,
                events,
                signals: signal_tx,
                watchdog: WatchdogConfig {
                    interval: self.options.heartbeat_interval,
                    timeout: self.options.heartbeat_timeout,
                },
            },
            commands: command_rx,
            signals: signal_rx,
            state: state_tx,
            session: None,
            generation: 0,
            attempts: 0,
            user_requested: false,
            closing: false,
            pending_acks: Vec::new(),
        };
        tokio::spawn(worker.run());

        Ok(PushConnection {
            handle: ConnectionHandle {
                commands: command_tx,
                state: state_rx,
            },
            events: events_rx,
        })
    }
}

/// Running client: a control handle plus the presentation event stream.
#[derive(Debug)]
pub struct PushConnection {
    handle: ConnectionHandle,
    events: mpsc::UnboundedReceiver<ClientEvent>,
}

impl PushConnection {
    /// Returns a cloneable control handle.
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Splits into control handle and event receiver.
    pub fn split(self) -> (ConnectionHandle, mpsc::UnboundedReceiver<ClientEvent>) {
        (self.handle, self.events)
    }

    /// Receives the next presentation event.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }
}

/// Cloneable control surface for the connection worker.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    /// Requests a fresh connect. A no-op while connected; collapses into the
    /// attempt already in progress while connecting.
    pub fn connect(&self) -> Result<(), ClientError> {
        self.send(Command::Connect)
    }

    /// Disconnects on behalf of the user and waits for teardown. Stops any
    /// reconnect loop in progress. Idempotent.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let (done, wait) = oneshot::channel();
        self.send(Command::Disconnect { done })?;
        wait.await.map_err(|_| ClientError::WorkerStopped)
    }

    /// Disconnects when connected or reconnecting, connects otherwise.
    pub async fn toggle(&self) -> Result<(), ClientError> {
        let (done, wait) = oneshot::channel();
        self.send(Command::Toggle { done })?;
        wait.await.map_err(|_| ClientError::WorkerStopped)
    }

    /// Stops the worker. Returns only after the live session, if any, has
    /// been torn down. Calling it on a stopped worker is a no-op.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let (done, wait) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).is_err() {
            return Ok(());
        }
        let _ = wait.await;
        Ok(())
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Returns a receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::WorkerStopped)
    }
}

/// Errors produced by the client surface.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Bind client could not be constructed.
    #[error("bind client setup failed: {0}")]
    Bind(#[from] BindError),

    /// The connection worker is no longer running.
    #[error("connection worker has stopped")]
    WorkerStopped,
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect { done: oneshot::Sender<()> },
    Toggle { done: oneshot::Sender<()> },
    Shutdown { done: oneshot::Sender<()> },
}

enum AttemptOutcome {
    Connected,
    Failed(SessionError),
    Interrupted,
}

struct ConnectionWorker {
    url: String,
    options: ConnectionOptions,
    ctx: SessionContext,
    commands: mpsc::UnboundedReceiver<Command>,
    signals: mpsc::UnboundedReceiver<SessionSignal>,
    state: watch::Sender<ConnectionState>,
    session: Option<Session>,
    generation: u64,
    attempts: usize,
    user_requested: bool,
    closing: bool,
    pending_acks: Vec<oneshot::Sender<()>>,
}

impl ConnectionWorker {
    async fn run(mut self) {
        debug!(event = "connection_worker_started", url = %self.url);

        while !self.closing {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.begin_closing();
                        self.teardown().await;
                    }
                },
                Some(signal) = self.signals.recv() => self.handle_signal(signal).await,
            }
        }

        self.flush_acks();
        debug!(event = "connection_worker_stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                self.user_requested = false;
                self.connect().await;
            }
            Command::Disconnect { done } => {
                self.disconnect(done).await;
            }
            Command::Toggle { done } => {
                if self.state().is_connected() {
                    self.disconnect(done).await;
                } else {
                    let _ = done.send(());
                    self.user_requested = false;
                    self.connect().await;
                }
            }
            Command::Shutdown { done } => {
                self.begin_closing();
                self.pending_acks.push(done);
                self.teardown().await;
            }
        }
    }

    async fn handle_signal(&mut self, signal: SessionSignal) {
        match signal {
            SessionSignal::Liveness {
                generation,
                remaining,
            } => {
                if self.is_current(generation) {
                    self.ctx.events.liveness(remaining);
                }
            }
            SessionSignal::Lost { generation, reason } => {
                if !self.is_current(generation) {
                    debug!(event = "stale_session_signal", generation, reason = %reason);
                    return;
                }
                self.handle_disconnection(reason).await;
            }
        }
    }

    async fn disconnect(&mut self, done: oneshot::Sender<()>) {
        self.user_requested = true;
        self.pending_acks.push(done);
        self.teardown().await;
        self.flush_acks();
    }

    async fn connect(&mut self) {
        if self.state().is_connected() {
            return;
        }

        self.attempts = 0;
        self.set_state(ConnectionState::Connecting {
            attempt: 0,
            max_attempts: self.options.reconnect.max_attempts,
        });
        self.ctx.events.log(format!("connecting to {}", self.url));
        info!(event = "connect_started", url = %self.url);

        match self.attempt_session().await {
            AttemptOutcome::Connected => {
                self.ctx.events.log("connected, waiting for messages...");
            }
            AttemptOutcome::Failed(err) => {
                warn!(event = "connect_failed", error = %err);
                self.ctx.events.log(format!("connect failed: {err}"));
                self.ctx.events.notify("Connection error", err.to_string());
                self.reconnect().await;
            }
            AttemptOutcome::Interrupted => {
                self.teardown().await;
                self.flush_acks();
            }
        }
    }

    async fn handle_disconnection(&mut self, reason: DisconnectReason) {
        info!(event = "connection_lost", reason = %reason);
        self.ctx.events.log(format!("connection lost: {reason}"));
        self.teardown().await;

        if reason.reconnect_eligible() && !self.user_requested && !self.closing {
            self.reconnect().await;
        }
    }

    /// Retries with capped exponential backoff until connected, stopped by
    /// the user, or out of attempts. Always leaves the worker either
    /// `Connected` or `Disconnected`.
    async fn reconnect(&mut self) {
        let policy = self.options.reconnect.clone();
        let max_attempts = policy.max_attempts;
        let mut interrupted = false;

        while policy.allows(self.attempts) && !self.user_requested && !self.closing {
            let attempt = self.attempts + 1;
            let delay = policy.delay_for_attempt(attempt);

            self.set_state(ConnectionState::Connecting {
                attempt,
                max_attempts,
            });
            self.ctx.events.log(format!(
                "waiting {}ms before reconnecting ({attempt}/{max_attempts})...",
                delay.as_millis()
            ));
            debug!(
                event = "reconnect_scheduled",
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64
            );

            if self.interruptible(tokio::time::sleep(delay)).await.is_none() {
                interrupted = true;
                break;
            }

            self.attempts = attempt;
            self.ctx
                .events
                .log(format!("reconnecting ({attempt}/{max_attempts})..."));

            match self.attempt_session().await {
                AttemptOutcome::Connected => {
                    info!(event = "reconnected", attempt);
                    self.ctx.events.log("reconnected, waiting for messages...");
                    return;
                }
                AttemptOutcome::Failed(err) => {
                    warn!(event = "reconnect_failed", attempt, error = %err);
                    self.ctx.events.log(format!("reconnect failed: {err}"));
                }
                AttemptOutcome::Interrupted => {
                    interrupted = true;
                    break;
                }
            }
        }

        // Shutdown is the only exit that stays quiet.
        if !self.closing {
            if interrupted || self.user_requested {
                info!(event = "reconnect_stopped", attempts = self.attempts, max_attempts);
                self.ctx.events.log("reconnect stopped");
            } else {
                warn!(event = "reconnect_exhausted", max_attempts);
                self.ctx.events.log(format!(
                    "reached the maximum of {max_attempts} reconnect attempts, giving up"
                ));
            }
            self.ctx.events.notify(
                "Reconnect failed",
                "maximum reconnect attempts reached, check the network connection",
            );
        }

        self.attempts = 0;
        self.teardown().await;
        self.flush_acks();
    }

    /// Tears down any stale session and opens a new one.
    async fn attempt_session(&mut self) -> AttemptOutcome {
        self.teardown_session().await;

        self.generation += 1;
        let generation = self.generation;
        let connect = connect_with_timeout(self.url.clone(), self.options.connect_timeout);

        match self.interruptible(connect).await {
            None => AttemptOutcome::Interrupted,
            Some(Err(err)) => AttemptOutcome::Failed(err),
            Some(Ok(socket)) => {
                self.attempts = 0;
                self.set_state(ConnectionState::Connected);
                self.session = Some(Session::start(socket, generation, &self.ctx));
                AttemptOutcome::Connected
            }
        }
    }

    /// Drives `future` while still serving commands. Returns `None` when a
    /// disconnect or shutdown request interrupts it; the future is dropped
    /// before returning.
    async fn interruptible<F: Future>(&mut self, future: F) -> Option<F::Output> {
        tokio::pin!(future);

        loop {
            tokio::select! {
                output = &mut future => return Some(output),
                command = self.commands.recv() => {
                    if self.interrupts(command) {
                        return None;
                    }
                }
                Some(signal) = self.signals.recv() => {
                    // No session is live while connecting or backing off.
                    debug!(event = "stale_session_signal", ?signal);
                }
            }
        }
    }

    fn interrupts(&mut self, command: Option<Command>) -> bool {
        match command {
            Some(Command::Connect) => {
                debug!(event = "connect_collapsed");
                false
            }
            Some(Command::Disconnect { done }) | Some(Command::Toggle { done }) => {
                self.user_requested = true;
                self.pending_acks.push(done);
                true
            }
            Some(Command::Shutdown { done }) => {
                self.begin_closing();
                self.pending_acks.push(done);
                true
            }
            None => {
                self.begin_closing();
                true
            }
        }
    }

    async fn teardown_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.shutdown(self.options.close_timeout).await;
        }
    }

    async fn teardown(&mut self) {
        self.teardown_session().await;
        self.set_state(ConnectionState::Disconnected);
    }

    fn begin_closing(&mut self) {
        self.closing = true;
        self.user_requested = true;
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.generation() == generation)
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            debug!(event = "connection_state", state = %next.label());
            self.ctx.events.status(next);
        }
    }

    fn flush_acks(&mut self) {
        for done in self.pending_acks.drain(..) {
            let _ = done.send(());
        }
    }
}
