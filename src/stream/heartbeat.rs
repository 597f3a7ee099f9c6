//! Heartbeat clock and liveness watchdog.
//!
//! The receive loop stamps the clock on every `@heart@` frame; the watchdog
//! samples it on a fixed interval and reports the session as dead once the
//! gap exceeds the configured timeout.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::stream::session::{DisconnectReason, SessionSignal};

/// Shortest sampling period; `tokio::time::interval_at` rejects zero.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Time of the last observed heartbeat, shared between the receive loop and
/// the watchdog. The lock is never held across an await.
#[derive(Clone, Debug)]
pub struct HeartbeatClock {
    last: Arc<Mutex<Instant>>,
}

impl HeartbeatClock {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Records a heartbeat at the current instant. Never moves backwards.
    pub fn stamp(&self) {
        let now = Instant::now();
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if now > *last {
            *last = now;
        }
    }

    /// Time elapsed since the last heartbeat.
    pub fn elapsed(&self) -> Duration {
        let last = *self.last.lock().unwrap_or_else(PoisonError::into_inner);
        Instant::now().saturating_duration_since(last)
    }
}

impl Default for HeartbeatClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Watchdog cadence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WatchdogConfig {
    /// How often the clock is sampled.
    pub interval: Duration,
    /// Heartbeat gap that counts as a dead link.
    pub timeout: Duration,
}

/// Result of one watchdog sample.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Liveness {
    Alive { remaining: Duration },
    Expired { elapsed: Duration },
}

/// Samples `clock` against `timeout`. Expiry requires strictly exceeding it.
pub fn check(clock: &HeartbeatClock, timeout: Duration) -> Liveness {
    let elapsed = clock.elapsed();
    if elapsed > timeout {
        Liveness::Expired { elapsed }
    } else {
        Liveness::Alive {
            remaining: timeout - elapsed,
        }
    }
}

pub(crate) fn spawn_watchdog(
    generation: u64,
    clock: HeartbeatClock,
    config: WatchdogConfig,
    cancel: CancellationToken,
    signals: mpsc::UnboundedSender<SessionSignal>,
) -> JoinHandle<()> {
    tokio::spawn(run_watchdog(generation, clock, config, cancel, signals))
}

async fn run_watchdog(
    generation: u64,
    clock: HeartbeatClock,
    config: WatchdogConfig,
    cancel: CancellationToken,
    signals: mpsc::UnboundedSender<SessionSignal>,
) {
    let period = config.interval.max(MIN_INTERVAL);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match check(&clock, config.timeout) {
            Liveness::Alive { remaining } => {
                let _ = signals.send(SessionSignal::Liveness {
                    generation,
                    remaining,
                });
            }
            Liveness::Expired { elapsed } => {
                debug!(
                    event = "heartbeat_expired",
                    generation,
                    elapsed_ms = elapsed.as_millis() as u64
                );
                let _ = signals.send(SessionSignal::Lost {
                    generation,
                    reason: DisconnectReason::HeartbeatTimeout { elapsed },
                });
                return;
            }
        }
    }
}
