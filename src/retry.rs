//! Reconnect backoff and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. The connection worker
//! uses [`RetryPolicy`] to pace reconnect attempts and [`with_timeout`] to
//! bound every connect and close handshake.

use std::future::Future;
use std::time::Duration;

/// Policy controlling reconnect attempts and exponential backoff behavior.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of reconnect attempts before giving up.
    pub max_attempts: usize,
    /// Delay used before the first reconnect attempt.
    pub initial_backoff: Duration,
    /// Cap on the doubled delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Returns the reconnect policy used against the push server: 10 attempts,
    /// 2s doubling up to 30s.
    pub fn reconnect() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(2_000),
            max_backoff: Duration::from_millis(30_000),
        }
    }

    /// Backoff before reconnect `attempt` (1-based; `0` counts as `1`):
    /// `initial_backoff * 2^(attempt - 1)`, capped at `max_backoff`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        (1..attempt).fold(self.initial_backoff.min(self.max_backoff), |delay, _| {
            delay.saturating_mul(2).min(self.max_backoff)
        })
    }

    /// Returns true while another attempt is allowed after `attempts_made`.
    pub fn allows(&self, attempts_made: usize) -> bool {
        attempts_made < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::reconnect()
    }
}

/// Applies a timeout to an async computation.
///
/// When the timeout fires the inner future is dropped before this returns, so
/// an abandoned connect or close attempt never outlives the call.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{with_timeout, RetryPolicy};

    #[test]
    fn reconnect_delays_double_and_cap_at_thirty_seconds() {
        let policy = RetryPolicy::reconnect();
        let delays: Vec<u64> = (1..=8)
            .map(|attempt| policy.delay_for_attempt(attempt).as_millis() as u64)
            .collect();

        assert_eq!(
            delays,
            vec![2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000, 30_000]
        );
    }

    #[test]
    fn attempt_zero_uses_initial_backoff() {
        let policy = RetryPolicy::reconnect();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(2_000));
    }

    #[test]
    fn delay_never_overflows_for_large_attempts() {
        let policy = RetryPolicy::reconnect();
        assert_eq!(policy.delay_for_attempt(10_000), Duration::from_secs(30));
    }

    #[test]
    fn allows_exactly_max_attempts() {
        let policy = RetryPolicy::reconnect();
        let allowed = (0..100).take_while(|made| policy.allows(*made)).count();
        assert_eq!(allowed, 10);
    }

    #[test]
    fn with_timeout_reports_elapsed() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let slow = with_timeout(Duration::from_millis(5), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
            })
            .await;
            assert!(slow.is_err());

            let fast = with_timeout(Duration::from_secs(5), async { 7 }).await;
            assert_eq!(fast.expect("completes"), 7);
        });
    }
}
