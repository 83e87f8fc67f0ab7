//! Retry, backoff, and timeout utilities.
//!
//! Two flavors live here: [`RetryPolicy`] bounds short-lived HTTP retries
//! (token fetches), while [`ReconnectPolicy`] holds the fixed delays the
//! stream supervisor applies between connection attempts. The supervisor
//! retries forever; only the delay depends on why the last attempt ended.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Policy for bounded retries with exponential backoff and jitter.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Delay before retrying after the given 1-based attempt failed.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let doublings = attempt.saturating_sub(1).min(32) as u32;
        let delay = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(doublings))
            .min(self.max_backoff.max(self.initial_backoff));
        delay + jitter_duration(self.jitter, attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            jitter: Duration::from_millis(100),
        }
    }
}

/// Why a supervised stream session ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureClass {
    /// The gateway asked us to reconnect, or closed the socket cleanly.
    Graceful,
    /// The connection-open request failed.
    Negotiation,
    /// The socket dropped abruptly while connected.
    Transport,
    /// Anything else (handshake rejected, bad endpoint, timeouts).
    Unexpected,
}

/// Fixed reconnect delays keyed by [`FailureClass`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub negotiation_retry_delay: Duration,
    pub transport_fault_delay: Duration,
    pub unexpected_fault_delay: Duration,
}

impl ReconnectPolicy {
    pub const NEGOTIATION_RETRY_DELAY: Duration = Duration::from_secs(10);
    pub const TRANSPORT_FAULT_DELAY: Duration = Duration::from_secs(10);
    pub const UNEXPECTED_FAULT_DELAY: Duration = Duration::from_secs(3);

    /// Uses the same delay for every failure class. Graceful reconnects stay
    /// immediate.
    pub fn uniform(delay: Duration) -> Self {
        Self {
            negotiation_retry_delay: delay,
            transport_fault_delay: delay,
            unexpected_fault_delay: delay,
        }
    }

    pub fn delay_for(&self, class: FailureClass) -> Duration {
        match class {
            FailureClass::Graceful => Duration::ZERO,
            FailureClass::Negotiation => self.negotiation_retry_delay,
            FailureClass::Transport => self.transport_fault_delay,
            FailureClass::Unexpected => self.unexpected_fault_delay,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            negotiation_retry_delay: Self::NEGOTIATION_RETRY_DELAY,
            transport_fault_delay: Self::TRANSPORT_FAULT_DELAY,
            unexpected_fault_delay: Self::UNEXPECTED_FAULT_DELAY,
        }
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number. `should_retry` decides whether
/// an error is worth another attempt.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if attempt >= max_attempts || !should_retry(&error) {
            return Err(error);
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(
            event = "retry_attempt_failed",
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
