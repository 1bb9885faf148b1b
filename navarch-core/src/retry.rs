//! Exponential-backoff retry with jitter, used by every network call the
//! node agent makes.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;

/// Backoff configuration: `delay(k) = min(initial * multiplier^k, max) ±
/// jitter * delay`, jitter drawn from a uniform distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// 0 means retry until cancellation.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the computed delay to jitter by, e.g. 0.1 = ±10%.
    pub jitter: f64,
}

impl RetryConfig {
    /// 4 attempts, 1s initial, 30s cap, 2x multiplier, 10% jitter.
    pub fn default_profile() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.10,
        }
    }

    /// 4 attempts, 2s initial, 16s cap, 2x multiplier, 20% jitter.
    pub fn network_profile() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(16),
            multiplier: 2.0,
            jitter: 0.20,
        }
    }

    /// 3 attempts, 500ms initial, 2s cap, 2x multiplier, 10% jitter —
    /// used by the heartbeat loop specifically so a slow control plane
    /// never causes the agent to miss more than one heartbeat tick.
    pub fn heartbeat_profile() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.10,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let lo = (1.0 - self.jitter).max(0.0);
            let hi = 1.0 + self.jitter;
            capped * rand::thread_rng().gen_range(lo..hi)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Outcome of a retry loop that never succeeded.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Cancelled while waiting between attempts; carries whatever error
    /// the last completed attempt returned, if any.
    #[error("retry cancelled (last error: {last_error:?})")]
    Cancelled { last_error: Option<E> },
    /// All attempts were exhausted without success.
    #[error("retry exhausted after all attempts: {0}")]
    Exhausted(E),
    /// The operation's error was classified non-retryable; returned
    /// immediately without consuming further attempts.
    #[error("non-retryable error: {0}")]
    NonRetryable(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Cancelled { last_error } => last_error,
            RetryError::Exhausted(e) | RetryError::NonRetryable(e) => Some(e),
        }
    }
}

/// Run `op` up to `config.max_attempts` times (or forever, if 0), waiting
/// an exponentially-increasing, jittered delay between attempts. `clock`
/// supplies the wait; `cancel` aborts the wait or the next attempt.
/// `is_retryable` classifies an error as worth another attempt; an error
/// for which it returns `false` is returned immediately as
/// [`RetryError::NonRetryable`].
pub async fn retry_with<F, Fut, T, E, R>(
    clock: &dyn Clock,
    cancel: &CancellationToken,
    config: &RetryConfig,
    is_retryable: R,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { last_error: None });
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(RetryError::NonRetryable(err));
                }

                attempt += 1;
                let exhausted = config.max_attempts != 0 && attempt >= config.max_attempts;
                if exhausted {
                    return Err(RetryError::Exhausted(err));
                }

                let delay = config.delay_for_attempt(attempt - 1);
                tokio::select! {
                    _ = clock.sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(RetryError::Cancelled { last_error: Some(err) });
                    }
                }
            }
        }
    }
}
