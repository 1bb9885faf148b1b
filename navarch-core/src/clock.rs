//! Abstract time source.
//!
//! Every time-dependent component (retry, the three agent loops, the
//! native backend's log-poll interval) takes a `Arc<dyn Clock>` instead of
//! calling `tokio::time`/`std::time` directly, so tests can drive time
//! deterministically instead of sleeping for real.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

/// Capability abstraction over time.
#[async_trait]
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> Instant;

    /// Resolves after `d` has elapsed.
    async fn sleep(&self, d: Duration);
}

/// Delegates to the real system clock and `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

struct FakeClockState {
    now: Instant,
    /// Pending sleeps, in the order they were requested; each carries the
    /// deadline and a notifier woken when `advance` passes it.
    waiters: VecDeque<(Instant, Arc<Notify>)>,
}

/// Deterministic clock for tests. Time advances only via [`FakeClock::advance`];
/// `sleep` registers a waiter and blocks until a test releases it by
/// advancing far enough.
pub struct FakeClock {
    state: Mutex<FakeClockState>,
}

impl FakeClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeClockState {
                now: Instant::now(),
                waiters: VecDeque::new(),
            }),
        })
    }

    /// Number of sleeps currently parked waiting for time to advance.
    pub async fn waiter_count(&self) -> usize {
        self.state.lock().await.waiters.len()
    }

    /// Advance the fake clock by `d`, waking any waiter whose deadline has
    /// now passed.
    pub async fn advance(&self, d: Duration) {
        let mut state = self.state.lock().await;
        state.now += d;
        let now = state.now;
        let mut still_waiting = VecDeque::new();
        for (deadline, notify) in state.waiters.drain(..) {
            if deadline <= now {
                notify.notify_one();
            } else {
                still_waiting.push_back((deadline, notify));
            }
        }
        state.waiters = still_waiting;
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> Instant {
        // Synchronous API over an async mutex: try_lock is safe here
        // because nothing else holds the lock across an await point that
        // overlaps with a `now()` call in test code.
        self.state
            .try_lock()
            .map(|s| s.now)
            .unwrap_or_else(|_| Instant::now())
    }

    async fn sleep(&self, d: Duration) {
        let notify = Arc::new(Notify::new());
        {
            let mut state = self.state.lock().await;
            let deadline = state.now + d;
            if deadline <= state.now {
                return;
            }
            state.waiters.push_back((deadline, notify.clone()));
        }
        notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_clock_sleep_resolves_on_advance() {
        let clock = FakeClock::new();
        let clock_for_task = clock.clone();
        let handle = tokio::spawn(async move {
            clock_for_task.sleep(Duration::from_secs(5)).await;
        });

        // Give the sleeper a chance to register before advancing.
        tokio::task::yield_now().await;
        assert_eq!(clock.waiter_count().await, 1);

        clock.advance(Duration::from_secs(5)).await;
        handle.await.unwrap();
        assert_eq!(clock.waiter_count().await, 0);
    }

    #[tokio::test]
    async fn fake_clock_does_not_wake_early() {
        let clock = FakeClock::new();
        let clock_for_task = clock.clone();
        let handle = tokio::spawn(async move {
            clock_for_task.sleep(Duration::from_secs(10)).await;
        });
        tokio::task::yield_now().await;

        clock.advance(Duration::from_secs(3)).await;
        assert_eq!(clock.waiter_count().await, 1);

        clock.advance(Duration::from_secs(7)).await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn system_clock_sleeps_for_real() {
        let clock = SystemClock;
        let start = clock.now();
        clock.sleep(Duration::from_millis(5)).await;
        assert!(clock.now() >= start);
    }
}
