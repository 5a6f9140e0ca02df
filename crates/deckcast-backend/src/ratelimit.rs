//! Sliding-window rate limiting.
//!
//! Every outbound API call passes through one shared [`RateLimiter`]. The
//! limiter never rejects; it delays the caller until one more call fits in
//! the rolling window.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::config::RateLimitConfig;

/// Admission gate enforcing "at most N calls per rolling window".
///
/// The admission check sleeps while holding the window lock, so while the
/// limiter is saturated every concurrent caller is serialized behind the
/// earliest waiter. That is intentional: a caller can never win a race and
/// sneak an extra call past one that is already waiting. The remote call
/// itself runs after `admit` returns, outside the lock, so admitted calls
/// still execute concurrently.
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    period: Duration,
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter from the given settings.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            max_calls: config.max_calls.max(1),
            period: config.period,
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Blocks until one more call is admissible, then records it.
    ///
    /// Never fails; the wait is bounded by the window period.
    pub async fn admit(&self) {
        let mut window = self.window.lock().await;
        loop {
            let now = Instant::now();
            while window
                .front()
                .is_some_and(|t| now.duration_since(*t) >= self.period)
            {
                window.pop_front();
            }

            if window.len() < self.max_calls {
                window.push_back(now);
                return;
            }

            // Holding the lock across the sleep is what serializes waiters.
            let oldest = *window.front().expect("saturated window is non-empty");
            let wait = self.period - now.duration_since(oldest);
            trace!("rate limiter saturated, waiting {:?}", wait);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// The maximum admissions per window.
    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    /// The rolling window length.
    pub fn period(&self) -> Duration {
        self.period
    }
}
