//! Global network limits shared by every item
//!
//! [`NetworkLimiter`] caps the number of in-flight HTTP requests across all
//! workers and, optionally, throttles aggregate bandwidth with a token bucket.
//! Per-item segment concurrency sits below this cap, so a large pool cannot
//! multiply into an unbounded number of CDN connections.

use crate::error::{Error, Result};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Shared request and bandwidth limiter
///
/// Cloning is cheap; all clones share the same budget.
#[derive(Clone, Debug)]
pub struct NetworkLimiter {
    requests: Arc<Semaphore>,
    max_requests: usize,
    bandwidth: Option<Arc<TokenBucket>>,
}

impl NetworkLimiter {
    /// Create a limiter allowing `max_requests` concurrent requests
    ///
    /// `limit_bps` of `None` (or zero) disables bandwidth throttling.
    #[must_use]
    pub fn new(max_requests: usize, limit_bps: Option<u64>) -> Self {
        let max_requests = max_requests.max(1);
        Self {
            requests: Arc::new(Semaphore::new(max_requests)),
            max_requests,
            bandwidth: limit_bps
                .filter(|bps| *bps > 0)
                .map(|bps| Arc::new(TokenBucket::new(bps))),
        }
    }

    /// Unlimited bandwidth with a generous request cap, for tests
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(Semaphore::MAX_PERMITS, None)
    }

    /// Wait for a request slot; the slot is released when the permit drops
    pub async fn request_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.requests
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ShuttingDown)
    }

    /// Requests currently in flight
    pub fn in_flight(&self) -> usize {
        self.max_requests - self.requests.available_permits()
    }

    /// Configured bandwidth limit in bytes per second
    pub fn limit_bps(&self) -> Option<u64> {
        self.bandwidth.as_ref().map(|bucket| bucket.rate)
    }

    /// Account for `bytes` received, sleeping until the bucket allows them
    pub async fn throttle(&self, bytes: u64) {
        let Some(bucket) = &self.bandwidth else {
            return;
        };
        let mut remaining = bytes;
        while remaining > 0 {
            let wait = bucket.take(&mut remaining);
            if remaining == 0 {
                return;
            }
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    rate: u64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: u64) -> Self {
        Self {
            rate,
            state: Mutex::new(BucketState {
                tokens: rate as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Consume as many of `remaining` bytes as the bucket holds
    ///
    /// Returns how long to wait before the rest could be served. Capacity is
    /// one second of traffic.
    fn take(&self, remaining: &mut u64) -> Duration {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate as f64).min(self.rate as f64);
        state.last_refill = now;

        let granted = (*remaining as f64).min(state.tokens.floor()).max(0.0) as u64;
        state.tokens -= granted as f64;
        *remaining -= granted;

        let needed = (*remaining).min(self.rate) as f64;
        let wait = needed / self.rate as f64;
        Duration::from_secs_f64(wait).clamp(Duration::from_millis(5), Duration::from_millis(100))
    }

    #[cfg(test)]
    fn drain(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.tokens = 0.0;
            state.last_refill = Instant::now();
        }
    }
}
