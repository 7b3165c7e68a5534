//! Token bucket with whole-interval refill.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    /// Tokens currently available, `0 <= tokens <= capacity`
    tokens: u64,
    /// Start of the interval whose progress has not been credited yet
    last_refill: Instant,
}

/// A token bucket for a single key.
///
/// Refill is lazy: each call credits `intervals * refill_rate` tokens, where
/// `intervals` counts only whole elapsed intervals. `last_refill` advances by
/// exactly that many intervals, so partial progress carries into the next call.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    capacity: u64,
    /// Tokens added per elapsed interval
    refill_rate: u64,
    refill_interval: Duration,
    state: Mutex<BucketState>,
    attempts: AtomicU64,
    rejections: AtomicU64,
}

impl TokenBucketLimiter {
    /// Create a full bucket.
    pub fn new(capacity: u64, refill_rate: u64, refill_interval: Duration) -> Self {
        Self::starting_at(Instant::now(), capacity, capacity, refill_rate, refill_interval)
    }

    /// Create a bucket holding `initial_tokens` (capped at capacity) as of `start`.
    pub fn starting_at(
        start: Instant,
        capacity: u64,
        initial_tokens: u64,
        refill_rate: u64,
        refill_interval: Duration,
    ) -> Self {
        Self {
            capacity,
            refill_rate,
            // A zero interval would never advance `last_refill`.
            refill_interval: refill_interval.max(Duration::from_millis(1)),
            state: Mutex::new(BucketState {
                tokens: initial_tokens.min(capacity),
                last_refill: start,
            }),
            attempts: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Try to take `tokens` now.
    pub fn try_acquire(&self, tokens: u64) -> bool {
        self.try_acquire_at(Instant::now(), tokens)
    }

    /// Refill, then take `tokens` if that many are available.
    ///
    /// A rejected call leaves the token count untouched (the refill still applies).
    pub fn try_acquire_at(&self, now: Instant, tokens: u64) -> bool {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        let acquired = {
            let mut state = self.state.lock();
            self.refill(&mut state, now);
            if state.tokens >= tokens {
                state.tokens -= tokens;
                true
            } else {
                false
            }
        };

        if !acquired {
            self.rejections.fetch_add(1, Ordering::Relaxed);
        }
        acquired
    }

    /// Tokens available now, after a refill-only pass.
    pub fn available_tokens(&self) -> u64 {
        self.available_tokens_at(Instant::now())
    }

    pub fn available_tokens_at(&self, now: Instant) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.tokens
    }

    /// `(capacity - tokens) / capacity`.
    pub fn utilization_rate(&self) -> f64 {
        self.utilization_rate_at(Instant::now())
    }

    pub fn utilization_rate_at(&self, now: Instant) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        let tokens = self.available_tokens_at(now);
        (self.capacity - tokens) as f64 / self.capacity as f64
    }

    /// Lifetime rejects / lifetime attempts. The counters are never reset.
    pub fn rejection_rate(&self) -> f64 {
        let attempts = self.attempts.load(Ordering::Relaxed);
        if attempts == 0 {
            return 0.0;
        }
        self.rejections.load(Ordering::Relaxed) as f64 / attempts as f64
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> u64 {
        self.refill_rate
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        let interval_nanos = self.refill_interval.as_nanos();
        let intervals = elapsed.as_nanos() / interval_nanos;
        if intervals == 0 {
            return;
        }

        let added = u64::try_from(intervals)
            .unwrap_or(u64::MAX)
            .saturating_mul(self.refill_rate);
        state.tokens = state.tokens.saturating_add(added).min(self.capacity);

        let advance = interval_nanos.saturating_mul(intervals);
        state.last_refill += Duration::from_nanos(u64::try_from(advance).unwrap_or(u64::MAX));
    }
}
