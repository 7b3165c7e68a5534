//! Sliding window counter with burst allowance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Mutable window state. Only touched under the limiter's lock.
#[derive(Debug)]
struct WindowState {
    /// When the current window started
    start: Instant,
    /// Admissions since `start`
    count: u64,
}

/// A windowed request counter for a single key.
///
/// Admits while `count < max_requests + burst_size`. Admissions past
/// `max_requests` are burst admits. Once the window has aged past its
/// duration it resets to zero before the next decision; the roll and the
/// increment happen in one critical section.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    /// Steady-state quota per window
    max_requests: u64,
    /// Additional admissions allowed on top of the quota
    burst_size: u64,
    /// Length of a window
    window: Duration,
    state: Mutex<WindowState>,
    attempts: AtomicU64,
    rejections: AtomicU64,
    burst_admits: AtomicU64,
}

impl SlidingWindowLimiter {
    /// Create a new limiter whose first window starts now.
    pub fn new(window: Duration, max_requests: u64, burst_size: u64) -> Self {
        Self::starting_at(Instant::now(), window, max_requests, burst_size)
    }

    /// Create a new limiter whose first window starts at `start`.
    pub fn starting_at(start: Instant, window: Duration, max_requests: u64, burst_size: u64) -> Self {
        Self {
            max_requests,
            burst_size,
            window,
            state: Mutex::new(WindowState { start, count: 0 }),
            attempts: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            burst_admits: AtomicU64::new(0),
        }
    }

    /// Try to admit one request now.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Try to admit one request at the given instant.
    ///
    /// Returns `true` if the request is within quota plus burst.
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        let admitted_count = {
            let mut state = self.state.lock();
            if now.saturating_duration_since(state.start) >= self.window {
                state.start = now;
                state.count = 0;
            }

            if state.count < self.limit() {
                state.count += 1;
                Some(state.count)
            } else {
                None
            }
        };

        match admitted_count {
            Some(count) => {
                if count > self.max_requests {
                    self.burst_admits.fetch_add(1, Ordering::Relaxed);
                }
                true
            }
            None => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Admissions in the current window, or 0 if the window has aged out.
    pub fn current_count(&self) -> u64 {
        self.current_count_at(Instant::now())
    }

    pub fn current_count_at(&self, now: Instant) -> u64 {
        let state = self.state.lock();
        if now.saturating_duration_since(state.start) >= self.window {
            0
        } else {
            state.count
        }
    }

    /// `count / max_requests`. Exceeds 1.0 while burst admits are in use.
    pub fn utilization_rate(&self) -> f64 {
        self.utilization_rate_at(Instant::now())
    }

    pub fn utilization_rate_at(&self, now: Instant) -> f64 {
        if self.max_requests == 0 {
            return if self.current_count_at(now) > 0 { 1.0 } else { 0.0 };
        }
        self.current_count_at(now) as f64 / self.max_requests as f64
    }

    /// Lifetime rejects / lifetime attempts.
    pub fn rejection_rate(&self) -> f64 {
        let attempts = self.attempts.load(Ordering::Relaxed);
        if attempts == 0 {
            return 0.0;
        }
        self.rejections.load(Ordering::Relaxed) as f64 / attempts as f64
    }

    /// Lifetime admissions that consumed burst allowance.
    pub fn burst_admits(&self) -> u64 {
        self.burst_admits.load(Ordering::Relaxed)
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn burst_size(&self) -> u64 {
        self.burst_size
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn limit(&self) -> u64 {
        self.max_requests.saturating_add(self.burst_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_admits_quota_plus_burst() {
        let start = Instant::now();
        let limiter = SlidingWindowLimiter::starting_at(start, Duration::from_secs(1), 5, 3);

        for _ in 0..8 {
            assert!(limiter.try_acquire_at(start));
        }

        // The 9th request exceeds quota + burst
        assert!(!limiter.try_acquire_at(start));
        assert_eq!(limiter.current_count_at(start), 8);
        assert_eq!(limiter.burst_admits(), 3);
    }

    #[test]
    fn test_window_resets_after_duration() {
        let start = Instant::now();
        let limiter = SlidingWindowLimiter::starting_at(start, Duration::from_millis(100), 2, 1);

        for _ in 0..3 {
            assert!(limiter.try_acquire_at(start));
        }
        assert!(!limiter.try_acquire_at(start + Duration::from_millis(99)));

        // A fresh quota + burst is available once the window elapses
        let later = start + Duration::from_millis(100);
        for _ in 0..3 {
            assert!(limiter.try_acquire_at(later));
        }
        assert!(!limiter.try_acquire_at(later));
    }

    #[test]
    fn test_expired_window_reports_zero() {
        let start = Instant::now();
        let limiter = SlidingWindowLimiter::starting_at(start, Duration::from_millis(50), 4, 0);

        limiter.try_acquire_at(start);
        limiter.try_acquire_at(start);
        assert_eq!(limiter.current_count_at(start), 2);
        assert_eq!(limiter.utilization_rate_at(start), 0.5);

        let aged = start + Duration::from_millis(60);
        assert_eq!(limiter.current_count_at(aged), 0);
        assert_eq!(limiter.utilization_rate_at(aged), 0.0);
    }

    #[test]
    fn test_rejection_rate_tracks_lifetime() {
        let start = Instant::now();
        let limiter = SlidingWindowLimiter::starting_at(start, Duration::from_secs(1), 1, 0);

        assert!(limiter.try_acquire_at(start));
        assert!(!limiter.try_acquire_at(start));
        assert!(!limiter.try_acquire_at(start));
        assert!(!limiter.try_acquire_at(start));

        assert_eq!(limiter.rejection_rate(), 0.75);
    }

    #[test]
    fn test_concurrent_acquire_never_over_admits() {
        let start = Instant::now();
        let limiter = Arc::new(SlidingWindowLimiter::starting_at(
            start,
            Duration::from_secs(3600),
            30,
            50,
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..50).filter(|_| limiter.try_acquire_at(start)).count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 80);
    }
}
