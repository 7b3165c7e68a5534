//! Keyed limiter registry.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::bucket::TokenBucketLimiter;
use super::key::{Dimension, LimiterKey};
use super::window::SlidingWindowLimiter;

/// Limiter bookkeeping kept next to the instance.
struct Slot<L> {
    limiter: Arc<L>,
    /// Registry access sequence at last use, for LRU ordering
    touched: AtomicU64,
    /// Milliseconds since the registry epoch at last use, for idle eviction
    last_seen_ms: AtomicU64,
}

impl<L> Slot<L> {
    fn new(limiter: Arc<L>, seq: u64, now_ms: u64) -> Self {
        Self {
            limiter,
            touched: AtomicU64::new(seq),
            last_seen_ms: AtomicU64::new(now_ms),
        }
    }

    fn touch(&self, seq: u64, now_ms: u64) {
        self.touched.fetch_max(seq, Ordering::Relaxed);
        self.last_seen_ms.fetch_max(now_ms, Ordering::Relaxed);
    }
}

/// One map of limiters of the same kind, with per-dimension entry counts.
struct LimiterTable<L> {
    slots: DashMap<LimiterKey, Slot<L>>,
    counts: [AtomicUsize; 4],
}

impl<L> LimiterTable<L> {
    fn new() -> Self {
        Self {
            slots: DashMap::new(),
            counts: Default::default(),
        }
    }

    fn get(&self, key: &LimiterKey) -> Option<Arc<L>> {
        self.slots.get(key).map(|slot| slot.limiter.clone())
    }

    fn remove(&self, key: &LimiterKey) -> bool {
        if self.slots.remove(key).is_some() {
            self.counts[key.dimension.index()].fetch_sub(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn count(&self, dimension: Dimension) -> usize {
        self.counts[dimension.index()].load(Ordering::Relaxed)
    }

    fn clear(&self) {
        self.slots.clear();
        for count in &self.counts {
            count.store(0, Ordering::Relaxed);
        }
    }

    /// Least recently touched key of a dimension, other than `keep`.
    fn least_recently_used(&self, dimension: Dimension, keep: &LimiterKey) -> Option<LimiterKey> {
        self.slots
            .iter()
            .filter(|slot| slot.key().dimension == dimension && slot.key() != keep)
            .min_by_key(|slot| slot.value().touched.load(Ordering::Relaxed))
            .map(|slot| slot.key().clone())
    }

    fn evict_idle(&self, cutoff_ms: u64) -> usize {
        let mut evicted = 0;
        self.slots.retain(|key, slot| {
            let keep = slot.last_seen_ms.load(Ordering::Relaxed) >= cutoff_ms;
            if !keep {
                self.counts[key.dimension.index()].fetch_sub(1, Ordering::Relaxed);
                evicted += 1;
            }
            keep
        });
        evicted
    }
}

/// Which primitive backs a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterKind {
    SlidingWindow,
    TokenBucket,
}

/// Point-in-time view of one limiter.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterSnapshot {
    pub key: String,
    pub dimension: Dimension,
    pub kind: LimiterKind,
    /// Window count for sliding windows, available tokens for buckets
    pub current: u64,
    pub utilization: f64,
    pub rejection_rate: f64,
}

/// Lazily creates and retains one limiter per key.
///
/// The first call for a key fixes its parameters; later calls return the cached
/// instance and ignore new parameters. Concurrent first calls for the same key
/// create exactly one instance. When `max_keys_per_dimension` is set, inserting
/// past the cap evicts the least recently used limiter of that dimension.
pub struct LimiterRegistry {
    windows: LimiterTable<SlidingWindowLimiter>,
    buckets: LimiterTable<TokenBucketLimiter>,
    max_keys_per_dimension: Option<usize>,
    sequence: AtomicU64,
    epoch: Instant,
}

impl LimiterRegistry {
    /// Create an unbounded registry.
    pub fn new() -> Self {
        Self::with_max_keys(None)
    }

    /// Create a registry holding at most `max_keys` limiters per dimension and kind.
    pub fn with_max_keys(max_keys: Option<usize>) -> Self {
        Self {
            windows: LimiterTable::new(),
            buckets: LimiterTable::new(),
            max_keys_per_dimension: max_keys.map(|max| max.max(1)),
            sequence: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Get the sliding window for `key`, creating it with these parameters if absent.
    pub fn get_or_create_sliding_window(
        &self,
        key: &LimiterKey,
        window: Duration,
        max_requests: u64,
        burst_size: u64,
    ) -> Arc<SlidingWindowLimiter> {
        self.get_or_create(&self.windows, key, || {
            debug!(
                key = %key,
                window = ?window,
                max_requests,
                burst_size,
                "Creating new sliding window limiter"
            );
            SlidingWindowLimiter::new(window, max_requests, burst_size)
        })
    }

    /// Get the token bucket for `key`, creating it with these parameters if absent.
    pub fn get_or_create_token_bucket(
        &self,
        key: &LimiterKey,
        capacity: u64,
        refill_rate: u64,
        refill_interval: Duration,
    ) -> Arc<TokenBucketLimiter> {
        self.get_or_create(&self.buckets, key, || {
            debug!(
                key = %key,
                capacity,
                refill_rate,
                refill_interval = ?refill_interval,
                "Creating new token bucket limiter"
            );
            TokenBucketLimiter::new(capacity, refill_rate, refill_interval)
        })
    }

    /// Look up an existing sliding window without creating one.
    pub fn sliding_window(&self, key: &LimiterKey) -> Option<Arc<SlidingWindowLimiter>> {
        self.windows.get(key)
    }

    /// Look up an existing token bucket without creating one.
    pub fn token_bucket(&self, key: &LimiterKey) -> Option<Arc<TokenBucketLimiter>> {
        self.buckets.get(key)
    }

    /// Drop every limiter stored under `key`. The next call recreates it.
    pub fn remove(&self, key: &LimiterKey) -> bool {
        let removed_window = self.windows.remove(key);
        let removed_bucket = self.buckets.remove(key);
        removed_window || removed_bucket
    }

    /// Drop limiters not used within `ttl`. Returns how many were evicted.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let cutoff_ms = self.now_ms().saturating_sub(duration_ms(ttl));
        let evicted = self.windows.evict_idle(cutoff_ms) + self.buckets.evict_idle(cutoff_ms);
        if evicted > 0 {
            debug!(evicted, ttl = ?ttl, "Evicted idle limiters");
        }
        evicted
    }

    /// Clear all limiters.
    pub fn clear(&self) {
        self.windows.clear();
        self.buckets.clear();
    }

    /// Get the number of live limiters.
    pub fn len(&self) -> usize {
        self.windows.slots.len() + self.buckets.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live limiters for one dimension.
    pub fn len_for(&self, dimension: Dimension) -> usize {
        self.windows.count(dimension) + self.buckets.count(dimension)
    }

    /// Snapshot limiters, optionally restricted to one dimension, sorted by key.
    pub fn snapshot(&self, dimension: Option<Dimension>) -> Vec<LimiterSnapshot> {
        let wanted = |key: &LimiterKey| dimension.map_or(true, |d| key.dimension == d);

        let mut snapshots: Vec<LimiterSnapshot> = self
            .windows
            .slots
            .iter()
            .filter(|slot| wanted(slot.key()))
            .map(|slot| {
                let limiter = &slot.value().limiter;
                LimiterSnapshot {
                    key: slot.key().to_string(),
                    dimension: slot.key().dimension,
                    kind: LimiterKind::SlidingWindow,
                    current: limiter.current_count(),
                    utilization: limiter.utilization_rate(),
                    rejection_rate: limiter.rejection_rate(),
                }
            })
            .collect();

        snapshots.extend(
            self.buckets
                .slots
                .iter()
                .filter(|slot| wanted(slot.key()))
                .map(|slot| {
                    let limiter = &slot.value().limiter;
                    LimiterSnapshot {
                        key: slot.key().to_string(),
                        dimension: slot.key().dimension,
                        kind: LimiterKind::TokenBucket,
                        current: limiter.available_tokens(),
                        utilization: limiter.utilization_rate(),
                        rejection_rate: limiter.rejection_rate(),
                    }
                }),
        );

        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    fn get_or_create<L>(
        &self,
        table: &LimiterTable<L>,
        key: &LimiterKey,
        create: impl FnOnce() -> L,
    ) -> Arc<L> {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let now_ms = self.now_ms();

        if let Some(slot) = table.slots.get(key) {
            slot.touch(seq, now_ms);
            return slot.limiter.clone();
        }

        // The entry guard holds the shard lock, so only one creator wins a race.
        let (limiter, inserted) = match table.slots.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                occupied.get().touch(seq, now_ms);
                (occupied.get().limiter.clone(), false)
            }
            Entry::Vacant(vacant) => {
                let limiter = Arc::new(create());
                vacant.insert(Slot::new(limiter.clone(), seq, now_ms));
                (limiter, true)
            }
        };

        if inserted {
            table.counts[key.dimension.index()].fetch_add(1, Ordering::Relaxed);
            self.enforce_cap(table, key);
        }

        limiter
    }

    fn enforce_cap<L>(&self, table: &LimiterTable<L>, inserted: &LimiterKey) {
        let Some(max) = self.max_keys_per_dimension else {
            return;
        };

        while table.count(inserted.dimension) > max {
            let Some(victim) = table.least_recently_used(inserted.dimension, inserted) else {
                break;
            };
            if table.remove(&victim) {
                trace!(key = %victim, max, "Evicted least recently used limiter");
            }
        }
    }

    fn now_ms(&self) -> u64 {
        duration_ms(self.epoch.elapsed())
    }
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_creation() {
        let registry = LimiterRegistry::new();
        assert_eq!(registry.len(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_same_key_returns_same_instance() {
        let registry = LimiterRegistry::new();
        let key = LimiterKey::ip("10.0.0.1");

        let first = registry.get_or_create_sliding_window(&key, Duration::from_secs(1), 5, 0);
        // Differing parameters on the second call are ignored
        let second = registry.get_or_create_sliding_window(&key, Duration::from_secs(9), 500, 50);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.max_requests(), 5);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_token_bucket_idempotent() {
        let registry = LimiterRegistry::new();
        let key = LimiterKey::api_weight("CORE");

        let first = registry.get_or_create_token_bucket(&key, 10, 1, Duration::from_secs(1));
        let second = registry.get_or_create_token_bucket(&key, 99, 9, Duration::from_millis(5));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.capacity(), 10);
    }

    #[test]
    fn test_concurrent_first_calls_create_one_instance() {
        let registry = Arc::new(LimiterRegistry::new());
        let key = LimiterKey::user("alice");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let key = key.clone();
                std::thread::spawn(move || {
                    registry.get_or_create_sliding_window(&key, Duration::from_secs(1), 10, 0)
                })
            })
            .collect();

        let limiters: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(limiters.iter().all(|l| Arc::ptr_eq(l, &limiters[0])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lru_cap_evicts_oldest_of_same_dimension() {
        let registry = LimiterRegistry::with_max_keys(Some(2));
        let window = Duration::from_secs(1);

        registry.get_or_create_sliding_window(&LimiterKey::user("a"), window, 1, 0);
        registry.get_or_create_sliding_window(&LimiterKey::user("b"), window, 1, 0);
        registry.get_or_create_sliding_window(&LimiterKey::ip("10.0.0.1"), window, 1, 0);
        // Touch "a" so that "b" becomes least recently used
        registry.get_or_create_sliding_window(&LimiterKey::user("a"), window, 1, 0);
        registry.get_or_create_sliding_window(&LimiterKey::user("c"), window, 1, 0);

        assert_eq!(registry.len_for(Dimension::User), 2);
        assert!(registry.sliding_window(&LimiterKey::user("a")).is_some());
        assert!(registry.sliding_window(&LimiterKey::user("b")).is_none());
        assert!(registry.sliding_window(&LimiterKey::user("c")).is_some());
        // Other dimensions are unaffected
        assert_eq!(registry.len_for(Dimension::Ip), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle() {
        let registry = LimiterRegistry::new();
        let window = Duration::from_secs(1);

        registry.get_or_create_sliding_window(&LimiterKey::ip("stale"), window, 1, 0);
        tokio::time::advance(Duration::from_secs(120)).await;
        registry.get_or_create_sliding_window(&LimiterKey::ip("fresh"), window, 1, 0);

        assert_eq!(registry.evict_idle(Duration::from_secs(60)), 1);
        assert!(registry.sliding_window(&LimiterKey::ip("stale")).is_none());
        assert!(registry.sliding_window(&LimiterKey::ip("fresh")).is_some());
        assert_eq!(registry.len_for(Dimension::Ip), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let registry = LimiterRegistry::new();
        let key = LimiterKey::url("GET", "/orders");

        let first = registry.get_or_create_sliding_window(&key, Duration::from_secs(1), 1, 0);
        assert!(registry.remove(&key));
        assert!(!registry.remove(&key));

        // Recreated with new parameters after removal
        let second = registry.get_or_create_sliding_window(&key, Duration::from_secs(1), 7, 0);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.max_requests(), 7);

        registry.get_or_create_token_bucket(&LimiterKey::api_weight("CORE"), 1, 1, window_ms(10));
        registry.clear();
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.len_for(Dimension::Url), 0);
    }

    #[test]
    fn test_snapshot_by_dimension() {
        let registry = LimiterRegistry::new();
        let ip = registry.get_or_create_sliding_window(&LimiterKey::ip("10.0.0.1"), Duration::from_secs(60), 4, 0);
        ip.try_acquire();
        ip.try_acquire();
        registry.get_or_create_token_bucket(&LimiterKey::api_weight("CORE"), 10, 1, window_ms(1000));

        let all = registry.snapshot(None);
        assert_eq!(all.len(), 2);

        let ips = registry.snapshot(Some(Dimension::Ip));
        assert_eq!(ips.len(), 1);
        assert_eq!(ips[0].key, "ip:10.0.0.1");
        assert_eq!(ips[0].kind, LimiterKind::SlidingWindow);
        assert_eq!(ips[0].current, 2);
        assert_eq!(ips[0].utilization, 0.5);
    }

    fn window_ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }
}
