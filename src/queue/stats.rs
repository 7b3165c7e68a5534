//! Queue engine statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lifetime counters. All monotonic.
#[derive(Debug, Default)]
pub(crate) struct QueueCounters {
    pub queued: AtomicU64,
    pub processed: AtomicU64,
    pub rejected: AtomicU64,
    pub timed_out: AtomicU64,
    pub fallback_invoked: AtomicU64,
    pub cleared: AtomicU64,
}

impl QueueCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Aggregate view over every key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Requests that entered a queue
    pub queued: u64,
    /// Dequeued requests whose work finished, successfully or not
    pub processed: u64,
    /// Requests turned away because the queue was full and no fallback ran
    pub rejected: u64,
    pub timed_out: u64,
    pub fallback_invoked: u64,
    /// Requests settled by a queue clear
    pub cleared: u64,
    pub active_queues: usize,
    pub active_processors: usize,
    /// Requests currently waiting across all keys
    pub total_depth: usize,
}

/// View of a single key's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyQueueStats {
    pub key: String,
    pub depth: usize,
    pub processor_active: bool,
}

impl QueueStats {
    pub(crate) fn from_counters(counters: &QueueCounters) -> Self {
        Self {
            queued: counters.queued.load(Ordering::Relaxed),
            processed: counters.processed.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            timed_out: counters.timed_out.load(Ordering::Relaxed),
            fallback_invoked: counters.fallback_invoked.load(Ordering::Relaxed),
            cleared: counters.cleared.load(Ordering::Relaxed),
            ..Self::default()
        }
    }
}
