//! Processing policies for draining a key's queue.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::config::QueueConfig;
use crate::config::AdaptiveSettings;

/// How much of a queue one processing pass may drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", content = "size", rename_all = "snake_case")]
pub enum ProcessingPolicy {
    /// The recurring tick: up to `max_concurrency`
    Scheduled,
    /// One extra pass now: up to `max_concurrency`
    Immediate,
    /// Up to `min(n, max_concurrency)`
    Batch(usize),
    /// Budget follows queue depth relative to capacity
    Adaptive,
}

impl ProcessingPolicy {
    /// Number of requests a pass may dispatch.
    pub fn budget(&self, config: &QueueConfig, depth: usize, adaptive: &AdaptiveSettings) -> usize {
        let base = config.max_concurrency.max(1);
        match self {
            ProcessingPolicy::Scheduled | ProcessingPolicy::Immediate => base,
            ProcessingPolicy::Batch(size) => (*size).min(base),
            ProcessingPolicy::Adaptive => {
                adaptive_budget(base, depth, config.max_queue_size, adaptive)
            }
        }
    }
}

impl fmt::Display for ProcessingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingPolicy::Scheduled => f.write_str("scheduled"),
            ProcessingPolicy::Immediate => f.write_str("immediate"),
            ProcessingPolicy::Batch(size) => write!(f, "batch({})", size),
            ProcessingPolicy::Adaptive => f.write_str("adaptive"),
        }
    }
}

/// Above the high watermark the batch is accelerated, between the
/// watermarks it is the normal batch, below the low watermark it is reduced
/// (never below one).
fn adaptive_budget(base: usize, depth: usize, capacity: usize, thresholds: &AdaptiveSettings) -> usize {
    let ratio = if capacity == 0 {
        if depth > 0 {
            1.0
        } else {
            0.0
        }
    } else {
        depth as f64 / capacity as f64
    };

    if ratio > thresholds.high_watermark {
        base.saturating_mul(thresholds.accelerate_factor.max(1))
    } else if ratio >= thresholds.low_watermark {
        base
    } else {
        (base / thresholds.reduce_divisor.max(1)).max(1)
    }
}
