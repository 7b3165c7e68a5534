//! Runtime queue configuration.

use std::time::Duration;

use crate::config::{AdaptiveSettings, QueueSettings};

/// Per-call queuing parameters.
///
/// A key's queue takes `max_queue_size`, `max_concurrency` and
/// `priority_enabled` from the config it was created with. The wait and
/// fallback fields apply to each call individually.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub max_queue_size: usize,
    pub max_wait_time: Duration,
    /// Requests drained per processing pass
    pub max_concurrency: usize,
    pub priority_enabled: bool,
    pub fallback_enabled: bool,
    pub fallback_timeout: Duration,
}

impl QueueConfig {
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn with_max_wait_time(mut self, max_wait_time: Duration) -> Self {
        self.max_wait_time = max_wait_time;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_priority(mut self, enabled: bool) -> Self {
        self.priority_enabled = enabled;
        self
    }

    pub fn with_fallback(mut self, enabled: bool, timeout: Duration) -> Self {
        self.fallback_enabled = enabled;
        self.fallback_timeout = timeout;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from(&QueueSettings::default())
    }
}

impl From<&QueueSettings> for QueueConfig {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            max_queue_size: settings.max_queue_size,
            max_wait_time: Duration::from_millis(settings.max_wait_time_ms),
            max_concurrency: settings.max_concurrency,
            priority_enabled: settings.priority_enabled,
            fallback_enabled: settings.fallback_enabled,
            fallback_timeout: Duration::from_millis(settings.fallback_timeout_ms),
        }
    }
}

/// Engine-wide settings shared by every key.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Period of each key's scheduled processing tick
    pub process_interval: Duration,
    /// How long an insert may wait for the queue lock before it is rejected
    pub insert_timeout: Duration,
    pub adaptive: AdaptiveSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&QueueSettings::default())
    }
}

impl From<&QueueSettings> for EngineSettings {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            process_interval: Duration::from_millis(settings.process_interval_ms.max(1)),
            insert_timeout: Duration::from_millis(settings.insert_timeout_ms),
            adaptive: settings.adaptive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_settings() {
        let settings = QueueSettings {
            max_wait_time_ms: 250,
            fallback_timeout_ms: 40,
            ..QueueSettings::default()
        };
        let config = QueueConfig::from(&settings);
        assert_eq!(config.max_wait_time, Duration::from_millis(250));
        assert_eq!(config.fallback_timeout, Duration::from_millis(40));
        assert_eq!(config.max_queue_size, 100);

        let engine = EngineSettings::from(&settings);
        assert_eq!(engine.process_interval, Duration::from_millis(100));
        assert_eq!(engine.adaptive.high_watermark, 0.8);
    }
}
