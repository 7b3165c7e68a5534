//! Route priority rules and classification.
//!
//! Routes are mapped to a coarse business priority with an exact-match table
//! and a prefix table. The classifier is built once at startup and shared
//! read-only afterwards.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Result, TurnstileError};

/// Business priority of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    /// Revenue-critical traffic
    #[serde(alias = "core")]
    Core,
    /// Key-handling and signing traffic
    #[serde(alias = "crypto")]
    Crypto,
    /// Regular business traffic
    #[serde(alias = "normal")]
    Normal,
    /// Everything else
    #[serde(alias = "non_core")]
    NonCore,
}

impl Priority {
    /// Queue rank, 0 is served first.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Core => 0,
            Priority::Crypto => 1,
            Priority::Normal => 2,
            Priority::NonCore => 3,
        }
    }

    /// The class name used in `api_weight` limiter keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Core => "CORE",
            Priority::Crypto => "CRYPTO",
            Priority::Normal => "NORMAL",
            Priority::NonCore => "NON_CORE",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NonCore
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Route-to-priority rules as loaded from configuration.
///
/// ```yaml
/// exact:
///   /api/orders/submit: CORE
/// prefixes:
///   /api/orders: NORMAL
///   /api/keys: CRYPTO
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriorityRules {
    /// Paths matched exactly
    #[serde(default)]
    pub exact: HashMap<String, Priority>,
    /// Path prefixes; the longest registered prefix wins
    #[serde(default)]
    pub prefixes: HashMap<String, Priority>,
}

impl PriorityRules {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse priority rules: {}", e)))
    }

    pub fn with_exact(mut self, path: impl Into<String>, priority: Priority) -> Self {
        self.exact.insert(path.into(), priority);
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>, priority: Priority) -> Self {
        self.prefixes.insert(prefix.into(), priority);
        self
    }
}

/// Maps a request path to its [`Priority`].
///
/// Exact match first, then the longest registered prefix, then `NON_CORE`.
#[derive(Debug, Clone, Default)]
pub struct PriorityClassifier {
    exact: HashMap<String, Priority>,
    /// Sorted by prefix length, longest first
    prefixes: Vec<(String, Priority)>,
}

impl PriorityClassifier {
    pub fn new(rules: &PriorityRules) -> Self {
        let mut prefixes: Vec<(String, Priority)> = rules
            .prefixes
            .iter()
            .map(|(p, priority)| (p.clone(), *priority))
            .collect();
        // Ties on length are broken lexically so classification is deterministic.
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        Self {
            exact: rules.exact.clone(),
            prefixes,
        }
    }

    /// Classify a request path.
    pub fn classify(&self, path: &str) -> Priority {
        if let Some(priority) = self.exact.get(path) {
            trace!(path, priority = %priority, "Exact priority match");
            return *priority;
        }

        let priority = self
            .prefixes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, priority)| *priority)
            .unwrap_or_default();

        trace!(path, priority = %priority, "Prefix priority match");
        priority
    }

    /// Number of registered rules.
    pub fn rule_count(&self) -> usize {
        self.exact.len() + self.prefixes.len()
    }
}
