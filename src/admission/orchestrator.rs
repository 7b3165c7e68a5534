//! Core admission orchestrator.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, trace};

use super::order::CheckOrder;
use super::request::{AdmissionRequest, AdmissionResult};
use crate::config::{AdmissionConfig, PriorityQuota};
use crate::error::Result;
use crate::ratelimit::{Dimension, LimiterKey, LimiterRegistry, PriorityClassifier};

/// Quota applied to a priority class with no configured entry.
pub const DEFAULT_PRIORITY_QUOTA: PriorityQuota = PriorityQuota {
    qps: 10,
    burst: 0,
    weight: 1,
};

#[derive(Debug, Default)]
struct DimensionCounters {
    checks: AtomicU64,
    rejections: AtomicU64,
}

/// Counters for one dimension.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DimensionStats {
    pub dimension: Dimension,
    pub enabled: bool,
    pub checks: u64,
    pub rejections: u64,
}

/// Orchestrator state as seen by the administrative layer.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStats {
    pub enabled: bool,
    pub order: CheckOrder,
    pub dimensions: Vec<DimensionStats>,
}

/// Applies the configured dimension checks to each request.
///
/// Dimensions are evaluated in the configured order and evaluation stops at
/// the first rejection, so only that dimension's rejection counter moves.
/// A dimension is skipped when it is disabled or has no identifier for the
/// request (anonymous traffic on the user dimension).
pub struct AdmissionOrchestrator {
    config: AdmissionConfig,
    registry: Arc<LimiterRegistry>,
    classifier: Arc<PriorityClassifier>,
    order: RwLock<Arc<CheckOrder>>,
    enabled: AtomicBool,
    dimension_enabled: [AtomicBool; 4],
    counters: [DimensionCounters; 4],
}

impl AdmissionOrchestrator {
    /// Create an orchestrator. The check order is taken from `config.order`.
    pub fn new(
        config: AdmissionConfig,
        registry: Arc<LimiterRegistry>,
        classifier: Arc<PriorityClassifier>,
    ) -> Result<Self> {
        let order = CheckOrder::new(config.order.clone())?;
        let dimension_enabled = Dimension::ALL.map(|d| AtomicBool::new(config.dimension_enabled(d)));

        Ok(Self {
            enabled: AtomicBool::new(config.enabled),
            config,
            registry,
            classifier,
            order: RwLock::new(Arc::new(order)),
            dimension_enabled,
            counters: Default::default(),
        })
    }

    /// Run the configured dimension checks for a request.
    pub fn check(&self, request: &AdmissionRequest) -> AdmissionResult {
        if !self.enabled.load(Ordering::Relaxed) {
            return AdmissionResult::Admitted;
        }

        let order = self.order();
        for &dimension in order.dimensions() {
            if !self.is_dimension_enabled(dimension) {
                continue;
            }

            let Some(key) = self.key_for(dimension, request) else {
                continue;
            };

            let counters = &self.counters[dimension.index()];
            counters.checks.fetch_add(1, Ordering::Relaxed);

            if !self.try_acquire(&key, request) {
                counters.rejections.fetch_add(1, Ordering::Relaxed);
                debug!(
                    key = %key,
                    order_version = order.version(),
                    "Admission rejected"
                );
                return AdmissionResult::Rejected {
                    dimension,
                    identifier: key.identifier,
                };
            }
        }

        trace!(route = %request.route(), client_ip = %request.client_ip, "Admission granted");
        AdmissionResult::Admitted
    }

    /// Convenience form of [`check`](Self::check) for the raw request attributes.
    pub fn check_admission(
        &self,
        client_ip: &str,
        user_id: Option<&str>,
        method: &str,
        path: &str,
    ) -> AdmissionResult {
        let mut request = AdmissionRequest::new(client_ip, method, path);
        request.user_id = user_id.map(str::to_string);
        self.check(&request)
    }

    /// The current order snapshot.
    pub fn order(&self) -> Arc<CheckOrder> {
        self.order.read().clone()
    }

    /// Replace the check order. Returns the new version.
    pub fn set_order(&self, dimensions: Vec<Dimension>) -> Result<u64> {
        let mut current = self.order.write();
        let next = current.succeeded_by(dimensions)?;
        let version = next.version();
        info!(order = %next, version, "Admission check order updated");
        *current = Arc::new(next);
        Ok(version)
    }

    /// Replace the check order from a string such as `"URL,IP"`.
    pub fn set_order_str(&self, order: &str) -> Result<u64> {
        let parsed: CheckOrder = order.parse()?;
        self.set_order(parsed.dimensions().to_vec())
    }

    /// Global switch; a disabled orchestrator admits everything.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        info!(enabled, "Admission orchestrator toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_dimension_enabled(&self, dimension: Dimension, enabled: bool) {
        self.dimension_enabled[dimension.index()].store(enabled, Ordering::Relaxed);
        info!(dimension = %dimension, enabled, "Admission dimension toggled");
    }

    pub fn is_dimension_enabled(&self, dimension: Dimension) -> bool {
        self.dimension_enabled[dimension.index()].load(Ordering::Relaxed)
    }

    /// Counters for one dimension.
    pub fn dimension_stats(&self, dimension: Dimension) -> DimensionStats {
        let counters = &self.counters[dimension.index()];
        DimensionStats {
            dimension,
            enabled: self.is_dimension_enabled(dimension),
            checks: counters.checks.load(Ordering::Relaxed),
            rejections: counters.rejections.load(Ordering::Relaxed),
        }
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            enabled: self.is_enabled(),
            order: self.order().as_ref().clone(),
            dimensions: Dimension::ALL.iter().map(|&d| self.dimension_stats(d)).collect(),
        }
    }

    pub fn registry(&self) -> &Arc<LimiterRegistry> {
        &self.registry
    }

    /// Quota used for a priority class, falling back to the default.
    pub fn priority_quota(&self, class: crate::ratelimit::Priority) -> PriorityQuota {
        self.config
            .api_weight
            .classes
            .get(&class)
            .copied()
            .unwrap_or(DEFAULT_PRIORITY_QUOTA)
    }

    fn key_for(&self, dimension: Dimension, request: &AdmissionRequest) -> Option<LimiterKey> {
        match dimension {
            Dimension::Ip => Some(LimiterKey::ip(&request.client_ip)),
            Dimension::User => request
                .user_id
                .as_deref()
                .filter(|user| !user.is_empty())
                .map(LimiterKey::user),
            Dimension::Url => Some(LimiterKey::url(&request.method, &request.path)),
            Dimension::ApiWeight => {
                let priority = request
                    .priority
                    .unwrap_or_else(|| self.classifier.classify(&request.path));
                Some(LimiterKey::api_weight(priority.as_str()))
            }
        }
    }

    fn try_acquire(&self, key: &LimiterKey, request: &AdmissionRequest) -> bool {
        match self.config.limit_for(key.dimension) {
            Some(limit) => self
                .registry
                .get_or_create_sliding_window(
                    key,
                    Duration::from_secs(limit.window_secs.max(1)),
                    limit.qps,
                    limit.burst,
                )
                .try_acquire(),
            None => {
                let priority = request
                    .priority
                    .unwrap_or_else(|| self.classifier.classify(&request.path));
                let quota = self.priority_quota(priority);
                self.registry
                    .get_or_create_token_bucket(
                        key,
                        quota.qps.saturating_add(quota.burst),
                        quota.qps,
                        Duration::from_millis(self.config.api_weight.refill_interval_ms.max(1)),
                    )
                    .try_acquire(quota.weight)
            }
        }
    }
}
