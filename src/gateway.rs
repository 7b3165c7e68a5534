//! Gateway facade: classify, admit, queue.
//!
//! This is the surface the routing pipeline and the administrative layer
//! use. It owns the classifier, the admission orchestrator and the queue
//! engine, and keys each request's queue on its route.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::admission::{AdmissionOrchestrator, AdmissionRequest, AdmissionResult, AdmissionStats, CheckOrder, DimensionStats};
use crate::config::{RegistrySettings, TurnstileConfig};
use crate::error::{Result, TurnstileError};
use crate::queue::{EngineSettings, KeyQueueStats, ProcessingPolicy, QueueConfig, QueueEngine, QueueStats};
use crate::ratelimit::{Dimension, LimiterRegistry, LimiterSnapshot, Priority, PriorityClassifier};
use crate::work::{BoxWork, Work};

/// Admission layer for one gateway instance.
pub struct Gateway<T> {
    classifier: Arc<PriorityClassifier>,
    registry: Arc<LimiterRegistry>,
    orchestrator: Arc<AdmissionOrchestrator>,
    engine: QueueEngine<T>,
    queue_config: QueueConfig,
}

impl<T: Send + 'static> Gateway<T> {
    pub fn new(config: &TurnstileConfig) -> Result<Self> {
        config.validate()?;

        let classifier = Arc::new(PriorityClassifier::new(&config.priorities));
        let registry = Arc::new(LimiterRegistry::with_max_keys(config.registry.max_keys_per_dimension));
        let orchestrator = Arc::new(AdmissionOrchestrator::new(
            config.admission.clone(),
            registry.clone(),
            classifier.clone(),
        )?);
        let engine = QueueEngine::new(EngineSettings::from(&config.queue));

        info!(
            order = %orchestrator.order(),
            priority_rules = classifier.rule_count(),
            max_queue_size = config.queue.max_queue_size,
            "Gateway initialized"
        );

        Ok(Self {
            classifier,
            registry,
            orchestrator,
            engine,
            queue_config: QueueConfig::from(&config.queue),
        })
    }

    pub fn classify(&self, path: &str) -> Priority {
        self.classifier.classify(path)
    }

    /// Dimension checks only, no queuing.
    pub fn check_admission(&self, client_ip: &str, user_id: Option<&str>, method: &str, path: &str) -> AdmissionResult {
        self.orchestrator.check_admission(client_ip, user_id, method, path)
    }

    /// Run `work` for `request`, queuing it under its route if admission fails.
    pub async fn handle<W>(&self, request: &AdmissionRequest, work: W, fallback: Option<BoxWork<T>>) -> Result<T>
    where
        W: Work<T>,
    {
        self.handle_with(request, work, fallback, &self.queue_config).await
    }

    /// As [`Gateway::handle`] with explicit queue parameters.
    ///
    /// A full queue with no fallback surfaces as the admission rejection
    /// that sent the request to the queue.
    pub async fn handle_with<W>(
        &self,
        request: &AdmissionRequest,
        work: W,
        fallback: Option<BoxWork<T>>,
        config: &QueueConfig,
    ) -> Result<T>
    where
        W: Work<T>,
    {
        let priority = request
            .priority
            .unwrap_or_else(|| self.classifier.classify(&request.path));
        let request = AdmissionRequest {
            priority: Some(priority),
            ..request.clone()
        };
        let key = request.route();

        let mut rejection = None;
        let outcome = self
            .engine
            .admit_or_queue(
                &key,
                work,
                || match self.orchestrator.check(&request) {
                    AdmissionResult::Admitted => true,
                    rejected => {
                        rejection = Some(rejected);
                        false
                    }
                },
                config,
                priority.rank(),
                fallback,
            )
            .await;

        match outcome {
            Err(TurnstileError::QueueFull { key }) => {
                debug!(key, "Queue full, surfacing admission rejection");
                Err(rejection
                    .and_then(AdmissionResult::into_error)
                    .unwrap_or(TurnstileError::QueueFull { key }))
            }
            other => other,
        }
    }

    /// Queue key a request is parked under.
    pub fn queue_key(request: &AdmissionRequest) -> String {
        request.route()
    }

    pub fn queue_config(&self) -> &QueueConfig {
        &self.queue_config
    }

    pub fn check_order(&self) -> Arc<CheckOrder> {
        self.orchestrator.order()
    }

    /// Replace the check order. Returns the new order version.
    pub fn set_check_order(&self, dimensions: Vec<Dimension>) -> Result<u64> {
        self.orchestrator.set_order(dimensions)
    }

    pub fn set_check_order_str(&self, order: &str) -> Result<u64> {
        self.orchestrator.set_order_str(order)
    }

    pub fn set_admission_enabled(&self, enabled: bool) {
        self.orchestrator.set_enabled(enabled);
    }

    pub fn set_dimension_enabled(&self, dimension: Dimension, enabled: bool) {
        self.orchestrator.set_dimension_enabled(dimension, enabled);
    }

    pub fn dimension_stats(&self, dimension: Dimension) -> DimensionStats {
        self.orchestrator.dimension_stats(dimension)
    }

    pub fn admission_stats(&self) -> AdmissionStats {
        self.orchestrator.stats()
    }

    /// Per-limiter utilization and rejection rates, optionally for one dimension.
    pub fn limiter_stats(&self, dimension: Option<Dimension>) -> Vec<LimiterSnapshot> {
        self.registry.snapshot(dimension)
    }

    pub fn clear_queue(&self, key: &str) -> usize {
        self.engine.clear_key(key)
    }

    pub fn process_queue(&self, key: &str, policy: ProcessingPolicy) -> usize {
        self.engine.process(key, policy)
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.engine.stats()
    }

    pub fn key_queue_stats(&self, key: &str) -> KeyQueueStats {
        self.engine.key_stats(key)
    }

    pub fn registry(&self) -> &Arc<LimiterRegistry> {
        &self.registry
    }

    /// Clear every queue. Returns how many waiting requests were failed.
    pub fn shutdown(&self) -> usize {
        self.engine.shutdown()
    }
}

/// Periodically evict limiters idle for longer than the configured TTL.
///
/// Returns `None` when idle eviction is disabled.
pub fn spawn_idle_sweeper(registry: Arc<LimiterRegistry>, settings: &RegistrySettings) -> Option<JoinHandle<()>> {
    let ttl = Duration::from_secs(settings.idle_ttl_secs?);
    let period = Duration::from_secs(settings.sweep_interval_secs.max(1));

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let evicted = registry.evict_idle(ttl);
            if evicted > 0 {
                debug!(evicted, remaining = registry.len(), "Swept idle limiters");
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DimensionLimit;
    use crate::error::BoxError;
    use crate::queue::TieredFallback;
    use futures::future::join_all;
    use tokio_test::{assert_err, assert_ok};

    fn ip_only_config(qps: u64, burst: u64) -> TurnstileConfig {
        let mut config = TurnstileConfig::default();
        config.admission.order = vec![Dimension::Ip];
        config.admission.ip = DimensionLimit::new(qps, burst);
        config.admission.user.enabled = false;
        config.admission.url.enabled = false;
        config.admission.api_weight.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_burst_of_150_admits_80() {
        let gateway: Gateway<()> = Gateway::new(&ip_only_config(30, 50)).unwrap();

        let results: Vec<AdmissionResult> = (0..150)
            .map(|_| gateway.check_admission("10.0.0.1", None, "GET", "/api/orders"))
            .collect();

        let admitted = results.iter().filter(|r| r.is_admitted()).count();
        assert_eq!(admitted, 80);
        assert_eq!(results.len() - admitted, 70);
        assert!(results[80..]
            .iter()
            .all(|r| matches!(r, AdmissionResult::Rejected { dimension: Dimension::Ip, .. })));

        let stats = gateway.dimension_stats(Dimension::Ip);
        assert_eq!(stats.checks, 150);
        assert_eq!(stats.rejections, 70);
    }

    #[tokio::test]
    async fn test_concurrent_handle_without_queue_room() {
        let mut config = ip_only_config(30, 50);
        config.queue.max_queue_size = 0;
        let gateway: Arc<Gateway<u32>> = Arc::new(Gateway::new(&config).unwrap());

        let calls = (0..150).map(|i| {
            let gateway = gateway.clone();
            async move {
                let request = AdmissionRequest::new("10.0.0.9", "GET", "/api/items");
                gateway.handle(&request, move || async move { Ok(i) }, None).await
            }
        });
        let results = join_all(calls).await;

        let admitted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 80);
        for result in results.into_iter().filter(|r| r.is_err()) {
            let err = assert_err!(result);
            assert!(matches!(
                err,
                TurnstileError::RateLimitExceeded { dimension: Dimension::Ip, ref identifier } if identifier == "10.0.0.9"
            ));
            assert!(err.is_rejection());
        }
        assert_eq!(gateway.queue_stats().rejected, 70);
    }

    #[tokio::test]
    async fn test_full_queue_uses_tiered_fallback() {
        let mut config = ip_only_config(1, 0);
        config.queue.max_queue_size = 0;
        let gateway: Gateway<&'static str> = Gateway::new(&config).unwrap();
        let request = AdmissionRequest::new("10.0.0.2", "GET", "/api/quote");
        let key = Gateway::<&'static str>::queue_key(&request);
        let chain = TieredFallback::new()
            .tier("cache", 0, || async { Ok::<_, BoxError>("cached") })
            .tier("static", 4, || async { Ok::<_, BoxError>("static") });

        let first = gateway
            .handle(&request, || async { Ok("fresh") }, Some(chain.work_for(&key)))
            .await;
        assert_eq!(assert_ok!(first), "fresh");

        let second = gateway
            .handle(&request, || async { Ok("fresh") }, Some(chain.work_for(&key)))
            .await;
        assert_eq!(assert_ok!(second), "static");
        assert_eq!(gateway.queue_stats().fallback_invoked, 1);
    }

    #[tokio::test]
    async fn test_exhausted_fallback_is_a_rejection() {
        let mut config = ip_only_config(1, 0);
        config.queue.max_queue_size = 0;
        let gateway: Gateway<u8> = Gateway::new(&config).unwrap();
        let request = AdmissionRequest::new("10.0.0.3", "GET", "/api/quote");
        let chain = TieredFallback::new().tier("none", 0, || async { Ok::<_, BoxError>(0u8) });

        assert_ok!(gateway.handle(&request, || async { Ok(1) }, None).await);
        let err = gateway
            .handle(&request, || async { Ok(1) }, Some(chain.work_for("GET /api/quote")))
            .await;
        let err = assert_err!(err);
        assert!(matches!(err, TurnstileError::FallbackExhausted { tiers: 1, .. }));
        assert!(err.is_rejection());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_request_waits_in_queue() {
        let gateway: Arc<Gateway<u32>> = Arc::new(Gateway::new(&ip_only_config(1, 0)).unwrap());
        let request = AdmissionRequest::new("10.0.0.4", "post", "/api/orders");

        assert_ok!(gateway.handle(&request, || async { Ok(1) }, None).await);

        let waiter = tokio::spawn({
            let gateway = gateway.clone();
            let request = request.clone();
            async move { gateway.handle(&request, || async { Ok(2) }, None).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let key = Gateway::<u32>::queue_key(&request);
        assert_eq!(key, "POST /api/orders");
        assert_eq!(gateway.key_queue_stats(&key).depth, 1);

        assert_eq!(gateway.process_queue(&key, ProcessingPolicy::Immediate), 1);
        assert_eq!(assert_ok!(waiter.await.unwrap()), 2);
        assert_eq!(gateway.queue_stats().processed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_priority_jumps_the_queue() {
        let gateway: Arc<Gateway<&'static str>> = Arc::new(Gateway::new(&ip_only_config(1, 0)).unwrap());
        let request = AdmissionRequest::new("10.0.0.8", "GET", "/api/mixed");
        assert_ok!(gateway.handle(&request, || async { Ok("first") }, None).await);

        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut waiters = Vec::new();
        for (label, request) in [
            ("default", request.clone()),
            ("core", request.clone().with_priority(Priority::Core)),
        ] {
            let gateway = gateway.clone();
            let order = order.clone();
            waiters.push(tokio::spawn(async move {
                gateway
                    .handle(
                        &request,
                        move || async move {
                            order.lock().push(label);
                            Ok(label)
                        },
                        None,
                    )
                    .await
            }));
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        }

        let key = Gateway::<&'static str>::queue_key(&request);
        assert_eq!(gateway.key_queue_stats(&key).depth, 2);

        assert_eq!(gateway.process_queue(&key, ProcessingPolicy::Batch(1)), 1);
        assert_eq!(gateway.process_queue(&key, ProcessingPolicy::Batch(1)), 1);
        for waiter in waiters {
            assert_ok!(waiter.await.unwrap());
        }
        assert_eq!(*order.lock(), vec!["core", "default"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_queue_cancels_waiters() {
        let gateway: Arc<Gateway<u32>> = Arc::new(Gateway::new(&ip_only_config(1, 0)).unwrap());
        let request = AdmissionRequest::new("10.0.0.5", "GET", "/api/slow");
        assert_ok!(gateway.handle(&request, || async { Ok(1) }, None).await);

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let gateway = gateway.clone();
                let request = request.clone();
                tokio::spawn(async move { gateway.handle(&request, || async { Ok(2) }, None).await })
            })
            .collect();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert_eq!(gateway.clear_queue("GET /api/slow"), 3);
        for waiter in join_all(waiters).await {
            assert!(waiter.unwrap().unwrap_err().is_cleared());
        }
        assert!(!gateway.key_queue_stats("GET /api/slow").processor_active);
    }

    #[tokio::test]
    async fn test_admin_order_and_stats() {
        let gateway: Gateway<()> = Gateway::new(&TurnstileConfig::default()).unwrap();
        assert_eq!(gateway.check_order().to_string(), "IP,USER,URL,API_WEIGHT");

        let version = gateway.set_check_order_str("url, ip").unwrap();
        assert_eq!(version, gateway.check_order().version());
        assert_eq!(gateway.check_order().dimensions(), &[Dimension::Url, Dimension::Ip]);
        assert!(gateway.set_check_order(vec![]).is_err());

        gateway.set_dimension_enabled(Dimension::Ip, false);
        assert!(gateway
            .check_admission("10.0.0.6", None, "GET", "/api/x")
            .is_admitted());

        let stats = gateway.admission_stats();
        assert!(stats.enabled);
        assert_eq!(gateway.dimension_stats(Dimension::Ip).checks, 0);
        assert_eq!(gateway.dimension_stats(Dimension::Url).checks, 1);
        assert_eq!(gateway.limiter_stats(Some(Dimension::Url)).len(), 1);
        assert!(gateway.limiter_stats(Some(Dimension::Ip)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweeper_evicts() {
        let gateway: Gateway<()> = Gateway::new(&ip_only_config(10, 0)).unwrap();
        gateway.check_admission("10.0.0.7", None, "GET", "/");
        assert_eq!(gateway.registry().len(), 1);

        let settings = RegistrySettings {
            max_keys_per_dimension: None,
            idle_ttl_secs: Some(5),
            sweep_interval_secs: 1,
        };
        let sweeper = spawn_idle_sweeper(gateway.registry().clone(), &settings).unwrap();
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(gateway.registry().is_empty());
        sweeper.abort();

        let disabled = RegistrySettings {
            idle_ttl_secs: None,
            ..settings
        };
        assert!(spawn_idle_sweeper(gateway.registry().clone(), &disabled).is_none());
    }
}
