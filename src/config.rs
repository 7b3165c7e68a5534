//! Configuration management for Turnstile.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{Dimension, Priority, PriorityRules};

/// Main configuration for the Turnstile admission layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Dimension limits and check order
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Queuing behaviour for requests that fail admission
    #[serde(default)]
    pub queue: QueueSettings,

    /// Limiter registry bounds
    #[serde(default)]
    pub registry: RegistrySettings,

    /// Route to priority rules
    #[serde(default)]
    pub priorities: PriorityRules,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TurnstileConfig {
    /// Load configuration from an optional file plus `TURNSTILE_` environment overrides.
    ///
    /// Nested fields are separated by a double underscore, e.g.
    /// `TURNSTILE_QUEUE__MAX_QUEUE_SIZE=500`. Priority rules are only read
    /// from the file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        let mut priorities = None;
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path));
            priorities = Some(file_priorities(path)?);
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("TURNSTILE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("admission.order"),
            )
            .build()?;

        let mut config: TurnstileConfig = settings.try_deserialize()?;
        // The layered loader folds map keys to lowercase; route paths are case-sensitive.
        if let Some(priorities) = priorities {
            config.priorities = priorities;
        }
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot be run.
    pub fn validate(&self) -> Result<()> {
        validate_order(&self.admission.order)?;

        for (dimension, limit) in [
            (Dimension::Ip, &self.admission.ip),
            (Dimension::User, &self.admission.user),
            (Dimension::Url, &self.admission.url),
        ] {
            if limit.window_secs == 0 {
                return Err(TurnstileError::Config(format!(
                    "{} window_secs must be greater than zero",
                    dimension
                )));
            }
        }

        if self.admission.api_weight.refill_interval_ms == 0 {
            return Err(TurnstileError::Config(
                "api_weight refill_interval_ms must be greater than zero".to_string(),
            ));
        }

        let queue = &self.queue;
        if queue.max_concurrency == 0 {
            return Err(TurnstileError::Config(
                "queue max_concurrency must be greater than zero".to_string(),
            ));
        }
        if queue.process_interval_ms == 0 {
            return Err(TurnstileError::Config(
                "queue process_interval_ms must be greater than zero".to_string(),
            ));
        }
        let adaptive = &queue.adaptive;
        if !(0.0..=1.0).contains(&adaptive.low_watermark)
            || !(0.0..=1.0).contains(&adaptive.high_watermark)
            || adaptive.low_watermark > adaptive.high_watermark
        {
            return Err(TurnstileError::Config(format!(
                "adaptive watermarks must satisfy 0 <= low ({}) <= high ({}) <= 1",
                adaptive.low_watermark, adaptive.high_watermark
            )));
        }

        Ok(())
    }
}

/// Check that a dimension order is non-empty and has no repeats.
pub(crate) fn validate_order(order: &[Dimension]) -> Result<()> {
    if order.is_empty() {
        return Err(TurnstileError::Config(
            "admission order must name at least one dimension".to_string(),
        ));
    }
    for (i, dimension) in order.iter().enumerate() {
        if order[..i].contains(dimension) {
            return Err(TurnstileError::Config(format!(
                "admission order lists {} more than once",
                dimension
            )));
        }
    }
    Ok(())
}

/// Admission orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Global switch; when false every request is admitted
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Order in which dimensions are checked
    #[serde(default = "default_order")]
    pub order: Vec<Dimension>,

    /// Per client IP
    #[serde(default = "default_ip_limit")]
    pub ip: DimensionLimit,

    /// Per resolved user
    #[serde(default = "default_user_limit")]
    pub user: DimensionLimit,

    /// Per method + path
    #[serde(default = "default_url_limit")]
    pub url: DimensionLimit,

    /// Per priority class
    #[serde(default)]
    pub api_weight: ApiWeightConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            order: default_order(),
            ip: default_ip_limit(),
            user: default_user_limit(),
            url: default_url_limit(),
            api_weight: ApiWeightConfig::default(),
        }
    }
}

impl AdmissionConfig {
    /// The window-based limit for a dimension. `ApiWeight` has none.
    pub fn limit_for(&self, dimension: Dimension) -> Option<&DimensionLimit> {
        match dimension {
            Dimension::Ip => Some(&self.ip),
            Dimension::User => Some(&self.user),
            Dimension::Url => Some(&self.url),
            Dimension::ApiWeight => None,
        }
    }

    /// Whether a dimension is enabled in configuration.
    pub fn dimension_enabled(&self, dimension: Dimension) -> bool {
        match self.limit_for(dimension) {
            Some(limit) => limit.enabled,
            None => self.api_weight.enabled,
        }
    }
}

/// Quota for one window-based dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionLimit {
    /// Steady-state admissions per window
    pub qps: u64,

    /// Extra admissions allowed on top of `qps`
    #[serde(default)]
    pub burst: u64,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl DimensionLimit {
    pub fn new(qps: u64, burst: u64) -> Self {
        Self {
            qps,
            burst,
            enabled: true,
            window_secs: default_window_secs(),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Quota for one priority class in the API-weight dimension.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityQuota {
    /// Tokens refilled per interval
    pub qps: u64,

    /// Bucket headroom above `qps`
    #[serde(default)]
    pub burst: u64,

    /// Tokens a single request of this class consumes
    #[serde(default = "default_weight")]
    pub weight: u64,
}

/// API-weight dimension configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiWeightConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Refill interval of each class bucket in milliseconds
    #[serde(default = "default_refill_interval_ms")]
    pub refill_interval_ms: u64,

    /// Quota per priority class
    #[serde(default = "default_classes")]
    pub classes: HashMap<Priority, PriorityQuota>,
}

impl Default for ApiWeightConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            refill_interval_ms: default_refill_interval_ms(),
            classes: default_classes(),
        }
    }
}

/// Queue configuration as it appears in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    #[serde(default = "default_max_wait_time_ms")]
    pub max_wait_time_ms: u64,

    /// Requests drained per processing pass
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_true")]
    pub priority_enabled: bool,

    #[serde(default = "default_true")]
    pub fallback_enabled: bool,

    #[serde(default = "default_fallback_timeout_ms")]
    pub fallback_timeout_ms: u64,

    /// Period of the scheduled processing tick
    #[serde(default = "default_process_interval_ms")]
    pub process_interval_ms: u64,

    /// Bound on waiting for the queue lock when inserting
    #[serde(default = "default_insert_timeout_ms")]
    pub insert_timeout_ms: u64,

    #[serde(default)]
    pub adaptive: AdaptiveSettings,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            max_wait_time_ms: default_max_wait_time_ms(),
            max_concurrency: default_max_concurrency(),
            priority_enabled: true,
            fallback_enabled: true,
            fallback_timeout_ms: default_fallback_timeout_ms(),
            process_interval_ms: default_process_interval_ms(),
            insert_timeout_ms: default_insert_timeout_ms(),
            adaptive: AdaptiveSettings::default(),
        }
    }
}

/// Thresholds for the adaptive processing policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveSettings {
    /// Depth ratio above which batches are accelerated
    #[serde(default = "default_high_watermark")]
    pub high_watermark: f64,

    /// Depth ratio below which batches are reduced
    #[serde(default = "default_low_watermark")]
    pub low_watermark: f64,

    #[serde(default = "default_accelerate_factor")]
    pub accelerate_factor: usize,

    #[serde(default = "default_reduce_divisor")]
    pub reduce_divisor: usize,
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        Self {
            high_watermark: default_high_watermark(),
            low_watermark: default_low_watermark(),
            accelerate_factor: default_accelerate_factor(),
            reduce_divisor: default_reduce_divisor(),
        }
    }
}

/// Limiter registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Cap on limiters per dimension; least recently used are evicted past it
    #[serde(default)]
    pub max_keys_per_dimension: Option<usize>,

    /// Limiters idle for longer than this are evicted by the sweeper
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: Option<u64>,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_keys_per_dimension: None,
            idle_ttl_secs: default_idle_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_order() -> Vec<Dimension> {
    Dimension::ALL.to_vec()
}

fn default_window_secs() -> u64 {
    1
}

fn default_ip_limit() -> DimensionLimit {
    DimensionLimit::new(100, 50)
}

fn default_user_limit() -> DimensionLimit {
    DimensionLimit::new(50, 20)
}

fn default_url_limit() -> DimensionLimit {
    DimensionLimit::new(200, 100)
}

fn default_weight() -> u64 {
    1
}

fn default_refill_interval_ms() -> u64 {
    1000
}

fn default_classes() -> HashMap<Priority, PriorityQuota> {
    HashMap::from([
        (Priority::Core, PriorityQuota { qps: 500, burst: 200, weight: 1 }),
        (Priority::Crypto, PriorityQuota { qps: 100, burst: 50, weight: 2 }),
        (Priority::Normal, PriorityQuota { qps: 200, burst: 100, weight: 1 }),
        (Priority::NonCore, PriorityQuota { qps: 50, burst: 20, weight: 1 }),
    ])
}

fn default_max_queue_size() -> usize {
    100
}

fn default_max_wait_time_ms() -> u64 {
    5000
}

fn default_max_concurrency() -> usize {
    10
}

fn default_fallback_timeout_ms() -> u64 {
    1000
}

fn default_process_interval_ms() -> u64 {
    100
}

fn default_insert_timeout_ms() -> u64 {
    10
}

fn default_high_watermark() -> f64 {
    0.8
}

fn default_low_watermark() -> f64 {
    0.5
}

fn default_accelerate_factor() -> usize {
    2
}

fn default_reduce_divisor() -> usize {
    2
}

fn default_idle_ttl_secs() -> Option<u64> {
    Some(600)
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Read the `priorities` section of a YAML file with its keys untouched.
fn file_priorities(path: &Path) -> Result<PriorityRules> {
    #[derive(Deserialize)]
    struct RouteSection {
        #[serde(default)]
        priorities: PriorityRules,
    }

    let contents = std::fs::read_to_string(path)?;
    let section: RouteSection =
        serde_yaml::from_str(&contents).map_err(|e| TurnstileError::Config(e.to_string()))?;
    Ok(section.priorities)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TurnstileConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.admission.order, Dimension::ALL.to_vec());
        assert_eq!(config.queue.process_interval_ms, 100);
        assert_eq!(config.admission.api_weight.classes.len(), 4);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
admission:
  order: [URL, IP]
  ip:
    qps: 30
    burst: 50
  api_weight:
    classes:
      CORE:
        qps: 5
        weight: 2
queue:
  max_queue_size: 8
  fallback_enabled: false
priorities:
  prefixes:
    /api/orders: CORE
logging:
  format: json
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.admission.order, vec![Dimension::Url, Dimension::Ip]);
        assert_eq!(config.admission.ip.qps, 30);
        assert_eq!(config.admission.ip.burst, 50);
        assert_eq!(config.admission.ip.window_secs, 1);
        assert!(config.admission.ip.enabled);
        // Unspecified dimensions keep their defaults
        assert_eq!(config.admission.user.qps, 50);

        let core = config.admission.api_weight.classes[&Priority::Core];
        assert_eq!(core, PriorityQuota { qps: 5, burst: 0, weight: 2 });
        assert_eq!(config.admission.api_weight.classes.len(), 1);

        assert_eq!(config.queue.max_queue_size, 8);
        assert!(!config.queue.fallback_enabled);
        assert_eq!(config.queue.max_concurrency, 10);
        assert_eq!(config.priorities.prefixes.len(), 1);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_duplicate_order_rejected() {
        let yaml = r#"
admission:
  order: [IP, URL, IP]
"#;
        assert!(TurnstileConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_empty_order_rejected() {
        assert!(validate_order(&[]).is_err());
        assert!(validate_order(&[Dimension::User]).is_ok());
    }

    #[test]
    fn test_bad_watermarks_rejected() {
        let mut config = TurnstileConfig::default();
        config.queue.adaptive.low_watermark = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = TurnstileConfig::default();
        config.admission.url.window_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = TurnstileConfig::load(None).unwrap();
        assert_eq!(config.queue.max_queue_size, 100);
    }

    #[test]
    fn test_load_keeps_route_case() {
        let yaml = r#"
queue:
  max_queue_size: 12
priorities:
  exact:
    /api/Orders/Submit: CORE
  prefixes:
    /api/Keys/: CRYPTO
"#;
        let path = std::env::temp_dir().join(format!("turnstile-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, yaml).unwrap();
        let loaded = TurnstileConfig::load(Some(&path));
        std::fs::remove_file(&path).unwrap();
        let config = loaded.unwrap();

        assert_eq!(config.queue.max_queue_size, 12);
        let classifier = crate::ratelimit::PriorityClassifier::new(&config.priorities);
        assert_eq!(classifier.classify("/api/Orders/Submit"), Priority::Core);
        assert_eq!(classifier.classify("/api/Keys/rotate"), Priority::Crypto);
        assert_eq!(classifier.classify("/api/orders/submit"), Priority::NonCore);
    }

    #[test]
    fn test_load_applies_env_overrides() {
        std::env::set_var("TURNSTILE_QUEUE__FALLBACK_TIMEOUT_MS", "1234");
        let loaded = TurnstileConfig::load(None);
        std::env::remove_var("TURNSTILE_QUEUE__FALLBACK_TIMEOUT_MS");

        assert_eq!(loaded.unwrap().queue.fallback_timeout_ms, 1234);
    }
}
