//! Turnstile - Gateway Admission Control
//!
//! This crate decides, per request, whether an API gateway lets traffic
//! through now, parks it in a per-route priority queue, or degrades it to a
//! fallback. Admission is checked along independent dimensions (client IP,
//! user, route and API priority class) with sliding-window and token-bucket
//! limiters that allow a configurable burst above the steady quota.

pub mod admission;
pub mod config;
pub mod error;
pub mod gateway;
pub mod queue;
pub mod ratelimit;
pub mod work;

pub use admission::{AdmissionOrchestrator, AdmissionRequest, AdmissionResult, CheckOrder};
pub use config::TurnstileConfig;
pub use error::{Result, TurnstileError};
pub use gateway::Gateway;
pub use queue::{ProcessingPolicy, QueueConfig, QueueEngine, TieredFallback};
pub use ratelimit::{Dimension, LimiterRegistry, Priority, PriorityClassifier};
pub use work::{BoxWork, Work};
