//! Rate limiting primitives, limiter registry and route classification.

mod bucket;
mod key;
mod priority;
mod registry;
mod window;

pub use bucket::TokenBucketLimiter;
pub use key::{route_identifier, Dimension, LimiterKey};
pub use priority::{Priority, PriorityClassifier, PriorityRules};
pub use registry::{LimiterKind, LimiterRegistry, LimiterSnapshot};
pub use window::SlidingWindowLimiter;
