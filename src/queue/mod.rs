mod config;
mod engine;
mod fallback;
mod policy;
mod request;
mod stats;

pub use config::{EngineSettings, QueueConfig};
pub use engine::QueueEngine;
pub use fallback::TieredFallback;
pub use policy::ProcessingPolicy;
pub use request::{Completion, QueuedRequest, RequestState};
pub use stats::{KeyQueueStats, QueueStats};
