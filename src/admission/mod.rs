//! Multi-dimensional admission checks.
//!
//! The orchestrator runs the configured dimensions in order against the
//! limiter registry and stops at the first one that rejects.

mod order;
mod orchestrator;
mod request;

pub use order::CheckOrder;
pub use orchestrator::{AdmissionOrchestrator, AdmissionStats, DimensionStats, DEFAULT_PRIORITY_QUOTA};
pub use request::{AdmissionRequest, AdmissionResult};
