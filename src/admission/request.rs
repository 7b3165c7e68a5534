//! Admission inputs and outcomes.

use serde::{Deserialize, Serialize};

use crate::error::TurnstileError;
use crate::ratelimit::{route_identifier, Dimension, Priority};

/// The request attributes the admission layer looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// Client IP as seen by the gateway
    pub client_ip: String,
    /// Resolved user identifier, absent for anonymous traffic
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    /// Pre-computed route priority; classified from `path` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl AdmissionRequest {
    pub fn new(client_ip: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            client_ip: client_ip.into(),
            user_id: None,
            method: method.into(),
            path: path.into(),
            priority: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Method + path, the identifier of the route.
    pub fn route(&self) -> String {
        route_identifier(&self.method, &self.path)
    }
}

fn default_method() -> String {
    "GET".to_string()
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AdmissionResult {
    Admitted,
    /// The first dimension that rejected, with the identifier it was keyed on
    Rejected {
        dimension: Dimension,
        identifier: String,
    },
}

impl AdmissionResult {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionResult::Admitted)
    }

    /// The rejection as an error, or `None` when admitted.
    pub fn into_error(self) -> Option<TurnstileError> {
        match self {
            AdmissionResult::Admitted => None,
            AdmissionResult::Rejected {
                dimension,
                identifier,
            } => Some(TurnstileError::RateLimitExceeded {
                dimension,
                identifier,
            }),
        }
    }
}
