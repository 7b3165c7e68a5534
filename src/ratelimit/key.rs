//! Limiter key generation and handling.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TurnstileError;

/// One independent axis of rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Dimension {
    /// Client IP address
    Ip,
    /// Resolved user identifier
    User,
    /// Method and path of the route
    Url,
    /// Business priority class of the route
    ApiWeight,
}

impl Dimension {
    /// All dimensions, in the default check order.
    pub const ALL: [Dimension; 4] = [
        Dimension::Ip,
        Dimension::User,
        Dimension::Url,
        Dimension::ApiWeight,
    ];

    /// The lowercase tag used in limiter keys.
    pub fn tag(&self) -> &'static str {
        match self {
            Dimension::Ip => "ip",
            Dimension::User => "user",
            Dimension::Url => "url",
            Dimension::ApiWeight => "api_weight",
        }
    }

    /// Dense index, used for per-dimension arrays.
    pub(crate) fn index(&self) -> usize {
        match self {
            Dimension::Ip => 0,
            Dimension::User => 1,
            Dimension::Url => 2,
            Dimension::ApiWeight => 3,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Dimension {
    type Err = TurnstileError;

    /// Accepts both the administrative names (`API_WEIGHT`) and key tags (`api_weight`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ip" => Ok(Dimension::Ip),
            "user" => Ok(Dimension::User),
            "url" => Ok(Dimension::Url),
            "api_weight" => Ok(Dimension::ApiWeight),
            other => Err(TurnstileError::Config(format!(
                "unknown admission dimension '{}'",
                other
            ))),
        }
    }
}

/// A key that uniquely identifies a limiter instance.
///
/// The key pairs a dimension with the identifier derived from the request
/// (raw IP, user id, method+path, or priority class name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimiterKey {
    /// The dimension this key belongs to
    pub dimension: Dimension,
    /// The identifier within that dimension
    pub identifier: String,
}

impl LimiterKey {
    /// Create a new limiter key.
    pub fn new(dimension: Dimension, identifier: impl Into<String>) -> Self {
        Self {
            dimension,
            identifier: identifier.into(),
        }
    }

    pub fn ip(ip: &str) -> Self {
        Self::new(Dimension::Ip, ip)
    }

    pub fn user(user_id: &str) -> Self {
        Self::new(Dimension::User, user_id)
    }

    /// Route key, e.g. `url:GET /orders`. The method is uppercased.
    pub fn url(method: &str, path: &str) -> Self {
        Self::new(Dimension::Url, route_identifier(method, path))
    }

    pub fn api_weight(priority_class: &str) -> Self {
        Self::new(Dimension::ApiWeight, priority_class)
    }
}

impl fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dimension.tag(), self.identifier)
    }
}

/// Method+path identifier shared by route limiters and route queues.
pub fn route_identifier(method: &str, path: &str) -> String {
    format!("{} {}", method.to_ascii_uppercase(), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_key_to_string() {
        assert_eq!(LimiterKey::ip("10.0.0.1").to_string(), "ip:10.0.0.1");
        assert_eq!(LimiterKey::url("get", "/orders").to_string(), "url:GET /orders");
        assert_eq!(LimiterKey::api_weight("CORE").to_string(), "api_weight:CORE");
    }

    #[test]
    fn test_limiter_key_equality() {
        let key1 = LimiterKey::user("alice");
        let key2 = LimiterKey::new(Dimension::User, "alice".to_string());
        assert_eq!(key1, key2);

        // Same identifier on a different dimension is a different key
        assert_ne!(LimiterKey::user("alice"), LimiterKey::ip("alice"));
    }

    #[test]
    fn test_dimension_parsing() {
        assert_eq!("IP".parse::<Dimension>().unwrap(), Dimension::Ip);
        assert_eq!(" api_weight ".parse::<Dimension>().unwrap(), Dimension::ApiWeight);
        assert_eq!("API_WEIGHT".parse::<Dimension>().unwrap(), Dimension::ApiWeight);
        assert!("tenant".parse::<Dimension>().is_err());
    }

    #[test]
    fn test_dimension_serde_names() {
        let yaml = serde_yaml::to_string(&Dimension::ApiWeight).unwrap();
        assert_eq!(yaml.trim(), "API_WEIGHT");
        let parsed: Dimension = serde_yaml::from_str("USER").unwrap();
        assert_eq!(parsed, Dimension::User);
    }
}
