//! Versioned dimension check order.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::config::validate_order;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::Dimension;

/// An immutable, validated dimension order.
///
/// The orchestrator swaps whole `CheckOrder` values, so a reader always sees
/// a complete order. Each swap bumps the version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckOrder {
    version: u64,
    dimensions: Vec<Dimension>,
}

impl CheckOrder {
    /// Build a version-zero order.
    pub fn new(dimensions: Vec<Dimension>) -> Result<Self> {
        validate_order(&dimensions)?;
        Ok(Self {
            version: 0,
            dimensions,
        })
    }

    /// The order that replaces `self`, one version later.
    pub(crate) fn succeeded_by(&self, dimensions: Vec<Dimension>) -> Result<Self> {
        let mut next = Self::new(dimensions)?;
        next.version = self.version + 1;
        Ok(next)
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }
}

impl Default for CheckOrder {
    fn default() -> Self {
        Self {
            version: 0,
            dimensions: Dimension::ALL.to_vec(),
        }
    }
}

impl FromStr for CheckOrder {
    type Err = TurnstileError;

    /// Parse a comma separated list such as `"IP,USER,URL,API_WEIGHT"`.
    fn from_str(s: &str) -> Result<Self> {
        let dimensions = s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Dimension>>>()?;
        Self::new(dimensions)
    }
}

impl fmt::Display for CheckOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .dimensions
            .iter()
            .map(|d| d.tag().to_ascii_uppercase())
            .collect();
        write!(f, "{}", names.join(","))
    }
}
