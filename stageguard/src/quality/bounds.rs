//! Bounded metrics with an edge margin.

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Where a value sits relative to a [`BoundedMetric`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricPosition {
    /// Comfortably inside the bounds.
    InRange,
    /// Inside the bounds but within the edge margin of one of them.
    NearBound,
    /// Outside the hard bounds.
    OutOfBounds,
}

/// Optional lower and upper hard bounds plus an edge margin.
///
/// Bounds are inclusive: a value equal to a bound is inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundedMetric {
    /// Inclusive lower bound.
    #[serde(default)]
    pub min: Option<f64>,
    /// Inclusive upper bound.
    #[serde(default)]
    pub max: Option<f64>,
    /// Distance from a bound that still counts as near it.
    #[serde(default)]
    pub edge_margin: f64,
}

impl BoundedMetric {
    /// Two-sided bounds.
    #[must_use]
    pub fn between(min: f64, max: f64, edge_margin: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            edge_margin,
        }
    }

    /// Upper bound only.
    #[must_use]
    pub fn at_most(max: f64, edge_margin: f64) -> Self {
        Self {
            min: None,
            max: Some(max),
            edge_margin,
        }
    }

    /// Lower bound only.
    #[must_use]
    pub fn at_least(min: f64, edge_margin: f64) -> Self {
        Self {
            min: Some(min),
            max: None,
            edge_margin,
        }
    }

    /// Classifies a value.
    #[must_use]
    pub fn position(&self, value: f64) -> MetricPosition {
        let below = self.min.is_some_and(|min| value < min);
        let above = self.max.is_some_and(|max| value > max);
        if below || above || value.is_nan() {
            return MetricPosition::OutOfBounds;
        }

        let near_min = self.min.is_some_and(|min| value < min + self.edge_margin);
        let near_max = self.max.is_some_and(|max| value > max - self.edge_margin);
        if near_min || near_max {
            MetricPosition::NearBound
        } else {
            MetricPosition::InRange
        }
    }

    /// Human-readable bounds, e.g. `[1200, 1800]`.
    #[must_use]
    pub fn describe(&self) -> String {
        let lo = self.min.map_or_else(|| "-inf".to_string(), |v| v.to_string());
        let hi = self.max.map_or_else(|| "inf".to_string(), |v| v.to_string());
        format!("[{lo}, {hi}]")
    }

    /// Validates the bounds.
    pub fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if !self.edge_margin.is_finite() || self.edge_margin < 0.0 {
            return Err(ConfigError::new(field, "edge margin must be non-negative"));
        }
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(ConfigError::new(field, "min must not exceed max"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_sided_positions() {
        let words = BoundedMetric::between(1200.0, 1800.0, 100.0);
        assert_eq!(words.position(1500.0), MetricPosition::InRange);
        assert_eq!(words.position(1250.0), MetricPosition::NearBound);
        assert_eq!(words.position(1750.0), MetricPosition::NearBound);
        assert_eq!(words.position(1199.0), MetricPosition::OutOfBounds);
        assert_eq!(words.position(1801.0), MetricPosition::OutOfBounds);
    }

    #[test]
    fn test_bound_is_inclusive() {
        let words = BoundedMetric::between(1200.0, 1800.0, 100.0);
        assert_eq!(words.position(1200.0), MetricPosition::NearBound);
        assert_eq!(words.position(1800.0), MetricPosition::NearBound);
        let no_margin = BoundedMetric::between(1200.0, 1800.0, 0.0);
        assert_eq!(no_margin.position(1200.0), MetricPosition::InRange);
    }

    #[test]
    fn test_one_sided() {
        let terms = BoundedMetric::at_most(3.0, 1.0);
        assert_eq!(terms.position(0.0), MetricPosition::InRange);
        assert_eq!(terms.position(2.5), MetricPosition::NearBound);
        assert_eq!(terms.position(4.0), MetricPosition::OutOfBounds);
        assert_eq!(terms.describe(), "[-inf, 3]");
    }

    #[test]
    fn test_validate() {
        assert!(BoundedMetric::between(1.0, 2.0, 0.1).validate("x").is_ok());
        assert!(BoundedMetric::between(3.0, 2.0, 0.1).validate("x").is_err());
        assert!(BoundedMetric::at_least(1.0, -1.0).validate("x").is_err());
    }
}
