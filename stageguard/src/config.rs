//! Aggregate configuration.
//!
//! Every section falls back to its defaults when missing from the JSON, so a
//! deployment only spells out what it changes. A handful of values can be
//! overridden from the environment after loading.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::budget::{AlertThresholds, BudgetConfig};
use crate::cost::PricingTable;
use crate::decision::DecisionConfig;
use crate::errors::{ConfigError, StageguardError};
use crate::quality::GateThresholds;
use crate::retry::RetryConfig;

/// Overrides `budget.initial_credit_usd`.
pub const ENV_INITIAL_CREDIT_USD: &str = "STAGEGUARD_INITIAL_CREDIT_USD";
/// Overrides `retry.max_retries`.
pub const ENV_MAX_RETRIES: &str = "STAGEGUARD_MAX_RETRIES";
/// Overrides `decision.cost_ceiling_usd`.
pub const ENV_COST_CEILING_USD: &str = "STAGEGUARD_COST_CEILING_USD";

/// Everything a pipeline run needs to be configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageguardConfig {
    /// Retry behaviour for provider calls.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Credit and spend targets.
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Per-run cost alert thresholds.
    #[serde(default)]
    pub alerts: AlertThresholds,
    /// Pre-publish decision thresholds.
    #[serde(default)]
    pub decision: DecisionConfig,
    /// Built-in quality gate thresholds.
    #[serde(default)]
    pub gates: GateThresholds,
    /// Rates for the cost helpers.
    #[serde(default)]
    pub pricing: PricingTable,
    /// How long publishing waits for a human reviewer.
    #[serde(default = "default_review_timeout_seconds")]
    pub review_timeout_seconds: u64,
    /// Concurrent asset captures per run.
    #[serde(default = "default_asset_capture_concurrency")]
    pub asset_capture_concurrency: usize,
}

fn default_review_timeout_seconds() -> u64 {
    86_400
}

fn default_asset_capture_concurrency() -> usize {
    3
}

impl Default for StageguardConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            budget: BudgetConfig::default(),
            alerts: AlertThresholds::default(),
            decision: DecisionConfig::default(),
            gates: GateThresholds::default(),
            pricing: PricingTable::default(),
            review_timeout_seconds: default_review_timeout_seconds(),
            asset_capture_concurrency: default_asset_capture_concurrency(),
        }
    }
}

impl StageguardConfig {
    /// Creates a config with every default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, StageguardError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| StageguardError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, StageguardError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "Loaded stageguard config");
        Self::from_json_str(&raw)
    }

    /// Applies overrides from the process environment, then re-validates.
    pub fn apply_env_overrides(self) -> Result<Self, ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`, then re-validates.
    pub fn apply_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_override::<f64, _>(&lookup, ENV_INITIAL_CREDIT_USD)? {
            self.budget.initial_credit_usd = v;
        }
        if let Some(v) = parse_override::<i64, _>(&lookup, ENV_MAX_RETRIES)? {
            self.retry.max_retries = v;
        }
        if let Some(v) = parse_override::<f64, _>(&lookup, ENV_COST_CEILING_USD)? {
            self.decision.cost_ceiling_usd = v;
        }
        self.validate()?;
        Ok(self)
    }

    /// Sets the retry section.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the budget section.
    #[must_use]
    pub fn with_budget(mut self, budget: BudgetConfig) -> Self {
        self.budget = budget;
        self
    }

    /// Sets the alert thresholds.
    #[must_use]
    pub fn with_alerts(mut self, alerts: AlertThresholds) -> Self {
        self.alerts = alerts;
        self
    }

    /// Sets the decision section.
    #[must_use]
    pub fn with_decision(mut self, decision: DecisionConfig) -> Self {
        self.decision = decision;
        self
    }

    /// Sets the gate thresholds.
    #[must_use]
    pub fn with_gates(mut self, gates: GateThresholds) -> Self {
        self.gates = gates;
        self
    }

    /// Sets the pricing table.
    #[must_use]
    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    /// Sets the review timeout.
    #[must_use]
    pub fn with_review_timeout_seconds(mut self, seconds: u64) -> Self {
        self.review_timeout_seconds = seconds;
        self
    }

    /// Sets the asset capture concurrency.
    #[must_use]
    pub fn with_asset_capture_concurrency(mut self, limit: usize) -> Self {
        self.asset_capture_concurrency = limit;
        self
    }

    /// Review timeout as a duration.
    #[must_use]
    pub fn review_timeout(&self) -> Duration {
        Duration::from_secs(self.review_timeout_seconds)
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        self.budget.validate()?;
        self.alerts.validate()?;
        self.decision.validate()?;
        self.gates.validate()?;
        self.pricing.validate()?;
        if self.review_timeout_seconds == 0 {
            return Err(ConfigError::new("review_timeout_seconds", "must be positive"));
        }
        if self.asset_capture_concurrency == 0 {
            return Err(ConfigError::new(
                "asset_capture_concurrency",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

fn parse_override<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::new(key, format!("cannot parse '{raw}'"))),
    }
}
