//! Per-stage cost ledger.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use super::category::{CategoryRules, ServiceCategory};
use super::pricing::PricingTable;
use crate::errors::ConfigError;
use crate::utils::{now_utc, round_usd, Timestamp};

/// One priced external call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEntry {
    /// Service that was called.
    pub service: String,
    /// Input tokens, when the service is token-priced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u64>,
    /// Output tokens, when the service is token-priced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u64>,
    /// Cost in USD, full precision.
    pub cost_usd: f64,
    /// When the call was recorded.
    pub timestamp_utc: Timestamp,
}

/// Aggregated cost of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCostBreakdown {
    /// Service name.
    pub service: String,
    /// Category the service maps to.
    pub category: ServiceCategory,
    /// Total cost, rounded to four decimals.
    pub cost_usd: f64,
    /// Number of calls.
    pub calls: u64,
    /// Summed input tokens, if any call reported them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u64>,
    /// Summed output tokens, if any call reported them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u64>,
}

/// Rolled-up view of a ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    /// Stage the ledger belongs to.
    pub stage: String,
    /// Total cost, rounded to four decimals.
    pub total_cost_usd: f64,
    /// One entry per service, ordered by service name.
    pub breakdown: Vec<ServiceCostBreakdown>,
    /// Totals per category.
    pub by_category: BTreeMap<ServiceCategory, f64>,
}

impl CostSummary {
    /// An empty summary for a stage that made no priced calls.
    #[must_use]
    pub fn empty(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            total_cost_usd: 0.0,
            breakdown: Vec::new(),
            by_category: BTreeMap::new(),
        }
    }

    /// Number of priced calls summarized.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.breakdown.iter().map(|b| b.calls).sum()
    }

    /// Breakdown for one service.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceCostBreakdown> {
        self.breakdown.iter().find(|b| b.service == name)
    }
}

struct LedgerInner {
    stage: String,
    entries: Mutex<Vec<CostEntry>>,
    rules: Arc<CategoryRules>,
    pricing: Arc<PricingTable>,
}

/// Append-only ledger of priced calls for one stage.
///
/// Clones share the same entries, so the ledger can be handed to a unit of
/// work as its cost-tracking handle while the executor keeps the original.
#[derive(Clone)]
pub struct CostLedger {
    inner: Arc<LedgerInner>,
}

impl CostLedger {
    /// Creates a ledger with the default rules and pricing.
    #[must_use]
    pub fn new(stage: impl Into<String>) -> Self {
        Self::with_rules(
            stage,
            Arc::new(CategoryRules::default()),
            Arc::new(PricingTable::default()),
        )
    }

    /// Creates a ledger with explicit categorization rules and pricing.
    #[must_use]
    pub fn with_rules(
        stage: impl Into<String>,
        rules: Arc<CategoryRules>,
        pricing: Arc<PricingTable>,
    ) -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                stage: stage.into(),
                entries: Mutex::new(Vec::new()),
                rules,
                pricing,
            }),
        }
    }

    /// Stage name.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.inner.stage
    }

    /// Records a call with a known cost.
    pub fn record_call(&self, service: &str, cost_usd: f64) -> Result<(), ConfigError> {
        self.push(service, cost_usd, None, None)
    }

    /// Records a call with a known cost and token counts.
    pub fn record_call_with_tokens(
        &self,
        service: &str,
        tokens_in: u64,
        tokens_out: u64,
        cost_usd: f64,
    ) -> Result<(), ConfigError> {
        self.push(service, cost_usd, Some(tokens_in), Some(tokens_out))
    }

    /// Records an LLM call priced from token counts. Returns the cost.
    pub fn record_llm(
        &self,
        service: &str,
        tokens_in: u64,
        tokens_out: u64,
    ) -> Result<f64, ConfigError> {
        let cost = self.inner.pricing.llm_cost(tokens_in, tokens_out);
        self.push(service, cost, Some(tokens_in), Some(tokens_out))?;
        Ok(cost)
    }

    /// Records a speech synthesis call priced per character. Returns the cost.
    pub fn record_tts(&self, service: &str, characters: u64) -> Result<f64, ConfigError> {
        let cost = self.inner.pricing.tts_cost(characters);
        self.push(service, cost, None, None)?;
        Ok(cost)
    }

    /// Records a render priced per minute. Returns the cost.
    pub fn record_render(&self, service: &str, minutes: f64) -> Result<f64, ConfigError> {
        let cost = self.inner.pricing.render_cost(minutes);
        self.push(service, cost, None, None)?;
        Ok(cost)
    }

    fn push(
        &self,
        service: &str,
        cost_usd: f64,
        tokens_in: Option<u64>,
        tokens_out: Option<u64>,
    ) -> Result<(), ConfigError> {
        if service.trim().is_empty() {
            return Err(ConfigError::new("service", "service name must not be empty"));
        }
        if !cost_usd.is_finite() || cost_usd < 0.0 {
            return Err(ConfigError::new(
                "cost_usd",
                format!("invalid cost {cost_usd} for service '{service}'"),
            ));
        }
        if self.inner.rules.categorize(service) == ServiceCategory::Unknown {
            warn!(
                stage = %self.inner.stage,
                service,
                cost_usd,
                "Service matched no category rule; counting as unknown"
            );
        }
        debug!(stage = %self.inner.stage, service, cost_usd, "Recorded priced call");
        self.inner.entries.lock().push(CostEntry {
            service: service.to_string(),
            tokens_in,
            tokens_out,
            cost_usd,
            timestamp_utc: now_utc(),
        });
        Ok(())
    }

    /// Snapshot of every recorded entry, in record order.
    #[must_use]
    pub fn entries(&self) -> Vec<CostEntry> {
        self.inner.entries.lock().clone()
    }

    /// Number of recorded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Returns true if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total cost so far, rounded.
    #[must_use]
    pub fn total_cost_usd(&self) -> f64 {
        round_usd(self.inner.entries.lock().iter().map(|e| e.cost_usd).sum())
    }

    /// Rolls the ledger up by service and category.
    ///
    /// Does not mutate the ledger; calling it twice returns equal summaries.
    #[must_use]
    pub fn summary(&self) -> CostSummary {
        struct Acc {
            cost: f64,
            calls: u64,
            tokens_in: Option<u64>,
            tokens_out: Option<u64>,
        }

        let entries = self.inner.entries.lock();
        let mut by_service: BTreeMap<&str, Acc> = BTreeMap::new();
        let mut by_category_raw: BTreeMap<ServiceCategory, f64> = BTreeMap::new();
        let mut total = 0.0;

        for entry in entries.iter() {
            total += entry.cost_usd;
            let category = self.inner.rules.categorize(&entry.service);
            *by_category_raw.entry(category).or_insert(0.0) += entry.cost_usd;

            let acc = by_service.entry(entry.service.as_str()).or_insert(Acc {
                cost: 0.0,
                calls: 0,
                tokens_in: None,
                tokens_out: None,
            });
            acc.cost += entry.cost_usd;
            acc.calls += 1;
            acc.tokens_in = add_tokens(acc.tokens_in, entry.tokens_in);
            acc.tokens_out = add_tokens(acc.tokens_out, entry.tokens_out);
        }

        let breakdown = by_service
            .into_iter()
            .map(|(service, acc)| ServiceCostBreakdown {
                service: service.to_string(),
                category: self.inner.rules.categorize(service),
                cost_usd: round_usd(acc.cost),
                calls: acc.calls,
                tokens_in: acc.tokens_in,
                tokens_out: acc.tokens_out,
            })
            .collect();

        CostSummary {
            stage: self.inner.stage.clone(),
            total_cost_usd: round_usd(total),
            breakdown,
            by_category: by_category_raw
                .into_iter()
                .map(|(category, cost)| (category, round_usd(cost)))
                .collect(),
        }
    }
}

pub(crate) fn add_tokens(acc: Option<u64>, value: Option<u64>) -> Option<u64> {
    match (acc, value) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
    }
}

impl fmt::Debug for CostLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CostLedger")
            .field("stage", &self.inner.stage)
            .field("entries", &self.len())
            .finish()
    }
}
