//! Per-run cost document.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::category::ServiceCategory;
use super::ledger::{add_tokens, CostSummary, ServiceCostBreakdown};
use crate::errors::StoreError;
use crate::store::{collections, load_document, save_document, DocumentStore};
use crate::utils::{now_utc, round_usd, Timestamp};

/// Everything spent during one pipeline run, stored at `costs/<run_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineCostDocument {
    /// Run identifier.
    pub run_id: String,
    /// Latest summary per stage.
    pub stages: BTreeMap<String, CostSummary>,
    /// Union of services across stages, merged by name.
    pub services: Vec<ServiceCostBreakdown>,
    /// Category totals recomputed from the service union.
    pub categories: BTreeMap<ServiceCategory, f64>,
    /// Run total.
    pub total_cost_usd: f64,
    /// Last write.
    pub updated_at: Timestamp,
}

impl PipelineCostDocument {
    /// Creates an empty document for a run.
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            stages: BTreeMap::new(),
            services: Vec::new(),
            categories: BTreeMap::new(),
            total_cost_usd: 0.0,
            updated_at: now_utc(),
        }
    }

    /// Merges a stage summary. A stage written twice replaces its earlier
    /// summary rather than double counting.
    pub fn merge_stage(&mut self, summary: CostSummary) {
        self.stages.insert(summary.stage.clone(), summary);
        self.recompute();
    }

    fn recompute(&mut self) {
        let mut services: BTreeMap<String, ServiceCostBreakdown> = BTreeMap::new();
        for summary in self.stages.values() {
            for item in &summary.breakdown {
                services
                    .entry(item.service.clone())
                    .and_modify(|acc| {
                        acc.cost_usd += item.cost_usd;
                        acc.calls += item.calls;
                        acc.tokens_in = add_tokens(acc.tokens_in, item.tokens_in);
                        acc.tokens_out = add_tokens(acc.tokens_out, item.tokens_out);
                    })
                    .or_insert_with(|| item.clone());
            }
        }

        let mut categories: BTreeMap<ServiceCategory, f64> = BTreeMap::new();
        let mut total = 0.0;
        for item in services.values_mut() {
            item.cost_usd = round_usd(item.cost_usd);
            *categories.entry(item.category).or_insert(0.0) += item.cost_usd;
            total += item.cost_usd;
        }

        self.services = services.into_values().collect();
        self.categories = categories
            .into_iter()
            .map(|(category, cost)| (category, round_usd(cost)))
            .collect();
        self.total_cost_usd = round_usd(total);
        self.updated_at = now_utc();
    }
}

/// Writes stage summaries into the run's cost document.
#[derive(Clone)]
pub struct CostRecorder {
    store: Arc<dyn DocumentStore>,
}

impl CostRecorder {
    /// Creates a recorder over a store.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Merges one stage's summary into `costs/<run_id>` and returns the
    /// updated document.
    pub async fn persist_stage(
        &self,
        run_id: &str,
        summary: &CostSummary,
    ) -> Result<PipelineCostDocument, StoreError> {
        let mut document =
            load_document::<PipelineCostDocument>(self.store.as_ref(), collections::COSTS, run_id)
                .await?
                .unwrap_or_else(|| PipelineCostDocument::new(run_id));

        document.merge_stage(summary.clone());
        save_document(self.store.as_ref(), collections::COSTS, run_id, &document).await?;

        info!(
            run_id,
            stage = %summary.stage,
            stage_cost_usd = summary.total_cost_usd,
            run_cost_usd = document.total_cost_usd,
            "Persisted stage costs"
        );
        Ok(document)
    }

    /// Loads the run's cost document, if any stage has been persisted.
    pub async fn load(&self, run_id: &str) -> Result<Option<PipelineCostDocument>, StoreError> {
        load_document(self.store.as_ref(), collections::COSTS, run_id).await
    }
}

impl std::fmt::Debug for CostRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostRecorder").finish_non_exhaustive()
    }
}
