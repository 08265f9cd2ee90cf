//! Pipeline fixtures.

use chrono::NaiveDate;
use std::sync::Arc;

use super::mocks::RecordingAlertTransport;
use crate::budget::{BudgetConfig, ThresholdAlerter};
use crate::config::StageguardConfig;
use crate::decision::{metric_keys, PipelineContext, StageSignal};
use crate::errors::StageguardError;
use crate::events::CollectingEventSink;
use crate::pipeline::{PipelineRun, RunDependencies, RunLock};
use crate::review::InMemoryReviewQueue;
use crate::store::InMemoryDocumentStore;

/// Builds a date, falling back to the epoch for impossible dates.
#[must_use]
pub fn fixed_date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or_default()
}

/// A context that passes every default detector, plus `signals`.
#[must_use]
pub fn context_with_signals(
    run_id: &str,
    signals: impl IntoIterator<Item = StageSignal>,
) -> PipelineContext {
    signals.into_iter().fold(
        PipelineContext::new(run_id)
            .with_metric(metric_keys::WORD_COUNT, 1500.0)
            .with_metric(metric_keys::UNRESOLVED_TERMS, 0.0),
        PipelineContext::with_stage,
    )
}

/// In-memory collaborators wired together for pipeline tests.
///
/// The budget period starts on 2024-05-01 so runs dated in May 2024 fall
/// inside the credit period.
#[derive(Debug)]
pub struct TestHarness {
    /// Configuration handed to every run.
    pub config: StageguardConfig,
    /// Shared document store.
    pub store: Arc<InMemoryDocumentStore>,
    /// Shared review queue.
    pub reviews: Arc<InMemoryReviewQueue>,
    /// Every event emitted.
    pub events: Arc<CollectingEventSink>,
    /// Every alert delivered.
    pub alerts: Arc<RecordingAlertTransport>,
    /// Alerter shared across runs.
    pub alerter: Arc<ThresholdAlerter>,
    /// Single-flight lock.
    pub lock: RunLock,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    /// Harness with default thresholds.
    #[must_use]
    pub fn new() -> Self {
        let config = StageguardConfig::default().with_budget(
            BudgetConfig::default().with_start_date(fixed_date(2024, 5, 1)),
        );
        Self::with_config(config)
    }

    /// Harness with a custom configuration.
    #[must_use]
    pub fn with_config(config: StageguardConfig) -> Self {
        let store = Arc::new(InMemoryDocumentStore::new());
        let events = Arc::new(CollectingEventSink::new());
        let reviews = Arc::new(
            InMemoryReviewQueue::new()
                .with_store(Arc::clone(&store) as _)
                .with_event_sink(Arc::clone(&events) as _),
        );
        let alerts = Arc::new(RecordingAlertTransport::new());
        let alerter = Arc::new(ThresholdAlerter::new(
            config.alerts.clone(),
            Arc::clone(&alerts) as _,
        ));
        Self {
            config,
            store,
            reviews,
            events,
            alerts,
            alerter,
            lock: RunLock::new(),
        }
    }

    /// Dependencies sharing this harness's collaborators.
    #[must_use]
    pub fn deps(&self) -> RunDependencies {
        RunDependencies::new(self.config.clone(), Arc::clone(&self.store) as _)
            .with_reviews(Arc::clone(&self.reviews) as _)
            .with_alerter(Arc::clone(&self.alerter))
            .with_event_sink(Arc::clone(&self.events) as _)
    }

    /// Starts a run under the harness lock.
    pub async fn start_run(&self, run_id: &str) -> Result<PipelineRun, StageguardError> {
        PipelineRun::start(&self.lock, run_id, self.deps()).await
    }
}
