//! Pipeline run orchestration.
//!
//! A [`PipelineRun`] owns one run end to end: it executes stages through a
//! [`StageExecutor`], collects their signals and costs, and on
//! [`PipelineRun::finish`] records spend, checks alert thresholds, decides
//! whether the output may publish and opens a review when it may not.
//!
//! Only one run may be active per [`RunLock`].

use chrono::{NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use crate::budget::{AlertCheck, BudgetTracker, LoggingAlertTransport, ThresholdAlerter};
use crate::config::StageguardConfig;
use crate::cost::{CategoryRules, CostRecorder};
use crate::decision::{
    AssetStats, PipelineContext, PrePublishDecisionEngine, PublishDecision, QualityDecision,
    StageSignal,
};
use crate::errors::{StageExecutionError, StageguardError};
use crate::events::{EventSink, NoOpEventSink};
use crate::executor::{ExecuteOptions, StageContext, StageExecutor, StageResult, UnitOutput};
use crate::quality::QualityGateRegistry;
use crate::review::{InMemoryReviewQueue, ReviewOutcome, ReviewStore};
use crate::store::{collections, save_document, DocumentStore};
use crate::utils::{parse_run_id, round_usd};

/// Default number of concurrent asset captures.
pub const ASSET_CAPTURE_CONCURRENCY: usize = 3;

/// Runs `f` over `items` with at most `limit` futures in flight.
///
/// Results come back in input order regardless of completion order. A
/// `limit` of zero is treated as one.
pub async fn run_bounded<T, R, F, Fut>(
    items: impl IntoIterator<Item = T>,
    limit: usize,
    f: F,
) -> Vec<R>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = R>,
{
    stream::iter(items).map(f).buffered(limit.max(1)).collect().await
}

/// Single-flight guard for pipeline runs.
#[derive(Debug, Clone)]
pub struct RunLock {
    permits: Arc<Semaphore>,
    active: Arc<Mutex<Option<String>>>,
}

impl Default for RunLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RunLock {
    /// Creates an unheld lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Takes the lock for `run_id` without waiting.
    pub fn try_acquire(&self, run_id: &str) -> Result<RunPermit, StageguardError> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                *self.active.lock() = Some(run_id.to_string());
                Ok(RunPermit {
                    run_id: run_id.to_string(),
                    active: Arc::clone(&self.active),
                    _permit: permit,
                })
            }
            Err(_) => {
                let active_run_id = self
                    .active
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string());
                warn!(
                    requested = %run_id,
                    active = %active_run_id,
                    "Rejected run start, another run holds the lock"
                );
                Err(StageguardError::RunInProgress { active_run_id })
            }
        }
    }

    /// Run currently holding the lock.
    #[must_use]
    pub fn active_run_id(&self) -> Option<String> {
        self.active.lock().clone()
    }

    /// Returns true while a run holds the lock.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.permits.available_permits() == 0
    }
}

/// Held for the lifetime of a run; dropping it releases the lock.
pub struct RunPermit {
    run_id: String,
    active: Arc<Mutex<Option<String>>>,
    _permit: OwnedSemaphorePermit,
}

impl RunPermit {
    /// Run this permit was issued to.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        let mut active = self.active.lock();
        if active.as_deref() == Some(self.run_id.as_str()) {
            *active = None;
        }
    }
}

impl fmt::Debug for RunPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunPermit")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

/// Collaborators shared by every run.
#[derive(Clone)]
pub struct RunDependencies {
    /// Configuration.
    pub config: StageguardConfig,
    /// Quality gates by stage.
    pub gates: Arc<QualityGateRegistry>,
    /// Document persistence.
    pub store: Arc<dyn DocumentStore>,
    /// Human review queue.
    pub reviews: Arc<dyn ReviewStore>,
    /// Cost alerting; shared so cooldowns span runs.
    pub alerter: Arc<ThresholdAlerter>,
    /// Event sink.
    pub events: Arc<dyn EventSink>,
    /// Service categorisation rules.
    pub rules: Arc<CategoryRules>,
}

impl RunDependencies {
    /// Wires defaults around `store`: built-in gates, an in-memory review
    /// queue mirrored to the store, and logging alerts.
    #[must_use]
    pub fn new(config: StageguardConfig, store: Arc<dyn DocumentStore>) -> Self {
        let gates = Arc::new(QualityGateRegistry::with_defaults(&config.gates));
        let reviews = Arc::new(InMemoryReviewQueue::new().with_store(Arc::clone(&store)));
        let alerter = Arc::new(ThresholdAlerter::new(
            config.alerts.clone(),
            Arc::new(LoggingAlertTransport),
        ));
        Self {
            config,
            gates,
            store,
            reviews,
            alerter,
            events: Arc::new(NoOpEventSink),
            rules: Arc::new(CategoryRules::default()),
        }
    }

    /// Replaces the gate registry.
    #[must_use]
    pub fn with_gates(mut self, gates: Arc<QualityGateRegistry>) -> Self {
        self.gates = gates;
        self
    }

    /// Replaces the review queue.
    #[must_use]
    pub fn with_reviews(mut self, reviews: Arc<dyn ReviewStore>) -> Self {
        self.reviews = reviews;
        self
    }

    /// Replaces the alerter.
    #[must_use]
    pub fn with_alerter(mut self, alerter: Arc<ThresholdAlerter>) -> Self {
        self.alerter = alerter;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Replaces the categorisation rules.
    #[must_use]
    pub fn with_category_rules(mut self, rules: Arc<CategoryRules>) -> Self {
        self.rules = rules;
        self
    }
}

impl fmt::Debug for RunDependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunDependencies")
            .field("config", &self.config)
            .field("gates", &self.gates)
            .field("alerter", &self.alerter)
            .finish_non_exhaustive()
    }
}

/// Whether a finished run may publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublishClearance {
    /// Auto-publish, with or without warnings.
    Cleared {
        /// The decision that cleared it.
        decision: PublishDecision,
    },
    /// A reviewer approved it.
    ClearedByReview {
        /// Review item id.
        review_id: String,
    },
    /// A reviewer rejected it.
    Blocked {
        /// Review item id.
        review_id: String,
    },
}

impl PublishClearance {
    /// Returns true when publishing may proceed.
    #[must_use]
    pub fn is_cleared(&self) -> bool {
        !matches!(self, Self::Blocked { .. })
    }
}

#[derive(Serialize)]
struct StoredDecision<'a> {
    #[serde(flatten)]
    decision: &'a QualityDecision,
    digest: String,
}

/// One pipeline run.
pub struct PipelineRun {
    run_id: String,
    run_date: NaiveDate,
    deps: RunDependencies,
    executor: StageExecutor,
    engine: PrePublishDecisionEngine,
    budget: BudgetTracker,
    signals: Vec<StageSignal>,
    visual_assets: Option<AssetStats>,
    thumbnail_fallback: bool,
    metrics: BTreeMap<String, f64>,
    total_cost_usd: f64,
    spend_booked: bool,
    alert: Option<AlertCheck>,
    decision: Option<QualityDecision>,
    review_id: Option<String>,
    permit: RunPermit,
}

impl PipelineRun {
    /// Starts a run, failing fast if another run holds `lock`.
    ///
    /// Run ids are `YYYY-MM-DD`; spend is booked on that date. Any other id
    /// books spend on today's date.
    pub async fn start(
        lock: &RunLock,
        run_id: impl Into<String>,
        deps: RunDependencies,
    ) -> Result<Self, StageguardError> {
        let run_id = run_id.into();
        deps.config.validate()?;
        let permit = lock.try_acquire(&run_id)?;

        let run_date = parse_run_id(&run_id).unwrap_or_else(|e| {
            warn!(run_id = %run_id, error = %e, "Run id is not a date, booking spend on today");
            Utc::now().date_naive()
        });
        let budget = BudgetTracker::load(deps.store.as_ref(), deps.config.budget.clone()).await?;

        let executor = StageExecutor::new(&run_id, Arc::clone(&deps.gates))
            .with_cost_recorder(CostRecorder::new(Arc::clone(&deps.store)))
            .with_event_sink(Arc::clone(&deps.events))
            .with_pricing(Arc::new(deps.config.pricing.clone()))
            .with_category_rules(Arc::clone(&deps.rules));
        let engine = PrePublishDecisionEngine::new(deps.config.decision.clone())
            .with_event_sink(Arc::clone(&deps.events));

        info!(run_id = %run_id, %run_date, "Pipeline run started");

        Ok(Self {
            run_id,
            run_date,
            deps,
            executor,
            engine,
            budget,
            signals: Vec::new(),
            visual_assets: None,
            thumbnail_fallback: false,
            metrics: BTreeMap::new(),
            total_cost_usd: 0.0,
            spend_booked: false,
            alert: None,
            decision: None,
            review_id: None,
            permit,
        })
    }

    /// Run identifier.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Date spend is booked on.
    #[must_use]
    pub fn run_date(&self) -> NaiveDate {
        self.run_date
    }

    /// The executor stages run through.
    #[must_use]
    pub fn executor(&self) -> &StageExecutor {
        &self.executor
    }

    /// Signals from completed stages, in order.
    #[must_use]
    pub fn signals(&self) -> &[StageSignal] {
        &self.signals
    }

    /// Cost of every stage so far, failed ones included.
    #[must_use]
    pub fn total_cost_usd(&self) -> f64 {
        round_usd(self.total_cost_usd)
    }

    /// Budget as loaded, plus this run's spend once finished.
    #[must_use]
    pub fn budget(&self) -> &BudgetTracker {
        &self.budget
    }

    /// Alert check from [`finish`](Self::finish).
    #[must_use]
    pub fn alert(&self) -> Option<&AlertCheck> {
        self.alert.as_ref()
    }

    /// The decision, once finished.
    #[must_use]
    pub fn decision(&self) -> Option<&QualityDecision> {
        self.decision.as_ref()
    }

    /// Review item id, if the decision needs review.
    #[must_use]
    pub fn review_id(&self) -> Option<&str> {
        self.review_id.as_deref()
    }

    /// Executes a stage and records its signal and cost.
    pub async fn run_stage<I, T, F, Fut>(
        &mut self,
        input: I,
        stage_name: &str,
        unit: F,
        options: ExecuteOptions,
    ) -> Result<StageResult<T>, StageExecutionError>
    where
        T: Serialize,
        F: FnOnce(I, StageContext) -> Fut,
        Fut: Future<Output = Result<UnitOutput<T>, StageguardError>>,
    {
        let result = self.executor.execute(input, stage_name, unit, options).await;
        match &result {
            Ok(stage) => {
                self.total_cost_usd += stage.cost_summary.total_cost_usd;
                self.upsert_signal(stage.signal());
            }
            Err(failure) => {
                if let Some(cost) = failure.context.get("cost_usd").and_then(Value::as_f64) {
                    self.total_cost_usd += cost;
                }
            }
        }
        result
    }

    /// Records a signal for a stage executed elsewhere.
    pub fn record_signal(&mut self, signal: StageSignal) {
        self.total_cost_usd += signal.cost_usd;
        self.upsert_signal(signal);
    }

    // A re-run stage replaces its earlier signal, matching the cost document.
    fn upsert_signal(&mut self, signal: StageSignal) {
        match self.signals.iter_mut().find(|s| s.stage == signal.stage) {
            Some(existing) => *existing = signal,
            None => self.signals.push(signal),
        }
    }

    /// Records the run's visual asset counts.
    pub fn record_assets(&mut self, total: usize, fallback: usize) {
        self.visual_assets = Some(AssetStats::new(total, fallback));
    }

    /// Marks whether the thumbnail came from a fallback source.
    pub fn set_thumbnail_fallback(&mut self, fallback: bool) {
        self.thumbnail_fallback = fallback;
    }

    /// Records a named metric for the decision.
    pub fn record_metric(&mut self, name: impl Into<String>, value: f64) {
        self.metrics.insert(name.into(), value);
    }

    /// What the decision engine sees right now.
    #[must_use]
    pub fn context(&self) -> PipelineContext {
        PipelineContext {
            run_id: self.run_id.clone(),
            stages: self.signals.clone(),
            visual_assets: self.visual_assets,
            thumbnail_fallback: self.thumbnail_fallback,
            metrics: self.metrics.clone(),
            total_cost_usd: self.total_cost_usd(),
            budget: Some(self.budget.status_on(self.run_date)),
        }
    }

    /// Closes the run: books spend, checks alerts, decides and persists.
    ///
    /// Calling it again returns the stored decision without booking spend
    /// twice. A call that failed part way can be retried; spend and alerts
    /// already recorded are not repeated.
    pub async fn finish(&mut self) -> Result<QualityDecision, StageguardError> {
        if let Some(decision) = &self.decision {
            return Ok(decision.clone());
        }

        let total = self.total_cost_usd();
        if !self.spend_booked {
            self.budget.record_spend(total, self.run_date)?;
            self.spend_booked = true;
        }
        self.budget.save(self.deps.store.as_ref()).await?;

        if self.alert.is_none() {
            let alert = self
                .deps
                .alerter
                .check_thresholds(Some(self.run_id.as_str()), total)
                .await;
            self.alert = Some(alert);
        }

        let decision = self.engine.decide(&self.context());
        let stored = StoredDecision {
            decision: &decision,
            digest: decision.digest(),
        };
        save_document(
            self.deps.store.as_ref(),
            collections::QUALITY_DECISIONS,
            &self.run_id,
            &stored,
        )
        .await?;

        if decision.decision.requires_review() {
            let review_id = self.deps.reviews.create_review_item(&decision).await?;
            info!(run_id = %self.run_id, review_id = %review_id, "Run held for human review");
            self.review_id = Some(review_id);
        }

        info!(
            run_id = %self.run_id,
            decision = %decision.decision,
            cost_usd = total,
            stages = self.signals.len(),
            "Pipeline run finished"
        );
        self.decision = Some(decision.clone());
        Ok(decision)
    }

    /// Decides whether publishing may proceed, waiting on the reviewer for
    /// held runs. Uses the configured review timeout when `timeout` is
    /// `None`.
    pub async fn publish_clearance(
        &self,
        timeout: Option<Duration>,
    ) -> Result<PublishClearance, StageguardError> {
        let Some(decision) = &self.decision else {
            return Err(StageguardError::Internal(format!(
                "run {} has not finished",
                self.run_id
            )));
        };
        if !decision.decision.requires_review() {
            return Ok(PublishClearance::Cleared {
                decision: decision.decision,
            });
        }
        let Some(review_id) = &self.review_id else {
            return Err(StageguardError::Internal(format!(
                "run {} requires review but has no review item",
                self.run_id
            )));
        };

        let timeout = timeout.unwrap_or_else(|| self.deps.config.review_timeout());
        let outcome = self
            .deps
            .reviews
            .wait_for_resolution(review_id, timeout)
            .await?;
        Ok(match outcome {
            ReviewOutcome::Approved => PublishClearance::ClearedByReview {
                review_id: review_id.clone(),
            },
            ReviewOutcome::Rejected => PublishClearance::Blocked {
                review_id: review_id.clone(),
            },
        })
    }

    /// Releases the run lock.
    pub fn close(self) {
        info!(run_id = %self.permit.run_id(), "Pipeline run closed");
    }
}

impl fmt::Debug for PipelineRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineRun")
            .field("run_id", &self.run_id)
            .field("run_date", &self.run_date)
            .field("stages", &self.signals.len())
            .field("total_cost_usd", &self.total_cost_usd())
            .field("decision", &self.decision.as_ref().map(|d| d.decision))
            .finish_non_exhaustive()
    }
}
