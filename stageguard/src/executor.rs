//! Stage execution with cost tracking, quality gating and error
//! normalization.
//!
//! Every stage runs through [`StageExecutor::execute`]. The unit of work
//! receives a [`StageContext`] whose cost ledger it records priced calls in.
//! Whatever happens inside, the caller sees either a [`StageResult`] or a
//! single [`StageExecutionError`].

use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, warn, Instrument};

use crate::cost::{CategoryRules, CostLedger, CostRecorder, CostSummary, PricingTable};
use crate::decision::StageSignal;
use crate::errors::{ProviderError, StageExecutionError, StageguardError};
use crate::events::{event_types, EventSink, NoOpEventSink};
use crate::fallback::FallbackOutcome;
use crate::providers::ProviderInfo;
use crate::quality::{GateResult, GateStatus, QualityGateRegistry};
use crate::utils::{now_utc, Timestamp};

/// What a unit of work sees while it runs.
#[derive(Debug, Clone)]
pub struct StageContext {
    run_id: String,
    stage_name: String,
    costs: CostLedger,
    started_at: Timestamp,
}

impl StageContext {
    /// Run identifier.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Stage name.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        &self.stage_name
    }

    /// Cost-tracking handle for this stage.
    #[must_use]
    pub fn costs(&self) -> &CostLedger {
        &self.costs
    }

    /// When the stage started.
    #[must_use]
    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }
}

/// What a unit of work returns on success.
#[derive(Debug, Clone)]
pub struct UnitOutput<T> {
    /// Stage payload.
    pub data: T,
    /// Provider that produced it, if the unit reports one.
    pub provider: Option<ProviderInfo>,
    /// Non-fatal observations.
    pub warnings: Vec<String>,
}

impl<T> UnitOutput<T> {
    /// Output without provider info.
    pub fn new(data: T) -> Self {
        Self {
            data,
            provider: None,
            warnings: Vec::new(),
        }
    }

    /// Output of a fallback chain, carrying its provider and tier.
    pub fn from_fallback(outcome: FallbackOutcome<T>) -> Self {
        let provider = outcome.provider_info();
        Self {
            data: outcome.value,
            provider: Some(provider),
            warnings: Vec::new(),
        }
    }

    /// Sets the provider.
    #[must_use]
    pub fn with_provider(mut self, provider: ProviderInfo) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Adds a warning.
    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Gate to run over the output, by registry name.
    pub quality_gate: Option<String>,
    /// Upper bound on the unit's wall-clock time.
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    /// No gate, no timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the named gate over the output.
    #[must_use]
    pub fn with_quality_gate(mut self, gate: impl Into<String>) -> Self {
        self.quality_gate = Some(gate.into());
        self
    }

    /// Bounds the unit's run time.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A completed stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult<T> {
    /// Stage name.
    pub stage: String,
    /// Always true; failures surface as [`StageExecutionError`].
    pub success: bool,
    /// Stage payload.
    pub data: T,
    /// Costs recorded during the stage.
    pub cost_summary: CostSummary,
    /// Gate result, if a gate ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_report: Option<GateResult>,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Provider that produced the output.
    pub provider_info: ProviderInfo,
    /// Unit and gate warnings.
    pub warnings: Vec<String>,
    /// Start time.
    pub started_at: Timestamp,
    /// End time.
    pub completed_at: Timestamp,
}

impl<T> StageResult<T> {
    /// The signal this stage contributes to the pre-publish decision.
    #[must_use]
    pub fn signal(&self) -> StageSignal {
        StageSignal {
            stage: self.stage.clone(),
            provider: self.provider_info.clone(),
            gate: self.quality_report.clone(),
            cost_usd: self.cost_summary.total_cost_usd,
            duration_ms: self.duration_ms,
            warnings: self.warnings.clone(),
        }
    }

    /// Maps the payload, keeping everything else.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StageResult<U> {
        StageResult {
            stage: self.stage,
            success: self.success,
            data: f(self.data),
            cost_summary: self.cost_summary,
            quality_report: self.quality_report,
            duration_ms: self.duration_ms,
            provider_info: self.provider_info,
            warnings: self.warnings,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Runs units of work for one pipeline run.
pub struct StageExecutor {
    run_id: String,
    gates: Arc<QualityGateRegistry>,
    rules: Arc<CategoryRules>,
    pricing: Arc<PricingTable>,
    recorder: Option<CostRecorder>,
    events: Arc<dyn EventSink>,
}

impl StageExecutor {
    /// Creates an executor for a run.
    #[must_use]
    pub fn new(run_id: impl Into<String>, gates: Arc<QualityGateRegistry>) -> Self {
        Self {
            run_id: run_id.into(),
            gates,
            rules: Arc::new(CategoryRules::default()),
            pricing: Arc::new(PricingTable::default()),
            recorder: None,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Persists each stage's costs into the run's cost document.
    #[must_use]
    pub fn with_cost_recorder(mut self, recorder: CostRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Sets the pricing table handed to each stage ledger.
    #[must_use]
    pub fn with_pricing(mut self, pricing: Arc<PricingTable>) -> Self {
        self.pricing = pricing;
        self
    }

    /// Sets the service categorization rules.
    #[must_use]
    pub fn with_category_rules(mut self, rules: Arc<CategoryRules>) -> Self {
        self.rules = rules;
        self
    }

    /// Run identifier.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Gate registry.
    #[must_use]
    pub fn gates(&self) -> &Arc<QualityGateRegistry> {
        &self.gates
    }

    /// Runs one stage.
    ///
    /// Costs are summarized and persisted whether or not the unit succeeds.
    /// A gate FAIL is returned as an error with code `QUALITY_GATE_FAILED`;
    /// a WARN succeeds and carries the gate's warnings.
    pub async fn execute<I, T, F, Fut>(
        &self,
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
        let ledger =
            CostLedger::with_rules(stage_name, Arc::clone(&self.rules), Arc::clone(&self.pricing));
        let started_at = now_utc();
        let ctx = StageContext {
            run_id: self.run_id.clone(),
            stage_name: stage_name.to_string(),
            costs: ledger.clone(),
            started_at,
        };

        self.events.try_emit(
            event_types::STAGE_STARTED,
            Some(json!({"run_id": self.run_id, "stage": stage_name})),
        );

        let span = info_span!("stage", run_id = %self.run_id, stage = stage_name);
        let start = Instant::now();
        let outcome = match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, unit(input, ctx))
                .instrument(span)
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout(duration_ms(limit)).into()),
            },
            None => unit(input, ctx).instrument(span).await,
        };
        let elapsed_ms = duration_ms(start.elapsed());

        let cost_summary = ledger.summary();
        self.persist_costs(&cost_summary).await;

        let output = match outcome {
            Ok(output) => output,
            Err(err) => return Err(self.fail(stage_name, &err, &cost_summary, elapsed_ms)),
        };

        let quality_report = match &options.quality_gate {
            Some(gate) => {
                let value = match serde_json::to_value(&output.data) {
                    Ok(value) => value,
                    Err(e) => {
                        let err = StageguardError::from(e);
                        return Err(self.fail(stage_name, &err, &cost_summary, elapsed_ms));
                    }
                };
                let report = self.gates.check(gate, &value);
                self.events.try_emit(
                    event_types::QUALITY_GATE,
                    Some(json!({
                        "run_id": self.run_id,
                        "stage": stage_name,
                        "gate": gate,
                        "status": report.status,
                        "metrics": report.metrics,
                    })),
                );
                if report.status == GateStatus::Fail {
                    let err = StageguardError::QualityGateFailed {
                        stage: stage_name.to_string(),
                        reason: report.reason.clone().unwrap_or_default(),
                    };
                    let failure = self
                        .fail(stage_name, &err, &cost_summary, elapsed_ms)
                        .with_context("gate", json!(gate))
                        .with_context("metrics", json!(report.metrics));
                    return Err(failure);
                }
                Some(report)
            }
            None => None,
        };

        let mut warnings = output.warnings;
        if let Some(report) = &quality_report {
            warnings.extend(report.warnings.iter().cloned());
        }
        let provider_info = output.provider.unwrap_or_default();

        info!(
            run_id = %self.run_id,
            stage = stage_name,
            duration_ms = elapsed_ms,
            cost_usd = cost_summary.total_cost_usd,
            provider = %provider_info.name,
            tier = %provider_info.tier,
            attempts = provider_info.attempts,
            "Stage completed"
        );
        self.events.try_emit(
            event_types::STAGE_COMPLETED,
            Some(json!({
                "run_id": self.run_id,
                "stage": stage_name,
                "duration_ms": elapsed_ms,
                "cost_usd": cost_summary.total_cost_usd,
                "provider": provider_info,
                "warnings": warnings.len(),
            })),
        );

        Ok(StageResult {
            stage: stage_name.to_string(),
            success: true,
            data: output.data,
            cost_summary,
            quality_report,
            duration_ms: elapsed_ms,
            provider_info,
            warnings,
            started_at,
            completed_at: now_utc(),
        })
    }

    async fn persist_costs(&self, summary: &CostSummary) {
        let Some(recorder) = &self.recorder else {
            return;
        };
        if let Err(e) = recorder.persist_stage(&self.run_id, summary).await {
            error!(
                run_id = %self.run_id,
                stage = %summary.stage,
                cost_usd = summary.total_cost_usd,
                error = %e,
                "Failed to persist stage costs"
            );
        }
    }

    fn fail(
        &self,
        stage_name: &str,
        err: &StageguardError,
        costs: &CostSummary,
        elapsed_ms: u64,
    ) -> StageExecutionError {
        let failure = StageExecutionError::from_error(stage_name, err)
            .with_context("cost_usd", json!(costs.total_cost_usd))
            .with_context("duration_ms", json!(elapsed_ms));

        warn!(
            run_id = %self.run_id,
            stage = stage_name,
            code = %failure.code,
            recoverable = failure.recoverable,
            "Stage failed: {}",
            failure.message
        );
        self.events.try_emit(
            event_types::STAGE_FAILED,
            Some(json!({
                "run_id": self.run_id,
                "stage": stage_name,
                "error": failure,
            })),
        );
        failure
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl std::fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor")
            .field("run_id", &self.run_id)
            .field("gates", &self.gates)
            .field("persists_costs", &self.recorder.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::providers::ProviderTier;
    use crate::quality::{GateError, GateThresholds};
    use crate::store::{collections, DocumentStore, InMemoryDocumentStore};
    use serde_json::{json, Value};

    fn executor() -> StageExecutor {
        StageExecutor::new(
            "2024-05-01",
            Arc::new(QualityGateRegistry::with_defaults(&GateThresholds::default())),
        )
    }

    #[tokio::test]
    async fn test_success_with_costs() {
        let result = executor()
            .execute(
                "topic".to_string(),
                "script",
                |topic: String, ctx: StageContext| async move {
                    ctx.costs().record_call("gemini-2.5-flash", 0.08)?;
                    ctx.costs().record_call("gemini-2.5-flash", 0.15)?;
                    Ok::<_, StageguardError>(
                        UnitOutput::new(format!("script about {topic}"))
                            .with_provider(ProviderInfo::primary("gemini-2.5-flash")),
                    )
                },
                ExecuteOptions::new(),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.data, "script about topic");
        assert_eq!(result.cost_summary.total_cost_usd, 0.23);
        assert_eq!(result.cost_summary.call_count(), 2);
        assert_eq!(result.provider_info.name, "gemini-2.5-flash");
        assert!(result.quality_report.is_none());
    }

    #[tokio::test]
    async fn test_gate_fail_becomes_error() {
        let err = executor()
            .execute(
                (),
                "script",
                |_: (), _ctx: StageContext| async move {
                    Ok::<_, StageguardError>(UnitOutput::new(json!({"word_count": 12})))
                },
                ExecuteOptions::new().with_quality_gate("script"),
            )
            .await
            .unwrap_err();

        assert_eq!(err.stage, "script");
        assert_eq!(err.error_name, "QualityGateError");
        assert_eq!(err.code, "QUALITY_GATE_FAILED");
        assert!(!err.recoverable);
        assert_eq!(err.context["metrics"]["word_count"], 12.0);
    }

    #[tokio::test]
    async fn test_gate_warn_succeeds_with_warnings() {
        let result = executor()
            .execute(
                (),
                "visuals",
                |_: (), _ctx: StageContext| async move {
                    Ok::<_, StageguardError>(
                        UnitOutput::new(json!({"total_assets": 10, "fallback_assets": 2}))
                            .with_warning("two stock images"),
                    )
                },
                ExecuteOptions::new().with_quality_gate("visuals"),
            )
            .await
            .unwrap();

        let report = result.quality_report.as_ref().unwrap();
        assert_eq!(report.status, GateStatus::Warn);
        assert_eq!(result.warnings.len(), 2);
        assert_eq!(result.signal().gate_status(), Some(GateStatus::Warn));
    }

    #[tokio::test]
    async fn test_unit_error_is_normalized_with_cost() {
        let err = executor()
            .execute(
                (),
                "narration",
                |_: (), ctx: StageContext| async move {
                    ctx.costs().record_call("google-tts", 0.05)?;
                    Err::<UnitOutput<Value>, StageguardError>(
                        ProviderError::recoverable("HTTP_503", "unavailable")
                            .with_provider("tts-a")
                            .into(),
                    )
                },
                ExecuteOptions::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.error_name, "ProviderError");
        assert_eq!(err.code, "HTTP_503");
        assert!(err.recoverable);
        assert_eq!(err.context["cost_usd"], 0.05);
        assert_eq!(err.context["provider"], "tts-a");
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = executor()
            .execute(
                (),
                "render",
                |_: (), _ctx: StageContext| async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, StageguardError>(UnitOutput::new(()))
                },
                ExecuteOptions::new().with_timeout(Duration::from_millis(10)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "TIMEOUT");
    }

    #[tokio::test]
    async fn test_unknown_gate_passes_with_warning() {
        let result = executor()
            .execute(
                (),
                "thumbnail",
                |_: (), _ctx: StageContext| async move {
                    Ok::<_, StageguardError>(UnitOutput::new(json!({"url": "x"})))
                },
                ExecuteOptions::new().with_quality_gate("thumbnail"),
            )
            .await
            .unwrap();
        assert_eq!(result.quality_report.unwrap().status, GateStatus::Pass);
        assert_eq!(result.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_gate_error_becomes_failure() {
        let registry = QualityGateRegistry::new();
        registry.register("strict", |_: &Value| -> Result<GateResult, GateError> {
            Err(GateError("cannot parse".into()))
        });
        let err = StageExecutor::new("2024-05-01", Arc::new(registry))
            .execute(
                (),
                "strict",
                |_: (), _ctx: StageContext| async move {
                    Ok::<_, StageguardError>(UnitOutput::new(1))
                },
                ExecuteOptions::new().with_quality_gate("strict"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "QUALITY_GATE_FAILED");
        assert!(err.message.contains("cannot parse"));
    }

    #[tokio::test]
    async fn test_persists_costs_even_on_failure() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let executor = executor().with_cost_recorder(CostRecorder::new(store.clone()));

        let _ = executor
            .execute(
                (),
                "narration",
                |_: (), ctx: StageContext| async move {
                    ctx.costs().record_call("google-tts", 0.07)?;
                    Err::<UnitOutput<()>, _>(StageguardError::Internal("boom".into()))
                },
                ExecuteOptions::new(),
            )
            .await;

        let doc = store
            .get_document(collections::COSTS, "2024-05-01")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["total_cost_usd"], 0.07);
    }

    #[tokio::test]
    async fn test_fallback_output_carries_tier() {
        let outcome = FallbackOutcome {
            value: "audio".to_string(),
            provider_name: "tts-b".to_string(),
            tier: ProviderTier::Fallback,
            total_attempts: 4,
            attempt_log: vec![],
        };
        let result = executor()
            .execute(
                (),
                "narration",
                move |_: (), _ctx: StageContext| async move {
                    Ok::<_, StageguardError>(UnitOutput::from_fallback(outcome))
                },
                ExecuteOptions::new(),
            )
            .await
            .unwrap();
        let signal = result.signal();
        assert_eq!(signal.provider.tier, ProviderTier::Fallback);
        assert_eq!(signal.provider.attempts, 4);
    }

    #[tokio::test]
    async fn test_emits_lifecycle_events() {
        let sink = Arc::new(CollectingEventSink::new());
        let executor = executor().with_event_sink(sink.clone());

        executor
            .execute(
                (),
                "timing",
                |_: (), _ctx: StageContext| async move {
                    Ok::<_, StageguardError>(UnitOutput::new(json!({"match_ratio": 0.99})))
                },
                ExecuteOptions::new().with_quality_gate("timing"),
            )
            .await
            .unwrap();

        assert_eq!(
            sink.event_types(),
            vec!["stage.started", "stage.quality_gate", "stage.completed"]
        );
    }
}
