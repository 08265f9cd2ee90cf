//! The pre-publish decision engine.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::detectors::{default_detectors, IssueDetector};
use super::types::{IssueSeverity, PipelineContext, PublishDecision, QualityDecision, QualityIssue};
use crate::errors::ConfigError;
use crate::events::{event_types, EventSink, NoOpEventSink};
use crate::quality::BoundedMetric;
use crate::utils::{now_utc, round_usd};

/// Thresholds for the decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionConfig {
    /// Stages with more attempts than this raise a minor issue.
    #[serde(default = "default_retry_threshold")]
    pub retry_attempt_threshold: usize,
    /// Visual fallback shares above this are major.
    #[serde(default = "default_visual_ratio")]
    pub visual_fallback_major_ratio: f64,
    /// Most minor issues still allowed to auto-publish.
    #[serde(default = "default_max_minor")]
    pub max_minor_issues: usize,
    /// Per-run cost ceiling.
    #[serde(default = "default_cost_ceiling")]
    pub cost_ceiling_usd: f64,
    /// Script word count bounds.
    #[serde(default = "default_word_count")]
    pub word_count: BoundedMetric,
    /// Unresolved term bounds.
    #[serde(default = "default_unresolved_terms")]
    pub unresolved_terms: BoundedMetric,
}

fn default_retry_threshold() -> usize {
    2
}

fn default_visual_ratio() -> f64 {
    0.30
}

fn default_max_minor() -> usize {
    2
}

fn default_cost_ceiling() -> f64 {
    1.50
}

fn default_word_count() -> BoundedMetric {
    BoundedMetric::between(1200.0, 1800.0, 100.0)
}

fn default_unresolved_terms() -> BoundedMetric {
    BoundedMetric::at_most(3.0, 1.0)
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            retry_attempt_threshold: default_retry_threshold(),
            visual_fallback_major_ratio: default_visual_ratio(),
            max_minor_issues: default_max_minor(),
            cost_ceiling_usd: default_cost_ceiling(),
            word_count: default_word_count(),
            unresolved_terms: default_unresolved_terms(),
        }
    }
}

impl DecisionConfig {
    /// Validates the thresholds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.visual_fallback_major_ratio) {
            return Err(ConfigError::new(
                "visual_fallback_major_ratio",
                "must lie in [0, 1]",
            ));
        }
        if !self.cost_ceiling_usd.is_finite() || self.cost_ceiling_usd < 0.0 {
            return Err(ConfigError::new(
                "cost_ceiling_usd",
                "must be a finite, non-negative amount",
            ));
        }
        self.word_count.validate("word_count")?;
        self.unresolved_terms.validate("unresolved_terms")
    }
}

/// Maps issues onto an outcome.
#[must_use]
pub fn decide_from_issues(issues: &[QualityIssue], max_minor_issues: usize) -> PublishDecision {
    let majors = issues
        .iter()
        .filter(|i| i.severity == IssueSeverity::Major)
        .count();
    let minors = issues.len() - majors;

    if majors > 0 || minors > max_minor_issues {
        PublishDecision::HumanReview
    } else if minors > 0 {
        PublishDecision::AutoPublishWithWarning
    } else {
        PublishDecision::AutoPublish
    }
}

/// Runs detectors over a [`PipelineContext`] and decides.
pub struct PrePublishDecisionEngine {
    config: DecisionConfig,
    detectors: Vec<Box<dyn IssueDetector>>,
    events: Arc<dyn EventSink>,
}

impl PrePublishDecisionEngine {
    /// Creates an engine with the built-in detectors.
    #[must_use]
    pub fn new(config: DecisionConfig) -> Self {
        let detectors = default_detectors(&config);
        Self {
            config,
            detectors,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Replaces the detector list.
    #[must_use]
    pub fn with_detectors(mut self, detectors: Vec<Box<dyn IssueDetector>>) -> Self {
        self.detectors = detectors;
        self
    }

    /// Appends a detector after the existing ones.
    #[must_use]
    pub fn with_detector(mut self, detector: Box<dyn IssueDetector>) -> Self {
        self.detectors.push(detector);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// Detector names in evaluation order.
    #[must_use]
    pub fn detector_names(&self) -> Vec<&str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    /// Collects issues in detector order, then drops minor issues that a
    /// fired detector supersedes.
    #[must_use]
    pub fn collect_issues(&self, ctx: &PipelineContext) -> Vec<QualityIssue> {
        let mut issues = Vec::new();
        let mut superseded: Vec<&str> = Vec::new();
        for detector in &self.detectors {
            if let Some(issue) = detector.detect(ctx) {
                superseded.extend(detector.supersedes().iter().copied());
                issues.push(issue);
            }
        }
        issues.retain(|issue| {
            !(issue.severity == IssueSeverity::Minor && superseded.contains(&issue.code.as_str()))
        });
        issues
    }

    /// Decides for a run. Pure over `ctx` apart from the timestamp.
    #[must_use]
    pub fn decide(&self, ctx: &PipelineContext) -> QualityDecision {
        let issues = self.collect_issues(ctx);
        let decision = decide_from_issues(&issues, self.config.max_minor_issues);

        let mut reasons: Vec<String> = issues.iter().map(QualityIssue::reason).collect();
        reasons.push(summary_reason(decision, &issues, self.config.max_minor_issues));

        let result = QualityDecision {
            run_id: ctx.run_id.clone(),
            decision,
            issues,
            reasons,
            metrics_snapshot: snapshot(ctx),
            timestamp_utc: now_utc(),
        };

        info!(
            run_id = %result.run_id,
            decision = %result.decision,
            major = result.major_count(),
            minor = result.minor_count(),
            "Pre-publish decision made"
        );
        self.events.try_emit(
            event_types::DECISION_MADE,
            Some(json!({
                "run_id": result.run_id,
                "decision": result.decision,
                "issues": result.issues.len(),
                "digest": result.digest(),
            })),
        );
        result
    }
}

fn summary_reason(decision: PublishDecision, issues: &[QualityIssue], max_minor: usize) -> String {
    let majors = issues
        .iter()
        .filter(|i| i.severity == IssueSeverity::Major)
        .count();
    let minors = issues.len() - majors;
    match decision {
        PublishDecision::AutoPublish => "no issues detected".to_string(),
        PublishDecision::AutoPublishWithWarning => {
            format!("{minors} minor issue(s), within the limit of {max_minor}")
        }
        PublishDecision::HumanReview if majors > 0 => {
            format!("{majors} major issue(s) require human review")
        }
        PublishDecision::HumanReview => {
            format!("{minors} minor issues exceed the limit of {max_minor}")
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn snapshot(ctx: &PipelineContext) -> BTreeMap<String, Value> {
    let mut snapshot: BTreeMap<String, Value> = ctx
        .metrics
        .iter()
        .map(|(k, v)| (k.clone(), json!(v)))
        .collect();
    snapshot.insert("total_cost_usd".into(), json!(round_usd(ctx.total_cost_usd)));
    snapshot.insert("stage_count".into(), json!(ctx.stages.len()));
    snapshot.insert(
        "fallback_stages".into(),
        json!(ctx
            .stages
            .iter()
            .filter(|s| s.provider.tier.is_fallback())
            .count()),
    );
    snapshot.insert(
        "max_attempts".into(),
        json!(ctx.stages.iter().map(|s| s.provider.attempts).max().unwrap_or(0)),
    );
    if let Some(assets) = ctx.visual_assets {
        snapshot.insert("visual_assets_total".into(), json!(assets.total));
        snapshot.insert("visual_assets_fallback".into(), json!(assets.fallback));
    }
    snapshot.insert("thumbnail_fallback".into(), json!(ctx.thumbnail_fallback));
    if let Some(budget) = &ctx.budget {
        snapshot.insert("budget_remaining_usd".into(), json!(budget.remaining_usd));
        snapshot.insert("budget_days_of_runway".into(), json!(budget.days_of_runway));
    }
    snapshot
}

impl std::fmt::Debug for PrePublishDecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrePublishDecisionEngine")
            .field("config", &self.config)
            .field("detectors", &self.detector_names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetConfig, BudgetTracker};
    use crate::decision::{issue_codes, metric_keys, StageSignal};
    use crate::events::CollectingEventSink;
    use crate::providers::{ProviderInfo, ProviderTier};
    use crate::quality::GateResult;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn engine() -> PrePublishDecisionEngine {
        PrePublishDecisionEngine::new(DecisionConfig::default())
    }

    fn clean_context() -> PipelineContext {
        PipelineContext::new("2024-05-01")
            .with_stage(StageSignal::new("script", ProviderInfo::primary("gemini")))
            .with_stage(StageSignal::new("narration", ProviderInfo::primary("tts-a")))
            .with_visual_assets(12, 0)
            .with_metric(metric_keys::WORD_COUNT, 1500.0)
            .with_total_cost(0.42)
    }

    #[test]
    fn test_decide_from_issues_rule() {
        let minor = QualityIssue::minor("A", "a");
        let major = QualityIssue::major("B", "b");
        assert_eq!(decide_from_issues(&[], 2), PublishDecision::AutoPublish);
        assert_eq!(
            decide_from_issues(&[minor.clone(), minor.clone()], 2),
            PublishDecision::AutoPublishWithWarning
        );
        assert_eq!(
            decide_from_issues(&[minor.clone(), minor.clone(), minor.clone()], 2),
            PublishDecision::HumanReview
        );
        assert_eq!(decide_from_issues(&[major], 2), PublishDecision::HumanReview);
    }

    #[test]
    fn test_clean_run_auto_publishes() {
        let decision = engine().decide(&clean_context());
        assert_eq!(decision.decision, PublishDecision::AutoPublish);
        assert!(decision.issues.is_empty());
        assert_eq!(decision.reasons, vec!["no issues detected"]);
    }

    #[test]
    fn test_fallback_provider_requires_review() {
        let ctx = clean_context().with_stage(StageSignal::new(
            "render",
            ProviderInfo::new("render-b", ProviderTier::Fallback, 1),
        ));
        let decision = engine().decide(&ctx);
        assert_eq!(decision.decision, PublishDecision::HumanReview);
        assert_eq!(decision.issues[0].code, issue_codes::PROVIDER_FALLBACK);
    }

    #[test]
    fn test_two_minors_warn() {
        let ctx = clean_context()
            .with_visual_assets(10, 2)
            .with_metric(metric_keys::WORD_COUNT, 1250.0);
        let decision = engine().decide(&ctx);
        assert_eq!(decision.decision, PublishDecision::AutoPublishWithWarning);
        assert_eq!(decision.minor_count(), 2);
    }

    #[test]
    fn test_three_minors_require_review() {
        let ctx = clean_context()
            .with_visual_assets(10, 2)
            .with_metric(metric_keys::WORD_COUNT, 1250.0)
            .with_metric(metric_keys::UNRESOLVED_TERMS, 3.0);
        let decision = engine().decide(&ctx);
        assert_eq!(decision.decision, PublishDecision::HumanReview);
        assert_eq!(decision.major_count(), 0);
        assert!(decision.reasons.last().unwrap().contains("exceed"));
    }

    #[test]
    fn test_combined_fallback_replaces_its_minors() {
        let ctx = clean_context()
            .with_visual_assets(10, 1)
            .with_thumbnail_fallback(true);
        let decision = engine().decide(&ctx);

        assert_eq!(decision.decision, PublishDecision::HumanReview);
        let codes: Vec<&str> = decision.issues.iter().map(|i| i.code.as_str()).collect();
        assert_eq!(codes, vec![issue_codes::COMBINED_FALLBACK]);
    }

    #[test]
    fn test_gate_warning_carried_forward() {
        let ctx = clean_context().with_stage(
            StageSignal::new("timing", ProviderInfo::primary("aligner"))
                .with_gate(GateResult::warn("90% aligned")),
        );
        let decision = engine().decide(&ctx);
        assert_eq!(decision.decision, PublishDecision::AutoPublishWithWarning);
        assert_eq!(decision.issues[0].code, issue_codes::QUALITY_GATE_WARNING);
    }

    #[test]
    fn test_cost_over_ceiling_requires_review() {
        let decision = engine().decide(&clean_context().with_total_cost(2.0));
        assert_eq!(decision.decision, PublishDecision::HumanReview);
        assert_eq!(decision.issues[0].code, issue_codes::BUDGET_OVERRUN);
    }

    #[test]
    fn test_projection_over_monthly_target_only_warns() {
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let mut budget = BudgetTracker::new(
            BudgetConfig::default()
                .with_monthly_target(10.0)
                .with_start_date(day),
        );
        budget.record_spend(0.40, day).unwrap();

        let ctx = clean_context()
            .with_total_cost(0.40)
            .with_budget(budget.status_on(day));
        let decision = engine().decide(&ctx);

        assert_eq!(decision.decision, PublishDecision::AutoPublishWithWarning);
        assert_eq!(decision.major_count(), 0);
        assert_eq!(decision.issues[0].code, issue_codes::BUDGET_OVER_TARGET);
    }

    #[test]
    fn test_deterministic() {
        let ctx = clean_context()
            .with_visual_assets(10, 2)
            .with_metric(metric_keys::UNRESOLVED_TERMS, 2.0);
        let a = engine().decide(&ctx);
        let b = engine().decide(&ctx);
        assert_eq!(a.decision, b.decision);
        assert_eq!(a.issues, b.issues);
        assert_eq!(a.reasons, b.reasons);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_zero_assets_is_not_an_issue() {
        let decision = engine().decide(&clean_context().with_visual_assets(0, 0));
        assert_eq!(decision.decision, PublishDecision::AutoPublish);
    }

    #[test]
    fn test_emits_decision_event() {
        let sink = Arc::new(CollectingEventSink::new());
        let engine = engine().with_event_sink(sink.clone());
        let decision = engine.decide(&clean_context());

        let events = sink.events_of_type(event_types::DECISION_MADE);
        assert_eq!(events.len(), 1);
        let data = events[0].1.clone().unwrap();
        assert_eq!(data["decision"], "AUTO_PUBLISH");
        assert_eq!(data["digest"], decision.digest());
    }

    #[test]
    fn test_snapshot_contents() {
        let decision = engine().decide(&clean_context());
        assert_eq!(decision.metrics_snapshot["word_count"], json!(1500.0));
        assert_eq!(decision.metrics_snapshot["stage_count"], json!(2));
        assert_eq!(decision.metrics_snapshot["visual_assets_total"], json!(12));
    }
}
