//! Decision inputs and outputs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::budget::BudgetStatus;
use crate::providers::ProviderInfo;
use crate::quality::{GateResult, GateStatus};
use crate::utils::Timestamp;

/// Well-known metric names in [`PipelineContext::metrics`].
pub mod metric_keys {
    /// Words in the final script.
    pub const WORD_COUNT: &str = "word_count";
    /// Domain terms the script could not resolve.
    pub const UNRESOLVED_TERMS: &str = "unresolved_terms";
}

/// How serious an issue is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    /// Publishable with a warning.
    Minor,
    /// Requires a human.
    Major,
}

impl fmt::Display for IssueSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minor => write!(f, "minor"),
            Self::Major => write!(f, "major"),
        }
    }
}

/// One detected problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityIssue {
    /// Stable machine-readable code.
    pub code: String,
    /// Severity.
    pub severity: IssueSeverity,
    /// Stage the issue concerns, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Human-readable explanation.
    pub message: String,
}

impl QualityIssue {
    /// A minor issue.
    #[must_use]
    pub fn minor(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            severity: IssueSeverity::Minor,
            stage: None,
            message: message.into(),
        }
    }

    /// A major issue.
    #[must_use]
    pub fn major(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Major,
            ..Self::minor(code, message)
        }
    }

    /// Attaches a stage.
    #[must_use]
    pub fn for_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Line used in the decision's reasons.
    #[must_use]
    pub fn reason(&self) -> String {
        match &self.stage {
            Some(stage) => format!("[{}] {} ({stage}): {}", self.severity, self.code, self.message),
            None => format!("[{}] {}: {}", self.severity, self.code, self.message),
        }
    }
}

/// Publish outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishDecision {
    /// Publish without comment.
    AutoPublish,
    /// Publish and surface the minor issues.
    AutoPublishWithWarning,
    /// Hold for a human.
    HumanReview,
}

impl PublishDecision {
    /// Returns true if a human must approve publication.
    #[must_use]
    pub fn requires_review(self) -> bool {
        matches!(self, Self::HumanReview)
    }
}

impl fmt::Display for PublishDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AutoPublish => write!(f, "AUTO_PUBLISH"),
            Self::AutoPublishWithWarning => write!(f, "AUTO_PUBLISH_WITH_WARNING"),
            Self::HumanReview => write!(f, "HUMAN_REVIEW"),
        }
    }
}

/// What one stage left behind for the decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSignal {
    /// Stage name.
    pub stage: String,
    /// Provider that produced the output.
    pub provider: ProviderInfo,
    /// Gate result, if the stage was gated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateResult>,
    /// Stage cost.
    pub cost_usd: f64,
    /// Wall-clock duration.
    pub duration_ms: u64,
    /// Warnings raised during the stage.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl StageSignal {
    /// A signal with a primary provider, no gate and no cost.
    #[must_use]
    pub fn new(stage: impl Into<String>, provider: ProviderInfo) -> Self {
        Self {
            stage: stage.into(),
            provider,
            gate: None,
            cost_usd: 0.0,
            duration_ms: 0,
            warnings: Vec::new(),
        }
    }

    /// Sets the gate result.
    #[must_use]
    pub fn with_gate(mut self, gate: GateResult) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Sets the cost.
    #[must_use]
    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = cost_usd;
        self
    }

    /// Gate status, if gated.
    #[must_use]
    pub fn gate_status(&self) -> Option<GateStatus> {
        self.gate.as_ref().map(|g| g.status)
    }
}

/// Visual asset counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssetStats {
    /// Assets in the final video.
    pub total: usize,
    /// Of those, how many came from a fallback source.
    pub fallback: usize,
}

impl AssetStats {
    /// Creates asset stats.
    #[must_use]
    pub fn new(total: usize, fallback: usize) -> Self {
        Self { total, fallback }
    }

    /// Fallback share of all assets; `None` when there are no assets.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fallback_ratio(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.fallback as f64 / self.total as f64)
        }
    }
}

/// Everything the detectors look at.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineContext {
    /// Run identifier.
    pub run_id: String,
    /// One signal per completed stage, in run order.
    #[serde(default)]
    pub stages: Vec<StageSignal>,
    /// Visual asset counts, if the run produced visuals.
    #[serde(default)]
    pub visual_assets: Option<AssetStats>,
    /// Whether the thumbnail came from a fallback source.
    #[serde(default)]
    pub thumbnail_fallback: bool,
    /// Named measurements such as word count.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Total run cost.
    #[serde(default)]
    pub total_cost_usd: f64,
    /// Budget view at decision time.
    #[serde(default)]
    pub budget: Option<BudgetStatus>,
}

impl PipelineContext {
    /// An empty context for a run.
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Self::default()
        }
    }

    /// Adds a stage signal.
    #[must_use]
    pub fn with_stage(mut self, signal: StageSignal) -> Self {
        self.stages.push(signal);
        self
    }

    /// Sets the visual asset counts.
    #[must_use]
    pub fn with_visual_assets(mut self, total: usize, fallback: usize) -> Self {
        self.visual_assets = Some(AssetStats::new(total, fallback));
        self
    }

    /// Marks the thumbnail as a fallback.
    #[must_use]
    pub fn with_thumbnail_fallback(mut self, fallback: bool) -> Self {
        self.thumbnail_fallback = fallback;
        self
    }

    /// Records a metric.
    #[must_use]
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Sets the run cost.
    #[must_use]
    pub fn with_total_cost(mut self, cost_usd: f64) -> Self {
        self.total_cost_usd = cost_usd;
        self
    }

    /// Sets the budget view.
    #[must_use]
    pub fn with_budget(mut self, status: BudgetStatus) -> Self {
        self.budget = Some(status);
        self
    }
}

/// The outcome of the pre-publish decision, stored at
/// `quality_decisions/<run_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityDecision {
    /// Run identifier.
    pub run_id: String,
    /// Outcome.
    pub decision: PublishDecision,
    /// Issues that led to it, in detector order.
    pub issues: Vec<QualityIssue>,
    /// Human-readable reasons.
    pub reasons: Vec<String>,
    /// Measurements at decision time.
    pub metrics_snapshot: BTreeMap<String, Value>,
    /// When the decision was made.
    pub timestamp_utc: Timestamp,
}

#[derive(Serialize)]
struct DigestView<'a> {
    run_id: &'a str,
    decision: PublishDecision,
    issues: &'a [QualityIssue],
    reasons: &'a [String],
    metrics_snapshot: &'a BTreeMap<String, Value>,
}

impl QualityDecision {
    /// Number of major issues.
    #[must_use]
    pub fn major_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Major)
            .count()
    }

    /// Number of minor issues.
    #[must_use]
    pub fn minor_count(&self) -> usize {
        self.issues.len() - self.major_count()
    }

    /// SHA-256 hex digest of everything but the timestamp.
    ///
    /// Two decisions over the same context share a digest.
    #[must_use]
    pub fn digest(&self) -> String {
        let view = DigestView {
            run_id: &self.run_id,
            decision: self.decision,
            issues: &self.issues,
            reasons: &self.reasons,
            metrics_snapshot: &self.metrics_snapshot,
        };
        let bytes = serde_json::to_vec(&view).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::now_utc;

    #[test]
    fn test_decision_serialization() {
        assert_eq!(
            serde_json::to_string(&PublishDecision::AutoPublishWithWarning).unwrap(),
            r#""AUTO_PUBLISH_WITH_WARNING""#
        );
        assert_eq!(PublishDecision::HumanReview.to_string(), "HUMAN_REVIEW");
        assert!(PublishDecision::HumanReview.requires_review());
    }

    #[test]
    fn test_issue_reason() {
        let issue = QualityIssue::major("PROVIDER_FALLBACK", "tts used fallback").for_stage("narration");
        assert_eq!(
            issue.reason(),
            "[major] PROVIDER_FALLBACK (narration): tts used fallback"
        );
    }

    #[test]
    fn test_asset_ratio() {
        assert_eq!(AssetStats::new(0, 0).fallback_ratio(), None);
        assert_eq!(AssetStats::new(10, 3).fallback_ratio(), Some(0.3));
    }

    #[test]
    fn test_digest_ignores_timestamp() {
        let decision = QualityDecision {
            run_id: "2024-05-01".into(),
            decision: PublishDecision::AutoPublish,
            issues: vec![],
            reasons: vec!["no issues".into()],
            metrics_snapshot: BTreeMap::new(),
            timestamp_utc: now_utc(),
        };
        let mut later = decision.clone();
        later.timestamp_utc = decision.timestamp_utc + chrono::Duration::seconds(5);
        assert_eq!(decision.digest(), later.digest());
        assert_eq!(decision.digest().len(), 64);

        let mut different = decision.clone();
        different.decision = PublishDecision::HumanReview;
        assert_ne!(decision.digest(), different.digest());
    }
}
