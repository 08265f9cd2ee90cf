//! Issue detectors.
//!
//! Each detector looks at the whole [`PipelineContext`] and reports at most
//! one issue. Detectors are independent; the engine runs them in order and
//! only afterwards applies supersession (see
//! [`IssueDetector::supersedes`]).

use super::engine::DecisionConfig;
use super::types::{metric_keys, PipelineContext, QualityIssue};
use crate::quality::{BoundedMetric, GateStatus, MetricPosition};

/// Issue codes produced by the built-in detectors.
pub mod issue_codes {
    /// A stage was served by a fallback provider.
    pub const PROVIDER_FALLBACK: &str = "PROVIDER_FALLBACK";
    /// A stage needed more attempts than the threshold.
    pub const EXCESSIVE_RETRIES: &str = "EXCESSIVE_RETRIES";
    /// Some visual assets came from a fallback source.
    pub const VISUAL_FALLBACK: &str = "VISUAL_FALLBACK";
    /// The thumbnail came from a fallback source.
    pub const THUMBNAIL_FALLBACK: &str = "THUMBNAIL_FALLBACK";
    /// Thumbnail and visual fallbacks occurred together.
    pub const COMBINED_FALLBACK: &str = "COMBINED_FALLBACK";
    /// Script word count near or outside its bounds.
    pub const WORD_COUNT: &str = "WORD_COUNT";
    /// Too many unresolved terms.
    pub const UNRESOLVED_TERMS: &str = "UNRESOLVED_TERMS";
    /// A quality gate warned.
    pub const QUALITY_GATE_WARNING: &str = "QUALITY_GATE_WARNING";
    /// A quality gate failed.
    pub const QUALITY_GATE_FAILED: &str = "QUALITY_GATE_FAILED";
    /// The run cost more than the ceiling or the credit ran out.
    pub const BUDGET_OVERRUN: &str = "BUDGET_OVERRUN";
    /// Projected monthly spend is over the soft target.
    pub const BUDGET_OVER_TARGET: &str = "BUDGET_OVER_TARGET";
}

/// Inspects the run and reports at most one issue.
pub trait IssueDetector: Send + Sync {
    /// Detector name for logs.
    fn name(&self) -> &str;

    /// Returns the issue this detector sees, if any.
    fn detect(&self, ctx: &PipelineContext) -> Option<QualityIssue>;

    /// Minor issue codes that this detector's issue replaces when it fires.
    fn supersedes(&self) -> &[&'static str] {
        &[]
    }
}

/// Any stage served by a fallback provider is a major issue.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProviderTierDetector;

impl IssueDetector for ProviderTierDetector {
    fn name(&self) -> &str {
        "provider_tier"
    }

    fn detect(&self, ctx: &PipelineContext) -> Option<QualityIssue> {
        let fallbacks: Vec<String> = ctx
            .stages
            .iter()
            .filter(|s| s.provider.tier.is_fallback())
            .map(|s| format!("{} via {}", s.stage, s.provider.name))
            .collect();
        if fallbacks.is_empty() {
            return None;
        }
        Some(QualityIssue::major(
            issue_codes::PROVIDER_FALLBACK,
            format!("fallback provider used: {}", fallbacks.join(", ")),
        ))
    }
}

/// Stages that needed more attempts than the threshold are a minor issue.
#[derive(Debug, Clone, Copy)]
pub struct RetryCountDetector {
    threshold: usize,
}

impl RetryCountDetector {
    /// Flags stages with more than `threshold` attempts.
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }
}

impl IssueDetector for RetryCountDetector {
    fn name(&self) -> &str {
        "retry_count"
    }

    fn detect(&self, ctx: &PipelineContext) -> Option<QualityIssue> {
        let noisy: Vec<String> = ctx
            .stages
            .iter()
            .filter(|s| s.provider.attempts > self.threshold)
            .map(|s| format!("{} ({} attempts)", s.stage, s.provider.attempts))
            .collect();
        if noisy.is_empty() {
            return None;
        }
        Some(QualityIssue::minor(
            issue_codes::EXCESSIVE_RETRIES,
            format!("more than {} attempts: {}", self.threshold, noisy.join(", ")),
        ))
    }
}

/// Fallback visual assets: minor up to the ratio, major above it.
#[derive(Debug, Clone, Copy)]
pub struct VisualFallbackDetector {
    major_ratio: f64,
}

impl VisualFallbackDetector {
    /// Fallback shares above `major_ratio` are major.
    #[must_use]
    pub fn new(major_ratio: f64) -> Self {
        Self { major_ratio }
    }
}

impl IssueDetector for VisualFallbackDetector {
    fn name(&self) -> &str {
        "visual_fallback"
    }

    fn detect(&self, ctx: &PipelineContext) -> Option<QualityIssue> {
        let assets = ctx.visual_assets?;
        if assets.fallback == 0 {
            return None;
        }
        let ratio = assets.fallback_ratio()?;
        let message = format!(
            "{} of {} visual assets are fallbacks ({:.0}%)",
            assets.fallback,
            assets.total,
            ratio * 100.0
        );
        let issue = if ratio > self.major_ratio {
            QualityIssue::major(issue_codes::VISUAL_FALLBACK, message)
        } else {
            QualityIssue::minor(issue_codes::VISUAL_FALLBACK, message)
        };
        Some(issue.for_stage("visuals"))
    }
}

/// A fallback thumbnail on its own is minor.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThumbnailFallbackDetector;

impl IssueDetector for ThumbnailFallbackDetector {
    fn name(&self) -> &str {
        "thumbnail_fallback"
    }

    fn detect(&self, ctx: &PipelineContext) -> Option<QualityIssue> {
        ctx.thumbnail_fallback.then(|| {
            QualityIssue::minor(
                issue_codes::THUMBNAIL_FALLBACK,
                "thumbnail was produced by a fallback source",
            )
            .for_stage("thumbnail")
        })
    }
}

/// A fallback thumbnail together with any fallback visuals is one major
/// issue, replacing the two minor ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct CombinedFallbackDetector;

const COMBINED_SUPERSEDES: &[&str] = &[
    issue_codes::THUMBNAIL_FALLBACK,
    issue_codes::VISUAL_FALLBACK,
];

impl IssueDetector for CombinedFallbackDetector {
    fn name(&self) -> &str {
        "combined_fallback"
    }

    fn detect(&self, ctx: &PipelineContext) -> Option<QualityIssue> {
        let visual_fallbacks = ctx.visual_assets.map_or(0, |a| a.fallback);
        if !ctx.thumbnail_fallback || visual_fallbacks == 0 {
            return None;
        }
        Some(QualityIssue::major(
            issue_codes::COMBINED_FALLBACK,
            format!("fallback thumbnail together with {visual_fallbacks} fallback visual asset(s)"),
        ))
    }

    fn supersedes(&self) -> &[&'static str] {
        COMBINED_SUPERSEDES
    }
}

/// A named metric: major outside its bounds, minor near them.
///
/// A missing metric is no issue.
#[derive(Debug, Clone)]
pub struct BoundedMetricDetector {
    metric: String,
    code: String,
    stage: Option<String>,
    bounds: BoundedMetric,
}

impl BoundedMetricDetector {
    /// Creates a detector for `metric` reporting `code`.
    #[must_use]
    pub fn new(metric: impl Into<String>, code: impl Into<String>, bounds: BoundedMetric) -> Self {
        Self {
            metric: metric.into(),
            code: code.into(),
            stage: None,
            bounds,
        }
    }

    /// Attributes issues to a stage.
    #[must_use]
    pub fn for_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }
}

impl IssueDetector for BoundedMetricDetector {
    fn name(&self) -> &str {
        &self.metric
    }

    fn detect(&self, ctx: &PipelineContext) -> Option<QualityIssue> {
        let value = *ctx.metrics.get(&self.metric)?;
        let issue = match self.bounds.position(value) {
            MetricPosition::InRange => return None,
            MetricPosition::NearBound => QualityIssue::minor(
                &self.code,
                format!("{} {value} is close to the bounds {}", self.metric, self.bounds.describe()),
            ),
            MetricPosition::OutOfBounds => QualityIssue::major(
                &self.code,
                format!("{} {value} is outside {}", self.metric, self.bounds.describe()),
            ),
        };
        Some(match &self.stage {
            Some(stage) => issue.for_stage(stage),
            None => issue,
        })
    }
}

/// Gate results carried forward: any FAIL is major, else any WARN is minor.
#[derive(Debug, Default, Clone, Copy)]
pub struct GateSignalDetector;

impl IssueDetector for GateSignalDetector {
    fn name(&self) -> &str {
        "gate_signal"
    }

    fn detect(&self, ctx: &PipelineContext) -> Option<QualityIssue> {
        let stages_with = |status: GateStatus| {
            ctx.stages
                .iter()
                .filter(|s| s.gate_status() == Some(status))
                .map(|s| s.stage.as_str())
                .collect::<Vec<_>>()
        };

        let failed = stages_with(GateStatus::Fail);
        if !failed.is_empty() {
            return Some(QualityIssue::major(
                issue_codes::QUALITY_GATE_FAILED,
                format!("quality gate failed: {}", failed.join(", ")),
            ));
        }
        let warned = stages_with(GateStatus::Warn);
        if !warned.is_empty() {
            return Some(QualityIssue::minor(
                issue_codes::QUALITY_GATE_WARNING,
                format!("quality gate warned: {}", warned.join(", ")),
            ));
        }
        None
    }
}

/// Run cost above the ceiling, or an exhausted credit, is major.
#[derive(Debug, Clone, Copy)]
pub struct BudgetOverrunDetector {
    ceiling_usd: f64,
}

impl BudgetOverrunDetector {
    /// Creates a detector with a per-run ceiling.
    #[must_use]
    pub fn new(ceiling_usd: f64) -> Self {
        Self { ceiling_usd }
    }
}

impl IssueDetector for BudgetOverrunDetector {
    fn name(&self) -> &str {
        "budget_overrun"
    }

    fn detect(&self, ctx: &PipelineContext) -> Option<QualityIssue> {
        let mut problems = Vec::new();
        if ctx.total_cost_usd > self.ceiling_usd {
            problems.push(format!(
                "run cost ${:.4} exceeds the ${:.2} ceiling",
                ctx.total_cost_usd, self.ceiling_usd
            ));
        }
        let budget = ctx.budget.as_ref();
        if budget.is_some_and(|b| b.remaining_usd <= 0.0) {
            problems.push("prepaid credit is exhausted".to_string());
        }
        if !problems.is_empty() {
            return Some(QualityIssue::major(
                issue_codes::BUDGET_OVERRUN,
                problems.join("; "),
            ));
        }

        // Over the monthly target is a soft limit.
        budget.filter(|b| !b.within_budget).map(|b| {
            QualityIssue::minor(
                issue_codes::BUDGET_OVER_TARGET,
                format!(
                    "projected monthly spend ${:.2} is over target",
                    b.projected_monthly_usd
                ),
            )
        })
    }
}

/// The built-in detectors, in evaluation order.
#[must_use]
pub fn default_detectors(config: &DecisionConfig) -> Vec<Box<dyn IssueDetector>> {
    vec![
        Box::new(ProviderTierDetector),
        Box::new(RetryCountDetector::new(config.retry_attempt_threshold)),
        Box::new(VisualFallbackDetector::new(config.visual_fallback_major_ratio)),
        Box::new(ThumbnailFallbackDetector),
        Box::new(CombinedFallbackDetector),
        Box::new(
            BoundedMetricDetector::new(
                metric_keys::WORD_COUNT,
                issue_codes::WORD_COUNT,
                config.word_count.clone(),
            )
            .for_stage("script"),
        ),
        Box::new(
            BoundedMetricDetector::new(
                metric_keys::UNRESOLVED_TERMS,
                issue_codes::UNRESOLVED_TERMS,
                config.unresolved_terms.clone(),
            )
            .for_stage("script"),
        ),
        Box::new(GateSignalDetector),
        Box::new(BudgetOverrunDetector::new(config.cost_ceiling_usd)),
    ]
}
