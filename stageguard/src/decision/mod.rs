//! Pre-publish decision.
//!
//! After every stage has run, the signals they left behind are gathered into
//! a [`PipelineContext`] and passed through an ordered list of issue
//! detectors. The resulting issues map onto one of three outcomes:
//!
//! - no issues: `AUTO_PUBLISH`
//! - only minor issues, at most the configured maximum:
//!   `AUTO_PUBLISH_WITH_WARNING`
//! - any major issue, or too many minors: `HUMAN_REVIEW`

mod detectors;
mod engine;
mod types;

pub use detectors::{
    default_detectors, issue_codes, BoundedMetricDetector, BudgetOverrunDetector,
    CombinedFallbackDetector, GateSignalDetector, IssueDetector, ProviderTierDetector,
    RetryCountDetector, ThumbnailFallbackDetector, VisualFallbackDetector,
};
pub use engine::{decide_from_issues, DecisionConfig, PrePublishDecisionEngine};
pub use types::{
    metric_keys, AssetStats, IssueSeverity, PipelineContext, PublishDecision, QualityDecision,
    QualityIssue, StageSignal,
};
