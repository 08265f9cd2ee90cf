//! # Stageguard
//!
//! Reliability and quality control for multi-stage content pipelines.
//!
//! Each stage of a run (script, narration, visuals, render) calls external
//! providers that fail, cost money and sometimes produce poor output.
//! Stageguard wraps those stages with:
//!
//! - **Retry**: exponential backoff with jitter for recoverable failures
//! - **Fallback**: ordered provider chains with primary/fallback tiering
//! - **Cost accounting**: per-stage ledgers merged into a per-run document
//! - **Budget tracking**: spend against a prepaid credit with runway and alerts
//! - **Quality gates**: PASS/WARN/FAIL checks on each stage's output
//! - **Pre-publish decision**: auto-publish, publish with warning, or hold
//!   for human review
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stageguard::prelude::*;
//!
//! let lock = RunLock::new();
//! let deps = RunDependencies::new(StageguardConfig::default(), store);
//! let mut run = PipelineRun::start(&lock, "2024-05-01", deps).await?;
//!
//! run.run_stage(topic, "script", write_script, ExecuteOptions::new().with_quality_gate("script"))
//!     .await?;
//!
//! let decision = run.finish().await?;
//! if run.publish_clearance(None).await?.is_cleared() {
//!     publish().await?;
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod budget;
pub mod config;
pub mod cost;
pub mod decision;
pub mod errors;
pub mod events;
pub mod executor;
pub mod fallback;
pub mod observability;
pub mod pipeline;
pub mod providers;
pub mod quality;
pub mod retry;
pub mod review;
pub mod store;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::budget::{
        AlertThresholds, AlertTransport, BudgetConfig, BudgetStatus, BudgetTracker,
        ThresholdAlerter,
    };
    pub use crate::config::StageguardConfig;
    pub use crate::cost::{CostLedger, CostSummary, PricingTable, ServiceCategory};
    pub use crate::decision::{
        DecisionConfig, PipelineContext, PrePublishDecisionEngine, PublishDecision,
        QualityDecision, QualityIssue, StageSignal,
    };
    pub use crate::errors::{ConfigError, ProviderError, StageExecutionError, StageguardError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::{
        ExecuteOptions, StageContext, StageExecutor, StageResult, UnitOutput,
    };
    pub use crate::fallback::{FallbackChain, FallbackOutcome};
    pub use crate::pipeline::{
        run_bounded, PipelineRun, PublishClearance, RunDependencies, RunLock,
    };
    pub use crate::providers::{FnProvider, Provider, ProviderInfo, ProviderTier};
    pub use crate::quality::{GateResult, GateStatus, QualityGate, QualityGateRegistry};
    pub use crate::retry::{with_retry, RetryConfig, RetryPolicy};
    pub use crate::review::{InMemoryReviewQueue, ReviewOutcome, ReviewStore};
    pub use crate::store::{DocumentStore, InMemoryDocumentStore, JsonFileStore};
}
