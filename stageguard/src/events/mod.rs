//! Lifecycle events.
//!
//! Executors and the decision engine report what they do through an
//! injected [`EventSink`]. There is no process-global sink: every component
//! that emits takes an `Arc<dyn EventSink>` at construction.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names.
pub mod event_types {
    /// A stage began executing.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage finished and passed its gate.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// A stage raised an error or failed its gate.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// A quality gate was evaluated.
    pub const QUALITY_GATE: &str = "stage.quality_gate";
    /// A pre-publish decision was made.
    pub const DECISION_MADE: &str = "decision.made";
    /// A human review item was created.
    pub const REVIEW_CREATED: &str = "review.created";
    /// A human review item was resolved.
    pub const REVIEW_RESOLVED: &str = "review.resolved";
}
