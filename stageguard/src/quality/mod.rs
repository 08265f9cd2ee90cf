//! Per-stage quality gates.
//!
//! A gate inspects a stage's serialized output and returns PASS, WARN or
//! FAIL with metrics. FAIL halts the stage; WARN is carried forward into
//! the pre-publish decision as a minor signal.

mod bounds;
mod gates;
mod registry;

pub use bounds::{BoundedMetric, MetricPosition};
pub use gates::{
    narration_gate, render_gate, script_gate, timing_gate, visuals_gate, GateThresholds,
    NarrationThresholds, RenderThresholds, TimingThresholds, VisualThresholds,
};
pub use registry::{GateError, GateResult, GateStatus, QualityGate, QualityGateRegistry};
