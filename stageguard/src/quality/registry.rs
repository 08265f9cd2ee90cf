//! Gate registry keyed by stage name.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::gates::{self, GateThresholds};

/// Gate verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GateStatus {
    /// Output is acceptable.
    Pass,
    /// Acceptable but worth flagging.
    Warn,
    /// Output must not be used.
    Fail,
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Warn => write!(f, "WARN"),
            Self::Fail => write!(f, "FAIL"),
        }
    }
}

/// Result of evaluating one gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    /// Verdict.
    pub status: GateStatus,
    /// Measured values.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    /// Warnings raised.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Why the gate did not pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl GateResult {
    /// A passing result.
    #[must_use]
    pub fn pass() -> Self {
        Self {
            status: GateStatus::Pass,
            metrics: BTreeMap::new(),
            warnings: Vec::new(),
            reason: None,
        }
    }

    /// A warning result.
    #[must_use]
    pub fn warn(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            status: GateStatus::Warn,
            warnings: vec![reason.clone()],
            reason: Some(reason),
            ..Self::pass()
        }
    }

    /// A failing result.
    #[must_use]
    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            status: GateStatus::Fail,
            reason: Some(reason.into()),
            ..Self::pass()
        }
    }

    /// Adds a metric.
    #[must_use]
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// Adds a warning without changing the status.
    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    /// True unless the status is FAIL.
    #[must_use]
    pub fn is_acceptable(&self) -> bool {
        self.status != GateStatus::Fail
    }
}

/// Raised by a gate that could not evaluate its input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct GateError(pub String);

impl GateError {
    /// A required field was missing or had the wrong type.
    #[must_use]
    pub fn missing_field(field: &str) -> Self {
        Self(format!("missing or non-numeric field '{field}'"))
    }
}

/// A quality check over a stage's serialized output.
pub trait QualityGate: Send + Sync {
    /// Evaluates the output.
    fn evaluate(&self, output: &Value) -> Result<GateResult, GateError>;
}

impl<F> QualityGate for F
where
    F: Fn(&Value) -> Result<GateResult, GateError> + Send + Sync,
{
    fn evaluate(&self, output: &Value) -> Result<GateResult, GateError> {
        self(output)
    }
}

/// Registry of gates keyed by stage name.
#[derive(Default)]
pub struct QualityGateRegistry {
    gates: RwLock<HashMap<String, Arc<dyn QualityGate>>>,
}

impl QualityGateRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in `script`, `narration`, `timing`,
    /// `visuals` and `render` gates.
    #[must_use]
    pub fn with_defaults(thresholds: &GateThresholds) -> Self {
        let registry = Self::new();
        registry.register("script", gates::script_gate(thresholds.script.clone()));
        registry.register("narration", gates::narration_gate(thresholds.narration.clone()));
        registry.register("timing", gates::timing_gate(thresholds.timing.clone()));
        registry.register("visuals", gates::visuals_gate(thresholds.visuals.clone()));
        registry.register("render", gates::render_gate(thresholds.render.clone()));
        registry
    }

    /// Registers or replaces the gate for a stage.
    pub fn register(&self, stage: impl Into<String>, gate: impl QualityGate + 'static) {
        let stage = stage.into();
        debug!(stage = %stage, "Registered quality gate");
        self.gates.write().insert(stage, Arc::new(gate));
    }

    /// Returns true if the stage has a gate.
    #[must_use]
    pub fn has_gate(&self, stage: &str) -> bool {
        self.gates.read().contains_key(stage)
    }

    /// Registered stage names, sorted.
    #[must_use]
    pub fn stages(&self) -> Vec<String> {
        let mut stages: Vec<String> = self.gates.read().keys().cloned().collect();
        stages.sort();
        stages
    }

    /// Runs the stage's gate over `output`.
    ///
    /// An unregistered stage passes with a warning. A gate that errors or
    /// panics yields FAIL with the failure as the reason.
    #[must_use]
    pub fn check(&self, stage: &str, output: &Value) -> GateResult {
        let gate = self.gates.read().get(stage).cloned();
        let Some(gate) = gate else {
            warn!(stage, "No quality gate registered; passing by default");
            return GateResult::pass()
                .with_warning(format!("no quality gate registered for stage '{stage}'"));
        };

        match catch_unwind(AssertUnwindSafe(|| gate.evaluate(output))) {
            Ok(Ok(result)) => {
                debug!(stage, status = %result.status, "Quality gate evaluated");
                result
            }
            Ok(Err(e)) => {
                warn!(stage, error = %e, "Quality gate could not evaluate output");
                GateResult::fail(format!("gate evaluation failed: {e}"))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(stage, panic = %message, "Quality gate panicked");
                GateResult::fail(format!("gate panicked: {message}"))
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl fmt::Debug for QualityGateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QualityGateRegistry")
            .field("stages", &self.stages())
            .finish()
    }
}
