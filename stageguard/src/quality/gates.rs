//! Built-in gates for the standard content stages.
//!
//! Each gate reads a few fields from the stage output:
//!
//! | stage     | fields                                                        |
//! |-----------|---------------------------------------------------------------|
//! | script    | `word_count`, or `script` text                                |
//! | narration | `duration_seconds`, optional `audio_bytes`                    |
//! | timing    | `match_ratio`, or `matched_words` and `total_words`           |
//! | visuals   | `total_assets`, `fallback_assets`                             |
//! | render    | `duration_seconds`, `file_size_bytes`, optional `narration_duration_seconds` |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::bounds::{BoundedMetric, MetricPosition};
use super::registry::{GateError, GateResult, QualityGate};
use crate::errors::ConfigError;

/// Thresholds for the narration gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrationThresholds {
    /// Acceptable audio duration in seconds.
    pub duration_seconds: BoundedMetric,
    /// Smallest plausible audio payload.
    pub min_audio_bytes: u64,
}

impl Default for NarrationThresholds {
    fn default() -> Self {
        Self {
            duration_seconds: BoundedMetric::between(60.0, 1200.0, 30.0),
            min_audio_bytes: 1024,
        }
    }
}

/// Thresholds for the timing gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingThresholds {
    /// Below this ratio of aligned words the stage fails.
    pub min_match_ratio: f64,
    /// Below this ratio the stage warns.
    pub warn_match_ratio: f64,
}

impl Default for TimingThresholds {
    fn default() -> Self {
        Self {
            min_match_ratio: 0.80,
            warn_match_ratio: 0.95,
        }
    }
}

/// Thresholds for the visuals gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualThresholds {
    /// Above this fallback ratio the stage fails.
    pub max_fallback_ratio: f64,
}

impl Default for VisualThresholds {
    fn default() -> Self {
        Self {
            max_fallback_ratio: 0.50,
        }
    }
}

/// Thresholds for the render gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderThresholds {
    /// Smallest plausible video file.
    pub min_file_size_bytes: u64,
    /// Allowed drift between video and narration length.
    pub max_duration_drift_seconds: f64,
}

impl Default for RenderThresholds {
    fn default() -> Self {
        Self {
            min_file_size_bytes: 1_000_000,
            max_duration_drift_seconds: 2.0,
        }
    }
}

/// Thresholds for every built-in gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateThresholds {
    /// Script word count bounds.
    #[serde(default = "default_script_words")]
    pub script: BoundedMetric,
    /// Narration checks.
    #[serde(default)]
    pub narration: NarrationThresholds,
    /// Timing checks.
    #[serde(default)]
    pub timing: TimingThresholds,
    /// Visual asset checks.
    #[serde(default)]
    pub visuals: VisualThresholds,
    /// Render checks.
    #[serde(default)]
    pub render: RenderThresholds,
}

fn default_script_words() -> BoundedMetric {
    BoundedMetric::between(800.0, 2500.0, 100.0)
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            script: default_script_words(),
            narration: NarrationThresholds::default(),
            timing: TimingThresholds::default(),
            visuals: VisualThresholds::default(),
            render: RenderThresholds::default(),
        }
    }
}

impl GateThresholds {
    /// Validates every threshold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.script.validate("gates.script")?;
        self.narration.duration_seconds.validate("gates.narration.duration_seconds")?;
        let t = &self.timing;
        if !(0.0..=1.0).contains(&t.min_match_ratio) || t.warn_match_ratio < t.min_match_ratio {
            return Err(ConfigError::new(
                "gates.timing",
                "ratios must lie in [0, 1] with warn >= min",
            ));
        }
        if !(0.0..=1.0).contains(&self.visuals.max_fallback_ratio) {
            return Err(ConfigError::new(
                "gates.visuals.max_fallback_ratio",
                "must lie in [0, 1]",
            ));
        }
        Ok(())
    }
}

fn number(output: &Value, field: &str) -> Result<f64, GateError> {
    output
        .get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| GateError::missing_field(field))
}

fn optional_number(output: &Value, field: &str) -> Option<f64> {
    output.get(field).and_then(Value::as_f64)
}

fn bounded(metric: &str, value: f64, bounds: &BoundedMetric) -> GateResult {
    let result = match bounds.position(value) {
        MetricPosition::InRange => GateResult::pass(),
        MetricPosition::NearBound => {
            GateResult::warn(format!("{metric} {value} is close to the bounds {}", bounds.describe()))
        }
        MetricPosition::OutOfBounds => {
            GateResult::fail(format!("{metric} {value} is outside {}", bounds.describe()))
        }
    };
    result.with_metric(metric, value)
}

/// Gate over the script's word count.
pub fn script_gate(bounds: BoundedMetric) -> impl QualityGate {
    move |output: &Value| -> Result<GateResult, GateError> {
        #[allow(clippy::cast_precision_loss)]
        let words = match optional_number(output, "word_count") {
            Some(n) => n,
            None => output
                .get("script")
                .and_then(Value::as_str)
                .map(|text| text.split_whitespace().count() as f64)
                .ok_or_else(|| GateError::missing_field("word_count"))?,
        };
        Ok(bounded("word_count", words, &bounds))
    }
}

/// Gate over narration duration and payload size.
pub fn narration_gate(thresholds: NarrationThresholds) -> impl QualityGate {
    move |output: &Value| -> Result<GateResult, GateError> {
        let duration = number(output, "duration_seconds")?;
        let mut result = bounded("duration_seconds", duration, &thresholds.duration_seconds);

        if let Some(bytes) = optional_number(output, "audio_bytes") {
            result = result.with_metric("audio_bytes", bytes);
            #[allow(clippy::cast_precision_loss)]
            let min = thresholds.min_audio_bytes as f64;
            if bytes < min {
                let metrics = result.metrics;
                result = GateResult::fail(format!("audio payload of {bytes} bytes is below {min}"));
                result.metrics = metrics;
            }
        }
        Ok(result)
    }
}

/// Gate over word-level alignment between narration and script.
pub fn timing_gate(thresholds: TimingThresholds) -> impl QualityGate {
    move |output: &Value| -> Result<GateResult, GateError> {
        let ratio = match optional_number(output, "match_ratio") {
            Some(ratio) => ratio,
            None => {
                let matched = number(output, "matched_words")?;
                let total = number(output, "total_words")?;
                if total <= 0.0 {
                    return Err(GateError("timing output has no words".to_string()));
                }
                matched / total
            }
        };

        let result = if ratio < thresholds.min_match_ratio {
            GateResult::fail(format!(
                "only {:.0}% of words aligned, need {:.0}%",
                ratio * 100.0,
                thresholds.min_match_ratio * 100.0
            ))
        } else if ratio < thresholds.warn_match_ratio {
            GateResult::warn(format!("{:.0}% of words aligned", ratio * 100.0))
        } else {
            GateResult::pass()
        };
        Ok(result.with_metric("match_ratio", ratio))
    }
}

/// Gate over the share of visual assets that came from fallbacks.
pub fn visuals_gate(thresholds: VisualThresholds) -> impl QualityGate {
    move |output: &Value| -> Result<GateResult, GateError> {
        let total = number(output, "total_assets")?;
        let fallback = optional_number(output, "fallback_assets").unwrap_or(0.0);

        if total <= 0.0 {
            return Ok(GateResult::warn("no visual assets were produced")
                .with_metric("total_assets", 0.0));
        }

        let ratio = fallback / total;
        let result = if ratio > thresholds.max_fallback_ratio {
            GateResult::fail(format!(
                "{fallback} of {total} visual assets are fallbacks ({:.0}%)",
                ratio * 100.0
            ))
        } else if fallback > 0.0 {
            GateResult::warn(format!("{fallback} of {total} visual assets are fallbacks"))
        } else {
            GateResult::pass()
        };
        Ok(result
            .with_metric("total_assets", total)
            .with_metric("fallback_assets", fallback)
            .with_metric("fallback_ratio", ratio))
    }
}

/// Gate over the rendered video file.
pub fn render_gate(thresholds: RenderThresholds) -> impl QualityGate {
    move |output: &Value| -> Result<GateResult, GateError> {
        let duration = number(output, "duration_seconds")?;
        let size = number(output, "file_size_bytes")?;
        #[allow(clippy::cast_precision_loss)]
        let min_size = thresholds.min_file_size_bytes as f64;

        let mut result = if duration <= 0.0 {
            GateResult::fail("rendered video has no duration")
        } else if size < min_size {
            GateResult::fail(format!("rendered file of {size} bytes is below {min_size}"))
        } else {
            GateResult::pass()
        };

        if let Some(narration) = optional_number(output, "narration_duration_seconds") {
            let drift = (duration - narration).abs();
            result = result.with_metric("duration_drift_seconds", drift);
            if result.is_acceptable() && drift > thresholds.max_duration_drift_seconds {
                result = GateResult::warn(format!(
                    "video and narration differ by {drift:.1}s"
                ))
                .with_metric("duration_drift_seconds", drift);
            }
        }

        Ok(result
            .with_metric("duration_seconds", duration)
            .with_metric("file_size_bytes", size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::GateStatus;
    use serde_json::json;

    #[test]
    fn test_script_gate_word_count_and_text() {
        let gate = script_gate(BoundedMetric::between(3.0, 10.0, 1.0));
        assert_eq!(gate.evaluate(&json!({"word_count": 6})).unwrap().status, GateStatus::Pass);
        assert_eq!(gate.evaluate(&json!({"word_count": 3})).unwrap().status, GateStatus::Warn);
        assert_eq!(gate.evaluate(&json!({"word_count": 2})).unwrap().status, GateStatus::Fail);

        let from_text = gate.evaluate(&json!({"script": "one two three four five"})).unwrap();
        assert_eq!(from_text.metrics["word_count"], 5.0);
        assert!(gate.evaluate(&json!({})).is_err());
    }

    #[test]
    fn test_narration_gate() {
        let gate = narration_gate(NarrationThresholds::default());
        let ok = gate
            .evaluate(&json!({"duration_seconds": 480.0, "audio_bytes": 4_000_000}))
            .unwrap();
        assert_eq!(ok.status, GateStatus::Pass);

        let tiny = gate
            .evaluate(&json!({"duration_seconds": 480.0, "audio_bytes": 10}))
            .unwrap();
        assert_eq!(tiny.status, GateStatus::Fail);
        assert_eq!(tiny.metrics["duration_seconds"], 480.0);

        let short = gate.evaluate(&json!({"duration_seconds": 5.0})).unwrap();
        assert_eq!(short.status, GateStatus::Fail);
    }

    #[test]
    fn test_timing_gate() {
        let gate = timing_gate(TimingThresholds::default());
        assert_eq!(gate.evaluate(&json!({"match_ratio": 0.99})).unwrap().status, GateStatus::Pass);
        let warn = gate
            .evaluate(&json!({"matched_words": 90, "total_words": 100}))
            .unwrap();
        assert_eq!(warn.status, GateStatus::Warn);
        assert_eq!(gate.evaluate(&json!({"match_ratio": 0.5})).unwrap().status, GateStatus::Fail);
        assert!(gate.evaluate(&json!({"matched_words": 0, "total_words": 0})).is_err());
    }

    #[test]
    fn test_visuals_gate() {
        let gate = visuals_gate(VisualThresholds::default());
        let clean = gate.evaluate(&json!({"total_assets": 10, "fallback_assets": 0})).unwrap();
        assert_eq!(clean.status, GateStatus::Pass);
        let some = gate.evaluate(&json!({"total_assets": 10, "fallback_assets": 2})).unwrap();
        assert_eq!(some.status, GateStatus::Warn);
        assert_eq!(some.metrics["fallback_ratio"], 0.2);
        let most = gate.evaluate(&json!({"total_assets": 10, "fallback_assets": 6})).unwrap();
        assert_eq!(most.status, GateStatus::Fail);
        let none = gate.evaluate(&json!({"total_assets": 0})).unwrap();
        assert_eq!(none.status, GateStatus::Warn);
    }

    #[test]
    fn test_render_gate() {
        let gate = render_gate(RenderThresholds::default());
        let ok = gate
            .evaluate(&json!({
                "duration_seconds": 480.0,
                "file_size_bytes": 50_000_000,
                "narration_duration_seconds": 479.5
            }))
            .unwrap();
        assert_eq!(ok.status, GateStatus::Pass);

        let drift = gate
            .evaluate(&json!({
                "duration_seconds": 480.0,
                "file_size_bytes": 50_000_000,
                "narration_duration_seconds": 470.0
            }))
            .unwrap();
        assert_eq!(drift.status, GateStatus::Warn);
        assert_eq!(drift.metrics["duration_drift_seconds"], 10.0);

        let small = gate
            .evaluate(&json!({"duration_seconds": 480.0, "file_size_bytes": 100}))
            .unwrap();
        assert_eq!(small.status, GateStatus::Fail);
    }

    #[test]
    fn test_thresholds_validate() {
        assert!(GateThresholds::default().validate().is_ok());
        let mut bad = GateThresholds::default();
        bad.timing.warn_match_ratio = 0.5;
        assert!(bad.validate().is_err());
    }
}
