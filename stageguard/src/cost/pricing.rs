//! Rates for turning usage into USD.

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Pricing rates used by the ledger's convenience recorders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    /// USD per million LLM input tokens.
    #[serde(default = "default_llm_input")]
    pub llm_input_per_million_usd: f64,
    /// USD per million LLM output tokens.
    #[serde(default = "default_llm_output")]
    pub llm_output_per_million_usd: f64,
    /// USD per million synthesized characters.
    #[serde(default = "default_tts_chars")]
    pub tts_per_million_chars_usd: f64,
    /// USD per rendered minute of video.
    #[serde(default = "default_render_minute")]
    pub render_per_minute_usd: f64,
}

fn default_llm_input() -> f64 {
    0.30
}

fn default_llm_output() -> f64 {
    2.50
}

fn default_tts_chars() -> f64 {
    16.0
}

fn default_render_minute() -> f64 {
    0.02
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            llm_input_per_million_usd: default_llm_input(),
            llm_output_per_million_usd: default_llm_output(),
            tts_per_million_chars_usd: default_tts_chars(),
            render_per_minute_usd: default_render_minute(),
        }
    }
}

impl PricingTable {
    /// Sets LLM token rates.
    #[must_use]
    pub fn with_llm_rates(mut self, input_per_million: f64, output_per_million: f64) -> Self {
        self.llm_input_per_million_usd = input_per_million;
        self.llm_output_per_million_usd = output_per_million;
        self
    }

    /// Sets the TTS character rate.
    #[must_use]
    pub fn with_tts_rate(mut self, per_million_chars: f64) -> Self {
        self.tts_per_million_chars_usd = per_million_chars;
        self
    }

    /// Sets the render rate.
    #[must_use]
    pub fn with_render_rate(mut self, per_minute: f64) -> Self {
        self.render_per_minute_usd = per_minute;
        self
    }

    /// Cost of an LLM call.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn llm_cost(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        (tokens_in as f64 * self.llm_input_per_million_usd
            + tokens_out as f64 * self.llm_output_per_million_usd)
            / 1_000_000.0
    }

    /// Cost of synthesizing `characters` characters.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn tts_cost(&self, characters: u64) -> f64 {
        characters as f64 * self.tts_per_million_chars_usd / 1_000_000.0
    }

    /// Cost of rendering `minutes` of video.
    #[must_use]
    pub fn render_cost(&self, minutes: f64) -> f64 {
        minutes.max(0.0) * self.render_per_minute_usd
    }

    /// Validates that every rate is finite and non-negative.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rates = [
            ("llm_input_per_million_usd", self.llm_input_per_million_usd),
            ("llm_output_per_million_usd", self.llm_output_per_million_usd),
            ("tts_per_million_chars_usd", self.tts_per_million_chars_usd),
            ("render_per_minute_usd", self.render_per_minute_usd),
        ];
        for (field, rate) in rates {
            if !rate.is_finite() || rate < 0.0 {
                return Err(ConfigError::new(field, "must be a finite, non-negative rate"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_cost() {
        let pricing = PricingTable::default().with_llm_rates(1.0, 2.0);
        let cost = pricing.llm_cost(500_000, 250_000);
        assert!((cost - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_tts_and_render_cost() {
        let pricing = PricingTable::default().with_tts_rate(16.0).with_render_rate(0.5);
        assert!((pricing.tts_cost(10_000) - 0.16).abs() < 1e-9);
        assert!((pricing.render_cost(4.0) - 2.0).abs() < 1e-9);
        assert_eq!(pricing.render_cost(-1.0), 0.0);
    }

    #[test]
    fn test_validate_rejects_negative_rates() {
        assert!(PricingTable::default().validate().is_ok());
        let err = PricingTable::default().with_tts_rate(-1.0).validate().unwrap_err();
        assert_eq!(err.field, "tts_per_million_chars_usd");
    }
}
