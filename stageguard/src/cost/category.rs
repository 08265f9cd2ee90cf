//! Service categorization rules.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::ConfigError;

/// Billing category of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceCategory {
    /// LLM and image generation calls.
    Gemini,
    /// Speech synthesis.
    Tts,
    /// Video rendering.
    Render,
    /// Matched no rule; still counted in totals.
    Unknown,
}

impl fmt::Display for ServiceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gemini => write!(f, "gemini"),
            Self::Tts => write!(f, "tts"),
            Self::Render => write!(f, "render"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One (pattern, category) rule.
#[derive(Debug, Clone)]
pub struct CategoryRule {
    pattern: Regex,
    category: ServiceCategory,
}

impl CategoryRule {
    /// Compiles a rule. Patterns are regular expressions.
    pub fn new(pattern: &str, category: ServiceCategory) -> Result<Self, ConfigError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| ConfigError::new("category_rules", format!("bad pattern '{pattern}': {e}")))?;
        Ok(Self { pattern, category })
    }

    /// The rule's pattern source.
    #[must_use]
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// The rule's category.
    #[must_use]
    pub fn category(&self) -> ServiceCategory {
        self.category
    }

    fn matches(&self, service: &str) -> bool {
        self.pattern.is_match(service)
    }
}

/// Ordered rule list; the first match wins, no match is `Unknown`.
#[derive(Debug, Clone)]
pub struct CategoryRules {
    rules: Vec<CategoryRule>,
}

impl CategoryRules {
    /// Builds rules from (pattern, category) pairs, in evaluation order.
    pub fn new<'a, I>(rules: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, ServiceCategory)>,
    {
        let rules = rules
            .into_iter()
            .map(|(pattern, category)| CategoryRule::new(pattern, category))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Categorizes a service name.
    #[must_use]
    pub fn categorize(&self, service: &str) -> ServiceCategory {
        self.rules
            .iter()
            .find(|rule| rule.matches(service))
            .map_or(ServiceCategory::Unknown, CategoryRule::category)
    }

    /// The rules in evaluation order.
    #[must_use]
    pub fn rules(&self) -> &[CategoryRule] {
        &self.rules
    }
}

const DEFAULT_RULES: &[(&str, ServiceCategory)] = &[
    (r"(?i)^gemini", ServiceCategory::Gemini),
    (r"(?i)^imagen", ServiceCategory::Gemini),
    (r"(?i)tts|text-to-speech|speech-synthesis", ServiceCategory::Tts),
    (r"(?i)render|remotion|lambda", ServiceCategory::Render),
];

impl Default for CategoryRules {
    fn default() -> Self {
        let rules = DEFAULT_RULES
            .iter()
            .filter_map(|(pattern, category)| CategoryRule::new(pattern, *category).ok())
            .collect();
        Self { rules }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules_compile() {
        assert_eq!(CategoryRules::default().rules().len(), DEFAULT_RULES.len());
    }

    #[test]
    fn test_default_categorization() {
        let rules = CategoryRules::default();
        assert_eq!(rules.categorize("gemini-2.5-flash"), ServiceCategory::Gemini);
        assert_eq!(rules.categorize("Gemini-Pro"), ServiceCategory::Gemini);
        assert_eq!(rules.categorize("imagen-3"), ServiceCategory::Gemini);
        assert_eq!(rules.categorize("google-tts"), ServiceCategory::Tts);
        assert_eq!(rules.categorize("cloud-text-to-speech"), ServiceCategory::Tts);
        assert_eq!(rules.categorize("remotion-lambda"), ServiceCategory::Render);
        assert_eq!(rules.categorize("video-render"), ServiceCategory::Render);
        assert_eq!(rules.categorize("whisper-stt"), ServiceCategory::Unknown);
    }

    #[test]
    fn test_first_rule_wins() {
        let rules = CategoryRules::new([
            ("tts", ServiceCategory::Tts),
            ("gemini", ServiceCategory::Gemini),
        ])
        .unwrap();
        assert_eq!(rules.categorize("gemini-tts"), ServiceCategory::Tts);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = CategoryRules::new([("(unclosed", ServiceCategory::Render)]).unwrap_err();
        assert_eq!(err.field, "category_rules");
    }

    #[test]
    fn test_category_serialize() {
        assert_eq!(serde_json::to_string(&ServiceCategory::Tts).unwrap(), r#""tts""#);
        assert_eq!(ServiceCategory::Unknown.to_string(), "unknown");
    }
}
