//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured default directive.

use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::errors::{ConfigError, StageguardError};

/// How logs are formatted and filtered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracingOptions {
    /// Emit newline-delimited JSON instead of human-readable lines.
    #[serde(default)]
    pub json: bool,
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_directive")]
    pub default_directive: String,
    /// Include the event target (module path).
    #[serde(default)]
    pub with_target: bool,
}

fn default_directive() -> String {
    "info".to_string()
}

impl Default for TracingOptions {
    fn default() -> Self {
        Self {
            json: false,
            default_directive: default_directive(),
            with_target: false,
        }
    }
}

impl TracingOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches to JSON output.
    #[must_use]
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Sets the fallback filter directive.
    #[must_use]
    pub fn with_default_directive(mut self, directive: impl Into<String>) -> Self {
        self.default_directive = directive.into();
        self
    }

    /// Includes event targets.
    #[must_use]
    pub fn with_target(mut self, with_target: bool) -> Self {
        self.with_target = with_target;
        self
    }

    /// Builds the filter from `RUST_LOG`, else the default directive.
    pub fn env_filter(&self) -> Result<EnvFilter, StageguardError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.default_directive).map_err(|e| {
                StageguardError::Config(ConfigError::new("default_directive", e.to_string()))
            }),
        }
    }
}

/// Installs the global subscriber.
///
/// Fails if the directive is invalid or a subscriber is already set.
pub fn init_tracing(options: &TracingOptions) -> Result<(), StageguardError> {
    let filter = options.env_filter()?;
    let result = if options.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(options.with_target).json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(options.with_target))
            .try_init()
    };
    result.map_err(|e| StageguardError::Internal(format!("tracing init failed: {e}")))
}
