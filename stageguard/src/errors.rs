//! Error types for the stageguard reliability layer.
//!
//! The taxonomy separates configuration errors (never retried), provider
//! errors (tagged recoverable or fatal when they are created), aggregated
//! retry and fallback failures that carry their full history, and the single
//! normalized shape that leaves a stage boundary.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::fallback::ProviderAttempt;
use crate::retry::RetryAttemptRecord;

/// The main error type for stageguard operations.
#[derive(Debug, Error)]
pub enum StageguardError {
    /// Invalid configuration.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A single provider call failed.
    #[error("{0}")]
    Provider(#[from] ProviderError),

    /// A retry policy gave up.
    #[error("{0}")]
    RetryExhausted(#[from] RetryExhaustedError),

    /// Every provider in a fallback chain failed.
    #[error("{0}")]
    FallbackExhausted(#[from] FallbackExhaustedError),

    /// A stage failed; already normalized.
    #[error("{0}")]
    StageExecution(#[from] StageExecutionError),

    /// A quality gate returned FAIL for the owning stage.
    #[error("Quality gate failed for stage '{stage}': {reason}")]
    QualityGateFailed {
        /// The stage whose output failed the gate.
        stage: String,
        /// Why the gate failed.
        reason: String,
    },

    /// The document store failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// The review workflow failed.
    #[error("{0}")]
    Review(#[from] ReviewError),

    /// Another pipeline run currently holds the run lock.
    #[error("Pipeline run already in progress: {active_run_id}")]
    RunInProgress {
        /// The run currently holding the lock.
        active_run_id: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StageguardError {
    /// Stable machine-readable error code.
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            Self::Config(_) => "CONFIG_INVALID".to_string(),
            Self::Provider(e) => e.code.clone(),
            Self::RetryExhausted(e) => e.code().to_string(),
            Self::FallbackExhausted(_) => "FALLBACK_EXHAUSTED".to_string(),
            Self::StageExecution(e) => e.code.clone(),
            Self::QualityGateFailed { .. } => "QUALITY_GATE_FAILED".to_string(),
            Self::Store(_) => "STORE_ERROR".to_string(),
            Self::Review(e) => e.code().to_string(),
            Self::RunInProgress { .. } => "RUN_IN_PROGRESS".to_string(),
            Self::Serialization(_) => "SERIALIZATION_ERROR".to_string(),
            Self::Internal(_) => "INTERNAL_ERROR".to_string(),
            Self::Io(_) => "IO_ERROR".to_string(),
        }
    }

    /// Name of the error variant, used when normalizing at stage boundaries.
    #[must_use]
    pub fn error_name(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Provider(_) => "ProviderError",
            Self::RetryExhausted(_) => "RetryExhaustedError",
            Self::FallbackExhausted(_) => "FallbackExhaustedError",
            Self::StageExecution(_) => "StageExecutionError",
            Self::QualityGateFailed { .. } => "QualityGateError",
            Self::Store(_) => "StoreError",
            Self::Review(_) => "ReviewError",
            Self::RunInProgress { .. } => "RunInProgressError",
            Self::Serialization(_) => "SerializationError",
            Self::Internal(_) => "InternalError",
            Self::Io(_) => "IoError",
        }
    }

    /// Whether retrying the failed operation could succeed.
    ///
    /// Only single provider errors and IO errors can be recoverable;
    /// aggregated failures are terminal by construction.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Provider(e) => e.recoverable,
            Self::StageExecution(e) => e.recoverable,
            Self::Io(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StageguardError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Error raised when configuration values are invalid.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid configuration for '{field}': {message}")]
pub struct ConfigError {
    /// The offending field.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Error returned by a provider invocation.
///
/// Recoverability is decided by the code that creates the error and is never
/// inferred later.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("Provider error [{code}]{}: {message}", provider_suffix(.provider))]
pub struct ProviderError {
    /// Provider that raised the error, when known.
    pub provider: Option<String>,
    /// Error code (e.g. "TIMEOUT", "HTTP_503").
    pub code: String,
    /// Human readable message.
    pub message: String,
    /// Whether the failure is transient.
    pub recoverable: bool,
    /// Upstream status code, if the provider speaks HTTP.
    pub status: Option<u16>,
}

fn provider_suffix(provider: &Option<String>) -> String {
    provider
        .as_ref()
        .map(|p| format!(" from '{p}'"))
        .unwrap_or_default()
}

impl ProviderError {
    /// Creates a recoverable (transient) error.
    #[must_use]
    pub fn recoverable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: None,
            code: code.into(),
            message: message.into(),
            recoverable: true,
            status: None,
        }
    }

    /// Creates a fatal error that must not be retried.
    #[must_use]
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            recoverable: false,
            ..Self::recoverable(code, message)
        }
    }

    /// Creates a recoverable timeout error.
    #[must_use]
    pub fn timeout(after_ms: u64) -> Self {
        Self::recoverable("TIMEOUT", format!("attempt timed out after {after_ms}ms"))
    }

    /// Classifies an HTTP status: 408, 429 and 5xx are transient.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let transient = status == 408 || status == 429 || (500..600).contains(&status);
        let mut err = if transient {
            Self::recoverable(format!("HTTP_{status}"), message)
        } else {
            Self::fatal(format!("HTTP_{status}"), message)
        };
        err.status = Some(status);
        err
    }

    /// Tags the error with the provider that raised it.
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

/// Why a retry policy stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStopReason {
    /// Every allowed attempt failed with a recoverable error.
    Exhausted,
    /// A fatal error stopped the policy early.
    Fatal,
}

impl RetryStopReason {
    fn label(self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::Fatal => "aborted on fatal error",
        }
    }
}

/// Aggregated failure raised by a retry policy.
#[derive(Debug, Clone, Error)]
#[error(
    "Retry {} after {attempts} attempt(s) ({total_delay_ms}ms backoff): {last_error}",
    .reason.label()
)]
pub struct RetryExhaustedError {
    /// Number of attempts made.
    pub attempts: usize,
    /// Total time spent waiting between attempts.
    pub total_delay_ms: u64,
    /// Per-attempt history, in order.
    pub history: Vec<RetryAttemptRecord>,
    /// The final error observed.
    pub last_error: ProviderError,
    /// Why the policy stopped.
    pub reason: RetryStopReason,
}

impl RetryExhaustedError {
    /// Error code for the aggregated failure.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self.reason {
            RetryStopReason::Exhausted => "RETRY_EXHAUSTED",
            RetryStopReason::Fatal => "RETRY_ABORTED_FATAL",
        }
    }
}

/// Raised when every provider in a fallback chain failed.
///
/// Never recoverable: there is nothing left to fall back to.
#[derive(Debug, Clone, Error)]
#[error("All {} provider(s) failed: {}", .failures.len(), summarize_failures(.failures))]
pub struct FallbackExhaustedError {
    /// One entry per provider, in chain order.
    pub failures: Vec<ProviderAttempt>,
}

fn summarize_failures(failures: &[ProviderAttempt]) -> String {
    failures
        .iter()
        .map(|f| {
            format!(
                "{} ({})",
                f.provider,
                f.error_code.as_deref().unwrap_or("unknown")
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// The uniform failure shape that leaves a stage boundary.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[error("Stage '{stage}' failed [{code}] {error_name}: {message}")]
pub struct StageExecutionError {
    /// The stage that failed.
    pub stage: String,
    /// Name of the original error type.
    pub error_name: String,
    /// Original error message.
    pub message: String,
    /// Original error code.
    pub code: String,
    /// Whether the original failure was recoverable.
    pub recoverable: bool,
    /// Extra diagnostic context (attempt history, provider failures).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl StageExecutionError {
    /// Creates a new stage execution error.
    #[must_use]
    pub fn new(
        stage: impl Into<String>,
        error_name: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            error_name: error_name.into(),
            message: message.into(),
            code: code.into(),
            recoverable: false,
            context: HashMap::new(),
        }
    }

    /// Normalizes any stageguard error raised inside a stage.
    #[must_use]
    pub fn from_error(stage: impl Into<String>, err: &StageguardError) -> Self {
        let stage = stage.into();
        if let StageguardError::StageExecution(inner) = err {
            // Already normalized; keep the original stage attribution.
            return inner.clone();
        }

        let mut normalized = Self::new(&stage, err.error_name(), err.code(), err.to_string());
        normalized.recoverable = err.is_recoverable();

        match err {
            StageguardError::RetryExhausted(e) => {
                normalized
                    .context
                    .insert("attempts".to_string(), serde_json::json!(e.attempts));
                normalized.context.insert(
                    "total_delay_ms".to_string(),
                    serde_json::json!(e.total_delay_ms),
                );
                normalized.context.insert(
                    "history".to_string(),
                    serde_json::to_value(&e.history).unwrap_or_default(),
                );
            }
            StageguardError::FallbackExhausted(e) => {
                normalized.context.insert(
                    "providers".to_string(),
                    serde_json::to_value(&e.failures).unwrap_or_default(),
                );
            }
            StageguardError::Provider(e) => {
                if let Some(ref provider) = e.provider {
                    normalized
                        .context
                        .insert("provider".to_string(), serde_json::json!(provider));
                }
            }
            _ => {}
        }

        normalized
    }

    /// Adds a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }
}

/// Errors raised by a document store.
#[derive(Debug, Clone, Error)]
#[error("Store error on {collection}/{id}: {message}")]
pub struct StoreError {
    /// Collection path.
    pub collection: String,
    /// Document id.
    pub id: String,
    /// What went wrong.
    pub message: String,
}

impl StoreError {
    /// Creates a new store error.
    #[must_use]
    pub fn new(
        collection: impl Into<String>,
        id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            message: message.into(),
        }
    }
}

/// Errors related to the human review workflow.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReviewError {
    /// No review item with this id exists.
    #[error("Review item not found: {review_id}")]
    NotFound {
        /// The review id.
        review_id: String,
    },

    /// The review item has already been resolved.
    #[error("Review item already resolved: {review_id}")]
    AlreadyResolved {
        /// The review id.
        review_id: String,
    },

    /// Waiting for a resolution timed out.
    #[error("Timed out waiting for review {review_id} after {timeout_seconds}s")]
    TimedOut {
        /// The review id.
        review_id: String,
        /// How long we waited.
        timeout_seconds: u64,
    },

    /// The decision does not require review.
    #[error("Decision for run {run_id} does not require review")]
    NotRequired {
        /// The pipeline run id.
        run_id: String,
    },
}

impl ReviewError {
    /// Error code for the review failure.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "REVIEW_NOT_FOUND",
            Self::AlreadyResolved { .. } => "REVIEW_ALREADY_RESOLVED",
            Self::TimedOut { .. } => "REVIEW_TIMED_OUT",
            Self::NotRequired { .. } => "REVIEW_NOT_REQUIRED",
        }
    }
}
