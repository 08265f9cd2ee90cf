//! Retry policy with exponential backoff and jitter.
//!
//! Runs an operation, retrying recoverable provider failures. The delay
//! before retry `n` (0-indexed) is
//! `min(base * 2^n, max) * (0.5 + random * 0.5)`, so concurrent pipeline
//! runs never retry in lockstep and no delay exceeds `max_delay_ms`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::{ConfigError, ProviderError, RetryExhaustedError, RetryStopReason, StageguardError};

/// Lower bound of the jitter multiplier.
pub const JITTER_MIN: f64 = 0.5;
/// Upper bound of the jitter multiplier.
pub const JITTER_MAX: f64 = 1.0;

/// Configuration for retry behavior.
///
/// Fields are signed so that configuration loaded from JSON or the
/// environment can be validated instead of silently wrapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    /// Base delay between retries in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: i64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: i64,
    /// Per-attempt timeout; an expired attempt counts as a recoverable failure.
    #[serde(default)]
    pub attempt_timeout_ms: Option<u64>,
}

fn default_max_retries() -> i64 {
    3
}

fn default_base_delay_ms() -> i64 {
    1000
}

fn default_max_delay_ms() -> i64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            attempt_timeout_ms: None,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, retries: i64) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: i64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: i64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_attempt_timeout_ms(mut self, timeout: u64) -> Self {
        self.attempt_timeout_ms = Some(timeout);
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries < 0 {
            return Err(ConfigError::new("max_retries", "must be >= 0"));
        }
        if self.base_delay_ms < 0 {
            return Err(ConfigError::new("base_delay_ms", "must be >= 0"));
        }
        if self.max_delay_ms < 0 {
            return Err(ConfigError::new("max_delay_ms", "must be >= 0"));
        }
        if self.attempt_timeout_ms == Some(0) {
            return Err(ConfigError::new(
                "attempt_timeout_ms",
                "must be positive when provided",
            ));
        }
        Ok(())
    }
}

/// Diagnostic record for one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAttemptRecord {
    /// 1-based attempt number.
    pub attempt_number: usize,
    /// Error code of the failure.
    pub error_code: String,
    /// Delay applied before the next attempt (0 when none followed).
    pub delay_ms: u64,
}

/// Successful result of a retried operation.
#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    /// The value returned by the successful attempt.
    pub value: T,
    /// Total attempts, including the successful one.
    pub attempts: usize,
    /// Total backoff time spent.
    pub total_delay_ms: u64,
    /// Failed attempts that preceded the success.
    pub history: Vec<RetryAttemptRecord>,
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more retries, give up.
    GiveUp,
    /// Don't retry, the error is not retryable.
    NotRetryable,
}

/// Deterministic part of the delay: `min(base * 2^attempt, max)`.
#[must_use]
pub fn backoff_ceiling_ms(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let factor = 2u64.saturating_pow(attempt);
    base_delay_ms.saturating_mul(factor).min(max_delay_ms)
}

/// Scales a delay by a jitter multiplier clamped to `[0.5, 1.0]`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn apply_jitter(ceiling_ms: u64, multiplier: f64) -> u64 {
    let multiplier = multiplier.clamp(JITTER_MIN, JITTER_MAX);
    (ceiling_ms as f64 * multiplier).floor() as u64
}

/// Calculates the jittered delay for a 0-indexed retry attempt.
#[must_use]
pub fn calculate_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> Duration {
    let ceiling = backoff_ceiling_ms(attempt, base_delay_ms, max_delay_ms);
    let multiplier = JITTER_MIN + rand::thread_rng().gen::<f64>() * (JITTER_MAX - JITTER_MIN);
    Duration::from_millis(apply_jitter(ceiling, multiplier))
}

/// A validated retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    base_delay_ms: u64,
    max_delay_ms: u64,
    attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Builds a policy, rejecting invalid configuration up front.
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub fn new(config: &RetryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            max_retries: config.max_retries as usize,
            base_delay_ms: config.base_delay_ms as u64,
            max_delay_ms: config.max_delay_ms as u64,
            attempt_timeout: config.attempt_timeout_ms.map(Duration::from_millis),
        })
    }

    /// Maximum attempts, including the first one.
    #[must_use]
    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    /// Decides what to do after attempt `attempts_made` failed with `error`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn decide(&self, attempts_made: usize, error: &ProviderError) -> RetryDecision {
        if !error.recoverable {
            return RetryDecision::NotRetryable;
        }
        if attempts_made > self.max_retries {
            return RetryDecision::GiveUp;
        }
        let retry_index = attempts_made.saturating_sub(1) as u32;
        RetryDecision::Retry(calculate_delay(
            retry_index,
            self.base_delay_ms,
            self.max_delay_ms,
        ))
    }

    /// Runs `operation` until it succeeds, fails fatally, or retries run out.
    pub async fn run<T, F, Fut>(
        &self,
        key: &str,
        mut operation: F,
    ) -> Result<RetryOutcome<T>, RetryExhaustedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut history: Vec<RetryAttemptRecord> = Vec::new();
        let mut total_delay_ms: u64 = 0;
        let mut attempts = 0usize;

        loop {
            attempts += 1;
            let result = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, operation()).await {
                    Ok(inner) => inner,
                    Err(_) => Err(ProviderError::timeout(
                        u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    )),
                },
                None => operation().await,
            };

            let error = match result {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(key = %key, attempts, total_delay_ms, "Succeeded after retry");
                    }
                    return Ok(RetryOutcome {
                        value,
                        attempts,
                        total_delay_ms,
                        history,
                    });
                }
                Err(e) => e,
            };

            match self.decide(attempts, &error) {
                RetryDecision::Retry(delay) => {
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    history.push(RetryAttemptRecord {
                        attempt_number: attempts,
                        error_code: error.code.clone(),
                        delay_ms,
                    });
                    total_delay_ms = total_delay_ms.saturating_add(delay_ms);
                    debug!(
                        key = %key,
                        attempt = attempts,
                        delay_ms,
                        error = %error,
                        "Retrying after recoverable error"
                    );
                    tokio::time::sleep(delay).await;
                }
                decision => {
                    history.push(RetryAttemptRecord {
                        attempt_number: attempts,
                        error_code: error.code.clone(),
                        delay_ms: 0,
                    });
                    let reason = if decision == RetryDecision::NotRetryable {
                        RetryStopReason::Fatal
                    } else {
                        RetryStopReason::Exhausted
                    };
                    warn!(
                        key = %key,
                        attempts,
                        total_delay_ms,
                        reason = ?reason,
                        error = %error,
                        "Giving up on operation"
                    );
                    return Err(RetryExhaustedError {
                        attempts,
                        total_delay_ms,
                        history,
                        last_error: error,
                        reason,
                    });
                }
            }
        }
    }
}

/// Validates `config` and runs `operation` under it.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    key: &str,
    operation: F,
) -> Result<RetryOutcome<T>, StageguardError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let policy = RetryPolicy::new(config)?;
    Ok(policy.run(key, operation).await?)
}
