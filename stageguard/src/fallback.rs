//! Ordered fallback across alternative providers.
//!
//! Providers are tried strictly in declared order. When a retry policy is
//! attached, each provider is retried before the chain moves on. The first
//! success short-circuits; if every provider fails the chain raises a single
//! non-recoverable [`FallbackExhaustedError`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::{ConfigError, FallbackExhaustedError, ProviderError, StageguardError};
use crate::providers::{Provider, ProviderInfo, ProviderTier};
use crate::retry::RetryPolicy;

/// What happened when one provider in the chain was tried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAttempt {
    /// Provider name.
    pub provider: String,
    /// Position in the chain.
    pub index: usize,
    /// Attempts spent on this provider, including retries.
    pub attempts: usize,
    /// Whether this provider produced the result.
    pub succeeded: bool,
    /// Code of the final error, if it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Message of the final error, if it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ProviderAttempt {
    /// Records a successful provider.
    #[must_use]
    pub fn succeeded(provider: impl Into<String>, index: usize, attempts: usize) -> Self {
        Self {
            provider: provider.into(),
            index,
            attempts,
            succeeded: true,
            error_code: None,
            error_message: None,
        }
    }

    /// Records a failed provider.
    #[must_use]
    pub fn failed(
        provider: impl Into<String>,
        index: usize,
        attempts: usize,
        error: &ProviderError,
    ) -> Self {
        Self {
            provider: provider.into(),
            index,
            attempts,
            succeeded: false,
            error_code: Some(error.code.clone()),
            error_message: Some(error.message.clone()),
        }
    }
}

/// Successful result of a fallback chain.
#[derive(Debug, Clone)]
pub struct FallbackOutcome<O> {
    /// The value produced.
    pub value: O,
    /// Name of the provider that produced it.
    pub provider_name: String,
    /// Primary or fallback.
    pub tier: ProviderTier,
    /// Attempts spent across the whole chain.
    pub total_attempts: usize,
    /// One entry per provider tried, in order.
    pub attempt_log: Vec<ProviderAttempt>,
}

impl<O> FallbackOutcome<O> {
    /// Provider info for the stage result.
    #[must_use]
    pub fn provider_info(&self) -> ProviderInfo {
        ProviderInfo::new(&self.provider_name, self.tier, self.total_attempts)
    }

    /// Maps the value, keeping the bookkeeping.
    pub fn map<U>(self, f: impl FnOnce(O) -> U) -> FallbackOutcome<U> {
        FallbackOutcome {
            value: f(self.value),
            provider_name: self.provider_name,
            tier: self.tier,
            total_attempts: self.total_attempts,
            attempt_log: self.attempt_log,
        }
    }
}

/// An ordered list of providers for one logical call.
pub struct FallbackChain<I, O> {
    name: String,
    providers: Vec<Arc<dyn Provider<I, O>>>,
    retry: Option<RetryPolicy>,
}

impl<I, O> FallbackChain<I, O>
where
    I: Send + Sync,
    O: Send,
{
    /// Creates an empty chain.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            providers: Vec::new(),
            retry: None,
        }
    }

    /// Appends a provider; order of calls is order of tries.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn Provider<I, O>>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Retries each provider under `policy` before moving to the next.
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Chain name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provider names in try order.
    #[must_use]
    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Runs the chain for one input.
    pub async fn run(&self, input: &I) -> Result<FallbackOutcome<O>, StageguardError> {
        if self.providers.is_empty() {
            return Err(ConfigError::new(
                "providers",
                format!("fallback chain '{}' has no providers", self.name),
            )
            .into());
        }

        let mut attempt_log: Vec<ProviderAttempt> = Vec::with_capacity(self.providers.len());
        let mut total_attempts = 0usize;

        for (index, provider) in self.providers.iter().enumerate() {
            let name = provider.name().to_string();
            let tier = ProviderTier::from_index(index);

            match self.try_provider(provider, input).await {
                Ok((value, attempts)) => {
                    total_attempts += attempts;
                    attempt_log.push(ProviderAttempt::succeeded(&name, index, attempts));
                    if tier.is_fallback() {
                        info!(
                            chain = %self.name,
                            provider = %name,
                            index,
                            total_attempts,
                            "Fallback provider succeeded"
                        );
                    }
                    return Ok(FallbackOutcome {
                        value,
                        provider_name: name,
                        tier,
                        total_attempts,
                        attempt_log,
                    });
                }
                Err((error, attempts)) => {
                    total_attempts += attempts;
                    warn!(
                        chain = %self.name,
                        provider = %name,
                        index,
                        attempts,
                        error = %error,
                        "Provider failed, moving down the chain"
                    );
                    attempt_log.push(ProviderAttempt::failed(&name, index, attempts, &error));
                }
            }
        }

        warn!(
            chain = %self.name,
            providers = attempt_log.len(),
            total_attempts,
            "Fallback chain exhausted"
        );
        Err(FallbackExhaustedError {
            failures: attempt_log,
        }
        .into())
    }

    async fn try_provider(
        &self,
        provider: &Arc<dyn Provider<I, O>>,
        input: &I,
    ) -> Result<(O, usize), (ProviderError, usize)> {
        let name = provider.name().to_string();
        match &self.retry {
            Some(policy) => {
                let result = policy
                    .run(&name, || {
                        let provider = Arc::clone(provider);
                        async move { provider.invoke(input).await }
                    })
                    .await;
                match result {
                    Ok(outcome) => Ok((outcome.value, outcome.attempts)),
                    Err(exhausted) => Err((
                        exhausted.last_error.with_provider(&name),
                        exhausted.attempts,
                    )),
                }
            }
            None => provider
                .invoke(input)
                .await
                .map(|value| (value, 1))
                .map_err(|e| (e.with_provider(&name), 1)),
        }
    }
}

impl<I, O> std::fmt::Debug for FallbackChain<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackChain")
            .field("name", &self.name)
            .field(
                "providers",
                &self.providers.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
            )
            .field("retry", &self.retry.is_some())
            .finish()
    }
}
