//! Provider capability and tier bookkeeping.
//!
//! A provider is anything with a name and an async `invoke` that fails with
//! a [`ProviderError`] tagged recoverable or fatal. Concrete speech, LLM and
//! rendering clients live outside this crate and implement [`Provider`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;

use crate::errors::ProviderError;

/// Whether a result came from the first-listed provider or a later one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTier {
    /// First provider in the chain.
    #[default]
    Primary,
    /// Any provider after the first.
    Fallback,
}

impl ProviderTier {
    /// Tier for a chain position.
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        if index == 0 {
            Self::Primary
        } else {
            Self::Fallback
        }
    }

    /// Returns true for fallback results.
    #[must_use]
    pub fn is_fallback(self) -> bool {
        matches!(self, Self::Fallback)
    }
}

impl fmt::Display for ProviderTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Which provider answered a stage and what it cost in attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Provider name.
    pub name: String,
    /// Primary or fallback.
    pub tier: ProviderTier,
    /// Attempts spent, including retries. Always at least 1.
    pub attempts: usize,
}

impl ProviderInfo {
    /// Creates provider info; `attempts` is raised to 1 if lower.
    #[must_use]
    pub fn new(name: impl Into<String>, tier: ProviderTier, attempts: usize) -> Self {
        Self {
            name: name.into(),
            tier,
            attempts: attempts.max(1),
        }
    }

    /// Primary provider answering on the first attempt.
    #[must_use]
    pub fn primary(name: impl Into<String>) -> Self {
        Self::new(name, ProviderTier::Primary, 1)
    }

    /// Used when a unit of work does not report its provider.
    #[must_use]
    pub fn unknown() -> Self {
        Self::primary("unknown")
    }
}

impl Default for ProviderInfo {
    fn default() -> Self {
        Self::unknown()
    }
}

/// An external capability that can be tried within a fallback chain.
///
/// Implementations decide recoverability when they build the error.
#[async_trait]
pub trait Provider<I, O>: Send + Sync {
    /// Provider name, used in logs, tiers and cost attribution.
    fn name(&self) -> &str;

    /// Invokes the provider.
    async fn invoke(&self, input: &I) -> Result<O, ProviderError>;
}

/// A provider backed by an async closure.
///
/// The closure receives an owned clone of the input.
pub struct FnProvider<F, Fut> {
    name: String,
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnProvider<F, Fut> {
    /// Creates a new closure-backed provider.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> fmt::Debug for FnProvider<F, Fut> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProvider")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<I, O, F, Fut> Provider<I, O> for FnProvider<F, Fut>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync,
    Fut: Future<Output = Result<O, ProviderError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, input: &I) -> Result<O, ProviderError> {
        (self.func)(input.clone()).await
    }
}
