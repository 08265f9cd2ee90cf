//! Scripted providers and recording transports.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::budget::{AlertPayload, AlertTransport};
use crate::errors::{ProviderError, StageguardError};
use crate::providers::Provider;

/// A provider that replays a script of results, then repeats a default.
#[derive(Debug)]
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    fallback: Result<String, ProviderError>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    /// Always succeeds with `value`.
    #[must_use]
    pub fn always_ok(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::scripted(name, Vec::new(), Ok(value.into()))
    }

    /// Always fails with `error`.
    #[must_use]
    pub fn always_fail(name: impl Into<String>, error: ProviderError) -> Self {
        Self::scripted(name, Vec::new(), Err(error))
    }

    /// Fails `failures` times with `error`, then succeeds with `value`.
    #[must_use]
    pub fn fails_then_ok(
        name: impl Into<String>,
        failures: usize,
        error: ProviderError,
        value: impl Into<String>,
    ) -> Self {
        let script = std::iter::repeat(Err(error)).take(failures).collect();
        Self::scripted(name, script, Ok(value.into()))
    }

    /// Replays `script`, then returns `then` forever.
    #[must_use]
    pub fn scripted(
        name: impl Into<String>,
        script: Vec<Result<String, ProviderError>>,
        then: Result<String, ProviderError>,
    ) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(script.into()),
            fallback: then,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of invocations so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<I: Send + Sync> Provider<I, String> for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _input: &I) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Captures alert payloads; can be told to fail delivery.
#[derive(Debug, Default)]
pub struct RecordingAlertTransport {
    sent: Mutex<Vec<AlertPayload>>,
    fail: bool,
}

impl RecordingAlertTransport {
    /// A transport that accepts every alert.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that rejects every alert.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    /// Alerts delivered so far.
    #[must_use]
    pub fn sent(&self) -> Vec<AlertPayload> {
        self.sent.lock().clone()
    }

    fn record(&self, payload: &AlertPayload) -> Result<(), StageguardError> {
        if self.fail {
            return Err(StageguardError::Internal("alert transport unavailable".into()));
        }
        self.sent.lock().push(payload.clone());
        Ok(())
    }
}

#[async_trait]
impl AlertTransport for RecordingAlertTransport {
    async fn send_warning_alert(&self, payload: &AlertPayload) -> Result<(), StageguardError> {
        self.record(payload)
    }

    async fn send_critical_alert(&self, payload: &AlertPayload) -> Result<(), StageguardError> {
        self.record(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fails_then_ok() {
        let provider =
            ScriptedProvider::fails_then_ok("p", 2, ProviderError::recoverable("X", "x"), "done");
        let input = ();
        assert!(provider.invoke(&input).await.is_err());
        assert!(provider.invoke(&input).await.is_err());
        assert_eq!(provider.invoke(&input).await.unwrap(), "done");
        assert_eq!(provider.invoke(&input).await.unwrap(), "done");
        assert_eq!(provider.call_count(), 4);
    }
}
