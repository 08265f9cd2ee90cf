//! Per-run cost threshold alerts.
//!
//! A run's cost is compared against warning and critical thresholds. Each
//! crossing is counted, but a severity only notifies again once its cooldown
//! has elapsed. Transport failures are logged and never interrupt the run.

use async_trait::async_trait;
use chrono::Duration;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::errors::{ConfigError, StageguardError};
use crate::utils::{now_utc, Timestamp};

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Cost crossed the warning threshold.
    Warning,
    /// Cost crossed the critical threshold.
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Threshold configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Per-run cost that raises a warning.
    #[serde(default = "default_warning")]
    pub warning_usd: f64,
    /// Per-run cost that raises a critical alert.
    #[serde(default = "default_critical")]
    pub critical_usd: f64,
    /// Minimum seconds between notifications of one severity.
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
}

fn default_warning() -> f64 {
    0.75
}

fn default_critical() -> f64 {
    1.00
}

fn default_cooldown() -> u64 {
    3600
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            warning_usd: default_warning(),
            critical_usd: default_critical(),
            cooldown_seconds: default_cooldown(),
        }
    }
}

impl AlertThresholds {
    /// Sets both thresholds.
    #[must_use]
    pub fn with_thresholds(mut self, warning_usd: f64, critical_usd: f64) -> Self {
        self.warning_usd = warning_usd;
        self.critical_usd = critical_usd;
        self
    }

    /// Sets the cooldown.
    #[must_use]
    pub fn with_cooldown_seconds(mut self, seconds: u64) -> Self {
        self.cooldown_seconds = seconds;
        self
    }

    /// Severity for a cost, if any threshold is crossed.
    #[must_use]
    pub fn severity_for(&self, cost_usd: f64) -> Option<AlertSeverity> {
        if cost_usd >= self.critical_usd {
            Some(AlertSeverity::Critical)
        } else if cost_usd >= self.warning_usd {
            Some(AlertSeverity::Warning)
        } else {
            None
        }
    }

    /// Validates the thresholds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.warning_usd.is_finite() || self.warning_usd < 0.0 {
            return Err(ConfigError::new("warning_usd", "must be a finite, non-negative amount"));
        }
        if !self.critical_usd.is_finite() || self.critical_usd < self.warning_usd {
            return Err(ConfigError::new(
                "critical_usd",
                "must be finite and at least the warning threshold",
            ));
        }
        Ok(())
    }
}

/// Alert sent to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    /// Severity.
    pub severity: AlertSeverity,
    /// Run cost that triggered the alert.
    pub cost_usd: f64,
    /// Threshold that was crossed.
    pub threshold_usd: f64,
    /// Run the alert concerns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// Crossings of this severity so far, including this one.
    pub count: u64,
    /// When the alert was raised.
    pub timestamp: Timestamp,
}

/// Delivery channel for alerts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertTransport: Send + Sync {
    /// Delivers a warning-level alert.
    async fn send_warning_alert(&self, payload: &AlertPayload) -> Result<(), StageguardError>;

    /// Delivers a critical alert.
    async fn send_critical_alert(&self, payload: &AlertPayload) -> Result<(), StageguardError>;
}

/// Transport that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAlertTransport;

#[async_trait]
impl AlertTransport for LoggingAlertTransport {
    async fn send_warning_alert(&self, payload: &AlertPayload) -> Result<(), StageguardError> {
        warn!(
            severity = %payload.severity,
            cost_usd = payload.cost_usd,
            threshold_usd = payload.threshold_usd,
            run_id = ?payload.run_id,
            "{}",
            payload.message
        );
        Ok(())
    }

    async fn send_critical_alert(&self, payload: &AlertPayload) -> Result<(), StageguardError> {
        error!(
            severity = %payload.severity,
            cost_usd = payload.cost_usd,
            threshold_usd = payload.threshold_usd,
            run_id = ?payload.run_id,
            "{}",
            payload.message
        );
        Ok(())
    }
}

/// Alert history for one severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    /// Severity.
    pub severity: AlertSeverity,
    /// Crossings observed, notified or not.
    pub count: u64,
    /// Last successful notification.
    pub last_notified_at: Option<Timestamp>,
    /// Cost of the most recent crossing.
    pub last_cost_usd: f64,
}

/// Result of a threshold check.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCheck {
    /// Severity crossed, if any.
    pub severity: Option<AlertSeverity>,
    /// Whether the transport delivered a notification.
    pub notified: bool,
    /// Crossings of this severity so far.
    pub count: u64,
}

impl AlertCheck {
    fn quiet() -> Self {
        Self {
            severity: None,
            notified: false,
            count: 0,
        }
    }
}

/// Compares run costs against thresholds and notifies with a cooldown.
pub struct ThresholdAlerter {
    thresholds: AlertThresholds,
    transport: Arc<dyn AlertTransport>,
    history: Mutex<BTreeMap<AlertSeverity, AlertRecord>>,
}

impl ThresholdAlerter {
    /// Creates an alerter.
    #[must_use]
    pub fn new(thresholds: AlertThresholds, transport: Arc<dyn AlertTransport>) -> Self {
        Self {
            thresholds,
            transport,
            history: Mutex::new(BTreeMap::new()),
        }
    }

    /// Thresholds in use.
    #[must_use]
    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    /// Checks a run cost now.
    pub async fn check_thresholds(&self, run_id: Option<&str>, cost_usd: f64) -> AlertCheck {
        self.check_thresholds_at(run_id, cost_usd, now_utc()).await
    }

    /// Checks a run cost at an explicit instant.
    pub async fn check_thresholds_at(
        &self,
        run_id: Option<&str>,
        cost_usd: f64,
        now: Timestamp,
    ) -> AlertCheck {
        let Some(severity) = self.thresholds.severity_for(cost_usd) else {
            return AlertCheck::quiet();
        };

        let cooldown_secs = u32::try_from(self.thresholds.cooldown_seconds).unwrap_or(u32::MAX);
        let cooldown = Duration::seconds(i64::from(cooldown_secs));
        let (count, due) = {
            let mut history = self.history.lock();
            let record = history.entry(severity).or_insert(AlertRecord {
                severity,
                count: 0,
                last_notified_at: None,
                last_cost_usd: 0.0,
            });
            record.count += 1;
            record.last_cost_usd = cost_usd;
            let due = record
                .last_notified_at
                .map_or(true, |last| now.signed_duration_since(last) >= cooldown);
            (record.count, due)
        };

        if !due {
            debug!(%severity, cost_usd, count, "Alert suppressed by cooldown");
            return AlertCheck {
                severity: Some(severity),
                notified: false,
                count,
            };
        }

        let threshold_usd = match severity {
            AlertSeverity::Critical => self.thresholds.critical_usd,
            AlertSeverity::Warning => self.thresholds.warning_usd,
        };
        let payload = AlertPayload {
            severity,
            cost_usd,
            threshold_usd,
            run_id: run_id.map(str::to_string),
            message: format!(
                "Run cost ${cost_usd:.4} crossed the {severity} threshold of ${threshold_usd:.2}"
            ),
            count,
            timestamp: now,
        };

        let sent = match severity {
            AlertSeverity::Critical => self.transport.send_critical_alert(&payload).await,
            AlertSeverity::Warning => self.transport.send_warning_alert(&payload).await,
        };
        let notified = match sent {
            Ok(()) => {
                if let Some(record) = self.history.lock().get_mut(&severity) {
                    record.last_notified_at = Some(now);
                }
                true
            }
            Err(e) => {
                error!(%severity, cost_usd, error = %e, "Failed to deliver cost alert");
                false
            }
        };

        AlertCheck {
            severity: Some(severity),
            notified,
            count,
        }
    }

    /// Alert history, one record per severity seen.
    #[must_use]
    pub fn history(&self) -> Vec<AlertRecord> {
        self.history.lock().values().cloned().collect()
    }
}

impl fmt::Debug for ThresholdAlerter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThresholdAlerter")
            .field("thresholds", &self.thresholds)
            .field("history", &self.history())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    fn at(hour: u32, minute: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_severity_for() {
        let t = AlertThresholds::default();
        assert_eq!(t.severity_for(0.5), None);
        assert_eq!(t.severity_for(0.75), Some(AlertSeverity::Warning));
        assert_eq!(t.severity_for(1.2), Some(AlertSeverity::Critical));
    }

    #[tokio::test]
    async fn test_below_threshold_does_not_notify() {
        let mut transport = MockAlertTransport::new();
        transport.expect_send_warning_alert().never();
        transport.expect_send_critical_alert().never();
        let alerter = ThresholdAlerter::new(AlertThresholds::default(), Arc::new(transport));

        let check = alerter.check_thresholds(Some("2024-05-01"), 0.10).await;
        assert_eq!(check, AlertCheck::quiet());
        assert!(alerter.history().is_empty());
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_but_counts() {
        let mut transport = MockAlertTransport::new();
        transport
            .expect_send_warning_alert()
            .withf(|p| p.severity == AlertSeverity::Warning)
            .times(2)
            .returning(|_| Ok(()));
        let alerter = ThresholdAlerter::new(AlertThresholds::default(), Arc::new(transport));

        let first = alerter.check_thresholds_at(None, 0.80, at(10, 0)).await;
        let second = alerter.check_thresholds_at(None, 0.85, at(10, 30)).await;
        let third = alerter.check_thresholds_at(None, 0.90, at(11, 0)).await;

        assert!(first.notified);
        assert!(!second.notified);
        assert_eq!(second.count, 2);
        assert!(third.notified);

        let history = alerter.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].count, 3);
        assert_eq!(history[0].last_notified_at, Some(at(11, 0)));
        assert_eq!(history[0].last_cost_usd, 0.90);
    }

    #[tokio::test]
    async fn test_severities_have_separate_cooldowns() {
        let mut transport = MockAlertTransport::new();
        transport
            .expect_send_warning_alert()
            .times(1)
            .returning(|_| Ok(()));
        transport
            .expect_send_critical_alert()
            .withf(|p| p.severity == AlertSeverity::Critical && p.threshold_usd == 1.0)
            .times(1)
            .returning(|_| Ok(()));
        let alerter = ThresholdAlerter::new(AlertThresholds::default(), Arc::new(transport));

        assert!(alerter.check_thresholds_at(None, 0.80, at(9, 0)).await.notified);
        let critical = alerter.check_thresholds_at(None, 1.50, at(9, 5)).await;
        assert_eq!(critical.severity, Some(AlertSeverity::Critical));
        assert!(critical.notified);
    }

    #[tokio::test]
    async fn test_transport_failure_is_swallowed_and_retried_next_time() {
        let mut transport = MockAlertTransport::new();
        let mut seq = mockall::Sequence::new();
        transport
            .expect_send_critical_alert()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(StageguardError::Internal("webhook down".into())));
        transport
            .expect_send_critical_alert()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let alerter = ThresholdAlerter::new(AlertThresholds::default(), Arc::new(transport));

        let failed = alerter.check_thresholds_at(None, 2.0, at(8, 0)).await;
        assert!(!failed.notified);
        assert!(alerter.history()[0].last_notified_at.is_none());

        let delivered = alerter.check_thresholds_at(None, 2.0, at(8, 1)).await;
        assert!(delivered.notified);
    }

    #[tokio::test]
    async fn test_logging_transport() {
        let alerter = ThresholdAlerter::new(
            AlertThresholds::default().with_thresholds(0.1, 0.2),
            Arc::new(LoggingAlertTransport),
        );
        let check = alerter.check_thresholds(Some("2024-05-01"), 0.15).await;
        assert!(check.notified);
        assert_eq!(check.severity, Some(AlertSeverity::Warning));
    }

    #[test]
    fn test_validate() {
        assert!(AlertThresholds::default().validate().is_ok());
        let err = AlertThresholds::default()
            .with_thresholds(1.0, 0.5)
            .validate()
            .unwrap_err();
        assert_eq!(err.field, "critical_usd");
    }
}
