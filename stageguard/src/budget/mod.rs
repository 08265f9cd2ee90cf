//! Cumulative spend tracking against a prepaid credit.

mod alerts;
mod tracker;

pub use alerts::{
    AlertCheck, AlertPayload, AlertRecord, AlertSeverity, AlertThresholds, AlertTransport,
    LoggingAlertTransport, ThresholdAlerter,
};
#[cfg(test)]
pub use alerts::MockAlertTransport;
pub use tracker::{
    calculate_runway, BudgetConfig, BudgetState, BudgetStatus, BudgetTracker,
    RUNWAY_UNBOUNDED_DAYS,
};
