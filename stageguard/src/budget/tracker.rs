//! Budget state, status and runway.

use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::errors::{ConfigError, StoreError};
use crate::store::{collections, load_document, save_document, DocumentStore};
use crate::utils::{now_utc, round_usd, Timestamp};

/// Runway reported when there is no recent spend to extrapolate from.
pub const RUNWAY_UNBOUNDED_DAYS: u32 = 9999;

/// Budget configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Prepaid credit in USD.
    #[serde(default = "default_initial_credit")]
    pub initial_credit_usd: f64,
    /// Days the credit stays valid after `start_date`.
    #[serde(default = "default_credit_period_days")]
    pub credit_period_days: u32,
    /// First day of the credit period. Defaults to the first load.
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    /// Target monthly spend.
    #[serde(default = "default_monthly_target")]
    pub monthly_target_usd: f64,
    /// Trailing window for the daily average.
    #[serde(default = "default_runway_window_days")]
    pub runway_window_days: u32,
}

fn default_initial_credit() -> f64 {
    300.0
}

fn default_credit_period_days() -> u32 {
    90
}

fn default_monthly_target() -> f64 {
    50.0
}

fn default_runway_window_days() -> u32 {
    7
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            initial_credit_usd: default_initial_credit(),
            credit_period_days: default_credit_period_days(),
            start_date: None,
            monthly_target_usd: default_monthly_target(),
            runway_window_days: default_runway_window_days(),
        }
    }
}

impl BudgetConfig {
    /// Sets the initial credit.
    #[must_use]
    pub fn with_initial_credit(mut self, usd: f64) -> Self {
        self.initial_credit_usd = usd;
        self
    }

    /// Sets the credit period start.
    #[must_use]
    pub fn with_start_date(mut self, date: NaiveDate) -> Self {
        self.start_date = Some(date);
        self
    }

    /// Sets the monthly target.
    #[must_use]
    pub fn with_monthly_target(mut self, usd: f64) -> Self {
        self.monthly_target_usd = usd;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let amounts = [
            ("initial_credit_usd", self.initial_credit_usd),
            ("monthly_target_usd", self.monthly_target_usd),
        ];
        for (field, value) in amounts {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::new(field, "must be a finite, non-negative amount"));
            }
        }
        if self.runway_window_days == 0 {
            return Err(ConfigError::new("runway_window_days", "must be at least 1"));
        }
        Ok(())
    }
}

/// Persisted budget state, stored at `budget/state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetState {
    /// Credit the period started with.
    pub initial_credit_usd: f64,
    /// Cumulative spend.
    pub total_spent_usd: f64,
    /// `initial - total`; may go negative on overrun.
    pub remaining_usd: f64,
    /// First day of the credit period.
    pub start_date: NaiveDate,
    /// Last day of the credit period.
    pub credit_expiration_date: NaiveDate,
    /// Spend per day.
    #[serde(default)]
    pub daily_spend: BTreeMap<NaiveDate, f64>,
    /// Last modification.
    pub last_updated: Timestamp,
}

impl BudgetState {
    /// Fresh state for a config, starting at `config.start_date` or `today`.
    #[must_use]
    pub fn from_config(config: &BudgetConfig, today: NaiveDate) -> Self {
        let start_date = config.start_date.unwrap_or(today);
        Self {
            initial_credit_usd: config.initial_credit_usd,
            total_spent_usd: 0.0,
            remaining_usd: config.initial_credit_usd,
            start_date,
            credit_expiration_date: start_date
                + Duration::days(i64::from(config.credit_period_days)),
            daily_spend: BTreeMap::new(),
            last_updated: now_utc(),
        }
    }

    /// Brings persisted state in line with `config`.
    ///
    /// A changed credit recomputes `remaining_usd` against the recorded
    /// spend; a changed start date or period moves the expiration date.
    /// Returns whether anything changed.
    pub fn reconcile(&mut self, config: &BudgetConfig) -> bool {
        let mut changed = false;
        if (self.initial_credit_usd - config.initial_credit_usd).abs() > f64::EPSILON {
            info!(
                from_usd = self.initial_credit_usd,
                to_usd = config.initial_credit_usd,
                "Initial credit changed by configuration"
            );
            self.initial_credit_usd = config.initial_credit_usd;
            self.remaining_usd = round_usd(self.initial_credit_usd - self.total_spent_usd);
            changed = true;
        }
        if let Some(start_date) = config.start_date {
            if start_date != self.start_date {
                info!(
                    from = %self.start_date,
                    to = %start_date,
                    "Credit start date changed by configuration"
                );
                self.start_date = start_date;
                changed = true;
            }
        }
        let expiration = self.start_date + Duration::days(i64::from(config.credit_period_days));
        if expiration != self.credit_expiration_date {
            info!(
                from = %self.credit_expiration_date,
                to = %expiration,
                "Credit expiration changed by configuration"
            );
            self.credit_expiration_date = expiration;
            changed = true;
        }
        if changed {
            self.last_updated = now_utc();
        }
        changed
    }
}

/// Derived view of the budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    /// Remaining credit, never below zero.
    pub remaining_usd: f64,
    /// Cumulative spend.
    pub total_spent_usd: f64,
    /// Average daily spend over the trailing window.
    pub avg_daily_cost_usd: f64,
    /// `avg_daily * 30`.
    pub projected_monthly_usd: f64,
    /// Whole days the remaining credit lasts at the average rate.
    pub days_of_runway: u32,
    /// Credit left and monthly projection within target.
    pub within_budget: bool,
    /// Today falls inside the credit period.
    pub within_credit_period: bool,
}

/// Whole days `remaining` lasts at `avg_daily`.
///
/// No remaining credit yields 0; no recent spend yields
/// [`RUNWAY_UNBOUNDED_DAYS`]. Results are capped at the sentinel.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn calculate_runway(remaining_usd: f64, avg_daily_usd: f64) -> u32 {
    if remaining_usd <= 0.0 || remaining_usd.is_nan() {
        return 0;
    }
    if avg_daily_usd <= 0.0 || !avg_daily_usd.is_finite() {
        return RUNWAY_UNBOUNDED_DAYS;
    }
    let days = (remaining_usd / avg_daily_usd).floor();
    if days >= f64::from(RUNWAY_UNBOUNDED_DAYS) {
        RUNWAY_UNBOUNDED_DAYS
    } else {
        days as u32
    }
}

/// Tracks cumulative spend against the prepaid credit.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    config: BudgetConfig,
    state: BudgetState,
}

impl BudgetTracker {
    /// Creates a tracker with fresh state.
    #[must_use]
    pub fn new(config: BudgetConfig) -> Self {
        let state = BudgetState::from_config(&config, Utc::now().date_naive());
        Self { config, state }
    }

    /// Creates a tracker from existing state.
    #[must_use]
    pub fn from_state(config: BudgetConfig, state: BudgetState) -> Self {
        Self { config, state }
    }

    /// Loads `budget/state`, or starts fresh if it does not exist.
    ///
    /// Persisted spend is kept; credit and period settings follow `config`.
    pub async fn load(store: &dyn DocumentStore, config: BudgetConfig) -> Result<Self, StoreError> {
        let state = load_document::<BudgetState>(
            store,
            collections::BUDGET,
            collections::BUDGET_STATE_ID,
        )
        .await?;
        Ok(match state {
            Some(mut state) => {
                state.reconcile(&config);
                Self::from_state(config, state)
            }
            None => {
                info!(
                    initial_credit_usd = config.initial_credit_usd,
                    "No budget state found, starting fresh"
                );
                Self::new(config)
            }
        })
    }

    /// Writes the state to `budget/state`.
    pub async fn save(&self, store: &dyn DocumentStore) -> Result<(), StoreError> {
        save_document(
            store,
            collections::BUDGET,
            collections::BUDGET_STATE_ID,
            &self.state,
        )
        .await
    }

    /// Current config.
    #[must_use]
    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &BudgetState {
        &self.state
    }

    /// Adds spend on `date`.
    pub fn record_spend(&mut self, amount_usd: f64, date: NaiveDate) -> Result<(), ConfigError> {
        if !amount_usd.is_finite() || amount_usd < 0.0 {
            return Err(ConfigError::new(
                "amount_usd",
                format!("invalid spend amount {amount_usd}"),
            ));
        }

        self.state.total_spent_usd = round_usd(self.state.total_spent_usd + amount_usd);
        self.state.remaining_usd =
            round_usd(self.state.initial_credit_usd - self.state.total_spent_usd);
        let day = self.state.daily_spend.entry(date).or_insert(0.0);
        *day = round_usd(*day + amount_usd);
        self.state.last_updated = now_utc();

        if self.state.remaining_usd < 0.0 {
            warn!(
                overrun_usd = -self.state.remaining_usd,
                "Spend exceeds the prepaid credit"
            );
        }
        Ok(())
    }

    /// Status as of today (UTC).
    #[must_use]
    pub fn status(&self) -> BudgetStatus {
        self.status_on(Utc::now().date_naive())
    }

    /// Status as of `today`.
    #[must_use]
    pub fn status_on(&self, today: NaiveDate) -> BudgetStatus {
        let avg_daily = self.average_daily_cost(today);
        let projected_monthly = round_usd(avg_daily * 30.0);
        let remaining = self.state.remaining_usd.max(0.0);

        BudgetStatus {
            remaining_usd: remaining,
            total_spent_usd: self.state.total_spent_usd,
            avg_daily_cost_usd: avg_daily,
            projected_monthly_usd: projected_monthly,
            days_of_runway: calculate_runway(remaining, avg_daily),
            within_budget: remaining > 0.0 && projected_monthly <= self.config.monthly_target_usd,
            within_credit_period: today >= self.state.start_date
                && today <= self.state.credit_expiration_date,
        }
    }

    /// Mean daily spend over the trailing window ending `today`.
    ///
    /// The divisor is the window length, or the days since the credit
    /// period started when that is shorter.
    #[must_use]
    pub fn average_daily_cost(&self, today: NaiveDate) -> f64 {
        let window = i64::from(self.config.runway_window_days.max(1));
        let window_start = today - Duration::days(window - 1);
        let spent: f64 = self
            .state
            .daily_spend
            .range(window_start..=today)
            .map(|(_, amount)| *amount)
            .sum();

        let elapsed = (today - self.state.start_date).num_days() + 1;
        let divisor = elapsed.clamp(1, window);
        #[allow(clippy::cast_precision_loss)]
        let avg = spent / divisor as f64;
        round_usd(avg)
    }
}
