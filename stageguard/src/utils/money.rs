//! USD rounding helpers.

/// Number of decimal places kept for aggregated money values.
pub const USD_DECIMALS: i32 = 4;

/// Rounds a USD amount to four decimal places.
///
/// Only applied at aggregation time; individual entries keep full precision.
#[must_use]
pub fn round_usd(value: f64) -> f64 {
    let factor = 10f64.powi(USD_DECIMALS);
    (value * factor).round() / factor
}

/// Sums raw amounts and rounds the total once.
#[must_use]
pub fn sum_usd<I>(values: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    round_usd(values.into_iter().sum())
}
