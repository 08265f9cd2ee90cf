//! Utility functions for run identifiers, timestamps and money rounding.
//!
//! Pipeline runs are keyed by a date-formatted identifier (`YYYY-MM-DD`);
//! the helpers here keep that format consistent across the ledger, the
//! budget tracker and the decision store.

mod money;
pub mod timestamps;

pub use money::{round_usd, sum_usd, USD_DECIMALS};
pub use timestamps::{
    iso_timestamp, now_utc, parse_run_id, run_id_for, today_run_id, Timestamp, TimestampError,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_round_trip_through_parse() {
        let id = today_run_id();
        assert_eq!(id.len(), 10);
        assert!(parse_run_id(&id).is_ok());
    }

    #[test]
    fn test_iso_timestamp_format() {
        let ts = iso_timestamp();
        assert!(ts.contains('T'));
        assert!(ts.ends_with("+00:00"));
    }
}
