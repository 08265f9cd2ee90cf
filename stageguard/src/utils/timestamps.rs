//! Timestamp and run identifier helpers.

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

const RUN_ID_FORMAT: &str = "%Y-%m-%d";

/// Errors that can occur while parsing identifiers and timestamps.
#[derive(Debug, Error)]
pub enum TimestampError {
    /// The run identifier string is empty.
    #[error("Empty run identifier")]
    EmptyRunId,

    /// The run identifier is not a `YYYY-MM-DD` date.
    #[error("Invalid run identifier '{0}': expected YYYY-MM-DD")]
    InvalidRunId(String),
}

/// Returns the current UTC time as an ISO 8601 formatted string.
///
/// Format: `YYYY-MM-DDTHH:MM:SS.ffffff+00:00`
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Formats a date as a pipeline run identifier.
#[must_use]
pub fn run_id_for(date: NaiveDate) -> String {
    date.format(RUN_ID_FORMAT).to_string()
}

/// Returns today's (UTC) pipeline run identifier.
#[must_use]
pub fn today_run_id() -> String {
    run_id_for(Utc::now().date_naive())
}

/// Parses a pipeline run identifier back into a date.
pub fn parse_run_id(run_id: &str) -> Result<NaiveDate, TimestampError> {
    let trimmed = run_id.trim();
    if trimmed.is_empty() {
        return Err(TimestampError::EmptyRunId);
    }
    NaiveDate::parse_from_str(trimmed, RUN_ID_FORMAT)
        .map_err(|_| TimestampError::InvalidRunId(run_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_for() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(run_id_for(date), "2024-03-07");
    }

    #[test]
    fn test_parse_run_id() {
        let date = parse_run_id("2024-12-31").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());
    }

    #[test]
    fn test_parse_run_id_rejects_garbage() {
        assert!(matches!(parse_run_id(""), Err(TimestampError::EmptyRunId)));
        assert!(matches!(
            parse_run_id("2024/12/31"),
            Err(TimestampError::InvalidRunId(_))
        ));
        assert!(matches!(
            parse_run_id("2024-13-01"),
            Err(TimestampError::InvalidRunId(_))
        ));
    }
}
