// Expiration dates at UTC day granularity
//
// Shards are keyed by the certificate's notAfter truncated to its calendar
// day in UTC, formatted YYYY-MM-DD.

use crate::error::IngestError;
use crate::Result;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const EXPIRATION_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpDate {
    date: NaiveDate,
}

impl ExpDate {
    /// Truncate a certificate's notAfter to its UTC day.
    pub fn from_time(t: DateTime<Utc>) -> ExpDate {
        ExpDate { date: t.date_naive() }
    }

    pub fn from_unix(secs: i64) -> Result<ExpDate> {
        let t = DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| IngestError::parse(format!("Timestamp out of range: {}", secs)))?;
        Ok(ExpDate::from_time(t))
    }

    pub fn parse(s: &str) -> Result<ExpDate> {
        let date = NaiveDate::parse_from_str(s, EXPIRATION_FORMAT)
            .map_err(|e| IngestError::parse(format!("Invalid expiration date [{}]: {}", s, e)))?;
        Ok(ExpDate { date })
    }

    /// Midnight UTC at the start of this day.
    pub fn start_of_day(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.date.and_hms_opt(0, 0, 0).unwrap())
    }

    /// The instant a shard for this day stops mattering: midnight after the
    /// day ends, plus the given slack.
    pub fn expiry_deadline(&self, slack: Duration) -> DateTime<Utc> {
        self.start_of_day() + Duration::days(1) + slack
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }
}

impl fmt::Display for ExpDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.date.format(EXPIRATION_FORMAT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn utc(s: &str) -> DateTime<Utc> {
        Utc.from_utc_datetime(&NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap())
    }

    #[test]
    fn test_truncation_to_day() {
        let e = ExpDate::from_time(utc("2026-03-15 23:59:59"));
        assert_eq!(e.to_string(), "2026-03-15");
    }

    #[test]
    fn test_midnight_truncation_is_noop() {
        let at_midnight = ExpDate::from_time(utc("2026-03-15 00:00:00"));
        let late = ExpDate::from_time(utc("2026-03-15 18:00:00"));
        assert_eq!(at_midnight, late);
        assert_eq!(at_midnight.start_of_day(), utc("2026-03-15 00:00:00"));
    }

    #[test]
    fn test_parse_round_trip() {
        let e = ExpDate::parse("2031-12-01").unwrap();
        assert_eq!(e.to_string(), "2031-12-01");
        assert!(ExpDate::parse("2031-13-01").is_err());
        assert!(ExpDate::parse("not-a-date").is_err());
    }

    #[test]
    fn test_expiry_deadline_includes_slack() {
        let e = ExpDate::parse("2026-03-15").unwrap();
        let deadline = e.expiry_deadline(Duration::days(2));
        assert_eq!(deadline, utc("2026-03-18 00:00:00"));
    }

    #[test]
    fn test_ordering() {
        assert!(ExpDate::parse("2026-01-01").unwrap() < ExpDate::parse("2026-01-02").unwrap());
    }
}
