//! UTC hour keys: the unit of archive files and of ingestion progress.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// One UTC calendar hour, identifying exactly one upstream archive file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HourKey {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
}

impl HourKey {
    /// Builds a key, validating that it names a real UTC hour.
    pub fn new(year: i32, month: u32, day: u32, hour: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
            .single()
            .map(|_| Self {
                year,
                month,
                day,
                hour,
            })
    }

    /// Truncates a timestamp down to its hour.
    pub fn from_datetime(ts: DateTime<Utc>) -> Self {
        Self {
            year: ts.year(),
            month: ts.month(),
            day: ts.day(),
            hour: ts.hour(),
        }
    }

    /// Start of the hour as a timestamp.
    pub fn start(&self) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(self.year, self.month, self.day, self.hour, 0, 0)
            .single()
            .expect("HourKey is validated at construction")
    }

    /// Archive file stem, e.g. `2015-01-02-3`. The upstream host does not
    /// zero-pad the hour.
    pub fn archive_stem(&self) -> String {
        format!("{:04}-{:02}-{:02}-{}", self.year, self.month, self.day, self.hour)
    }

    /// The following hour.
    pub fn succ(&self) -> Self {
        Self::from_datetime(self.start() + chrono::Duration::hours(1))
    }

    /// Inclusive iterator from `self` to `end`.
    pub fn range_to(self, end: HourKey) -> impl Iterator<Item = HourKey> {
        let mut cursor = Some(self);
        std::iter::from_fn(move || {
            let current = cursor?;
            if current > end {
                cursor = None;
                return None;
            }
            cursor = Some(current.succ());
            Some(current)
        })
    }
}

impl fmt::Display for HourKey {
    /// CLI form, e.g. `2015-01-02T03`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}",
            self.year, self.month, self.day, self.hour
        )
    }
}

/// Parse failure for an hour flag.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid hour '{0}', expected YYYY-MM-DDTHH")]
pub struct ParseHourError(pub String);

impl FromStr for HourKey {
    type Err = ParseHourError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ParseHourError(s.to_string());
        let (date, hour) = s.split_once('T').ok_or_else(bad)?;
        let mut parts = date.splitn(3, '-');
        let year = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        let month = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        let day = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
        let hour = hour.parse().map_err(|_| bad())?;
        HourKey::new(year, month, day, hour).ok_or_else(bad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let hour: HourKey = "2015-01-02T03".parse().unwrap();
        assert_eq!(hour, HourKey::new(2015, 1, 2, 3).unwrap());
        assert_eq!(hour.to_string(), "2015-01-02T03");
    }

    #[test]
    fn archive_stem_has_unpadded_hour() {
        let hour: HourKey = "2015-01-02T03".parse().unwrap();
        assert_eq!(hour.archive_stem(), "2015-01-02-3");
        let late: HourKey = "2025-09-19T10".parse().unwrap();
        assert_eq!(late.archive_stem(), "2025-09-19-10");
    }

    #[test]
    fn rejects_nonsense() {
        assert!("2015-13-02T03".parse::<HourKey>().is_err());
        assert!("2015-02-30T03".parse::<HourKey>().is_err());
        assert!("2015-01-02T24".parse::<HourKey>().is_err());
        assert!("2015-01-02 03".parse::<HourKey>().is_err());
        assert!("garbage".parse::<HourKey>().is_err());
    }

    #[test]
    fn range_is_inclusive_and_crosses_days() {
        let start: HourKey = "2015-01-01T22".parse().unwrap();
        let end: HourKey = "2015-01-02T01".parse().unwrap();
        let hours: Vec<String> = start.range_to(end).map(|h| h.to_string()).collect();
        assert_eq!(
            hours,
            vec![
                "2015-01-01T22",
                "2015-01-01T23",
                "2015-01-02T00",
                "2015-01-02T01"
            ]
        );
    }

    #[test]
    fn empty_range_when_start_after_end() {
        let start: HourKey = "2015-01-02T01".parse().unwrap();
        let end: HourKey = "2015-01-01T22".parse().unwrap();
        assert_eq!(start.range_to(end).count(), 0);
    }
}
