//! Core data types used throughout the engine
//!
//! # Key Types
//!
//! - **`Timestamp`**: Epoch milliseconds (UTC instant, or a naive device-local
//!   wall clock read as if it were UTC)
//! - **`TimeRange`**: Half-open window `[start, end)` used by every query filter
//! - **`ActiveDays`**: Set of weekdays allowed to contribute to a window
//!
//! # Example
//!
//! ```rust
//! use diabetes_data_engine::types::{ActiveDays, TimeRange};
//! use chrono::Weekday;
//!
//! let range = TimeRange::new(1000, 2000).unwrap();
//! assert!(range.contains(1000));
//! assert!(!range.contains(2000)); // end is exclusive
//!
//! let weekdays = ActiveDays::from_weekdays([Weekday::Mon, Weekday::Tue]);
//! assert!(weekdays.contains(Weekday::Mon));
//! assert!(!weekdays.contains(Weekday::Sun));
//! ```

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::QueryError;

/// Epoch milliseconds
pub type Timestamp = i64;

/// Milliseconds in one hour
pub const MS_PER_HOUR: i64 = 60 * 60 * 1000;

/// Milliseconds in one nominal 24-hour day
pub const MS_PER_DAY: i64 = 24 * MS_PER_HOUR;

/// Time range for queries (start inclusive, end exclusive)
///
/// ```rust
/// use diabetes_data_engine::types::TimeRange;
///
/// let range = TimeRange::new(0, 10).unwrap();
/// assert_eq!(range.duration_ms(), 10);
/// assert!(TimeRange::new(10, 10).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeRange {
    /// Start timestamp in milliseconds (inclusive)
    pub start: Timestamp,

    /// End timestamp in milliseconds (exclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range, rejecting empty or inverted ranges
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self, QueryError> {
        if start >= end {
            return Err(QueryError::InvalidEndpoints { start, end });
        }
        Ok(Self { start, end })
    }

    /// Build a range without validation (callers guarantee `start <= end`)
    pub(crate) fn unchecked(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Check whether a timestamp falls inside `[start, end)`
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Check whether `[a_start, a_end)` intersects this range
    pub fn overlaps(&self, start: Timestamp, end: Timestamp) -> bool {
        start < self.end && end > self.start
    }

    /// Length of the range in milliseconds
    pub fn duration_ms(&self) -> i64 {
        self.end - self.start
    }
}

impl Serialize for TimeRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [self.start, self.end].serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TimeRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let [start, end] = <[EndpointValue; 2]>::deserialize(deserializer)?;
        let start = start.to_millis().map_err(serde::de::Error::custom)?;
        let end = end.to_millis().map_err(serde::de::Error::custom)?;
        TimeRange::new(start, end).map_err(serde::de::Error::custom)
    }
}

/// An endpoint may arrive as epoch milliseconds or as an ISO-8601 string
#[derive(Deserialize)]
#[serde(untagged)]
enum EndpointValue {
    Millis(i64),
    Float(f64),
    Iso(String),
}

impl EndpointValue {
    fn to_millis(&self) -> Result<Timestamp, String> {
        match self {
            EndpointValue::Millis(ms) => Ok(*ms),
            EndpointValue::Float(f) if f.is_finite() => Ok(f.round() as i64),
            EndpointValue::Float(f) => Err(format!("non-finite endpoint {}", f)),
            EndpointValue::Iso(s) => {
                parse_instant(s).ok_or_else(|| format!("unparseable endpoint '{}'", s))
            },
        }
    }
}

// ============================================================================
// Time parsing
// ============================================================================

/// Parse an ISO-8601 instant into epoch milliseconds
///
/// Strings carrying an offset are converted to UTC; strings without one are
/// read as UTC.
pub fn parse_instant(s: &str) -> Option<Timestamp> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    parse_naive(s).map(|naive| naive.and_utc().timestamp_millis())
}

/// Parse a device-local wall clock time into "naive" epoch milliseconds
///
/// The wall clock reading is kept as-is: `2018-02-01T01:00:00` maps to the
/// same number as `2018-02-01T01:00:00Z`. A trailing offset, when present,
/// is ignored rather than applied.
pub fn parse_wall_clock(s: &str) -> Option<Timestamp> {
    if let Some(naive) = parse_naive(s) {
        return Some(naive.and_utc().timestamp_millis());
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.naive_local().and_utc().timestamp_millis())
}

fn parse_naive(s: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// Format epoch milliseconds as an ISO-8601 UTC string with millisecond precision
pub fn format_instant(ts: Timestamp) -> String {
    DateTime::from_timestamp_millis(ts)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_default()
}

// ============================================================================
// Active days
// ============================================================================

/// Set of weekdays permitted to contribute to a window
///
/// Stored as a 7-bit mask indexed by days from Sunday. Defaults to all seven days.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActiveDays(u8);

impl ActiveDays {
    const ALL: u8 = 0b0111_1111;

    /// Every day of the week
    pub fn all() -> Self {
        Self(Self::ALL)
    }

    /// No days at all
    pub fn none() -> Self {
        Self(0)
    }

    /// Build from an iterator of weekdays
    pub fn from_weekdays<I: IntoIterator<Item = Weekday>>(days: I) -> Self {
        let mut mask = 0u8;
        for day in days {
            mask |= 1 << day.num_days_from_sunday();
        }
        Self(mask)
    }

    /// Check membership
    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_sunday()) != 0
    }

    /// True when all seven days are active
    pub fn is_all(&self) -> bool {
        self.0 == Self::ALL
    }

    /// Number of active weekdays
    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// True when no weekday is active
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate active weekdays, Sunday first
    pub fn iter(&self) -> impl Iterator<Item = Weekday> + '_ {
        [
            Weekday::Sun,
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
        ]
        .into_iter()
        .filter(|d| self.contains(*d))
    }

    /// Parse a weekday from a name (`monday`, `mon`) or a number (0 = Sunday)
    pub fn parse_day(s: &str) -> Result<Weekday, QueryError> {
        let trimmed = s.trim();
        if let Ok(n) = trimmed.parse::<u8>() {
            return weekday_from_sunday(n).ok_or_else(|| QueryError::InvalidActiveDay(s.to_string()));
        }
        trimmed
            .parse::<Weekday>()
            .map_err(|_| QueryError::InvalidActiveDay(s.to_string()))
    }
}

fn weekday_from_sunday(n: u8) -> Option<Weekday> {
    match n {
        0 => Some(Weekday::Sun),
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        _ => None,
    }
}

impl Default for ActiveDays {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for ActiveDays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl Serialize for ActiveDays {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let names: Vec<String> = self.iter().map(|d| format!("{:?}", d).to_lowercase()).collect();
        names.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ActiveDays {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum DayValue {
            Number(u8),
            Name(String),
        }

        let values = Vec::<DayValue>::deserialize(deserializer)?;
        let mut days = Vec::with_capacity(values.len());
        for value in values {
            let day = match value {
                DayValue::Number(n) => weekday_from_sunday(n)
                    .ok_or_else(|| QueryError::InvalidActiveDay(n.to_string())),
                DayValue::Name(name) => ActiveDays::parse_day(&name),
            }
            .map_err(serde::de::Error::custom)?;
            days.push(day);
        }
        Ok(ActiveDays::from_weekdays(days))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_half_open() {
        let range = TimeRange::new(100, 200).unwrap();
        assert!(range.contains(100));
        assert!(range.contains(199));
        assert!(!range.contains(200));
        assert!(range.overlaps(50, 101));
        assert!(!range.overlaps(200, 300));
    }

    #[test]
    fn test_time_range_rejects_inverted() {
        assert!(matches!(
            TimeRange::new(5, 1),
            Err(QueryError::InvalidEndpoints { start: 5, end: 1 })
        ));
    }

    #[test]
    fn test_time_range_deserializes_iso_and_millis() {
        let range: TimeRange =
            serde_json::from_str(r#"["2018-02-01T00:00:00.000Z", 1517529600000]"#).unwrap();
        assert_eq!(range.start, 1_517_443_200_000);
        assert_eq!(range.end, 1_517_529_600_000);
    }

    #[test]
    fn test_parse_instant_with_offset() {
        let utc = parse_instant("2018-02-01T01:00:00Z").unwrap();
        let offset = parse_instant("2018-01-31T20:00:00-05:00").unwrap();
        assert_eq!(utc, offset);
    }

    #[test]
    fn test_parse_wall_clock_ignores_offset() {
        let naive = parse_wall_clock("2018-02-01T01:00:00").unwrap();
        let with_offset = parse_wall_clock("2018-02-01T01:00:00-05:00").unwrap();
        assert_eq!(naive, with_offset);
        assert_eq!(naive, parse_instant("2018-02-01T01:00:00Z").unwrap());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_instant("not a date").is_none());
        assert!(parse_wall_clock("").is_none());
    }

    #[test]
    fn test_format_instant() {
        assert_eq!(format_instant(0), "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_active_days_parse() {
        let days: ActiveDays = serde_json::from_str(r#"["monday", "tue", 0]"#).unwrap();
        assert!(days.contains(Weekday::Mon));
        assert!(days.contains(Weekday::Tue));
        assert!(days.contains(Weekday::Sun));
        assert_eq!(days.len(), 3);
        assert!(serde_json::from_str::<ActiveDays>(r#"["funday"]"#).is_err());
    }

    #[test]
    fn test_active_days_default_all() {
        assert!(ActiveDays::default().is_all());
        assert_eq!(ActiveDays::none().len(), 0);
    }
}
