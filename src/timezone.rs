//! Local calendar arithmetic over epoch milliseconds
//!
//! All windowing, day-of-week membership and fill-bin placement goes through
//! [`LocalCalendar`], which wraps an IANA zone (UTC when the engine is not
//! timezone aware). Local wall-clock times that do not exist because of a DST
//! gap are shifted forward by the DST delta; ambiguous times resolve to the
//! earlier instant.

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, Offset, TimeZone,
    Timelike, Weekday,
};
use chrono_tz::Tz;

use crate::error::QueryError;
use crate::types::Timestamp;

/// Calendar view of instants in one timezone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalCalendar {
    tz: Tz,
}

impl LocalCalendar {
    /// Calendar in UTC
    pub fn utc() -> Self {
        Self { tz: Tz::UTC }
    }

    /// Calendar in a named IANA zone
    pub fn named(name: &str) -> Result<Self, QueryError> {
        name.parse::<Tz>()
            .map(|tz| Self { tz })
            .map_err(|_| QueryError::UnknownTimezone(name.to_string()))
    }

    /// The zone's IANA name
    pub fn name(&self) -> &'static str {
        self.tz.name()
    }

    fn to_local(&self, ts: Timestamp) -> DateTime<Tz> {
        let utc = DateTime::from_timestamp_millis(ts).unwrap_or_default();
        utc.with_timezone(&self.tz)
    }

    /// Resolve a local wall-clock time to an instant
    fn resolve(&self, naive: NaiveDateTime) -> Timestamp {
        match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => dt.timestamp_millis(),
            LocalResult::Ambiguous(earliest, _) => earliest.timestamp_millis(),
            LocalResult::None => {
                // Inside a DST gap: read the wall clock with the pre-transition
                // offset, which lands the same distance past the gap.
                let before = self
                    .tz
                    .offset_from_utc_datetime(&(naive - Duration::days(1)))
                    .fix()
                    .local_minus_utc();
                (naive - Duration::seconds(before as i64))
                    .and_utc()
                    .timestamp_millis()
            },
        }
    }

    /// Offset from UTC in minutes at the given instant (local minus UTC)
    pub fn offset_minutes(&self, ts: Timestamp) -> i64 {
        let local = self.to_local(ts);
        (local.offset().fix().local_minus_utc() / 60) as i64
    }

    /// Local calendar date of an instant
    pub fn local_date(&self, ts: Timestamp) -> NaiveDate {
        self.to_local(ts).date_naive()
    }

    /// Local weekday of an instant
    pub fn weekday(&self, ts: Timestamp) -> Weekday {
        self.to_local(ts).weekday()
    }

    /// Local hour of day (0-23)
    pub fn hour_of_day(&self, ts: Timestamp) -> u32 {
        self.to_local(ts).hour()
    }

    /// Milliseconds elapsed since local midnight, by the wall clock
    pub fn ms_per_24(&self, ts: Timestamp) -> i64 {
        let local = self.to_local(ts);
        let time = local.time();
        (time.num_seconds_from_midnight() as i64) * 1000 + (time.nanosecond() / 1_000_000) as i64
    }

    /// Instant of local midnight starting the day containing `ts`
    pub fn start_of_day(&self, ts: Timestamp) -> Timestamp {
        self.start_of_date(self.local_date(ts))
    }

    /// Instant of local midnight starting `date`
    pub fn start_of_date(&self, date: NaiveDate) -> Timestamp {
        self.resolve(date.and_hms_opt(0, 0, 0).unwrap_or_default())
    }

    /// Instant of a local wall-clock hour on `date`
    pub fn at_local_hour(&self, date: NaiveDate, hour: u32) -> Timestamp {
        self.resolve(date.and_hms_opt(hour, 0, 0).unwrap_or_default())
    }

    /// Advance an instant by whole calendar days, keeping the local wall clock
    ///
    /// Across a DST transition the result differs from `ts + days * 24h` by the
    /// DST delta, so the span always covers the intended number of local days.
    pub fn add_days(&self, ts: Timestamp, days: i64) -> Timestamp {
        let local = self.to_local(ts).naive_local();
        self.resolve(local + Duration::days(days))
    }

    /// Dates of every local calendar day touched by `[start, end)`
    pub fn dates_in(&self, start: Timestamp, end: Timestamp) -> Vec<NaiveDate> {
        if end <= start {
            return Vec::new();
        }
        let first = self.local_date(start);
        let last = self.local_date(end - 1);
        first
            .iter_days()
            .take_while(|d| *d <= last)
            .collect()
    }
}

impl Default for LocalCalendar {
    fn default() -> Self {
        Self::utc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{parse_instant, MS_PER_DAY, MS_PER_HOUR};

    fn ts(s: &str) -> Timestamp {
        parse_instant(s).unwrap()
    }

    #[test]
    fn test_unknown_zone() {
        assert!(matches!(
            LocalCalendar::named("Nowhere/Special"),
            Err(QueryError::UnknownTimezone(_))
        ));
    }

    #[test]
    fn test_offset_minutes_eastern() {
        let cal = LocalCalendar::named("US/Eastern").unwrap();
        assert_eq!(cal.offset_minutes(ts("2019-01-15T12:00:00Z")), -300);
        assert_eq!(cal.offset_minutes(ts("2019-07-15T12:00:00Z")), -240);
    }

    #[test]
    fn test_add_days_across_spring_forward() {
        let cal = LocalCalendar::named("US/Eastern").unwrap();
        let start = ts("2019-03-10T05:00:00Z"); // local midnight EST
        let next = cal.add_days(start, 1);
        assert_eq!(next, ts("2019-03-11T04:00:00Z")); // local midnight EDT
        assert_eq!(next - start, MS_PER_DAY - MS_PER_HOUR);
    }

    #[test]
    fn test_resolve_gap_shifts_forward() {
        let cal = LocalCalendar::named("US/Eastern").unwrap();
        let date = NaiveDate::from_ymd_opt(2019, 3, 10).unwrap();
        // 02:00 local does not exist; it lands on 03:00 EDT
        assert_eq!(cal.at_local_hour(date, 2), ts("2019-03-10T07:00:00Z"));
    }

    #[test]
    fn test_dates_in_range() {
        let cal = LocalCalendar::utc();
        let dates = cal.dates_in(ts("2018-02-01T00:00:00Z"), ts("2018-02-03T00:00:00Z"));
        assert_eq!(dates.len(), 2);
        assert_eq!(dates[0], NaiveDate::from_ymd_opt(2018, 2, 1).unwrap());
    }

    #[test]
    fn test_ms_per_24_and_hour() {
        let cal = LocalCalendar::utc();
        let t = ts("2018-02-01T03:30:00Z");
        assert_eq!(cal.ms_per_24(t), 3 * MS_PER_HOUR + 30 * 60 * 1000);
        assert_eq!(cal.hour_of_day(t), 3);
    }
}
