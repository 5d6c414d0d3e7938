//! Fill-gap bins
//!
//! Charts draw a background band for every few hours of the window. Bins
//! cover whole local days, from the start of the first day to the start of
//! the day after the last instant of the range.
//!
//! ```text
//! fixed steps          |--3h--|--3h--|--3h--| ...   (one bin may span a DST change)
//! adjustForDSTChanges  00:00  03:00  06:00 ...      (local hours; a bin absorbs the delta)
//! ```

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::timezone::LocalCalendar;
use crate::types::{TimeRange, Timestamp, MS_PER_HOUR};

/// Fill options accepted in a query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct FillOptions {
    /// Start bins on local multiples of the bin width
    #[serde(default, rename = "adjustForDSTChanges")]
    pub adjust_for_dst_changes: bool,
}

/// One generated bin
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FillBin {
    /// Stable id derived from the UTC start instant
    pub id: String,
    /// Always `fill`
    #[serde(rename = "type")]
    pub record_type: &'static str,
    /// Bin start
    pub normal_time: Timestamp,
    /// Bin end (next bin's start when DST-adjusted)
    pub normal_end: Timestamp,
    /// UTC offset at the start, in minutes
    pub display_offset: i64,
    /// Milliseconds since local midnight at the start
    #[serde(rename = "msPer24")]
    pub ms_per_24: i64,
    /// Local hour at the start
    pub hour_of_day: u32,
    /// Local date of the start (`YYYY-MM-DD`)
    pub fill_date: String,
}

/// Generate bins covering the local days of `range`
pub fn get_fill_data(
    range: TimeRange,
    calendar: &LocalCalendar,
    bin_hours: u32,
    opts: FillOptions,
) -> Vec<FillBin> {
    let bin_hours = bin_hours.clamp(1, 24);
    let start = calendar.start_of_day(range.start);
    let end = calendar.add_days(calendar.start_of_day(range.end - 1), 1);

    let starts: Vec<Timestamp> = if opts.adjust_for_dst_changes {
        let mut starts: Vec<Timestamp> = calendar
            .dates_in(start, end)
            .into_iter()
            .flat_map(|date| {
                (0..24)
                    .step_by(bin_hours as usize)
                    .map(move |hour| calendar.at_local_hour(date, hour))
            })
            .filter(|t| *t >= start && *t < end)
            .collect();
        // an hour lost to a spring-forward gap resolves onto the next bin
        starts.dedup();
        starts
    } else {
        let step = i64::from(bin_hours) * MS_PER_HOUR;
        (0..)
            .map(|i| start + i * step)
            .take_while(|t| *t < end)
            .collect()
    };

    let step = i64::from(bin_hours) * MS_PER_HOUR;
    starts
        .iter()
        .enumerate()
        .map(|(i, &normal_time)| {
            let normal_end = if opts.adjust_for_dst_changes {
                starts.get(i + 1).copied().unwrap_or(end)
            } else {
                normal_time + step
            };
            FillBin {
                id: fill_id(normal_time),
                record_type: "fill",
                normal_time,
                normal_end,
                display_offset: calendar.offset_minutes(normal_time),
                ms_per_24: calendar.ms_per_24(normal_time),
                hour_of_day: calendar.hour_of_day(normal_time),
                fill_date: calendar.local_date(normal_time).format("%Y-%m-%d").to_string(),
            }
        })
        .collect()
}

/// `fill_` plus the compact UTC instant, e.g. `fill_20190310T050000000Z`
fn fill_id(ts: Timestamp) -> String {
    let stamp = DateTime::from_timestamp_millis(ts)
        .map(|dt| dt.format("%Y%m%dT%H%M%S%3fZ").to_string())
        .unwrap_or_else(|| ts.to_string());
    format!("fill_{}", stamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_instant;

    fn ts(s: &str) -> i64 {
        parse_instant(s).unwrap()
    }

    #[test]
    fn test_fixed_bins_cover_whole_days() {
        let range = TimeRange::new(ts("2018-02-01T10:00:00Z"), ts("2018-02-02T01:00:00Z")).unwrap();
        let bins = get_fill_data(range, &LocalCalendar::utc(), 3, FillOptions::default());
        assert_eq!(bins.len(), 16);
        assert_eq!(bins[0].normal_time, ts("2018-02-01T00:00:00Z"));
        assert_eq!(bins[0].id, "fill_20180201T000000000Z");
        assert_eq!(bins[15].normal_end, ts("2018-02-03T00:00:00Z"));
        assert_eq!(bins[1].hour_of_day, 3);
        assert_eq!(bins[1].ms_per_24, 3 * MS_PER_HOUR);
        assert_eq!(bins[0].fill_date, "2018-02-01");
    }

    #[test]
    fn test_dst_adjusted_spring_forward() {
        let calendar = LocalCalendar::named("US/Eastern").unwrap();
        let start = ts("2019-03-10T05:00:00Z");
        let range = TimeRange::new(start, ts("2019-03-11T04:00:00Z")).unwrap();
        let bins = get_fill_data(
            range,
            &calendar,
            3,
            FillOptions {
                adjust_for_dst_changes: true,
            },
        );
        assert_eq!(bins.len(), 8);
        assert_eq!(bins[0].normal_time, start);
        assert_eq!(bins[0].normal_end - bins[0].normal_time, 2 * MS_PER_HOUR);
        assert_eq!(bins[0].display_offset, -300);
        assert_eq!(bins[1].display_offset, -240);
        assert_eq!(bins[1].hour_of_day, 3);
        for pair in bins.windows(2) {
            assert_eq!(pair[0].normal_end, pair[1].normal_time);
        }
        assert_eq!(bins[7].normal_end, ts("2019-03-11T04:00:00Z"));
    }

    #[test]
    fn test_fixed_bins_drift_across_dst() {
        let calendar = LocalCalendar::named("US/Eastern").unwrap();
        let range = TimeRange::new(ts("2019-03-10T05:00:00Z"), ts("2019-03-11T04:00:00Z")).unwrap();
        let bins = get_fill_data(range, &calendar, 3, FillOptions::default());
        // 23 local hours need 8 fixed bins; the second starts at 04:00 EDT
        assert_eq!(bins.len(), 8);
        assert_eq!(bins[1].hour_of_day, 4);
        assert!(bins.iter().all(|b| b.normal_end - b.normal_time == 3 * MS_PER_HOUR));
    }
}
