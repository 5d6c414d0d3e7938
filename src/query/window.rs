//! Window planning
//!
//! A query covers up to three contiguous windows:
//!
//! ```text
//!   prev                 current                  next
//! [start-p, start)   [start, end)            [end, end+n)
//! ```
//!
//! `p` and `n` are whole local calendar days, so across a DST transition a
//! window is 23 or 25 hours long rather than 24 × days.

use chrono::Datelike;
use serde::Serialize;

use crate::timezone::LocalCalendar;
use crate::types::{ActiveDays, TimeRange};

/// One planned window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Window {
    /// `[start, end)` in the active time field
    pub range: TimeRange,
    /// Local calendar days touched by the range
    pub days: usize,
    /// Of those, days whose weekday is active
    pub active_days: usize,
}

/// The three windows of a query; `next`/`prev` only when requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPlan {
    /// Requested range
    pub current: Window,
    /// Range following `current`
    pub next: Option<Window>,
    /// Range preceding `current`
    pub prev: Option<Window>,
}

/// Computes window ranges and day counts for one calendar
#[derive(Debug, Clone)]
pub struct WindowPlanner {
    calendar: LocalCalendar,
    active_days: ActiveDays,
    plan: Option<WindowPlan>,
}

impl WindowPlanner {
    /// Planner with every weekday active
    pub fn new(calendar: LocalCalendar) -> Self {
        Self {
            calendar,
            active_days: ActiveDays::all(),
            plan: None,
        }
    }

    /// Calendar in use
    pub fn calendar(&self) -> &LocalCalendar {
        &self.calendar
    }

    /// Current plan, if endpoints were set
    pub fn plan(&self) -> Option<&WindowPlan> {
        self.plan.as_ref()
    }

    /// Active weekday set
    pub fn active_days(&self) -> ActiveDays {
        self.active_days
    }

    /// Plan windows around `range`
    ///
    /// `next_days` / `prev_days` of zero or less produce no window.
    pub fn set_endpoints(
        &mut self,
        range: TimeRange,
        next_days: Option<i64>,
        prev_days: Option<i64>,
    ) -> &WindowPlan {
        let next = next_days.filter(|n| *n > 0).map(|n| {
            let end = self.calendar.add_days(range.end, n);
            self.window(TimeRange::unchecked(range.end, end.max(range.end)))
        });
        let prev = prev_days.filter(|p| *p > 0).map(|p| {
            let start = self.calendar.add_days(range.start, -p);
            self.window(TimeRange::unchecked(start.min(range.start), range.start))
        });
        let current = self.window(range);
        self.plan.insert(WindowPlan {
            current,
            next,
            prev,
        })
    }

    /// Change the active weekdays, recounting without moving any range
    pub fn set_active_days(&mut self, days: ActiveDays) {
        self.active_days = days;
        let calendar = self.calendar;
        if let Some(plan) = self.plan.as_mut() {
            let windows = std::iter::once(&mut plan.current)
                .chain(plan.next.as_mut())
                .chain(plan.prev.as_mut());
            for window in windows {
                window.active_days = count_active(&calendar, days, window.range);
            }
        }
    }

    fn window(&self, range: TimeRange) -> Window {
        Window {
            range,
            days: self.calendar.dates_in(range.start, range.end).len(),
            active_days: count_active(&self.calendar, self.active_days, range),
        }
    }
}

fn count_active(calendar: &LocalCalendar, days: ActiveDays, range: TimeRange) -> usize {
    calendar
        .dates_in(range.start, range.end)
        .into_iter()
        .filter(|d| days.contains(d.weekday()))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{parse_instant, MS_PER_DAY};
    use chrono::Weekday;

    fn ts(s: &str) -> i64 {
        parse_instant(s).unwrap()
    }

    #[test]
    fn test_windows_partition() {
        let mut planner = WindowPlanner::new(LocalCalendar::utc());
        let range = TimeRange::new(ts("2018-02-01T00:00:00Z"), ts("2018-02-08T00:00:00Z")).unwrap();
        let plan = *planner.set_endpoints(range, Some(7), Some(7));

        let prev = plan.prev.unwrap();
        let next = plan.next.unwrap();
        assert_eq!(prev.range.end, plan.current.range.start);
        assert_eq!(plan.current.range.end, next.range.start);
        assert_eq!(prev.range.duration_ms(), 7 * MS_PER_DAY);
        assert_eq!(plan.current.days, 7);
        assert_eq!(next.days, 7);
    }

    #[test]
    fn test_no_next_or_prev_by_default() {
        let mut planner = WindowPlanner::new(LocalCalendar::utc());
        let plan = planner.set_endpoints(TimeRange::new(0, MS_PER_DAY).unwrap(), None, Some(0));
        assert!(plan.next.is_none());
        assert!(plan.prev.is_none());
    }

    #[test]
    fn test_prev_window_spans_dst_change() {
        let calendar = LocalCalendar::named("US/Eastern").unwrap();
        let mut planner = WindowPlanner::new(calendar);
        // local midnight 2019-03-11 EDT
        let start = ts("2019-03-11T04:00:00Z");
        let range = TimeRange::new(start, start + MS_PER_DAY).unwrap();
        let plan = planner.set_endpoints(range, None, Some(1));
        let prev = plan.prev.unwrap();
        assert_eq!(prev.range.start, ts("2019-03-10T05:00:00Z"));
        assert_eq!(prev.range.duration_ms(), 23 * 60 * 60 * 1000);
        assert_eq!(prev.days, 1);
    }

    #[test]
    fn test_set_active_days_keeps_ranges() {
        let mut planner = WindowPlanner::new(LocalCalendar::utc());
        // Thu 2018-02-01 .. Thu 2018-02-08
        let range = TimeRange::new(ts("2018-02-01T00:00:00Z"), ts("2018-02-08T00:00:00Z")).unwrap();
        planner.set_endpoints(range, Some(7), None);
        let before = *planner.plan().unwrap();

        planner.set_active_days(ActiveDays::from_weekdays([Weekday::Sat, Weekday::Sun]));
        let after = planner.plan().unwrap();
        assert_eq!(after.current.range, before.current.range);
        assert_eq!(after.current.days, 7);
        assert_eq!(after.current.active_days, 2);
        assert_eq!(after.next.unwrap().active_days, 2);
    }
}
