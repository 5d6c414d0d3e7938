//! Window and fill-bin behaviour across daylight-saving transitions
//!
//! Windows advance by local calendar days, so a day containing a DST
//! change is 23 or 25 hours long. Fill bins either keep a fixed width or
//! realign to local hours.

use diabetes_data_engine::query::{get_fill_data, FillOptions, WindowPlanner};
use diabetes_data_engine::timezone::LocalCalendar;
use diabetes_data_engine::types::{parse_instant, ActiveDays, TimeRange, MS_PER_HOUR};

fn ts(s: &str) -> i64 {
    parse_instant(s).expect("valid instant")
}

#[test]
fn test_next_window_over_fall_back_is_25_hours() {
    let calendar = LocalCalendar::named("US/Eastern").unwrap();
    let mut planner = WindowPlanner::new(calendar);
    // local midnight 2019-11-02 EDT .. midnight 2019-11-03 EDT
    let range = TimeRange::new(ts("2019-11-02T04:00:00Z"), ts("2019-11-03T04:00:00Z")).unwrap();
    let plan = planner.set_endpoints(range, Some(1), None);

    let next = plan.next.unwrap();
    assert_eq!(next.range.start, ts("2019-11-03T04:00:00Z"));
    assert_eq!(next.range.end, ts("2019-11-04T05:00:00Z"));
    assert_eq!(next.range.duration_ms(), 25 * MS_PER_HOUR);
    assert_eq!(next.days, 1);
}

#[test]
fn test_week_window_spanning_spring_forward() {
    let calendar = LocalCalendar::named("US/Eastern").unwrap();
    let mut planner = WindowPlanner::new(calendar);
    let range = TimeRange::new(ts("2019-03-07T05:00:00Z"), ts("2019-03-14T04:00:00Z")).unwrap();
    let plan = *planner.set_endpoints(range, Some(7), Some(7));

    let prev = plan.prev.unwrap();
    let next = plan.next.unwrap();
    assert_eq!(plan.current.days, 7);
    assert_eq!(prev.range.end, plan.current.range.start);
    assert_eq!(plan.current.range.end, next.range.start);
    // a week without a transition is exactly 168 hours
    assert_eq!(prev.range.duration_ms(), 168 * MS_PER_HOUR);
    assert_eq!(next.range.duration_ms(), 168 * MS_PER_HOUR);
}

#[test]
fn test_active_days_counted_in_local_time() {
    // noon on Friday 2018-02-02 in US/Pacific, already evening in UTC
    let calendar = LocalCalendar::named("US/Pacific").unwrap();
    let mut planner = WindowPlanner::new(calendar);
    let start = calendar.start_of_day(ts("2018-02-02T20:00:00Z"));
    let range = TimeRange::new(start, calendar.add_days(start, 1)).unwrap();
    planner.set_endpoints(range, None, None);
    planner.set_active_days(ActiveDays::from_weekdays([chrono::Weekday::Fri]));
    assert_eq!(planner.plan().unwrap().current.active_days, 1);
}

#[test]
fn test_fall_back_adjusted_bins() {
    let calendar = LocalCalendar::named("US/Eastern").unwrap();
    let range = TimeRange::new(ts("2019-11-03T04:00:00Z"), ts("2019-11-04T05:00:00Z")).unwrap();
    let bins = get_fill_data(
        range,
        &calendar,
        3,
        FillOptions {
            adjust_for_dst_changes: true,
        },
    );

    assert_eq!(bins.len(), 8);
    // 00:00 to 03:00 local spans the repeated hour
    assert_eq!(bins[0].normal_end - bins[0].normal_time, 4 * MS_PER_HOUR);
    assert!(bins[1..]
        .iter()
        .all(|b| b.normal_end - b.normal_time == 3 * MS_PER_HOUR));
    assert_eq!(bins[0].display_offset, -240);
    assert_eq!(bins[1].display_offset, -300);
}

#[test]
fn test_fixed_bins_ids_are_utc_stamped() {
    let calendar = LocalCalendar::named("US/Eastern").unwrap();
    let range = TimeRange::new(ts("2019-11-03T04:00:00Z"), ts("2019-11-04T05:00:00Z")).unwrap();
    let bins = get_fill_data(range, &calendar, 3, FillOptions::default());

    // 25 local hours need 9 fixed bins
    assert_eq!(bins.len(), 9);
    assert_eq!(bins[0].id, "fill_20191103T040000000Z");
    assert!(bins.iter().all(|b| b.record_type == "fill"));
}
