//! Scoped filter state over a [`RecordIndex`]
//!
//! A session starts with no filters. Each `by_*` call narrows the match set;
//! [`QuerySession::clear_filters`] resets them. Nothing is written back to
//! the index, so a dropped session leaves no state behind.
//!
//! # Example
//!
//! ```rust
//! use diabetes_data_engine::index::{RecordIndex, SortOrder, TimeField};
//! use diabetes_data_engine::record::{BgReading, Record, RecordKind, RecordType};
//! use diabetes_data_engine::timezone::LocalCalendar;
//! use diabetes_data_engine::types::TimeRange;
//!
//! let mut index = RecordIndex::new();
//! for (id, time) in [("a", 10), ("b", 20), ("c", 30)] {
//!     let reading = BgReading { value: 100.0, ..BgReading::default() };
//!     index.upsert(Record::new(id, time, RecordKind::Cbg(reading)));
//! }
//!
//! let mut session = index.session(TimeField::Time, LocalCalendar::utc());
//! session
//!     .by_endpoints(TimeRange::new(15, 40).unwrap())
//!     .by_type(RecordType::Cbg);
//! let ids: Vec<_> = session.records(SortOrder::Desc).iter().map(|r| r.id.clone()).collect();
//! assert_eq!(ids, vec!["c", "b"]);
//! ```

use std::collections::BTreeSet;

use super::{RecordIndex, SlotBitmap, TimeField};
use crate::record::{Record, RecordType};
use crate::timezone::LocalCalendar;
use crate::types::{ActiveDays, TimeRange, Timestamp};

/// Direction of time-ordered retrieval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Oldest first
    #[default]
    Asc,
    /// Newest first
    Desc,
}

/// Filter state borrowed from an index for the duration of one query
#[derive(Debug, Clone)]
pub struct QuerySession<'a> {
    index: &'a RecordIndex,
    field: TimeField,
    calendar: LocalCalendar,
    endpoints: Option<TimeRange>,
    active_days: ActiveDays,
    types: Option<Vec<RecordType>>,
    sub_type: Option<String>,
    id: Option<String>,
    excluded_devices: BTreeSet<String>,
    include_rejected: bool,
}

impl<'a> QuerySession<'a> {
    pub(super) fn new(index: &'a RecordIndex, field: TimeField, calendar: LocalCalendar) -> Self {
        Self {
            index,
            field,
            calendar,
            endpoints: None,
            active_days: ActiveDays::all(),
            types: None,
            sub_type: None,
            id: None,
            excluded_devices: BTreeSet::new(),
            include_rejected: false,
        }
    }

    /// The borrowed index
    pub fn index(&self) -> &'a RecordIndex {
        self.index
    }

    /// Active time field
    pub fn time_field(&self) -> TimeField {
        self.field
    }

    /// Calendar used for weekday membership
    pub fn calendar(&self) -> &LocalCalendar {
        &self.calendar
    }

    /// Restrict to `[start, end)` on the active time field
    pub fn by_endpoints(&mut self, range: TimeRange) -> &mut Self {
        self.endpoints = Some(range);
        self
    }

    /// Restrict to records whose local weekday is active
    pub fn by_active_days(&mut self, days: ActiveDays) -> &mut Self {
        self.active_days = days;
        self
    }

    /// Restrict to one type
    pub fn by_type(&mut self, record_type: RecordType) -> &mut Self {
        self.types = Some(vec![record_type]);
        self
    }

    /// Restrict to any of several types
    pub fn by_types<I: IntoIterator<Item = RecordType>>(&mut self, types: I) -> &mut Self {
        self.types = Some(types.into_iter().collect());
        self
    }

    /// Restrict to a subType
    pub fn by_sub_type(&mut self, sub_type: impl Into<String>) -> &mut Self {
        self.sub_type = Some(sub_type.into());
        self
    }

    /// Restrict to one id
    pub fn by_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.id = Some(id.into());
        self
    }

    /// Exclude records from the given devices; records without a device id stay
    pub fn by_device_ids<I: IntoIterator<Item = String>>(&mut self, excluded: I) -> &mut Self {
        self.excluded_devices = excluded.into_iter().collect();
        self
    }

    /// Keep rejected records in the match set
    pub fn include_rejected(&mut self, include: bool) -> &mut Self {
        self.include_rejected = include;
        self
    }

    /// Drop the type filter only
    pub fn clear_type_filter(&mut self) -> &mut Self {
        self.types = None;
        self.sub_type = None;
        self
    }

    /// Reset every filter
    pub fn clear_filters(&mut self) -> &mut Self {
        self.endpoints = None;
        self.active_days = ActiveDays::all();
        self.types = None;
        self.sub_type = None;
        self.id = None;
        self.excluded_devices.clear();
        self.include_rejected = false;
        self
    }

    /// Active days filter
    pub fn active_days(&self) -> ActiveDays {
        self.active_days
    }

    /// Excluded device ids
    pub fn excluded_devices(&self) -> &BTreeSet<String> {
        &self.excluded_devices
    }

    /// Slots matching every filter except endpoints
    pub fn matching_unbounded(&self) -> SlotBitmap {
        let index = self.index;
        let mut matched = match &self.types {
            Some(types) => index.of_types(types.iter()),
            None => index.all().clone(),
        };

        if let Some(sub_type) = &self.sub_type {
            matched = matched.and(index.of_sub_type(sub_type));
        }
        if let Some(id) = &self.id {
            matched = match index.slot_of(id) {
                Some(slot) if matched.contains(slot) => SlotBitmap::from_slots([slot]),
                _ => SlotBitmap::new(),
            };
        }
        if !self.active_days.is_all() {
            let calendar = index.calendar_dimension(&self.calendar, self.field);
            let allowed = self
                .active_days
                .iter()
                .fold(SlotBitmap::new(), |acc, day| {
                    acc.or(calendar.weekday(day.num_days_from_sunday() as usize))
                });
            matched = matched.and(&allowed);
        }
        if !self.excluded_devices.is_empty() {
            matched = matched.and_not(&index.of_devices(self.excluded_devices.iter()));
        }
        if !self.include_rejected {
            matched = matched.and_not(index.rejected());
        }
        matched
    }

    /// Slots matching every filter
    pub fn matching(&self) -> SlotBitmap {
        let matched = self.matching_unbounded();
        match self.endpoints {
            Some(range) => matched.and(&self.index.in_range(self.field, range)),
            None => matched,
        }
    }

    /// Number of matching records
    pub fn count(&self) -> usize {
        self.matching().cardinality()
    }

    /// Matching records ordered by the active time field
    pub fn records(&self, order: SortOrder) -> Vec<&'a Record> {
        let index = self.index;
        let mut slots = index.sorted(self.field, &self.matching());
        if order == SortOrder::Desc {
            slots.reverse();
        }
        slots.into_iter().filter_map(|slot| index.record(slot)).collect()
    }

    /// Latest matching record of a type that starts before `before`,
    /// ignoring the endpoints filter
    pub fn latest_before(&self, record_type: &RecordType, before: Timestamp) -> Option<&'a Record> {
        let subset = self.matching_unbounded();
        self.index
            .latest_of_type_before(record_type, self.field, before, &subset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BgReading, Bolus, RecordKind};

    fn index() -> RecordIndex {
        let mut index = RecordIndex::new();
        let day = 86_400_000;
        // 2018-02-01 (Thu) .. 2018-02-04 (Sun)
        let base = 1_517_443_200_000;
        for i in 0..4 {
            let mut cbg = Record::new(
                format!("cbg{}", i),
                base + i * day,
                RecordKind::Cbg(BgReading {
                    value: 100.0,
                    ..BgReading::default()
                }),
            );
            cbg.device_id = Some(if i % 2 == 0 { "dexcom" } else { "libre" }.to_string());
            index.upsert(cbg);
        }
        let mut bolus = Record::new("bolus", base + 1000, RecordKind::Bolus(Bolus::default()));
        bolus.reject = true;
        index.upsert(bolus);
        index
    }

    #[test]
    fn test_type_and_rejected_filters() {
        let index = index();
        let mut session = index.session(TimeField::Time, LocalCalendar::utc());
        assert_eq!(session.count(), 4);
        session.include_rejected(true);
        assert_eq!(session.count(), 5);
        session.by_type(RecordType::Bolus);
        assert_eq!(session.count(), 1);
        session.clear_filters();
        assert_eq!(session.count(), 4);
    }

    #[test]
    fn test_active_days_filter() {
        let index = index();
        let mut session = index.session(TimeField::Time, LocalCalendar::utc());
        session.by_active_days(ActiveDays::from_weekdays([chrono::Weekday::Sat, chrono::Weekday::Sun]));
        let ids: Vec<_> = session.records(SortOrder::Asc).iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["cbg2", "cbg3"]);
    }

    #[test]
    fn test_excluded_devices() {
        let index = index();
        let mut session = index.session(TimeField::Time, LocalCalendar::utc());
        session.by_device_ids(["libre".to_string()]);
        assert_eq!(session.count(), 2);
    }

    #[test]
    fn test_by_id_respects_other_filters() {
        let index = index();
        let mut session = index.session(TimeField::Time, LocalCalendar::utc());
        session.by_id("cbg1");
        assert_eq!(session.count(), 1);
        session.by_type(RecordType::Bolus);
        assert_eq!(session.count(), 0);
    }

    #[test]
    fn test_latest_before_ignores_endpoints() {
        let index = index();
        let mut session = index.session(TimeField::Time, LocalCalendar::utc());
        let third = index.get("cbg2").unwrap().time;
        session.by_endpoints(TimeRange::new(third, third + 1).unwrap());
        let prior = session.latest_before(&RecordType::Cbg, third).unwrap();
        assert_eq!(prior.id, "cbg1");
    }
}
