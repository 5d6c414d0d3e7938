//! Multi-dimensional record index
//!
//! The index is the single authority over stored records. Records live in a
//! slot table keyed by id; every other lookup is a dimension derived from
//! the slot table and updated in the same call that changes it.
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!   id ─────────> │ slots: [Option<Record>; n]   │
//!                 └──────────────┬───────────────┘
//!                                │ slot numbers
//!        ┌───────────┬───────────┼────────────┬──────────────┐
//!        v           v           v            v              v
//!     by_type   by_sub_type   by_device   by_time       calendar
//!     (bitmap)   (bitmap)     (bitmap)    (ordered)     (weekday/date bitmaps,
//!                                                        rebuilt per zone+field)
//! ```
//!
//! Filtering happens in a [`QuerySession`] which borrows the index. Filters
//! are owned by the session, so they vanish when it drops.

pub mod bitmap;
pub mod session;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use bitmap::{DimensionIndex, Slot, SlotBitmap};
pub use session::{QuerySession, SortOrder};

use crate::record::{Record, RecordType};
use crate::timezone::LocalCalendar;
use crate::types::{TimeRange, Timestamp};

/// Which time field windows, sorting and calendar dimensions use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TimeField {
    /// Absolute instant (timezone-aware queries)
    #[default]
    #[serde(rename = "time")]
    Time,
    /// Device wall clock (timezone-naive queries)
    #[serde(rename = "deviceTime")]
    DeviceTime,
}

impl TimeField {
    /// Read the field from a record
    pub fn of(&self, record: &Record) -> Timestamp {
        match self {
            TimeField::Time => record.time,
            TimeField::DeviceTime => record.device_time,
        }
    }

    /// Field name as it appears in records
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeField::Time => "time",
            TimeField::DeviceTime => "deviceTime",
        }
    }
}

/// Weekday and local-date membership for one zone and time field
#[derive(Debug)]
pub struct CalendarDimension {
    zone: &'static str,
    field: TimeField,
    /// Indexed by days from Sunday
    weekdays: [SlotBitmap; 7],
    dates: BTreeMap<NaiveDate, SlotBitmap>,
}

impl CalendarDimension {
    /// Slots falling on a weekday (0 = Sunday)
    pub fn weekday(&self, days_from_sunday: usize) -> &SlotBitmap {
        &self.weekdays[days_from_sunday % 7]
    }

    /// Slots falling on a local date
    pub fn date(&self, date: NaiveDate) -> Option<&SlotBitmap> {
        self.dates.get(&date)
    }

    /// Dates that have at least one record
    pub fn dates(&self) -> impl Iterator<Item = &NaiveDate> {
        self.dates.keys()
    }

    fn matches(&self, calendar: &LocalCalendar, field: TimeField) -> bool {
        self.zone == calendar.name() && self.field == field
    }
}

/// Slot table plus derived dimensions
#[derive(Debug, Default)]
pub struct RecordIndex {
    slots: Vec<Option<Record>>,
    by_id: HashMap<String, Slot>,
    free: Vec<Slot>,
    all: SlotBitmap,
    rejected: SlotBitmap,
    by_type: DimensionIndex<RecordType>,
    by_sub_type: DimensionIndex<String>,
    by_device: DimensionIndex<String>,
    by_time: BTreeSet<(Timestamp, Slot)>,
    by_device_time: BTreeSet<(Timestamp, Slot)>,
    calendar: RwLock<Option<Arc<CalendarDimension>>>,
}

impl RecordIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records (rejected included)
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Drop every record
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Insert or replace by id; returns the slot and whether a record was replaced
    pub fn upsert(&mut self, record: Record) -> (Slot, bool) {
        if let Some(&slot) = self.by_id.get(&record.id) {
            self.unindex(slot);
            self.slots[slot] = Some(record);
            self.index(slot);
            return (slot, true);
        }

        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            },
        };
        self.by_id.insert(record.id.clone(), slot);
        self.slots[slot] = Some(record);
        self.index(slot);
        (slot, false)
    }

    /// Remove by id
    pub fn remove(&mut self, id: &str) -> Option<Record> {
        let slot = self.by_id.remove(id)?;
        self.unindex(slot);
        self.free.push(slot);
        self.slots[slot].take()
    }

    /// Mutate a stored record in place and re-derive its dimensions
    pub fn modify<F: FnOnce(&mut Record)>(&mut self, slot: Slot, f: F) {
        if self.record(slot).is_none() {
            return;
        }
        self.unindex(slot);
        if let Some(record) = self.slots[slot].as_mut() {
            f(record);
        }
        self.index(slot);
    }

    /// Record by id
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.by_id.get(id).and_then(|&slot| self.record(slot))
    }

    /// Slot holding an id
    pub fn slot_of(&self, id: &str) -> Option<Slot> {
        self.by_id.get(id).copied()
    }

    /// Record in a slot
    pub fn record(&self, slot: Slot) -> Option<&Record> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Every stored record, in slot order
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    /// All occupied slots
    pub fn all(&self) -> &SlotBitmap {
        &self.all
    }

    /// Slots holding rejected records
    pub fn rejected(&self) -> &SlotBitmap {
        &self.rejected
    }

    /// Slots of one type
    pub fn of_type(&self, record_type: &RecordType) -> &SlotBitmap {
        self.by_type.get(record_type)
    }

    /// Slots of any of several types
    pub fn of_types<'t, I: IntoIterator<Item = &'t RecordType>>(&self, types: I) -> SlotBitmap {
        self.by_type.union(types)
    }

    /// Slots with a subType value
    pub fn of_sub_type(&self, sub_type: &str) -> &SlotBitmap {
        self.by_sub_type.get(&sub_type.to_string())
    }

    /// Slots from any of the given devices
    pub fn of_devices<'d, I: IntoIterator<Item = &'d String>>(&self, devices: I) -> SlotBitmap {
        self.by_device.union(devices)
    }

    /// Distinct device ids present
    pub fn device_ids(&self) -> impl Iterator<Item = &String> {
        self.by_device.keys()
    }

    /// Slots whose time field falls in `[start, end)`
    pub fn in_range(&self, field: TimeField, range: TimeRange) -> SlotBitmap {
        let ordered = self.ordered(field);
        SlotBitmap::from_slots(
            ordered
                .range((range.start, 0)..(range.end, 0))
                .map(|&(_, slot)| slot),
        )
    }

    /// Slots ordered by a time field, restricted to `subset`
    pub fn sorted(&self, field: TimeField, subset: &SlotBitmap) -> Vec<Slot> {
        let mut slots: Vec<(Timestamp, Slot)> = subset
            .iter()
            .filter_map(|slot| self.record(slot).map(|r| (field.of(r), slot)))
            .collect();
        slots.sort_unstable();
        slots.into_iter().map(|(_, slot)| slot).collect()
    }

    /// Latest non-rejected record of a type by a time field
    pub fn latest_of_type(&self, record_type: &RecordType, field: TimeField) -> Option<&Record> {
        let of_type = self.of_type(record_type);
        self.ordered(field)
            .iter()
            .rev()
            .find(|(_, slot)| of_type.contains(*slot) && !self.rejected.contains(*slot))
            .and_then(|&(_, slot)| self.record(slot))
    }

    /// Latest non-rejected record of a type starting strictly before `before`
    pub fn latest_of_type_before(
        &self,
        record_type: &RecordType,
        field: TimeField,
        before: Timestamp,
        subset: &SlotBitmap,
    ) -> Option<&Record> {
        let of_type = self.of_type(record_type);
        self.ordered(field)
            .range(..(before, 0))
            .rev()
            .find(|(_, slot)| {
                of_type.contains(*slot) && subset.contains(*slot) && !self.rejected.contains(*slot)
            })
            .and_then(|&(_, slot)| self.record(slot))
    }

    /// Weekday/date membership for a zone and field, rebuilt after mutations
    pub fn calendar_dimension(
        &self,
        calendar: &LocalCalendar,
        field: TimeField,
    ) -> Arc<CalendarDimension> {
        if let Some(cached) = self.calendar.read().as_ref() {
            if cached.matches(calendar, field) {
                return Arc::clone(cached);
            }
        }

        let mut weekdays: [SlotBitmap; 7] = Default::default();
        let mut dates: BTreeMap<NaiveDate, SlotBitmap> = BTreeMap::new();
        for slot in self.all.iter() {
            if let Some(record) = self.record(slot) {
                let date = calendar.local_date(field.of(record));
                weekdays[date.weekday().num_days_from_sunday() as usize].set(slot);
                dates.entry(date).or_default().set(slot);
            }
        }
        let built = Arc::new(CalendarDimension {
            zone: calendar.name(),
            field,
            weekdays,
            dates,
        });
        *self.calendar.write() = Some(Arc::clone(&built));
        built
    }

    /// Open a filter session over the index
    pub fn session(&self, field: TimeField, calendar: LocalCalendar) -> QuerySession<'_> {
        QuerySession::new(self, field, calendar)
    }

    fn ordered(&self, field: TimeField) -> &BTreeSet<(Timestamp, Slot)> {
        match field {
            TimeField::Time => &self.by_time,
            TimeField::DeviceTime => &self.by_device_time,
        }
    }

    fn index(&mut self, slot: Slot) {
        let Some(record) = self.slots[slot].as_ref() else {
            return;
        };
        self.all.set(slot);
        if record.reject {
            self.rejected.set(slot);
        }
        self.by_type.add(record.record_type.clone(), slot);
        if let Some(sub_type) = record.sub_type() {
            self.by_sub_type.add(sub_type.to_string(), slot);
        }
        if let Some(device_id) = &record.device_id {
            self.by_device.add(device_id.clone(), slot);
        }
        self.by_time.insert((record.time, slot));
        self.by_device_time.insert((record.device_time, slot));
        *self.calendar.get_mut() = None;
    }

    fn unindex(&mut self, slot: Slot) {
        let Some(record) = self.slots[slot].as_ref() else {
            return;
        };
        self.all.clear(slot);
        self.rejected.clear(slot);
        self.by_type.remove(&record.record_type, slot);
        if let Some(sub_type) = record.sub_type() {
            self.by_sub_type.remove(&sub_type.to_string(), slot);
        }
        if let Some(device_id) = &record.device_id {
            self.by_device.remove(device_id, slot);
        }
        self.by_time.remove(&(record.time, slot));
        self.by_device_time.remove(&(record.device_time, slot));
        *self.calendar.get_mut() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BgReading, RecordKind};

    fn cbg(id: &str, time: Timestamp, device: &str) -> Record {
        let mut record = Record::new(
            id,
            time,
            RecordKind::Cbg(BgReading {
                value: 100.0,
                ..BgReading::default()
            }),
        );
        record.device_id = Some(device.to_string());
        record
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let mut index = RecordIndex::new();
        let (slot, replaced) = index.upsert(cbg("a", 10, "d1"));
        assert!(!replaced);
        let (again, replaced) = index.upsert(cbg("a", 20, "d2"));
        assert!(replaced);
        assert_eq!(slot, again);
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("a").unwrap().time, 20);
        assert!(index.of_devices([&"d1".to_string()]).is_empty());
        assert_eq!(index.of_devices([&"d2".to_string()]).cardinality(), 1);
    }

    #[test]
    fn test_remove_frees_slot() {
        let mut index = RecordIndex::new();
        index.upsert(cbg("a", 10, "d1"));
        index.upsert(cbg("b", 20, "d1"));
        assert!(index.remove("a").is_some());
        assert!(index.remove("a").is_none());
        let (slot, _) = index.upsert(cbg("c", 30, "d1"));
        assert_eq!(slot, 0);
        assert_eq!(index.len(), 2);
        assert_eq!(index.of_type(&RecordType::Cbg).cardinality(), 2);
    }

    #[test]
    fn test_in_range_half_open() {
        let mut index = RecordIndex::new();
        index.upsert(cbg("a", 10, "d"));
        index.upsert(cbg("b", 20, "d"));
        index.upsert(cbg("c", 30, "d"));
        let hits = index.in_range(TimeField::Time, TimeRange::new(10, 30).unwrap());
        assert_eq!(hits.cardinality(), 2);
        assert!(!hits.contains(index.slot_of("c").unwrap()));
    }

    #[test]
    fn test_latest_of_type_skips_rejected() {
        let mut index = RecordIndex::new();
        index.upsert(cbg("a", 10, "d"));
        let mut late = cbg("b", 20, "d");
        late.reject = true;
        index.upsert(late);
        assert_eq!(index.latest_of_type(&RecordType::Cbg, TimeField::Time).unwrap().id, "a");
    }

    #[test]
    fn test_calendar_dimension_cached_and_invalidated() {
        let mut index = RecordIndex::new();
        // 2018-02-01 is a Thursday
        index.upsert(cbg("a", 1_517_443_200_000, "d"));
        let cal = LocalCalendar::utc();
        let first = index.calendar_dimension(&cal, TimeField::Time);
        assert_eq!(first.weekday(4).cardinality(), 1);
        let second = index.calendar_dimension(&cal, TimeField::Time);
        assert!(Arc::ptr_eq(&first, &second));

        index.upsert(cbg("b", 1_517_443_200_000 + 86_400_000, "d"));
        let rebuilt = index.calendar_dimension(&cal, TimeField::Time);
        assert_eq!(rebuilt.weekday(5).cardinality(), 1);
        assert_eq!(rebuilt.dates().count(), 2);
    }
}
