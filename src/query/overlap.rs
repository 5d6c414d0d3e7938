//! Records that began before a window and are still running at its start
//!
//! A basal programmed at 23:00 for two hours belongs to tomorrow's chart as
//! much as today's, but a range filter on start time misses it. These
//! lookups find that one segment under the session's day and device filters
//! so the orchestrator can prepend it.

use crate::index::QuerySession;
use crate::record::{Record, RecordType};
use crate::types::Timestamp;

/// Device event subType of a temporary pump settings override
pub const PUMP_SETTINGS_OVERRIDE: &str = "pumpSettingsOverride";

/// Latest basal starting before `start` whose span reaches past it
pub fn basal_overlapping_start<'a>(
    session: &QuerySession<'a>,
    start: Timestamp,
) -> Option<&'a Record> {
    let mut scoped = session.clone();
    scoped.clear_type_filter();
    overlapping(&scoped, &RecordType::Basal, start)
}

/// Latest pump settings override starting before `start` and still active
pub fn pump_settings_override_overlapping_start<'a>(
    session: &QuerySession<'a>,
    start: Timestamp,
) -> Option<&'a Record> {
    let mut scoped = session.clone();
    scoped.clear_type_filter();
    scoped.by_sub_type(PUMP_SETTINGS_OVERRIDE);
    overlapping(&scoped, &RecordType::DeviceEvent, start)
}

fn overlapping<'a>(
    session: &QuerySession<'a>,
    record_type: &RecordType,
    start: Timestamp,
) -> Option<&'a Record> {
    let field = session.time_field();
    session
        .latest_before(record_type, start)
        .filter(|r| r.duration().is_some_and(|d| field.of(r).saturating_add(d) > start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{RecordIndex, TimeField};
    use crate::record::{Basal, DeviceEvent, RecordKind};
    use crate::timezone::LocalCalendar;
    use crate::types::{TimeRange, MS_PER_HOUR};

    fn basal(id: &str, time: Timestamp, hours: i64, device: &str) -> Record {
        let mut record = Record::new(
            id,
            time,
            RecordKind::Basal(Basal {
                rate: Some(1.0),
                duration: Some(hours * MS_PER_HOUR),
                ..Basal::default()
            }),
        );
        record.device_id = Some(device.to_string());
        record
    }

    #[test]
    fn test_basal_spanning_start_found() {
        let mut index = RecordIndex::new();
        index.upsert(basal("early", 0, 1, "pump"));
        index.upsert(basal("spanning", 2 * MS_PER_HOUR, 3, "pump"));
        index.upsert(basal("inside", 5 * MS_PER_HOUR, 1, "pump"));

        let mut session = index.session(TimeField::Time, LocalCalendar::utc());
        let start = 4 * MS_PER_HOUR;
        session
            .by_endpoints(TimeRange::new(start, 10 * MS_PER_HOUR).unwrap())
            .by_type(RecordType::Cbg);
        assert_eq!(basal_overlapping_start(&session, start).unwrap().id, "spanning");
    }

    #[test]
    fn test_finished_basal_not_returned() {
        let mut index = RecordIndex::new();
        index.upsert(basal("ended", 0, 1, "pump"));
        let session = index.session(TimeField::Time, LocalCalendar::utc());
        assert!(basal_overlapping_start(&session, 2 * MS_PER_HOUR).is_none());
    }

    #[test]
    fn test_excluded_device_respected() {
        let mut index = RecordIndex::new();
        index.upsert(basal("spanning", 0, 5, "old-pump"));
        let mut session = index.session(TimeField::Time, LocalCalendar::utc());
        session.by_device_ids(["old-pump".to_string()]);
        assert!(basal_overlapping_start(&session, MS_PER_HOUR).is_none());
    }

    #[test]
    fn test_pump_settings_override() {
        let mut index = RecordIndex::new();
        let event: DeviceEvent = serde_json::from_value(serde_json::json!({
            "subType": "pumpSettingsOverride",
            "overrideType": "preprandial",
            "duration": 7_200_000
        }))
        .unwrap();
        index.upsert(Record::new("ovr", 0, RecordKind::DeviceEvent(event)));
        let session = index.session(TimeField::Time, LocalCalendar::utc());
        assert_eq!(
            pump_settings_override_overlapping_start(&session, MS_PER_HOUR).unwrap().id,
            "ovr"
        );
        assert!(pump_settings_override_overlapping_start(&session, 3 * MS_PER_HOUR).is_none());
    }
}
