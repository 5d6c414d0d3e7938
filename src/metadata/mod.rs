//! Metadata cache
//!
//! Summaries that clients read alongside query results. The cache is
//! recomputed from the index after every mutating call, so a read never
//! scans the store.
//!
//! ```text
//! add_data / update_datum / remove_data
//!        │
//!        v
//!   RecordIndex ──refresh──> MetadataCache ──get_meta_data(fields)──> JSON
//!                                  ^
//!   query ── bgPrefs, bgSource, matchedDevices
//! ```

pub mod devices;

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

pub use devices::{Device, LatestPumpUpload, UploadInfo};

use crate::index::{RecordIndex, TimeField};
use crate::record::{Record, RecordKind, RecordType, ANNOTATION_INCOMPLETE_TUPLE};
use crate::types::{TimeRange, Timestamp};
use crate::units::BgPrefs;

/// Every field [`MetadataCache::get_meta_data`] understands
pub const META_DATA_FIELDS: [&str; 10] = [
    "size",
    "bgPrefs",
    "bgSources",
    "latestDatumByType",
    "latestPumpUpload",
    "devices",
    "excludedDevices",
    "uploadMap",
    "incompleteSuspends",
    "matchedDevices",
];

/// Glucose sources present in the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BgSources {
    /// Any continuous readings stored
    pub cbg: bool,
    /// Any fingerstick readings stored
    pub smbg: bool,
    /// Source used for glucose statistics
    pub current: Option<String>,
}

/// A suspend whose closing event never arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncompleteSuspend<'a> {
    /// Suspend record id
    pub id: &'a str,
    /// Span by absolute time
    pub range: TimeRange,
}

/// Cached summaries, refreshed after each mutation
#[derive(Debug, Clone, Default)]
pub struct MetadataCache {
    /// Records stored, rejected ones included
    pub size: usize,
    /// Display preferences last applied by a query
    pub bg_prefs: BgPrefs,
    /// Glucose source availability
    pub bg_sources: BgSources,
    /// Id of the latest accepted record per type
    pub latest_datum_by_type: BTreeMap<String, String>,
    /// Most recent pump upload
    pub latest_pump_upload: Option<LatestPumpUpload>,
    /// One entry per device id
    pub devices: Vec<Device>,
    /// Device ids hidden by default
    pub excluded_devices: Vec<String>,
    /// Upload sessions by upload id
    pub upload_map: BTreeMap<String, UploadInfo>,
    /// Pump suspends with no matching resume, with their spans
    pub incomplete_suspends: Vec<(String, TimeRange)>,
    /// Devices consulted by the last statistics pass
    pub matched_devices: BTreeSet<String>,
}

impl MetadataCache {
    /// Empty cache with the given display preferences
    pub fn new(bg_prefs: BgPrefs) -> Self {
        Self {
            bg_prefs,
            ..Self::default()
        }
    }

    /// Recompute everything derived from the index
    ///
    /// The current glucose source is kept once chosen; only an unset source
    /// falls back to `cbg`, then `smbg`. `now` closes suspends still running.
    pub fn refresh(&mut self, index: &RecordIndex, now: Timestamp) {
        let not_rejected = index.all().and_not(index.rejected());
        let present = |t: &RecordType| !index.of_type(t).and(&not_rejected).is_empty();

        self.size = index.len();
        self.bg_sources.cbg = present(&RecordType::Cbg);
        self.bg_sources.smbg = present(&RecordType::Smbg);
        if self.bg_sources.current.is_none() {
            self.bg_sources.current = if self.bg_sources.cbg {
                Some("cbg".to_string())
            } else if self.bg_sources.smbg {
                Some("smbg".to_string())
            } else {
                None
            };
        }

        let types: BTreeSet<RecordType> = not_rejected
            .iter()
            .filter_map(|slot| index.record(slot))
            .map(|r| r.record_type.clone())
            .collect();
        self.latest_datum_by_type = types
            .iter()
            .filter_map(|t| {
                let latest = index.latest_of_type(t, TimeField::Time)?;
                Some((t.as_str().to_string(), latest.id.clone()))
            })
            .collect();

        self.latest_pump_upload = devices::latest_pump_upload(index);
        let (devices, excluded) = devices::inventory(index);
        self.devices = devices;
        self.excluded_devices = excluded;
        self.upload_map = devices::upload_map(index);
        self.incomplete_suspends = incomplete_suspends(index, now);

        debug!(
            size = self.size,
            devices = self.devices.len(),
            uploads = self.upload_map.len(),
            "Metadata refreshed"
        );
    }

    /// Reset to an empty store, keeping display preferences
    pub fn clear(&mut self) {
        *self = Self::new(self.bg_prefs);
    }

    /// Spans of still-open suspends
    pub fn incomplete_suspend_ranges(&self) -> Vec<TimeRange> {
        self.incomplete_suspends.iter().map(|(_, r)| *r).collect()
    }

    /// Open suspends as borrowed views
    pub fn incomplete_suspends(&self) -> impl Iterator<Item = IncompleteSuspend<'_>> {
        self.incomplete_suspends
            .iter()
            .map(|(id, range)| IncompleteSuspend { id, range: *range })
    }

    /// Requested subset as a JSON object
    ///
    /// Record-valued fields (`latestDatumByType`, `incompleteSuspends`) are
    /// rendered through `render`; unknown names are skipped.
    pub fn get_meta_data<F>(&self, fields: &[String], index: &RecordIndex, render: F) -> Value
    where
        F: Fn(&Record) -> Value,
    {
        let mut out = Map::new();
        for field in fields {
            let value = match field.as_str() {
                "size" => Value::from(self.size),
                "bgPrefs" => to_value(&self.bg_prefs),
                "bgSources" => to_value(&self.bg_sources),
                "latestDatumByType" => Value::Object(
                    self.latest_datum_by_type
                        .iter()
                        .filter_map(|(t, id)| Some((t.clone(), render(index.get(id)?))))
                        .collect(),
                ),
                "latestPumpUpload" => to_value(&self.latest_pump_upload),
                "devices" => to_value(&self.devices),
                "excludedDevices" => to_value(&self.excluded_devices),
                "uploadMap" => to_value(&self.upload_map),
                "incompleteSuspends" => Value::Array(
                    self.incomplete_suspends()
                        .filter_map(|s| index.get(s.id))
                        .map(&render)
                        .collect(),
                ),
                "matchedDevices" => to_value(&self.matched_devices),
                _ => continue,
            };
            out.insert(field.clone(), value);
        }
        Value::Object(out)
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Status events `suspended` whose resume never arrived
fn incomplete_suspends(index: &RecordIndex, now: Timestamp) -> Vec<(String, TimeRange)> {
    index
        .sorted(TimeField::Time, index.of_type(&RecordType::DeviceEvent))
        .into_iter()
        .filter_map(|slot| index.record(slot))
        .filter(|r| !r.reject && r.has_annotation(ANNOTATION_INCOMPLETE_TUPLE))
        .filter(|r| {
            matches!(&r.kind, RecordKind::DeviceEvent(e)
                if e.sub_type.as_deref() == Some("status") && e.status.as_deref() == Some("suspended"))
        })
        .map(|r| {
            let end = r.end_time().unwrap_or(now).max(r.time.saturating_add(1));
            (r.id.clone(), TimeRange::unchecked(r.time, end))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BgReading, DeviceEvent};
    use crate::types::MS_PER_HOUR;
    use serde_json::json;

    fn reading(id: &str, kind: fn(BgReading) -> RecordKind) -> Record {
        Record::new(
            id,
            0,
            kind(BgReading {
                value: 100.0,
                ..BgReading::default()
            }),
        )
    }

    #[test]
    fn test_bg_source_defaults_then_sticks() {
        let mut index = RecordIndex::new();
        index.upsert(reading("s1", RecordKind::Smbg));
        let mut cache = MetadataCache::default();
        cache.refresh(&index, 0);
        assert_eq!(cache.bg_sources.current.as_deref(), Some("smbg"));

        // cbg arriving later does not replace the chosen source
        index.upsert(reading("c1", RecordKind::Cbg));
        cache.refresh(&index, 0);
        assert!(cache.bg_sources.cbg);
        assert_eq!(cache.bg_sources.current.as_deref(), Some("smbg"));
    }

    fn suspend_event(id: &str, duration: Option<i64>) -> Record {
        let mut event = Record::new(
            id,
            MS_PER_HOUR,
            RecordKind::DeviceEvent(DeviceEvent {
                sub_type: Some("status".into()),
                status: Some("suspended".into()),
                duration,
                ..DeviceEvent::default()
            }),
        );
        event.add_annotation(ANNOTATION_INCOMPLETE_TUPLE);
        event
    }

    #[test]
    fn test_incomplete_suspends_collected() {
        let mut index = RecordIndex::new();
        index.upsert(suspend_event("closed", Some(MS_PER_HOUR)));
        index.upsert(suspend_event("open", None));

        let mut cache = MetadataCache::default();
        cache.refresh(&index, 5 * MS_PER_HOUR);
        assert_eq!(
            cache.incomplete_suspends,
            vec![
                ("closed".to_string(), TimeRange::new(MS_PER_HOUR, 2 * MS_PER_HOUR).unwrap()),
                ("open".to_string(), TimeRange::new(MS_PER_HOUR, 5 * MS_PER_HOUR).unwrap()),
            ]
        );
    }

    #[test]
    fn test_unannotated_or_resumed_events_ignored() {
        let mut index = RecordIndex::new();
        let mut plain = suspend_event("plain", None);
        plain.annotations.clear();
        index.upsert(plain);
        let mut resumed = suspend_event("resumed", None);
        if let RecordKind::DeviceEvent(e) = &mut resumed.kind {
            e.status = Some("resumed".into());
        }
        index.upsert(resumed);

        let mut cache = MetadataCache::default();
        cache.refresh(&index, 5 * MS_PER_HOUR);
        assert!(cache.incomplete_suspends.is_empty());
    }

    #[test]
    fn test_get_meta_data_subset() {
        let mut index = RecordIndex::new();
        index.upsert(reading("c1", RecordKind::Cbg));
        let mut cache = MetadataCache::default();
        cache.refresh(&index, 0);

        let fields = vec!["size".to_string(), "latestDatumByType".to_string(), "bogus".to_string()];
        let meta = cache.get_meta_data(&fields, &index, |r| json!({ "id": r.id }));
        assert_eq!(meta["size"], json!(1));
        assert_eq!(meta["latestDatumByType"]["cbg"]["id"], json!("c1"));
        assert!(meta.get("bogus").is_none());
        assert!(meta.get("devices").is_none());
    }

    #[test]
    fn test_get_meta_data_all_fields() {
        let index = RecordIndex::new();
        let mut cache = MetadataCache::default();
        cache.refresh(&index, 0);

        let fields: Vec<String> = META_DATA_FIELDS.iter().map(|f| f.to_string()).collect();
        let meta = cache.get_meta_data(&fields, &index, |r| json!({ "id": r.id }));
        for field in META_DATA_FIELDS {
            assert!(meta.get(field).is_some(), "{}", field);
        }
    }
}
