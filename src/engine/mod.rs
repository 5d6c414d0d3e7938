//! The data engine
//!
//! [`DataEngine`] owns the record index and the metadata cache, and runs
//! the ingest and query pipelines against them. Collaborators (validator,
//! statistics, clock) are plugged in through [`DataEngineBuilder`].
//!
//! ```text
//!                    ┌─────────────────────── DataEngine ───────────────────────┐
//!  add_data ───────> │ Normalizer ─> RecordIndex ─> relink ─> MetadataCache     │
//!  update_datum ───> │                    │                        ^            │
//!  remove_data ────> │                    v                        │            │
//!  query ──────────> │ WindowPlanner ─> QuerySession ─> denormalize / stats     │
//!                    └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use diabetes_data_engine::engine::DataEngineBuilder;
//! use diabetes_data_engine::query::QueryOptions;
//! use serde_json::json;
//!
//! let mut engine = DataEngineBuilder::new().build().unwrap();
//! engine
//!     .add_data(
//!         &[json!({
//!             "id": "c1", "type": "cbg", "units": "mg/dL", "value": 120,
//!             "time": "2018-02-01T12:00:00.000Z"
//!         })],
//!         "patient-1",
//!     )
//!     .unwrap();
//!
//! let opts = QueryOptions::from_json(&json!({
//!     "types": { "cbg": {} },
//!     "endpoints": ["2018-02-01T00:00:00.000Z", "2018-02-02T00:00:00.000Z"],
//!     "timePrefs": { "timezoneAware": true, "timezoneName": "UTC" }
//! }))
//! .unwrap();
//! let response = engine.query(&opts).unwrap();
//! assert_eq!(response.data.current.data["cbg"].len(), 1);
//! ```

pub mod builder;
pub mod traits;

pub use builder::DataEngineBuilder;
pub use traits::{Clock, FixedClock, SchemaValidator, StatsContext, StatsProvider, SystemClock};

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, QueryError, Result};
use crate::index::{RecordIndex, TimeField};
use crate::ingestion::{ingest_batch, relink, IngestReport, Normalizer};
use crate::metadata::MetadataCache;
use crate::query::{
    fetch_window, get_fill_data, stats_slice, DenormalizeContext, QueryOptions, QueryResponse,
    TimePrefs, WindowData, WindowPlanner, WindowSet,
};
use crate::record::Record;
use crate::timezone::LocalCalendar;
use crate::types::ActiveDays;
use crate::units::BgPrefs;

/// Engine shared between threads; one engine per subject
pub type SharedEngine = Arc<Mutex<DataEngine>>;

/// Glucose sources a query may select
const BG_SOURCES: [&str; 2] = ["cbg", "smbg"];

/// In-memory store and query engine for one subject's device data
pub struct DataEngine {
    pub(crate) config: EngineConfig,
    pub(crate) index: RecordIndex,
    pub(crate) validator: Option<Arc<dyn SchemaValidator>>,
    pub(crate) stats: Arc<dyn StatsProvider>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) metadata: MetadataCache,
    pub(crate) time_prefs: TimePrefs,
    /// Windows of the last query; reused when endpoints are omitted
    pub(crate) planner: WindowPlanner,
    pub(crate) subject: Option<String>,
}

impl std::fmt::Debug for DataEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataEngine")
            .field("subject", &self.subject)
            .field("size", &self.index.len())
            .field("stats", &self.stats.provider_id())
            .field(
                "validator",
                &self.validator.as_ref().map(|v| v.validator_id().to_string()),
            )
            .finish()
    }
}

impl DataEngine {
    /// Get engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Read-only view of the index
    pub fn index(&self) -> &RecordIndex {
        &self.index
    }

    /// Cached metadata
    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    /// Subject whose data is loaded
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Records stored
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Wrap for sharing across threads
    pub fn into_shared(self) -> SharedEngine {
        Arc::new(Mutex::new(self))
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Ingest a batch for a subject
    ///
    /// A subject different from the loaded one clears the store first.
    /// Records failing validation are kept and flagged; records without a
    /// string id are dropped and counted.
    pub fn add_data(&mut self, raw: &[Value], subject: &str) -> Result<IngestReport> {
        if self.subject.as_deref().is_some_and(|s| s != subject) {
            info!(from = ?self.subject, to = subject, "Subject changed, clearing store");
            self.clear();
        }
        self.subject = Some(subject.to_string());

        let normalizer = Normalizer::new(
            self.validator.as_deref(),
            &self.config.ingest,
            self.clock.now_ms(),
        );
        let report = ingest_batch(&mut self.index, raw, &normalizer, &self.config.ingest);
        self.metadata.refresh(&self.index, self.clock.now_ms());
        Ok(report)
    }

    /// Replace one stored record
    ///
    /// An update that is rejected by validation or by a join check is
    /// discarded and the previous version stays in place.
    pub fn update_datum(&mut self, raw: &Value) -> Result<()> {
        let normalizer = Normalizer::new(
            self.validator.as_deref(),
            &self.config.ingest,
            self.clock.now_ms(),
        );
        let record = normalizer.normalize(raw)?;
        if record.reject {
            warn!(id = %record.id, reasons = ?record.reject_reason, "Discarding rejected update");
            return Err(Error::UpdateDiscarded {
                id: record.id,
                reasons: record.reject_reason,
            });
        }

        let id = record.id.clone();
        let previous = self.index.get(&id).cloned();
        self.index.upsert(record);
        relink(&mut self.index, &self.config.ingest);

        let rejected = self
            .index
            .get(&id)
            .filter(|r| r.reject)
            .map(|r| r.reject_reason.clone());
        if let Some(reasons) = rejected {
            match previous {
                Some(previous) => {
                    self.index.upsert(previous);
                },
                None => {
                    self.index.remove(&id);
                },
            }
            relink(&mut self.index, &self.config.ingest);
            self.metadata.refresh(&self.index, self.clock.now_ms());
            warn!(id = %id, ?reasons, "Discarding update that failed a join check");
            return Err(Error::UpdateDiscarded { id, reasons });
        }

        self.metadata.refresh(&self.index, self.clock.now_ms());
        debug!(id = %id, "Record updated");
        Ok(())
    }

    /// Remove records by id; returns how many existed
    pub fn remove_data<I, S>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let removed = ids
            .into_iter()
            .filter(|id| self.index.remove(id.as_ref()).is_some())
            .count();
        if removed > 0 {
            relink(&mut self.index, &self.config.ingest);
            self.metadata.refresh(&self.index, self.clock.now_ms());
        }
        info!(removed, total = self.index.len(), "Removed records");
        removed
    }

    /// Drop every record; display preferences are kept
    pub fn clear(&mut self) {
        self.index.clear();
        self.metadata.clear();
        debug!("Store cleared");
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Run a query
    ///
    /// Options are checked before any state changes, so a failed query
    /// leaves the last applied preferences in place. Omitted endpoints keep
    /// the previous windows; omitted `nextDays` / `prevDays` keep their
    /// previous lengths too.
    pub fn query(&mut self, opts: &QueryOptions) -> Result<QueryResponse> {
        // validate everything up front
        if let Some(source) = &opts.bg_source {
            if !BG_SOURCES.contains(&source.as_str()) {
                return Err(QueryError::InvalidBgSource(source.clone()).into());
            }
        }
        let requests = opts.type_requests()?;
        let time_prefs = opts.time_prefs.clone().unwrap_or_else(|| self.time_prefs.clone());
        let (calendar, field) = self.calendar_for(&time_prefs)?;
        let endpoints = opts.checked_endpoints()?;

        // then apply, in order
        if let Some(source) = &opts.bg_source {
            self.metadata.bg_sources.current = Some(source.clone());
        }
        if let Some(prefs) = &opts.bg_prefs {
            self.metadata.bg_prefs = prefs.resolve();
        }
        self.time_prefs = time_prefs;

        let mut planner = WindowPlanner::new(calendar);
        match (endpoints, self.planner.plan()) {
            (Some(range), _) => {
                planner.set_endpoints(range, opts.next_days, opts.prev_days);
            },
            (None, Some(previous)) => {
                let next = opts.next_days.or(previous.next.map(|w| w.days as i64));
                let prev = opts.prev_days.or(previous.prev.map(|w| w.days as i64));
                planner.set_endpoints(previous.current.range, next, prev);
            },
            (None, None) => {},
        }
        planner.set_active_days(opts.active_days.unwrap_or_else(ActiveDays::all));
        self.planner = planner.clone();
        self.metadata.matched_devices.clear();

        let incomplete_suspends = self.metadata.incomplete_suspend_ranges();
        let ctx = DenormalizeContext {
            calendar,
            field,
            bg_prefs: self.metadata.bg_prefs,
            raw: opts.raw,
            now: self.clock.now_ms(),
            incomplete_suspends: &incomplete_suspends,
        };

        let mut windows = WindowSet::default();
        if let Some(plan) = planner.plan().copied() {
            let mut session = self.index.session(field, calendar);
            session
                .by_active_days(planner.active_days())
                .by_device_ids(opts.excluded_devices.iter().cloned());

            let mut current = WindowData {
                data: fetch_window(&mut session, &plan.current, &requests, &ctx, true),
                endpoints: Some(plan.current),
                ..WindowData::default()
            };
            if let Some(fill) = opts.fill_data {
                let bins = get_fill_data(
                    plan.current.range,
                    &calendar,
                    self.config.query.fill_bin_hours,
                    fill,
                );
                current.data.insert(
                    "fill".to_string(),
                    bins.iter().map(serde_json::to_value).collect::<std::result::Result<_, _>>()?,
                );
            }

            if !opts.stats.is_empty() || !opts.aggregations_by_date.is_empty() {
                let slice = stats_slice(&session, &plan.current);
                let bg_source = self.metadata.bg_sources.current.clone();
                let mut stats_ctx = StatsContext {
                    endpoints: plan.current.range,
                    time_field: field,
                    calendar,
                    bg_prefs: self.metadata.bg_prefs,
                    active_days: planner.active_days(),
                    active_day_count: plan.current.active_days,
                    bg_source: bg_source.as_deref(),
                    matched_devices: &mut self.metadata.matched_devices,
                };

                let mut stats = Map::new();
                for name in &opts.stats {
                    match self.stats.compute_stat(name, &slice, &mut stats_ctx) {
                        Some(value) => {
                            stats.insert(name.clone(), value);
                        },
                        None => warn!(stat = %name, "Unknown statistic"),
                    }
                }
                let mut aggregations = Map::new();
                for name in &opts.aggregations_by_date {
                    match self.stats.compute_aggregation(name, &slice, &mut stats_ctx) {
                        Some(value) => {
                            aggregations.insert(name.clone(), value);
                        },
                        None => warn!(aggregation = %name, "Unknown aggregation"),
                    }
                }
                current.stats = (!opts.stats.is_empty()).then_some(stats);
                current.aggregations_by_date =
                    (!opts.aggregations_by_date.is_empty()).then_some(aggregations);
            }
            windows.current = current;

            for (slot, window) in [(&mut windows.next, plan.next), (&mut windows.prev, plan.prev)] {
                if let Some(window) = window {
                    *slot = WindowData {
                        data: fetch_window(&mut session, &window, &requests, &ctx, false),
                        endpoints: Some(window),
                        ..WindowData::default()
                    };
                }
            }
        }

        let meta_data = opts.meta_data.as_ref().map(|fields| self.get_meta_data(fields));
        info!(
            types = requests.len(),
            field = field.as_str(),
            zone = calendar.name(),
            current = windows.current.data.values().map(Vec::len).sum::<usize>(),
            "Query complete"
        );

        Ok(QueryResponse {
            data: windows,
            bg_prefs: self.metadata.bg_prefs,
            time_prefs: self.time_prefs.clone(),
            meta_data,
        })
    }

    /// Requested metadata fields as a JSON object
    ///
    /// Records inside the metadata are denormalized with the last applied
    /// preferences.
    pub fn get_meta_data(&self, fields: &[String]) -> Value {
        let (calendar, field) = self
            .calendar_for(&self.time_prefs)
            .unwrap_or((LocalCalendar::utc(), TimeField::DeviceTime));
        let incomplete_suspends = self.metadata.incomplete_suspend_ranges();
        let ctx = DenormalizeContext {
            calendar,
            field,
            bg_prefs: self.metadata.bg_prefs,
            raw: false,
            now: self.clock.now_ms(),
            incomplete_suspends: &incomplete_suspends,
        };
        self.metadata
            .get_meta_data(fields, &self.index, |r: &Record| crate::query::denormalize(r, &ctx))
    }

    /// Display preferences last applied
    pub fn bg_prefs(&self) -> BgPrefs {
        self.metadata.bg_prefs
    }

    /// Calendar and time field for a set of time preferences
    ///
    /// Timezone-aware queries window by absolute time in the named zone
    /// (or the configured default); naive queries window by device time
    /// read as UTC.
    fn calendar_for(
        &self,
        prefs: &TimePrefs,
    ) -> std::result::Result<(LocalCalendar, TimeField), QueryError> {
        if prefs.timezone_aware {
            let name = prefs
                .timezone_name
                .as_deref()
                .unwrap_or(&self.config.query.default_timezone);
            Ok((LocalCalendar::named(name)?, TimeField::Time))
        } else {
            Ok((LocalCalendar::utc(), TimeField::DeviceTime))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Window;
    use crate::types::{parse_instant, MS_PER_HOUR};
    use serde_json::json;

    fn engine() -> DataEngine {
        DataEngineBuilder::new()
            .with_clock(FixedClock(parse_instant("2018-02-03T00:00:00Z").unwrap()))
            .build()
            .unwrap()
    }

    fn day_query(extra: Value) -> QueryOptions {
        let mut opts = json!({
            "endpoints": ["2018-02-01T00:00:00.000Z", "2018-02-02T00:00:00.000Z"],
            "timePrefs": { "timezoneAware": true, "timezoneName": "UTC" }
        });
        if let (Value::Object(base), Value::Object(extra)) = (&mut opts, extra) {
            base.extend(extra);
        }
        QueryOptions::from_json(&opts).unwrap()
    }

    fn basal(id: &str, time: &str, rate: f64) -> Value {
        json!({
            "id": id, "type": "basal", "deliveryType": "scheduled", "rate": rate,
            "duration": MS_PER_HOUR, "time": time, "deviceId": "pump-1"
        })
    }

    #[test]
    fn test_subject_change_clears_store() {
        let mut engine = engine();
        engine
            .add_data(&[basal("a", "2018-02-01T00:00:00Z", 1.0)], "one")
            .unwrap();
        engine
            .add_data(&[basal("b", "2018-02-01T00:00:00Z", 1.0)], "two")
            .unwrap();
        assert_eq!(engine.len(), 1);
        assert!(engine.index().get("a").is_none());
        assert_eq!(engine.subject(), Some("two"));
    }

    #[test]
    fn test_total_basal_for_day() {
        let mut engine = engine();
        engine
            .add_data(
                &[
                    basal("a", "2018-02-01T00:00:00Z", 0.25),
                    basal("b", "2018-02-01T01:00:00Z", 0.75),
                    basal("c", "2018-02-01T02:00:00Z", 0.5),
                ],
                "s",
            )
            .unwrap();
        let response = engine
            .query(&day_query(json!({ "stats": "totalInsulin" })))
            .unwrap();
        let stats = response.data.current.stats.unwrap();
        assert_eq!(stats["totalInsulin"]["basal"], json!(1.5));
        assert!(engine.metadata().matched_devices.contains("pump-1"));
    }

    #[test]
    fn test_update_rejected_keeps_previous() {
        let mut engine = engine();
        engine
            .add_data(
                &[json!({
                    "id": "s1", "type": "smbg", "units": "mg/dL", "value": 100,
                    "time": "2018-02-01T00:00:00Z"
                })],
                "s",
            )
            .unwrap();
        let err = engine
            .update_datum(&json!({ "id": "s1", "type": "smbg", "time": "2018-02-01T00:00:00Z" }))
            .unwrap_err();
        assert!(matches!(err, Error::UpdateDiscarded { ref id, .. } if id == "s1"));
        let stored = engine.index().get("s1").unwrap();
        assert_eq!(stored.as_bg_reading().unwrap().value, 100.0);
        assert!(!stored.reject);
    }

    #[test]
    fn test_remove_data_updates_metadata() {
        let mut engine = engine();
        engine
            .add_data(&[basal("a", "2018-02-01T00:00:00Z", 1.0)], "s")
            .unwrap();
        assert_eq!(engine.remove_data(["a", "missing"]), 1);
        assert_eq!(engine.metadata().size, 0);
    }

    #[test]
    fn test_invalid_query_leaves_prefs() {
        let mut engine = engine();
        let bad = QueryOptions::from_json(&json!({
            "bgPrefs": { "bgUnits": "mmol/L" },
            "timePrefs": { "timezoneAware": true, "timezoneName": "Mars/Olympus" }
        }))
        .unwrap();
        let err = engine.query(&bad).unwrap_err();
        assert!(matches!(err, Error::Query(QueryError::UnknownTimezone(_))));
        assert_eq!(engine.bg_prefs(), BgPrefs::default());

        let bad_source = QueryOptions {
            bg_source: Some("meter".to_string()),
            ..QueryOptions::default()
        };
        assert!(matches!(
            engine.query(&bad_source),
            Err(Error::Query(QueryError::InvalidBgSource(_)))
        ));
    }

    #[test]
    fn test_query_without_endpoints_is_empty() {
        let mut engine = engine();
        engine
            .add_data(&[basal("a", "2018-02-01T00:00:00Z", 1.0)], "s")
            .unwrap();
        let opts = QueryOptions::from_json(&json!({ "types": { "basal": {} } })).unwrap();
        let response = engine.query(&opts).unwrap();
        assert!(response.data.current.data.is_empty());
        assert!(response.data.current.endpoints.is_none());
    }

    #[test]
    fn test_follow_up_query_reuses_windows() {
        let mut engine = engine();
        engine
            .add_data(
                &[json!({
                    "id": "c1", "type": "cbg", "units": "mg/dL", "value": 120,
                    "time": "2018-02-01T12:00:00Z"
                })],
                "s",
            )
            .unwrap();
        let first = engine
            .query(&day_query(json!({ "types": { "cbg": {} }, "nextDays": 1 })))
            .unwrap();
        assert_eq!(first.data.current.data["cbg"].len(), 1);

        // 2018-02-01 is a Thursday
        let follow_up = QueryOptions::from_json(&json!({
            "types": { "cbg": {} },
            "activeDays": ["thursday"]
        }))
        .unwrap();
        let response = engine.query(&follow_up).unwrap();
        let current = response.data.current;
        assert_eq!(current.endpoints, first.data.current.endpoints.map(|w| Window {
            active_days: 1,
            ..w
        }));
        assert_eq!(current.data["cbg"].len(), 1);
        assert!(response.data.next.endpoints.is_some());

        let friday_only = QueryOptions::from_json(&json!({
            "types": { "cbg": {} },
            "activeDays": ["friday"]
        }))
        .unwrap();
        let response = engine.query(&friday_only).unwrap();
        assert_eq!(response.data.current.endpoints.unwrap().active_days, 0);
        assert!(response.data.current.data["cbg"].is_empty());
    }

    #[test]
    fn test_overlapping_basal_prepended() {
        let mut engine = engine();
        engine
            .add_data(&[basal("late", "2018-01-31T23:30:00Z", 1.0)], "s")
            .unwrap();
        let response = engine
            .query(&day_query(json!({ "types": { "basal": {} } })))
            .unwrap();
        let basals = &response.data.current.data["basal"];
        assert_eq!(basals.len(), 1);
        assert_eq!(basals[0]["id"], json!("late"));
    }

    #[test]
    fn test_shared_engine() {
        let shared = engine().into_shared();
        let clone = Arc::clone(&shared);
        std::thread::spawn(move || {
            clone
                .lock()
                .add_data(&[basal("a", "2018-02-01T00:00:00Z", 1.0)], "s")
                .unwrap();
        })
        .join()
        .unwrap();
        assert_eq!(shared.lock().len(), 1);
    }
}
