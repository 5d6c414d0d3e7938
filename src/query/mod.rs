//! Query options, per-window fetching and the response shape
//!
//! A query walks through fixed steps; each consumes one group of options:
//!
//! ```text
//! QueryOptions
//!   bgSource ─> bgPrefs ─> timePrefs ─> endpoints/nextDays/prevDays ─> activeDays ─> excludedDevices
//!                             │                  │
//!                             v                  v
//!                     active time field     WindowPlanner
//!                             └──────┬───────────┘
//!                                    v
//!              per window: QuerySession (range, days, devices)
//!                                    │
//!            ┌───────────────────────┼──────────────────────────┐
//!            v                       v                          v
//!      get_type_data          overlap fix-up (current)     fill bins, stats (current)
//! ```
//!
//! # Components
//!
//! - **Window**: current/next/prev ranges in local calendar days
//! - **Denormalize**: record to output JSON, sorting and projection
//! - **Fill**: background bins for charts
//! - **Overlap**: records that began before the window but still run
//!
//! # Example
//!
//! ```rust
//! use diabetes_data_engine::query::QueryOptions;
//! use serde_json::json;
//!
//! let opts = QueryOptions::from_json(&json!({
//!     "types": { "cbg": { "select": "id,normalTime,value" } },
//!     "endpoints": ["2018-02-01T00:00:00.000Z", "2018-02-02T00:00:00.000Z"],
//!     "stats": "averageGlucose,readingsInRange"
//! }))
//! .unwrap();
//! assert_eq!(opts.types.len(), 1);
//! assert_eq!(opts.stats.len(), 2);
//! ```

pub mod denormalize;
pub mod fill;
pub mod overlap;
pub mod window;

pub use denormalize::{
    denormalize, get_type_data, DenormalizeContext, Selection, SortSpec, TypeRequest,
};
pub use fill::{get_fill_data, FillBin, FillOptions};
pub use overlap::{basal_overlapping_start, pump_settings_override_overlapping_start};
pub use window::{Window, WindowPlan, WindowPlanner};

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::QueryError;
use crate::index::{QuerySession, SortOrder};
use crate::record::{Record, RecordType};
use crate::types::{ActiveDays, TimeRange};
use crate::units::{BgPrefs, BgPrefsInput};

// ============================================================================
// Options
// ============================================================================

/// Timezone handling requested by a query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimePrefs {
    /// Windows use absolute time in `timezone_name`; otherwise device time
    #[serde(default)]
    pub timezone_aware: bool,
    /// IANA zone name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone_name: Option<String>,
}

/// One entry of `types`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TypeQuery {
    /// Type name; filled from the key when `types` is an object
    #[serde(default, rename = "type")]
    pub record_type: Option<String>,
    /// Fields to keep
    #[serde(default, deserialize_with = "de_list")]
    pub select: Vec<String>,
    /// `field[,asc|desc]`
    #[serde(default, deserialize_with = "de_list")]
    pub sort: Vec<String>,
}

impl TypeQuery {
    /// Resolve into a typed request
    pub fn to_request(&self) -> Result<TypeRequest, QueryError> {
        let name = self
            .record_type
            .as_deref()
            .ok_or_else(|| QueryError::Malformed("type entry without a type".to_string()))?;
        let record_type = RecordType::parse(name);
        if let RecordType::Other(name) = record_type {
            return Err(QueryError::UnknownType(name));
        }
        Ok(TypeRequest {
            record_type,
            select: Selection::parse(&self.select),
            sort: SortSpec::parse(&self.sort)?,
        })
    }
}

/// Options accepted by a query
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    /// Glucose source for statistics (`cbg` or `smbg`)
    #[serde(default)]
    pub bg_source: Option<String>,
    /// Per-type data requests
    #[serde(default, deserialize_with = "de_types")]
    pub types: Vec<TypeQuery>,
    /// Display preferences
    #[serde(default)]
    pub bg_prefs: Option<BgPrefsInput>,
    /// Timezone handling
    #[serde(default)]
    pub time_prefs: Option<TimePrefs>,
    /// Current window
    #[serde(default)]
    pub endpoints: Option<TimeRange>,
    /// Days after the current window to fetch
    #[serde(default)]
    pub next_days: Option<i64>,
    /// Days before the current window to fetch
    #[serde(default)]
    pub prev_days: Option<i64>,
    /// Weekdays to include
    #[serde(default)]
    pub active_days: Option<ActiveDays>,
    /// Device ids to leave out
    #[serde(default)]
    pub excluded_devices: Vec<String>,
    /// Emit records in their ingested shape
    #[serde(default)]
    pub raw: bool,
    /// Statistics for the current window
    #[serde(default, deserialize_with = "de_list")]
    pub stats: Vec<String>,
    /// Per-date aggregations for the current window
    #[serde(default, deserialize_with = "de_list")]
    pub aggregations_by_date: Vec<String>,
    /// Fill bins for the current window
    #[serde(default)]
    pub fill_data: Option<FillOptions>,
    /// Metadata fields to include
    #[serde(default, deserialize_with = "de_opt_list")]
    pub meta_data: Option<Vec<String>>,
}

impl QueryOptions {
    /// Decode options from JSON
    pub fn from_json(value: &Value) -> Result<Self, QueryError> {
        Self::deserialize(value).map_err(|e| QueryError::Malformed(e.to_string()))
    }

    /// Decode options from a JSON string
    pub fn from_json_str(s: &str) -> Result<Self, QueryError> {
        serde_json::from_str(s).map_err(|e| QueryError::Malformed(e.to_string()))
    }

    /// Typed requests for every `types` entry
    pub fn type_requests(&self) -> Result<Vec<TypeRequest>, QueryError> {
        self.types.iter().map(TypeQuery::to_request).collect()
    }

    /// Endpoints checked again, since the fields are public
    pub fn checked_endpoints(&self) -> Result<Option<TimeRange>, QueryError> {
        self.endpoints
            .map(|r| TimeRange::new(r.start, r.end))
            .transpose()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn into_list(self) -> Vec<String> {
        match self {
            StringOrList::One(s) => s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            StringOrList::Many(list) => list,
        }
    }
}

fn de_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(de_opt_list(deserializer)?.unwrap_or_default())
}

fn de_opt_list<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Vec<String>>, D::Error> {
    Ok(Option::<StringOrList>::deserialize(deserializer)?.map(StringOrList::into_list))
}

/// `types` as `[{type, select, sort}]` or `{type: {select, sort}}`
fn de_types<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<TypeQuery>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TypesInput {
        List(Vec<TypeQuery>),
        Map(BTreeMap<String, TypeQuery>),
    }

    Ok(match Option::<TypesInput>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(TypesInput::List(list)) => list,
        Some(TypesInput::Map(map)) => map
            .into_iter()
            .map(|(name, mut query)| {
                query.record_type.get_or_insert(name);
                query
            })
            .collect(),
    })
}

// ============================================================================
// Response
// ============================================================================

/// Output of one window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowData {
    /// Records per type name
    pub data: BTreeMap<String, Vec<Value>>,
    /// Range and day counts; absent when the query had no endpoints
    pub endpoints: Option<Window>,
    /// Statistics by name (current window only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<Map<String, Value>>,
    /// Aggregations by name (current window only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregations_by_date: Option<Map<String, Value>>,
}

/// The three windows of a response
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowSet {
    /// Requested range
    pub current: WindowData,
    /// Range after it
    pub next: WindowData,
    /// Range before it
    pub prev: WindowData,
}

/// Full query result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    /// Per-window data
    pub data: WindowSet,
    /// Display preferences in effect
    pub bg_prefs: BgPrefs,
    /// Timezone handling in effect
    pub time_prefs: TimePrefs,
    /// Requested metadata fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta_data: Option<Value>,
}

// ============================================================================
// Per-window fetch
// ============================================================================

/// Fetch the requested types for one window
///
/// The session keeps its day and device filters; its range and type filters
/// are replaced. With `fix_boundaries`, a basal or settings override that
/// started before the window and still runs at its start is prepended to
/// its type's array.
pub fn fetch_window<'a>(
    session: &mut QuerySession<'a>,
    window: &Window,
    requests: &[TypeRequest],
    ctx: &DenormalizeContext<'_>,
    fix_boundaries: bool,
) -> BTreeMap<String, Vec<Value>> {
    session
        .by_endpoints(window.range)
        .clear_type_filter()
        .by_types(requests.iter().map(|r| r.record_type.clone()));
    let records = session.records(SortOrder::Asc);

    let mut data = BTreeMap::new();
    for request in requests {
        let mut rows = get_type_data(&records, request, ctx);
        if fix_boundaries {
            let overlapping = match request.record_type {
                RecordType::Basal => basal_overlapping_start(session, window.range.start),
                RecordType::DeviceEvent => {
                    pump_settings_override_overlapping_start(session, window.range.start)
                },
                _ => None,
            };
            if let Some(record) = overlapping.filter(|r| !records.iter().any(|s| s.id == r.id)) {
                let row = denormalize(record, ctx);
                rows.insert(0, denormalize::project(row, &request.select));
            }
        }
        data.insert(request.record_type.as_str().to_string(), rows);
    }
    data
}

/// Every record in the window regardless of the requested types, plus a
/// basal still running at its start
pub fn stats_slice<'a>(session: &QuerySession<'a>, window: &Window) -> Vec<&'a Record> {
    let mut scoped = session.clone();
    scoped.by_endpoints(window.range).clear_type_filter();
    let mut slice = scoped.records(SortOrder::Asc);
    if let Some(basal) = basal_overlapping_start(&scoped, window.range.start) {
        slice.insert(0, basal);
    }
    slice
}
