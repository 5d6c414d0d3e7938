//! Output denormalizer
//!
//! Turns stored records into the JSON shape charts consume. In the default
//! mode every record gains derived fields; in raw mode it is emitted in its
//! ingested shape.
//!
//! ```text
//! Record ──> common fields (id, type, time, deviceTime, uploadId, deviceId, annotations)
//!        ──> payload fields (bolus with dosing-decision values copied in)
//!        ──> nested links (wizard, bolus, dosingDecision, pumpSettings), recursively
//!        ──> normalTime / displayOffset / normalEnd / msPer24 / localDate
//!        ──> glucose values converted to the display unit
//! ```

use std::cmp::Ordering;

use serde_json::{json, Value};

use crate::error::QueryError;
use crate::index::{SortOrder, TimeField};
use crate::ingestion::join::with_dosing_fields;
use crate::record::{
    Fields, Link, Record, RecordKind, RecordType, ANNOTATION_INCOMPLETE_TUPLE,
    ANNOTATION_INTERSECTS_INCOMPLETE_SUSPEND,
};
use crate::timezone::LocalCalendar;
use crate::types::{format_instant, TimeRange, Timestamp};
use crate::units::{convert_bg, BgPrefs, BgUnits};

/// Key of the default sort field
pub const NORMAL_TIME: &str = "normalTime";

/// Name of the schedule listed first after reshaping
const STANDARD_SCHEDULE: &str = "standard";

// ============================================================================
// Requests
// ============================================================================

/// Field projection
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selection {
    /// Every field
    #[default]
    All,
    /// Only the listed top-level fields
    Fields(Vec<String>),
}

impl Selection {
    /// Parse a field list; empty or `*` selects everything
    pub fn parse(fields: &[String]) -> Self {
        let fields: Vec<String> = fields
            .iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
        if fields.is_empty() || fields.iter().any(|f| f == "*") {
            Selection::All
        } else {
            Selection::Fields(fields)
        }
    }
}

/// Sort key and direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    /// Output field to sort by
    pub field: String,
    /// Direction
    pub order: SortOrder,
}

impl Default for SortSpec {
    fn default() -> Self {
        Self {
            field: NORMAL_TIME.to_string(),
            order: SortOrder::Asc,
        }
    }
}

impl SortSpec {
    /// Parse `[field]` or `[field, asc|desc]`
    pub fn parse(parts: &[String]) -> Result<Self, QueryError> {
        let parts: Vec<&str> = parts.iter().map(|p| p.trim()).filter(|p| !p.is_empty()).collect();
        let order = match parts.get(1).map(|o| o.to_ascii_lowercase()) {
            None => SortOrder::Asc,
            Some(o) if o == "asc" => SortOrder::Asc,
            Some(o) if o == "desc" => SortOrder::Desc,
            Some(_) => return Err(QueryError::InvalidSort(parts.join(","))),
        };
        match parts.as_slice() {
            [] => Ok(Self::default()),
            [field] | [field, _] => Ok(Self {
                field: field.to_string(),
                order,
            }),
            _ => Err(QueryError::InvalidSort(parts.join(","))),
        }
    }
}

/// One per-type data request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRequest {
    /// Type to emit
    pub record_type: RecordType,
    /// Projection
    pub select: Selection,
    /// Ordering
    pub sort: SortSpec,
}

// ============================================================================
// Context
// ============================================================================

/// Everything the denormalizer needs besides the record
#[derive(Debug, Clone)]
pub struct DenormalizeContext<'a> {
    /// Calendar for offsets and local dates
    pub calendar: LocalCalendar,
    /// Field reported as `normalTime`
    pub field: TimeField,
    /// Display unit for glucose values
    pub bg_prefs: BgPrefs,
    /// Emit the ingested shape
    pub raw: bool,
    /// Latest known instant; ongoing records end here
    pub now: Timestamp,
    /// Spans of suspends whose resume was never recorded
    pub incomplete_suspends: &'a [TimeRange],
}

// ============================================================================
// Entry points
// ============================================================================

/// Denormalize, sort and project the records of one requested type
///
/// Rejected records are skipped.
pub fn get_type_data(
    records: &[&Record],
    request: &TypeRequest,
    ctx: &DenormalizeContext<'_>,
) -> Vec<Value> {
    let mut rows: Vec<(Timestamp, Value)> = records
        .iter()
        .filter(|r| r.record_type == request.record_type && !r.reject)
        .map(|r| (ctx.field.of(r), denormalize(r, ctx)))
        .collect();

    let key = request.sort.field.as_str();
    rows.sort_by(|(ta, a), (tb, b)| {
        let ordering = match (a.get(key), b.get(key)) {
            (None, None) if key == NORMAL_TIME => ta.cmp(tb),
            (x, y) => compare_values(x, y),
        };
        match request.sort.order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });

    rows.into_iter()
        .map(|(_, value)| project(value, &request.select))
        .collect()
}

/// Denormalize one record
pub fn denormalize(record: &Record, ctx: &DenormalizeContext<'_>) -> Value {
    if ctx.raw {
        return Value::Object(raw_fields(record));
    }

    let mut out = Fields::new();
    out.insert("id".into(), json!(record.id));
    out.insert("type".into(), json!(record.record_type.as_str()));
    out.insert("time".into(), json!(record.time));
    out.insert("deviceTime".into(), json!(record.device_time));
    insert_opt(&mut out, "uploadId", record.upload_id.as_deref());
    insert_opt(&mut out, "deviceId", record.device_id.as_deref());

    let mut annotations = record.annotations.clone();
    if intersects_incomplete_suspend(record, ctx) {
        annotations.push(json!({ "code": ANNOTATION_INTERSECTS_INCOMPLETE_SUSPEND }));
    }
    if !annotations.is_empty() {
        out.insert("annotations".into(), Value::Array(annotations));
    }

    let mut payload = payload_with_links(record, ctx);
    if record.record_type == RecordType::PumpSettings {
        reshape_basal_schedules(&mut payload);
    }
    if record.record_type == RecordType::Basal {
        if let Some(suppressed) = payload.get_mut("suppressed") {
            denormalize_suppressed(suppressed, ctx);
        }
    }
    for (key, value) in payload {
        out.entry(key).or_insert(value);
    }

    if !record.tags.is_empty() {
        if let Ok(tags) = serde_json::to_value(record.tags) {
            out.insert("tags".into(), tags);
        }
    }

    let normal_time = ctx.field.of(record);
    out.insert(NORMAL_TIME.into(), json!(normal_time));
    out.insert(
        "displayOffset".into(),
        json!(ctx.calendar.offset_minutes(normal_time)),
    );
    if let Some(end) = normal_end(record.time, normal_time, record.duration(), ctx.now) {
        out.insert("normalEnd".into(), json!(end));
    }
    if record.record_type.is_bg() {
        out.insert("msPer24".into(), json!(ctx.calendar.ms_per_24(normal_time)));
        out.insert(
            "localDate".into(),
            json!(ctx.calendar.local_date(normal_time).format("%Y-%m-%d").to_string()),
        );
    }

    let mut value = Value::Object(out);
    convert_glucose(&mut value, &record.record_type, ctx.bg_prefs.bg_units);
    value
}

// ============================================================================
// Payload and links
// ============================================================================

fn payload_with_links(record: &Record, ctx: &DenormalizeContext<'_>) -> Fields {
    match &record.kind {
        RecordKind::Bolus(bolus) => {
            let view = with_dosing_fields(bolus);
            let mut payload = to_fields(&*view);
            if let Some(link) = &bolus.wizard {
                payload.insert("wizard".into(), link_value(link, ctx));
            }
            if let Some(decision) = &bolus.dosing_decision {
                payload.insert("dosingDecision".into(), denormalize(decision, ctx));
            }
            payload
        },
        RecordKind::Wizard(wizard) => {
            let mut payload = record.payload_fields();
            if let Some(link) = &wizard.bolus {
                payload.insert("bolus".into(), link_value(link, ctx));
            }
            payload
        },
        RecordKind::DosingDecision(decision) => {
            let mut payload = record.payload_fields();
            if let Some(settings) = &decision.pump_settings {
                payload.insert("pumpSettings".into(), denormalize(settings, ctx));
            }
            payload
        },
        _ => record.payload_fields(),
    }
}

fn link_value(link: &Link, ctx: &DenormalizeContext<'_>) -> Value {
    match link {
        Link::Resolved(target) if !ctx.raw => denormalize(target, ctx),
        _ => json!(link.target_id()),
    }
}

fn to_fields<T: serde::Serialize>(payload: &T) -> Fields {
    match serde_json::to_value(payload) {
        Ok(Value::Object(map)) => map,
        _ => Fields::new(),
    }
}

fn insert_opt(out: &mut Fields, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        out.insert(key.into(), json!(value));
    }
}

/// Ingested shape: original time strings, links as ids, no derived fields
fn raw_fields(record: &Record) -> Fields {
    if let RecordKind::Unparsed(fields) = &record.kind {
        return fields.clone();
    }

    let mut out = Fields::new();
    out.insert("id".into(), json!(record.id));
    out.insert("type".into(), json!(record.record_type.as_str()));
    match &record.raw_time {
        Some(raw) => out.insert("time".into(), json!(raw)),
        None => out.insert("time".into(), json!(format_instant(record.time))),
    };
    if let Some(raw) = &record.raw_device_time {
        out.insert("deviceTime".into(), json!(raw));
    }
    insert_opt(&mut out, "uploadId", record.upload_id.as_deref());
    insert_opt(&mut out, "deviceId", record.device_id.as_deref());
    if !record.annotations.is_empty() {
        out.insert("annotations".into(), Value::Array(record.annotations.clone()));
    }

    let mut payload = record.payload_fields();
    match &record.kind {
        RecordKind::Bolus(b) => {
            if let Some(link) = &b.wizard {
                payload.insert("wizard".into(), json!(link.target_id()));
            }
        },
        RecordKind::Wizard(w) => {
            if let Some(link) = &w.bolus {
                payload.insert("bolus".into(), json!(link.target_id()));
            }
        },
        _ => {},
    }
    for (key, value) in payload {
        out.entry(key).or_insert(value);
    }
    out
}

// ============================================================================
// Derived fields
// ============================================================================

/// `normalTime + duration`, cut at `now` for records still running
fn normal_end(
    time: Timestamp,
    normal_time: Timestamp,
    duration: Option<i64>,
    now: Timestamp,
) -> Option<Timestamp> {
    let duration = duration?.max(0);
    let effective = if time.saturating_add(duration) > now && time <= now {
        now - time
    } else {
        duration
    };
    Some(normal_time.saturating_add(effective))
}

fn intersects_incomplete_suspend(record: &Record, ctx: &DenormalizeContext<'_>) -> bool {
    if record.record_type != RecordType::Basal || record.has_annotation(ANNOTATION_INCOMPLETE_TUPLE) {
        return false;
    }
    let Some(end) = record.end_time() else {
        return false;
    };
    ctx.incomplete_suspends
        .iter()
        .any(|suspend| suspend.overlaps(record.time, end.max(record.time.saturating_add(1))))
}

fn denormalize_suppressed(value: &mut Value, ctx: &DenormalizeContext<'_>) {
    let Value::Object(level) = value else {
        return;
    };
    let key = ctx.field.as_str();
    let start = level.get(key).and_then(Value::as_i64);
    let time = level.get("time").and_then(Value::as_i64);
    if let Some(start) = start {
        level.insert(NORMAL_TIME.into(), json!(start));
        let duration = level.get("duration").and_then(Value::as_i64);
        if let Some(end) = normal_end(time.unwrap_or(start), start, duration, ctx.now) {
            level.insert("normalEnd".into(), json!(end));
        }
    }
    if let Some(next) = level.get_mut("suppressed") {
        denormalize_suppressed(next, ctx);
    }
}

/// `{name: [...]}` schedules become `[{name, value}]`, `standard` first
fn reshape_basal_schedules(payload: &mut Fields) {
    let Some(Value::Object(schedules)) = payload.remove("basalSchedules") else {
        return;
    };
    let mut entries: Vec<(String, Value)> = schedules.into_iter().collect();
    entries.sort_by(|(a, _), (b, _)| {
        (a != STANDARD_SCHEDULE, a.as_str()).cmp(&(b != STANDARD_SCHEDULE, b.as_str()))
    });
    let reshaped = entries
        .into_iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();
    payload.insert("basalSchedules".into(), Value::Array(reshaped));
}

// ============================================================================
// Glucose units
// ============================================================================

/// Paths of glucose-bearing values, `*` matching every key of an object
fn glucose_paths(record_type: &RecordType) -> &'static [&'static [&'static str]] {
    match record_type {
        RecordType::Cbg | RecordType::Smbg | RecordType::DeviceEvent => &[&["value"]],
        RecordType::Bolus => &[&["bgInput"]],
        RecordType::Wizard => &[
            &["bgInput"],
            &["insulinSensitivity"],
            &["bgTarget", "target"],
            &["bgTarget", "range"],
            &["bgTarget", "low"],
            &["bgTarget", "high"],
        ],
        RecordType::DosingDecision => &[&["bgHistorical", "value"]],
        RecordType::PumpSettings => &[
            &["bgTarget", "target"],
            &["bgTarget", "range"],
            &["bgTarget", "low"],
            &["bgTarget", "high"],
            &["bgTargets", "*", "target"],
            &["bgTargets", "*", "range"],
            &["bgTargets", "*", "low"],
            &["bgTargets", "*", "high"],
            &["insulinSensitivity", "amount"],
            &["insulinSensitivities", "*", "amount"],
        ],
        _ => &[],
    }
}

/// Where the record's glucose unit lives
fn units_path(record_type: &RecordType) -> &'static [&'static str] {
    match record_type {
        RecordType::DosingDecision | RecordType::PumpSettings => &["units", "bg"],
        _ => &["units"],
    }
}

fn convert_glucose(value: &mut Value, record_type: &RecordType, to: BgUnits) {
    let paths = glucose_paths(record_type);
    if paths.is_empty() {
        return;
    }
    let units_at = units_path(record_type);
    let from = value
        .pointer(&format!("/{}", units_at.join("/")))
        .and_then(Value::as_str)
        .and_then(BgUnits::parse);
    let Some(from) = from else {
        return;
    };

    if from != to {
        for path in paths {
            convert_in(value, path, from, to);
        }
    }
    if let Some(slot) = value.pointer_mut(&format!("/{}", units_at.join("/"))) {
        *slot = json!(to.as_str());
    }
}

fn convert_in(value: &mut Value, path: &[&str], from: BgUnits, to: BgUnits) {
    match value {
        Value::Array(items) => {
            for item in items {
                convert_in(item, path, from, to);
            }
        },
        Value::Object(map) => {
            let Some((key, rest)) = path.split_first() else {
                return;
            };
            let children: Vec<&mut Value> = if *key == "*" {
                map.values_mut().collect()
            } else {
                map.get_mut(*key).into_iter().collect()
            };
            for child in children {
                if rest.is_empty() {
                    convert_leaf(child, from, to);
                } else {
                    convert_in(child, rest, from, to);
                }
            }
        },
        _ => {},
    }
}

fn convert_leaf(value: &mut Value, from: BgUnits, to: BgUnits) {
    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_f64() {
                *value = json!(convert_bg(v, from, to));
            }
        },
        Value::Array(items) => {
            for item in items {
                convert_leaf(item, from, to);
            }
        },
        _ => {},
    }
}

// ============================================================================
// Sorting and projection
// ============================================================================

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

pub(crate) fn project(value: Value, select: &Selection) -> Value {
    match (value, select) {
        (Value::Object(map), Selection::Fields(fields)) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| fields.iter().any(|f| f == key))
                .collect(),
        ),
        (value, _) => value,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Basal, BgReading, Bolus, DeliveryType, PumpSettings, Wizard};
    use crate::types::{parse_instant, MS_PER_HOUR};
    use crate::units::MGDL_PER_MMOLL;

    const NOW: i64 = 1_517_529_600_000; // 2018-02-02T00:00:00Z

    fn ctx<'a>(calendar: LocalCalendar, units: BgUnits, suspends: &'a [TimeRange]) -> DenormalizeContext<'a> {
        DenormalizeContext {
            calendar,
            field: TimeField::Time,
            bg_prefs: BgPrefs::for_units(units),
            raw: false,
            now: NOW,
            incomplete_suspends: suspends,
        }
    }

    fn cbg(id: &str, time: i64, mmol: f64) -> Record {
        Record::new(
            id,
            time,
            RecordKind::Cbg(BgReading {
                value: mmol,
                units: Some("mmol/L".into()),
                ..BgReading::default()
            }),
        )
    }

    #[test]
    fn test_cbg_derived_fields_and_conversion() {
        let time = parse_instant("2018-02-01T15:30:00Z").unwrap();
        let calendar = LocalCalendar::named("US/Eastern").unwrap();
        let out = denormalize(&cbg("c", time, 10.0), &ctx(calendar, BgUnits::MgDl, &[]));
        assert_eq!(out["normalTime"], json!(time));
        assert_eq!(out["displayOffset"], json!(-300));
        assert_eq!(out["msPer24"], json!((10 * 60 + 30) * 60 * 1000));
        assert_eq!(out["localDate"], json!("2018-02-01"));
        assert_eq!(out["units"], json!("mg/dL"));
        let value = out["value"].as_f64().unwrap();
        assert!((value - 10.0 * MGDL_PER_MMOLL).abs() < 1e-9);
    }

    #[test]
    fn test_raw_mode_restores_strings() {
        let mut record = cbg("c", 0, 5.0);
        record.raw_time = Some("2018-02-01T00:00:00.000Z".into());
        let mut context = ctx(LocalCalendar::utc(), BgUnits::MgDl, &[]);
        context.raw = true;
        let out = denormalize(&record, &context);
        assert_eq!(out["time"], json!("2018-02-01T00:00:00.000Z"));
        assert_eq!(out["value"], json!(5.0));
        assert!(out.get("normalTime").is_none());
    }

    #[test]
    fn test_normal_end_clamped_for_ongoing() {
        let time = NOW - MS_PER_HOUR;
        let record = Record::new(
            "b",
            time,
            RecordKind::Basal(Basal {
                rate: Some(1.0),
                duration: Some(5 * MS_PER_HOUR),
                ..Basal::default()
            }),
        );
        let out = denormalize(&record, &ctx(LocalCalendar::utc(), BgUnits::MgDl, &[]));
        assert_eq!(out["normalEnd"], json!(NOW));
    }

    #[test]
    fn test_suppressed_chain_denormalized() {
        let basal: Basal = serde_json::from_value(json!({
            "deliveryType": "temp",
            "rate": 0.5,
            "duration": 3_600_000,
            "suppressed": {
                "deliveryType": "scheduled",
                "rate": 1.0,
                "time": 1000,
                "duration": 3_600_000
            }
        }))
        .unwrap();
        let record = Record::new("t", 1000, RecordKind::Basal(basal));
        let out = denormalize(&record, &ctx(LocalCalendar::utc(), BgUnits::MgDl, &[]));
        assert_eq!(out["suppressed"]["normalTime"], json!(1000));
        assert_eq!(out["suppressed"]["normalEnd"], json!(1000 + 3_600_000));
    }

    #[test]
    fn test_intersects_incomplete_suspend_annotation() {
        let record = Record::new(
            "b",
            0,
            RecordKind::Basal(Basal {
                delivery_type: DeliveryType::Scheduled,
                rate: Some(1.0),
                duration: Some(MS_PER_HOUR),
                ..Basal::default()
            }),
        );
        let suspends = [TimeRange::new(MS_PER_HOUR / 2, 2 * MS_PER_HOUR).unwrap()];
        let out = denormalize(&record, &ctx(LocalCalendar::utc(), BgUnits::MgDl, &suspends));
        assert_eq!(
            out["annotations"][0]["code"],
            json!(ANNOTATION_INTERSECTS_INCOMPLETE_SUSPEND)
        );
    }

    #[test]
    fn test_pump_settings_schedules_reshaped() {
        let settings: PumpSettings = serde_json::from_value(json!({
            "basalSchedules": {
                "weekend": [{"start": 0, "rate": 0.8}],
                "standard": [{"start": 0, "rate": 1.0}],
                "active": [{"start": 0, "rate": 1.2}]
            },
            "bgTarget": [{"start": 0, "target": 5.5}],
            "units": {"bg": "mmol/L", "carb": "grams"}
        }))
        .unwrap();
        let record = Record::new("ps", 0, RecordKind::PumpSettings(settings));
        let out = denormalize(&record, &ctx(LocalCalendar::utc(), BgUnits::MgDl, &[]));
        let names: Vec<&str> = out["basalSchedules"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["standard", "active", "weekend"]);
        assert_eq!(out["units"]["bg"], json!("mg/dL"));
        let target = out["bgTarget"][0]["target"].as_f64().unwrap();
        assert!((target - 5.5 * MGDL_PER_MMOLL).abs() < 1e-9);
    }

    #[test]
    fn test_nested_links() {
        let wizard = Record::new("w", 0, RecordKind::Wizard(Wizard::default()));
        let bolus = Record::new(
            "b",
            0,
            RecordKind::Bolus(Bolus {
                normal: Some(1.0),
                wizard: Some(Link::Resolved(Box::new(wizard))),
                ..Bolus::default()
            }),
        );
        let context = ctx(LocalCalendar::utc(), BgUnits::MgDl, &[]);
        let out = denormalize(&bolus, &context);
        assert_eq!(out["wizard"]["id"], json!("w"));
        assert_eq!(out["wizard"]["normalTime"], json!(0));

        let mut raw = context.clone();
        raw.raw = true;
        assert_eq!(denormalize(&bolus, &raw)["wizard"], json!("w"));
    }

    #[test]
    fn test_get_type_data_sort_select_and_rejects() {
        let a = cbg("a", 10, 5.0);
        let b = cbg("b", 20, 6.0);
        let mut rejected = cbg("r", 30, 7.0);
        rejected.reject = true;
        let records = vec![&a, &b, &rejected];
        let request = TypeRequest {
            record_type: RecordType::Cbg,
            select: Selection::parse(&["id".to_string(), "value".to_string()]),
            sort: SortSpec::parse(&["normalTime".to_string(), "desc".to_string()]).unwrap(),
        };
        let data = get_type_data(&records, &request, &ctx(LocalCalendar::utc(), BgUnits::MmolL, &[]));
        assert_eq!(data.len(), 2);
        assert_eq!(data[0], json!({"id": "b", "value": 6.0}));
    }

    #[test]
    fn test_sort_spec_parse() {
        assert_eq!(SortSpec::parse(&[]).unwrap(), SortSpec::default());
        assert!(SortSpec::parse(&["value".into(), "sideways".into()]).is_err());
        assert_eq!(Selection::parse(&["*".into()]), Selection::All);
    }
}
