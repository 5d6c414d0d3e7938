//! Built-in statistics over the current window
//!
//! [`BasicStats`] is the default [`StatsProvider`]. It works on the filtered
//! slice of the current window (plus a basal that began before the window
//! and still runs at its start) and reports every device it consulted
//! through [`StatsContext::record_device`].
//!
//! # Statistics
//!
//! | name              | shape                                                   |
//! |-------------------|---------------------------------------------------------|
//! | `totalInsulin`    | `{basal, bolus, total, activeDays}` in units            |
//! | `averageGlucose`  | `{averageGlucose, total, units}`                        |
//! | `readingsInRange` | `{veryLow, low, target, high, veryHigh, total}`         |
//! | `carbs`           | `{grams, exchanges}`                                    |
//!
//! # Aggregations
//!
//! `basals`, `boluses`, `fingersticks` and `siteChanges` count tags per local
//! date: `{byDate: {"2018-02-01": {...}}, summary: {...}}`.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::engine::traits::{StatsContext, StatsProvider};
use crate::ingestion::with_dosing_fields;
use crate::record::{Record, RecordKind, RecordType, Tags};
use crate::types::MS_PER_HOUR;
use crate::units::{convert_bg, BgClass, BgUnits};

/// Stat names understood by [`BasicStats`]
pub const STAT_NAMES: [&str; 4] = ["totalInsulin", "averageGlucose", "readingsInRange", "carbs"];

/// Aggregation names understood by [`BasicStats`]
pub const AGGREGATION_NAMES: [&str; 4] = ["basals", "boluses", "fingersticks", "siteChanges"];

type TagCounter = (&'static str, fn(&Tags) -> bool);

const BASAL_COUNTERS: &[TagCounter] = &[("temp", |t| t.temp), ("suspend", |t| t.suspend)];

const BOLUS_COUNTERS: &[TagCounter] = &[
    ("manual", |t| t.manual),
    ("automated", |t| t.automated),
    ("wizard", |t| t.wizard),
    ("correction", |t| t.correction),
    ("extended", |t| t.extended),
    ("interrupted", |t| t.interrupted),
    ("override", |t| t.override_),
    ("underride", |t| t.underride),
];

const FINGERSTICK_COUNTERS: &[TagCounter] = &[
    ("meter", |t| t.meter),
    ("manual", |t| t.manual),
    ("calibration", |t| t.calibration),
];

const SITE_CHANGE_COUNTERS: &[TagCounter] = &[
    ("reservoirChange", |t| t.reservoir_change),
    ("cannulaPrime", |t| t.cannula_prime),
    ("tubingPrime", |t| t.tubing_prime),
];

// ============================================================================
// Provider
// ============================================================================

/// Default statistics provider
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicStats;

impl StatsProvider for BasicStats {
    fn provider_id(&self) -> &str {
        "basic"
    }

    fn compute_stat(
        &self,
        name: &str,
        slice: &[&Record],
        ctx: &mut StatsContext<'_>,
    ) -> Option<Value> {
        match name {
            "totalInsulin" => Some(total_insulin(slice, ctx)),
            "averageGlucose" => Some(average_glucose(slice, ctx)),
            "readingsInRange" => Some(readings_in_range(slice, ctx)),
            "carbs" => Some(carbs(slice, ctx)),
            _ => None,
        }
    }

    fn compute_aggregation(
        &self,
        name: &str,
        slice: &[&Record],
        ctx: &mut StatsContext<'_>,
    ) -> Option<Value> {
        match name {
            "basals" => Some(count_by_date(slice, ctx, |r| {
                (r.record_type == RecordType::Basal).then_some(BASAL_COUNTERS)
            })),
            "boluses" => Some(count_by_date(slice, ctx, |r| {
                (r.record_type == RecordType::Bolus).then_some(BOLUS_COUNTERS)
            })),
            "fingersticks" => Some(count_by_date(slice, ctx, |r| {
                let fingerstick = r.record_type == RecordType::Smbg
                    || (r.record_type == RecordType::DeviceEvent && r.tags.calibration);
                fingerstick.then_some(FINGERSTICK_COUNTERS)
            })),
            "siteChanges" => Some(count_by_date(slice, ctx, |r| {
                (r.record_type == RecordType::DeviceEvent && r.tags.is_site_change())
                    .then_some(SITE_CHANGE_COUNTERS)
            })),
            _ => None,
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Basal delivered inside the window plus bolus delivered
///
/// A basal is clipped to the window so a segment running across midnight
/// only contributes the part that falls inside the day.
fn total_insulin(slice: &[&Record], ctx: &mut StatsContext<'_>) -> Value {
    let mut basal = 0.0;
    let mut bolus = 0.0;

    for record in slice {
        match &record.kind {
            RecordKind::Basal(b) => {
                let start = ctx.time_field.of(record);
                let end = start.saturating_add(b.duration.unwrap_or(0));
                let overlap = end.min(ctx.endpoints.end) - start.max(ctx.endpoints.start);
                if overlap <= 0 {
                    continue;
                }
                basal += b.rate.unwrap_or(0.0) * overlap as f64 / MS_PER_HOUR as f64;
                ctx.record_device(record);
            },
            RecordKind::Bolus(b) => {
                bolus += b.delivered();
                ctx.record_device(record);
            },
            _ => {},
        }
    }

    json!({
        "basal": round_to(basal, 3),
        "bolus": round_to(bolus, 3),
        "total": round_to(basal + bolus, 3),
        "activeDays": ctx.active_day_count,
    })
}

/// Readings of the selected source, converted to the display unit
fn glucose_values(slice: &[&Record], ctx: &mut StatsContext<'_>) -> Vec<f64> {
    let source = match ctx.bg_source {
        Some(source) => RecordType::parse(source),
        None => return Vec::new(),
    };
    let target_units = ctx.bg_prefs.bg_units;
    let mut values = Vec::new();
    for record in slice.iter().filter(|r| r.record_type == source) {
        let Some(reading) = record.as_bg_reading() else {
            continue;
        };
        let from = reading
            .units
            .as_deref()
            .and_then(BgUnits::parse)
            .unwrap_or(target_units);
        values.push(convert_bg(reading.value, from, target_units));
        ctx.record_device(record);
    }
    values
}

fn average_glucose(slice: &[&Record], ctx: &mut StatsContext<'_>) -> Value {
    let values = glucose_values(slice, ctx);
    let average = if values.is_empty() {
        Value::Null
    } else {
        json!(values.iter().sum::<f64>() / values.len() as f64)
    };
    json!({
        "averageGlucose": average,
        "total": values.len(),
        "units": ctx.bg_prefs.bg_units.as_str(),
    })
}

fn readings_in_range(slice: &[&Record], ctx: &mut StatsContext<'_>) -> Value {
    let values = glucose_values(slice, ctx);
    let bounds = ctx.bg_prefs.bg_bounds;
    let mut counts = [0usize; 5];
    for value in &values {
        let bucket = match bounds.classify(*value) {
            BgClass::VeryLow => 0,
            BgClass::Low => 1,
            BgClass::Target => 2,
            BgClass::High => 3,
            BgClass::VeryHigh => 4,
        };
        counts[bucket] += 1;
    }
    json!({
        "veryLow": counts[0],
        "low": counts[1],
        "target": counts[2],
        "high": counts[3],
        "veryHigh": counts[4],
        "total": values.len(),
    })
}

/// Carbohydrates entered in bolus calculators, dosing decisions and food logs
fn carbs(slice: &[&Record], ctx: &mut StatsContext<'_>) -> Value {
    let mut grams = 0.0;
    let mut exchanges = 0.0;

    for record in slice {
        match &record.kind {
            RecordKind::Wizard(w) => {
                let Some(input) = w.carb_input else { continue };
                if w.carb_units.as_deref() == Some("exchanges") {
                    exchanges += input;
                } else {
                    grams += input;
                }
                ctx.record_device(record);
            },
            // wizard-linked boluses are already counted through the wizard
            RecordKind::Bolus(b) if b.wizard.is_none() && b.dosing_decision.is_some() => {
                if let Some(input) = with_dosing_fields(b).carb_input {
                    grams += input;
                    ctx.record_device(record);
                }
            },
            RecordKind::Food(f) => {
                let net = f
                    .nutrition
                    .as_ref()
                    .and_then(|n| n.pointer("/carbohydrate/net"))
                    .and_then(Value::as_f64);
                if let Some(net) = net {
                    grams += net;
                    ctx.record_device(record);
                }
            },
            _ => {},
        }
    }

    json!({ "grams": round_to(grams, 1), "exchanges": round_to(exchanges, 1) })
}

// ============================================================================
// Aggregations
// ============================================================================

/// Count tag hits per local date for the records `select` accepts
fn count_by_date<F>(slice: &[&Record], ctx: &mut StatsContext<'_>, select: F) -> Value
where
    F: Fn(&Record) -> Option<&'static [TagCounter]>,
{
    let mut by_date: BTreeMap<String, BTreeMap<&'static str, u64>> = BTreeMap::new();
    let mut summary: BTreeMap<&'static str, u64> = BTreeMap::new();

    for record in slice {
        let Some(counters) = select(record) else {
            continue;
        };
        let ts = ctx.time_field.of(record);
        if !ctx.endpoints.contains(ts) {
            continue;
        }
        let date = ctx.calendar.local_date(ts).format("%Y-%m-%d").to_string();
        let day = by_date.entry(date).or_default();
        *day.entry("total").or_default() += 1;
        *summary.entry("total").or_default() += 1;
        for &(name, hit) in counters {
            if hit(&record.tags) {
                *day.entry(name).or_default() += 1;
                *summary.entry(name).or_default() += 1;
            }
        }
        ctx.record_device(record);
    }

    json!({ "byDate": by_date, "summary": summary })
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::TimeField;
    use crate::record::{Basal, BgReading, Bolus, BolusSubType};
    use crate::timezone::LocalCalendar;
    use crate::types::{ActiveDays, TimeRange, MS_PER_DAY};
    use crate::units::BgPrefs;
    use std::collections::BTreeSet;

    fn basal(id: &str, hour: i64, rate: f64) -> Record {
        let mut record = Record::new(
            id,
            hour * MS_PER_HOUR,
            RecordKind::Basal(Basal {
                rate: Some(rate),
                duration: Some(MS_PER_HOUR),
                ..Basal::default()
            }),
        );
        record.device_id = Some("pump".into());
        record
    }

    fn cbg(id: &str, value: f64) -> Record {
        Record::new(
            id,
            MS_PER_HOUR,
            RecordKind::Cbg(BgReading {
                value,
                units: Some("mg/dL".into()),
                ..BgReading::default()
            }),
        )
    }

    fn with_context<R>(f: impl FnOnce(&mut StatsContext<'_>) -> R) -> (R, BTreeSet<String>) {
        let mut matched = BTreeSet::new();
        let result = {
            let mut ctx = StatsContext {
                endpoints: TimeRange::new(0, MS_PER_DAY).unwrap(),
                time_field: TimeField::Time,
                calendar: LocalCalendar::utc(),
                bg_prefs: BgPrefs::default(),
                active_days: ActiveDays::all(),
                active_day_count: 1,
                bg_source: Some("cbg"),
                matched_devices: &mut matched,
            };
            f(&mut ctx)
        };
        (result, matched)
    }

    #[test]
    fn test_total_basal_for_three_segments() {
        let records = [basal("a", 0, 0.25), basal("b", 1, 0.75), basal("c", 2, 0.5)];
        let slice: Vec<&Record> = records.iter().collect();
        let (value, matched) =
            with_context(|ctx| BasicStats.compute_stat("totalInsulin", &slice, ctx).unwrap());
        assert_eq!(value["basal"], json!(1.5));
        assert_eq!(value["bolus"], json!(0.0));
        assert!(matched.contains("pump"));
    }

    #[test]
    fn test_basal_clipped_to_window() {
        // starts 30 minutes before the window
        let mut spanning = basal("a", 0, 2.0);
        spanning.time = -MS_PER_HOUR / 2;
        let slice = vec![&spanning];
        let (value, _) =
            with_context(|ctx| BasicStats.compute_stat("totalInsulin", &slice, ctx).unwrap());
        assert_eq!(value["basal"], json!(1.0));
    }

    #[test]
    fn test_bolus_delivered_counted() {
        let bolus = Record::new(
            "b",
            0,
            RecordKind::Bolus(Bolus {
                sub_type: BolusSubType::Normal,
                normal: Some(2.5),
                ..Bolus::default()
            }),
        );
        let slice = vec![&bolus];
        let (value, _) =
            with_context(|ctx| BasicStats.compute_stat("totalInsulin", &slice, ctx).unwrap());
        assert_eq!(value["bolus"], json!(2.5));
        assert_eq!(value["total"], json!(2.5));
    }

    #[test]
    fn test_glucose_statistics() {
        let records = [cbg("a", 50.0), cbg("b", 100.0), cbg("c", 300.0)];
        let slice: Vec<&Record> = records.iter().collect();
        let (avg, _) =
            with_context(|ctx| BasicStats.compute_stat("averageGlucose", &slice, ctx).unwrap());
        assert_eq!(avg["averageGlucose"], json!(150.0));
        assert_eq!(avg["total"], json!(3));

        let (range, _) =
            with_context(|ctx| BasicStats.compute_stat("readingsInRange", &slice, ctx).unwrap());
        assert_eq!(range["veryLow"], json!(1));
        assert_eq!(range["target"], json!(1));
        assert_eq!(range["veryHigh"], json!(1));
    }

    #[test]
    fn test_unknown_names() {
        let (stat, _) = with_context(|ctx| BasicStats.compute_stat("nope", &[], ctx));
        let (agg, _) = with_context(|ctx| BasicStats.compute_aggregation("nope", &[], ctx));
        assert!(stat.is_none());
        assert!(agg.is_none());
    }

    #[test]
    fn test_every_listed_name_is_computed() {
        for name in STAT_NAMES {
            let (stat, _) = with_context(|ctx| BasicStats.compute_stat(name, &[], ctx));
            assert!(stat.is_some(), "{}", name);
        }
        for name in AGGREGATION_NAMES {
            let (agg, _) = with_context(|ctx| BasicStats.compute_aggregation(name, &[], ctx));
            assert!(agg.is_some(), "{}", name);
        }
    }

    #[test]
    fn test_bolus_aggregation_by_date() {
        let mut interrupted = Record::new(
            "b1",
            MS_PER_HOUR,
            RecordKind::Bolus(Bolus {
                normal: Some(1.0),
                expected_normal: Some(2.0),
                ..Bolus::default()
            }),
        );
        interrupted.tags.manual = true;
        interrupted.tags.interrupted = true;
        let mut manual = interrupted.clone();
        manual.id = "b2".into();
        manual.tags.interrupted = false;

        let slice = vec![&interrupted, &manual];
        let (value, _) =
            with_context(|ctx| BasicStats.compute_aggregation("boluses", &slice, ctx).unwrap());
        assert_eq!(value["byDate"]["1970-01-01"]["total"], json!(2));
        assert_eq!(value["byDate"]["1970-01-01"]["interrupted"], json!(1));
        assert_eq!(value["summary"]["manual"], json!(2));
    }
}
