//! Variant payloads of the record union
//!
//! Each struct models the fields the engine reads or rewrites; everything
//! else a device sends is kept verbatim in `extra` and re-emitted on output.
//! Cross-record links (`wizard.bolus`, `bolus.wizard`, `bolus.dosingDecision`,
//! `dosingDecision.pumpSettings`) are not deserialized here; the normalizer
//! lifts them out of the raw object first.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::{Fields, Link, Record};
use crate::types::{parse_instant, parse_wall_clock, Timestamp};

// ============================================================================
// Field helpers
// ============================================================================

/// Accept integer or float milliseconds
fn de_opt_ms<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value.filter(|v| v.is_finite()).map(|v| v.round() as i64))
}

fn de_ms<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    de_opt_ms(deserializer)?.ok_or_else(|| serde::de::Error::custom("expected milliseconds"))
}

/// Accept an ISO instant string or epoch milliseconds
fn de_opt_instant<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    de_time_with(deserializer, parse_instant)
}

/// Accept a device wall-clock string or naive epoch milliseconds
fn de_opt_wall_clock<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<i64>, D::Error> {
    de_time_with(deserializer, parse_wall_clock)
}

fn de_time_with<'de, D: Deserializer<'de>>(
    deserializer: D,
    parse: fn(&str) -> Option<Timestamp>,
) -> Result<Option<i64>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64().map(|v| v.round() as i64)),
        Some(Value::String(s)) => parse(&s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid time '{}'", s))),
        Some(other) => Err(serde::de::Error::custom(format!("invalid time {}", other))),
    }
}

// ============================================================================
// Basal
// ============================================================================

/// Basal delivery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryType {
    /// Programmed schedule
    #[default]
    Scheduled,
    /// Delivery suspended
    Suspend,
    /// Temporary rate
    Temp,
    /// Closed-loop automated rate
    Automated,
    /// Any other value a device reports
    #[serde(other)]
    Unknown,
}

/// Basal segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Basal {
    /// Delivery mode
    pub delivery_type: DeliveryType,
    /// Units per hour
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    /// Segment length (ms)
    #[serde(default, deserialize_with = "de_opt_ms", skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    /// Programmed length before interruption (ms)
    #[serde(default, deserialize_with = "de_opt_ms", skip_serializing_if = "Option::is_none")]
    pub expected_duration: Option<i64>,
    /// Temp basal percentage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    /// Schedule the segment came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_name: Option<String>,
    /// Delivery this segment replaced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppressed: Option<Box<SuppressedBasal>>,
    /// Unmodeled fields
    #[serde(flatten)]
    pub extra: Fields,
}

/// A basal replaced by another (temp or suspend); may itself suppress another
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SuppressedBasal {
    /// Delivery mode
    #[serde(default)]
    pub delivery_type: DeliveryType,
    /// Units per hour
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    /// Inherited from the parent when absent
    #[serde(default, deserialize_with = "de_opt_ms", skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    /// Inherited from the parent when absent
    #[serde(default, deserialize_with = "de_opt_instant", skip_serializing_if = "Option::is_none")]
    pub time: Option<Timestamp>,
    /// Inherited from the parent when absent
    #[serde(default, deserialize_with = "de_opt_wall_clock", skip_serializing_if = "Option::is_none")]
    pub device_time: Option<Timestamp>,
    /// Temp basal percentage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    /// Schedule name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_name: Option<String>,
    /// Next level of the chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppressed: Option<Box<SuppressedBasal>>,
    /// Unmodeled fields
    #[serde(flatten)]
    pub extra: Fields,
}

impl SuppressedBasal {
    /// Number of levels in this chain, counting `self`
    pub fn depth(&self) -> usize {
        1 + self.suppressed.as_ref().map_or(0, |s| s.depth())
    }
}

// ============================================================================
// Bolus / Wizard / DosingDecision
// ============================================================================

/// Bolus delivery shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BolusSubType {
    /// Immediate
    #[default]
    #[serde(rename = "normal")]
    Normal,
    /// Extended over a duration
    #[serde(rename = "square")]
    Square,
    /// Immediate plus extended
    #[serde(rename = "dual/square")]
    DualSquare,
    /// Issued by an automated controller
    #[serde(rename = "automated")]
    Automated,
    /// Anything else
    #[serde(other, rename = "unknown")]
    Unknown,
}

/// Data provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Origin {
    /// Reverse-DNS name of the producing application
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Unmodeled fields
    #[serde(flatten)]
    pub extra: Fields,
}

/// Insulin bolus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Bolus {
    /// Delivery shape
    #[serde(default)]
    pub sub_type: BolusSubType,
    /// Immediate units delivered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normal: Option<f64>,
    /// Extended units delivered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended: Option<f64>,
    /// Immediate units programmed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_normal: Option<f64>,
    /// Extended units programmed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_extended: Option<f64>,
    /// Extended delivery length (ms)
    #[serde(default, deserialize_with = "de_opt_ms", skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    /// Programmed extended length (ms)
    #[serde(default, deserialize_with = "de_opt_ms", skip_serializing_if = "Option::is_none")]
    pub expected_duration: Option<i64>,
    /// Carbs entered (copied from a dosing decision)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carb_input: Option<f64>,
    /// Glucose entered (copied from a dosing decision)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bg_input: Option<f64>,
    /// Active insulin (copied from a dosing decision)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insulin_on_board: Option<f64>,
    /// Glucose unit of `bg_input`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Provenance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    /// Calculator record that produced this bolus
    #[serde(skip)]
    pub wizard: Option<Link>,
    /// Loop dosing decision attached by the joiner
    #[serde(skip)]
    pub dosing_decision: Option<Box<Record>>,
    /// Unmodeled fields
    #[serde(flatten)]
    pub extra: Fields,
}

impl Bolus {
    /// Total units delivered
    pub fn delivered(&self) -> f64 {
        self.normal.unwrap_or(0.0) + self.extended.unwrap_or(0.0)
    }

    /// Total units programmed (falls back to delivered when not interrupted)
    pub fn programmed(&self) -> f64 {
        self.expected_normal.or(self.normal).unwrap_or(0.0)
            + self.expected_extended.or(self.extended).unwrap_or(0.0)
    }
}

/// Calculator recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Recommended {
    /// Units for carbs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carb: Option<f64>,
    /// Units for correction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<f64>,
    /// Net recommendation after insulin on board
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net: Option<f64>,
    /// Unmodeled fields
    #[serde(flatten)]
    pub extra: Fields,
}

/// Glucose target, either a single entry or one schedule segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BgTarget {
    /// Segment start (ms since midnight)
    #[serde(default, deserialize_with = "de_opt_ms", skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    /// Target value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<f64>,
    /// Symmetric range around target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<f64>,
    /// Lower bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<f64>,
    /// Upper bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    /// Unmodeled fields
    #[serde(flatten)]
    pub extra: Fields,
}

/// Bolus calculator record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Wizard {
    /// Carbs entered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carb_input: Option<f64>,
    /// `grams` or `exchanges`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carb_units: Option<String>,
    /// Grams per unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insulin_carb_ratio: Option<f64>,
    /// Glucose drop per unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insulin_sensitivity: Option<f64>,
    /// Glucose entered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bg_input: Option<f64>,
    /// Target used by the calculation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bg_target: Option<BgTarget>,
    /// Calculator output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended: Option<Recommended>,
    /// Active insulin at calculation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insulin_on_board: Option<f64>,
    /// Glucose unit of the bg-bearing fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Bolus this calculation produced
    #[serde(skip)]
    pub bolus: Option<Link>,
    /// Unmodeled fields
    #[serde(flatten)]
    pub extra: Fields,
}

/// Reference from a dosing decision to another record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Association {
    /// Why the record is associated (`pumpSettings`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Target record id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Unmodeled fields
    #[serde(flatten)]
    pub extra: Fields,
}

/// Insulin amount wrapper used by dosing decisions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Amount {
    /// Units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    /// Unmodeled fields
    #[serde(flatten)]
    pub extra: Fields,
}

/// Historical glucose sample attached to a dosing decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BgSample {
    /// Glucose value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Unmodeled fields
    #[serde(flatten)]
    pub extra: Fields,
}

/// Unit block of dosing decisions and pump settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UnitsBlock {
    /// Glucose unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bg: Option<String>,
    /// Carb unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carb: Option<String>,
    /// Unmodeled fields
    #[serde(flatten)]
    pub extra: Fields,
}

/// Loop dosing decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DosingDecision {
    /// Why the decision was made
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Related records
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub associations: Vec<Association>,
    /// Bolus the user asked for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_bolus: Option<Amount>,
    /// Bolus the algorithm recommended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_bolus: Option<Amount>,
    /// Active insulin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insulin_on_board: Option<Amount>,
    /// Recent glucose samples, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bg_historical: Vec<BgSample>,
    /// Food entered with the decision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub food: Option<Value>,
    /// Units of the numeric fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<UnitsBlock>,
    /// Pump settings in force, resolved by the joiner
    #[serde(skip)]
    pub pump_settings: Option<Box<Record>>,
    /// Unmodeled fields
    #[serde(flatten)]
    pub extra: Fields,
}

impl DosingDecision {
    /// Net carbohydrates entered with the decision
    pub fn carbs_net(&self) -> Option<f64> {
        self.food
            .as_ref()
            .and_then(|food| food.pointer("/nutrition/carbohydrate/net"))
            .and_then(Value::as_f64)
    }

    /// Id of the associated pump settings record
    pub fn pump_settings_id(&self) -> Option<&str> {
        self.associations
            .iter()
            .find(|a| a.reason.as_deref() == Some("pumpSettings"))
            .and_then(|a| a.id.as_deref())
    }
}

// ============================================================================
// Settings / Upload / readings / misc
// ============================================================================

/// One segment of a basal schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BasalScheduleEntry {
    /// Segment start (ms since midnight)
    #[serde(deserialize_with = "de_ms")]
    pub start: i64,
    /// Units per hour
    pub rate: f64,
    /// Unmodeled fields
    #[serde(flatten)]
    pub extra: Fields,
}

/// One segment of a ratio or sensitivity schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScheduleAmount {
    /// Segment start (ms since midnight)
    #[serde(default, deserialize_with = "de_opt_ms", skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    /// Ratio or sensitivity value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    /// Unmodeled fields
    #[serde(flatten)]
    pub extra: Fields,
}

/// Pump configuration snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PumpSettings {
    /// Basal schedules by name
    #[serde(default)]
    pub basal_schedules: BTreeMap<String, Vec<BasalScheduleEntry>>,
    /// Single glucose target schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bg_target: Option<Vec<BgTarget>>,
    /// Glucose target schedules by name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bg_targets: Option<BTreeMap<String, Vec<BgTarget>>>,
    /// Single carb ratio schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carb_ratio: Option<Vec<ScheduleAmount>>,
    /// Carb ratio schedules by name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carb_ratios: Option<BTreeMap<String, Vec<ScheduleAmount>>>,
    /// Single sensitivity schedule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insulin_sensitivity: Option<Vec<ScheduleAmount>>,
    /// Sensitivity schedules by name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insulin_sensitivities: Option<BTreeMap<String, Vec<ScheduleAmount>>>,
    /// Schedule in use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_schedule: Option<String>,
    /// Last schedule in use while not automated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_manual_basal_schedule: Option<String>,
    /// Units of the numeric fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<UnitsBlock>,
    /// Unmodeled fields
    #[serde(flatten)]
    pub extra: Fields,
}

/// Upload session describing the source device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Upload {
    /// Uploader-reported source (`carelink`, `Tandem`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Device model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    /// Manufacturers, first is primary
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_manufacturers: Vec<String>,
    /// Serial number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_serial_number: Option<String>,
    /// `insulin-pump`, `cgm`, `bgm`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_tags: Vec<String>,
    /// `normal` or `continuous`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_set_type: Option<String>,
    /// Unmodeled fields
    #[serde(flatten)]
    pub extra: Fields,
}

impl Upload {
    /// Source label: `source`, else the first manufacturer, else `Unknown`
    ///
    /// CareLink exports are relabelled to the pump manufacturer.
    pub fn resolved_source(&self) -> String {
        let manufacturer = self.device_manufacturers.first();
        match self.source.as_deref() {
            Some(source) if source.eq_ignore_ascii_case("carelink") => manufacturer
                .cloned()
                .unwrap_or_else(|| "Medtronic".to_string()),
            Some(source) => source.to_string(),
            None => manufacturer
                .cloned()
                .unwrap_or_else(|| "Unknown".to_string()),
        }
    }

    /// Serial number or `Unknown`
    pub fn serial_or_unknown(&self) -> String {
        self.device_serial_number
            .clone()
            .unwrap_or_else(|| "Unknown".to_string())
    }

    /// True when the upload came from an insulin pump
    pub fn is_pump(&self) -> bool {
        self.device_tags.iter().any(|t| t == "insulin-pump")
    }
}

/// Continuous or fingerstick glucose reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BgReading {
    /// Glucose value in `units`
    pub value: f64,
    /// Glucose unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// `manual`, `linked`, ...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    /// Unmodeled fields
    #[serde(flatten)]
    pub extra: Fields,
}

/// Food entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Food {
    /// Nutrition facts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nutrition: Option<Value>,
    /// Unmodeled fields
    #[serde(flatten)]
    pub extra: Fields,
}

/// Device event (site change, calibration, status, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    /// Event kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    /// Status events: `suspended` / `resumed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Status reason object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Value>,
    /// Prime events: `cannula` / `tubing`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prime_target: Option<String>,
    /// Event length (ms)
    #[serde(default, deserialize_with = "de_opt_ms", skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    /// Calibration value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Calibration unit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    /// Vendor payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Unmodeled fields
    #[serde(flatten)]
    pub extra: Fields,
}

/// Note attached to the timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_text: Option<String>,
    /// Thread parent id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message: Option<String>,
    /// Unmodeled fields
    #[serde(flatten)]
    pub extra: Fields,
}
